// src/errors.rs
use chrono::{DateTime, Utc};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    #[error("Quota exceeded for {kind}: limit {limit}, resets at {reset_at}")]
    QuotaExceeded {
        kind: String,
        limit: i64,
        reset_at: DateTime<Utc>,
    },

    #[error("Entitlement denied: {0}")]
    EntitlementDenied(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl EngineError {
    /// Transient errors are retried at the point of failure and never
    /// surfaced as user-visible failures from background monitoring.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::TransientIo(_))
    }

    /// Errors that should surface as an upgrade prompt rather than a
    /// generic failure.
    pub fn is_upgrade_prompt(&self) -> bool {
        matches!(
            self,
            EngineError::QuotaExceeded { .. } | EngineError::EntitlementDenied(_)
        )
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
