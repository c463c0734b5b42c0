// src/storage/mod.rs
// Request/response contracts for the persistence engine. The engine never
// talks to a database directly; every component takes one of these traits so
// the backing store can be swapped without touching lifecycle logic.

pub mod memory;

use async_trait::async_trait;

use crate::errors::EngineResult;
use crate::types::{
    AlertSubscription, NotificationEvent, Zone, ZoneAlertPreferences, ZoneTest,
};

#[async_trait]
pub trait ZoneRepository: Send + Sync {
    async fn insert_zone(&self, zone: Zone) -> EngineResult<()>;
    async fn get_zone(&self, zone_id: &str) -> EngineResult<Option<Zone>>;
    async fn update_zone(&self, zone: &Zone) -> EngineResult<()>;
    /// Zones for a symbol, optionally narrowed to one timeframe. Includes
    /// terminal zones; callers filter.
    async fn zones_for_symbol(&self, symbol: &str, timeframe: Option<&str>)
        -> EngineResult<Vec<Zone>>;
    /// Full zone scan, used by the periodic lifecycle sweeper.
    async fn all_zones(&self) -> EngineResult<Vec<Zone>>;
    /// Append a test record. Returns false when a test with the same event id
    /// already exists, so replays never double-count.
    async fn insert_test(&self, test: &ZoneTest) -> EngineResult<bool>;
    async fn tests_for_zone(&self, zone_id: &str) -> EngineResult<Vec<ZoneTest>>;
}

#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    /// Insert a subscription only if the user's active count is below
    /// `max_active` (-1 = unlimited). The check and insert are one atomic
    /// operation at the storage layer. Returns false when the cap is hit.
    async fn insert_capped(&self, sub: AlertSubscription, max_active: i64) -> EngineResult<bool>;
    async fn get(&self, sub_id: &str) -> EngineResult<Option<AlertSubscription>>;
    /// Soft delete: clears the active flag, keeping the row. Returns the
    /// subscription as it was before deactivation so callers can tell
    /// whether this call actually released an active slot.
    async fn deactivate(&self, sub_id: &str) -> EngineResult<Option<AlertSubscription>>;
    async fn active_for_user(&self, user_id: &str) -> EngineResult<Vec<AlertSubscription>>;
    async fn active_count(&self, user_id: &str) -> EngineResult<usize>;
    async fn active_for_zone(&self, zone_id: &str) -> EngineResult<Vec<AlertSubscription>>;
}

#[derive(Debug, Clone, Copy)]
pub struct QuotaConsumption {
    pub allowed: bool,
    /// Counter value after the attempt (unchanged when not allowed).
    pub used: u32,
}

#[async_trait]
pub trait QuotaRepository: Send + Sync {
    /// Atomic compare-and-increment of the (user, kind, day-bucket) counter.
    /// Never exceeds `limit`; -1 = unlimited.
    async fn try_consume(
        &self,
        user_id: &str,
        kind: &str,
        day_bucket: &str,
        limit: i64,
    ) -> EngineResult<QuotaConsumption>;
    async fn current_usage(&self, user_id: &str, kind: &str, day_bucket: &str)
        -> EngineResult<u32>;
}

#[async_trait]
pub trait NotificationLogRepository: Send + Sync {
    /// Write-once append; rows are never mutated afterwards.
    async fn append(&self, event: NotificationEvent) -> EngineResult<()>;
    async fn for_user(&self, user_id: &str) -> EngineResult<Vec<NotificationEvent>>;
}

#[async_trait]
pub trait PreferenceRepository: Send + Sync {
    async fn get(&self, user_id: &str) -> EngineResult<Option<ZoneAlertPreferences>>;
    async fn upsert(&self, prefs: ZoneAlertPreferences) -> EngineResult<()>;
}
