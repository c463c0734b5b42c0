// src/push.rs
// Push delivery transport. Delivery itself is an external collaborator; the
// dispatcher only sees this trait.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::errors::{EngineError, EngineResult};

#[derive(Serialize, Debug, Clone)]
pub struct PushMessage {
    pub title: String,
    pub body: String,
    pub data: serde_json::Value,
}

#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn deliver(&self, user_id: &str, message: &PushMessage) -> EngineResult<()>;
}

/// Webhook-backed transport: posts the rendered alert to a configured URL.
/// Disabled (no-op) when no URL is configured, so local runs work without a
/// delivery backend.
pub struct WebhookPush {
    client: reqwest::Client,
    url: Option<String>,
}

impl WebhookPush {
    pub fn new(url: Option<String>) -> Self {
        if let Some(url) = &url {
            info!("[PUSH] Webhook transport initialized ({})", url);
        } else {
            warn!("[PUSH] No PUSH_WEBHOOK_URL configured, delivery disabled");
        }
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl PushTransport for WebhookPush {
    async fn deliver(&self, user_id: &str, message: &PushMessage) -> EngineResult<()> {
        let Some(url) = &self.url else {
            debug!("[PUSH] Delivery disabled, dropping message for {}", user_id);
            return Ok(());
        };

        let payload = serde_json::json!({
            "user_id": user_id,
            "title": message.title,
            "body": message.body,
            "data": message.data,
        });

        let response = self
            .client
            .post(url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| EngineError::TransientIo(format!("push webhook: {}", e)))?;

        if !response.status().is_success() {
            return Err(EngineError::TransientIo(format!(
                "push webhook returned {}",
                response.status()
            )));
        }

        debug!("[PUSH] Delivered '{}' to {}", message.title, user_id);
        Ok(())
    }
}

/// Transport that records instead of sending; used by the test suites.
#[derive(Default)]
pub struct CollectingPush {
    sent: Mutex<Vec<(String, PushMessage)>>,
    fail: bool,
}

impl CollectingPush {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport whose every delivery fails, for exercising the
    /// failure-is-logged-not-propagated path.
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn sent(&self) -> Vec<(String, PushMessage)> {
        self.sent.lock().expect("push mutex poisoned").clone()
    }
}

#[async_trait]
impl PushTransport for CollectingPush {
    async fn deliver(&self, user_id: &str, message: &PushMessage) -> EngineResult<()> {
        if self.fail {
            return Err(EngineError::TransientIo("simulated delivery failure".into()));
        }
        self.sent
            .lock()
            .expect("push mutex poisoned")
            .push((user_id.to_string(), message.clone()));
        Ok(())
    }
}
