// src/dispatcher.rs
// Notification dispatcher: turns raised zone events into user-facing alerts.
// Pipeline order per event and user: entitlement gate, stored preference,
// cooldown, template render, push delivery, audit row. Delivery failures are
// logged, never propagated back to the event source.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::entitlement::EntitlementGate;
use crate::errors::{EngineError, EngineResult};
use crate::push::{PushMessage, PushTransport};
use crate::storage::{NotificationLogRepository, PreferenceRepository, SubscriptionRepository};
use crate::types::{
    AlertCategory, NotificationEvent, NotificationPriority, ZoneAlertPreferences, ZoneEvent,
};

/// Template catalog entry. The catalog is data: an event type with no entry
/// is rejected rather than rendered empty.
pub struct NotificationTemplate {
    pub priority: NotificationPriority,
    pub channel: &'static str,
    pub render: fn(&ZoneEvent) -> (String, String),
}

pub fn default_catalog() -> HashMap<AlertCategory, NotificationTemplate> {
    let mut catalog = HashMap::new();
    catalog.insert(
        AlertCategory::Retest,
        NotificationTemplate {
            priority: NotificationPriority::Normal,
            channel: "zone_alerts",
            render: |e| {
                (
                    format!("{} retesting {} zone", e.symbol, e.zone_type.label()),
                    format!(
                        "Price {:.5} entered the {} zone {:.5}-{:.5} ({})",
                        e.price,
                        e.zone_type.label(),
                        e.price_low,
                        e.price_high,
                        e.timeframe
                    ),
                )
            },
        },
    );
    catalog.insert(
        AlertCategory::Broken,
        NotificationTemplate {
            priority: NotificationPriority::High,
            channel: "zone_alerts",
            render: |e| {
                (
                    format!("{} {} zone broken", e.symbol, e.zone_type.label()),
                    format!(
                        "Price {:.5} broke through the {} zone {:.5}-{:.5} ({})",
                        e.price,
                        e.zone_type.label(),
                        e.price_low,
                        e.price_high,
                        e.timeframe
                    ),
                )
            },
        },
    );
    catalog.insert(
        AlertCategory::Approaching,
        NotificationTemplate {
            priority: NotificationPriority::Low,
            channel: "zone_alerts",
            render: |e| {
                (
                    format!("{} approaching {} zone", e.symbol, e.zone_type.label()),
                    format!(
                        "Price {:.5} is near the {} zone {:.5}-{:.5} ({})",
                        e.price,
                        e.zone_type.label(),
                        e.price_low,
                        e.price_high,
                        e.timeframe
                    ),
                )
            },
        },
    );
    catalog
}

#[derive(Debug)]
pub enum NotifyOutcome {
    Delivered(NotificationEvent),
    /// The user's stored preference disables this category.
    SkippedPreference,
    /// The same (user, event, symbol) fired inside the cooldown window.
    SkippedCooldown,
}

pub struct NotificationDispatcher {
    gate: Arc<EntitlementGate>,
    subscriptions: Arc<dyn SubscriptionRepository>,
    preferences: Arc<dyn PreferenceRepository>,
    audit: Arc<dyn NotificationLogRepository>,
    push: Arc<dyn PushTransport>,
    catalog: HashMap<AlertCategory, NotificationTemplate>,
    cooldowns: DashMap<String, DateTime<Utc>>,
    cooldown_window: Duration,
}

impl NotificationDispatcher {
    pub fn new(
        gate: Arc<EntitlementGate>,
        subscriptions: Arc<dyn SubscriptionRepository>,
        preferences: Arc<dyn PreferenceRepository>,
        audit: Arc<dyn NotificationLogRepository>,
        push: Arc<dyn PushTransport>,
        cooldown_secs: u64,
    ) -> Self {
        Self {
            gate,
            subscriptions,
            preferences,
            audit,
            push,
            catalog: default_catalog(),
            cooldowns: DashMap::new(),
            cooldown_window: Duration::seconds(cooldown_secs as i64),
        }
    }

    /// Evaluate the full pipeline for one user. Entitlement denial and an
    /// unrecognized event type are errors; preference and cooldown skips are
    /// normal outcomes.
    pub async fn notify(&self, event: &ZoneEvent, user_id: &str) -> EngineResult<NotifyOutcome> {
        let caps = self.gate.capabilities_for(user_id).await?;
        if caps.zone_alerts_quota == 0 {
            return Err(EngineError::EntitlementDenied(format!(
                "tier does not include zone alerts for user {}",
                user_id
            )));
        }

        let prefs = self
            .preferences
            .get(user_id)
            .await?
            .unwrap_or_else(|| ZoneAlertPreferences::default_for(user_id));
        if !prefs.allows(event.category) {
            debug!(
                "[DISPATCH] {} has {} alerts disabled, skipping",
                user_id,
                event.category.as_str()
            );
            return Ok(NotifyOutcome::SkippedPreference);
        }

        let template = self.catalog.get(&event.category).ok_or_else(|| {
            EngineError::Validation(format!(
                "no notification template for event type {}",
                event.category.as_str()
            ))
        })?;

        let dedupe_key = format!("{}:{}:{}", user_id, event.category.as_str(), event.symbol);
        if !self.try_claim_cooldown(&dedupe_key) {
            debug!("[DISPATCH] Cooldown active for {}, skipping", dedupe_key);
            return Ok(NotifyOutcome::SkippedCooldown);
        }

        let (title, body) = (template.render)(event);
        let message = PushMessage {
            title: title.clone(),
            body: body.clone(),
            data: serde_json::json!({
                "zone_id": event.zone_id,
                "symbol": event.symbol,
                "event_type": event.category.as_str(),
                "channel": template.channel,
            }),
        };

        // Delivery failures are logged and swallowed; the event source must
        // never see them.
        if let Err(e) = self.push.deliver(user_id, &message).await {
            warn!("[DISPATCH] Push delivery to {} failed: {}", user_id, e);
        }

        let record = NotificationEvent {
            id: Uuid::new_v4().to_string(),
            event_type: event.category,
            priority: template.priority,
            user_id: user_id.to_string(),
            zone_id: event.zone_id.clone(),
            symbol: event.symbol.clone(),
            title,
            body,
            dedupe_key,
            sent_at: Utc::now(),
        };

        // The audit row must not block delivery that already happened.
        if let Err(e) = self.audit.append(record.clone()).await {
            error!("[DISPATCH] Failed to persist audit row: {}", e);
        }

        info!(
            "[DISPATCH] {} alert sent to {} for zone {}",
            record.event_type.as_str(),
            user_id,
            record.zone_id
        );
        Ok(NotifyOutcome::Delivered(record))
    }

    /// Atomically claim the cooldown slot for a dedupe key. Returns false
    /// when the window has not elapsed, so rapid tick bursts collapse to one
    /// notification.
    fn try_claim_cooldown(&self, key: &str) -> bool {
        let now = Utc::now();
        // Elapsed windows are dead weight; drop them so the map tracks only
        // live cooldowns instead of every key ever seen.
        self.cooldowns
            .retain(|_, last| now - *last < self.cooldown_window);
        match self.cooldowns.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if now - *occupied.get() < self.cooldown_window {
                    false
                } else {
                    occupied.insert(now);
                    true
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(now);
                true
            }
        }
    }

    /// Fan one raised event out to every active subscription on the zone
    /// that asked for this category.
    pub async fn dispatch(&self, event: &ZoneEvent) {
        let subs = match self.subscriptions.active_for_zone(&event.zone_id).await {
            Ok(subs) => subs,
            Err(e) => {
                error!(
                    "[DISPATCH] Subscription lookup for zone {} failed: {}",
                    event.zone_id, e
                );
                return;
            }
        };

        for sub in subs {
            if !sub.alert_types.contains(&event.category) {
                continue;
            }
            match self.notify(event, &sub.user_id).await {
                Ok(_) => {}
                Err(e) if e.is_upgrade_prompt() => {
                    debug!(
                        "[DISPATCH] {} not entitled to {} alerts: {}",
                        sub.user_id,
                        event.category.as_str(),
                        e
                    );
                }
                Err(e) => {
                    error!("[DISPATCH] notify({}) failed: {}", sub.user_id, e);
                }
            }
        }
    }

    /// Drain the monitor's event stream until it closes.
    pub async fn run_dispatch_loop(
        self: Arc<Self>,
        mut events_rx: tokio::sync::mpsc::Receiver<ZoneEvent>,
    ) {
        info!("[DISPATCH] Dispatch loop started");
        while let Some(event) = events_rx.recv().await {
            self.dispatch(&event).await;
        }
        info!("[DISPATCH] Event stream closed, dispatch loop exiting");
    }
}
