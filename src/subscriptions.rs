// src/subscriptions.rs
// Alert subscription service: the UI layer's entry point for subscribing to
// zone alerts. Enforces tier entitlement before anything is persisted and
// keeps the stream monitor's per-symbol refcounts in step with active
// subscriptions.

use chrono::Utc;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::entitlement::{next_reset, EntitlementGate};
use crate::errors::{EngineError, EngineResult};
use crate::storage::SubscriptionRepository;
use crate::stream_monitor::StreamMonitor;
use crate::types::{AlertCategory, AlertSubscription};
use crate::zone_store::ZoneLifecycleStore;

pub struct AlertSubscriptionService {
    zones: Arc<ZoneLifecycleStore>,
    subscriptions: Arc<dyn SubscriptionRepository>,
    gate: Arc<EntitlementGate>,
    monitor: Arc<StreamMonitor>,
}

impl AlertSubscriptionService {
    pub fn new(
        zones: Arc<ZoneLifecycleStore>,
        subscriptions: Arc<dyn SubscriptionRepository>,
        gate: Arc<EntitlementGate>,
        monitor: Arc<StreamMonitor>,
    ) -> Self {
        Self {
            zones,
            subscriptions,
            gate,
            monitor,
        }
    }

    /// Subscribe a user to alerts on one zone. The zone's boundaries are
    /// snapshotted onto the subscription so it stays evaluable after the
    /// source zone expires. Nothing is persisted when the tier gate or the
    /// active-subscription cap rejects the request.
    pub async fn subscribe(
        &self,
        user_id: &str,
        zone_id: &str,
        alert_types: Vec<AlertCategory>,
    ) -> EngineResult<AlertSubscription> {
        if alert_types.is_empty() {
            return Err(EngineError::Validation(
                "at least one alert type is required".to_string(),
            ));
        }

        let caps = self.gate.capabilities_for(user_id).await?;
        if caps.zone_alerts_quota == 0 {
            return Err(EngineError::EntitlementDenied(format!(
                "tier does not include zone alerts for user {}",
                user_id
            )));
        }

        let zone = self
            .zones
            .get_zone(zone_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("zone {}", zone_id)))?;

        let sub = AlertSubscription {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            zone_id: zone.id.clone(),
            symbol: zone.symbol.clone(),
            zone_type: zone.zone_type,
            price_high: zone.price_high,
            price_low: zone.price_low,
            alert_types,
            active: true,
            created_at: Utc::now(),
        };

        // Active-count cap is enforced atomically at the storage layer.
        if !self
            .subscriptions
            .insert_capped(sub.clone(), caps.zone_alerts_quota)
            .await?
        {
            return Err(EngineError::QuotaExceeded {
                kind: "zone_alerts".to_string(),
                limit: caps.zone_alerts_quota,
                reset_at: next_reset(Utc::now()),
            });
        }

        self.monitor.watch(&sub.symbol).await;
        info!(
            "[SUBSCRIPTIONS] {} subscribed to zone {} ({})",
            user_id, sub.zone_id, sub.symbol
        );
        Ok(sub)
    }

    /// Soft-delete a subscription and release its feed reference. Repeating
    /// the call is a no-op once the subscription is inactive.
    pub async fn unsubscribe(&self, sub_id: &str) -> EngineResult<AlertSubscription> {
        let before = self
            .subscriptions
            .deactivate(sub_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("subscription {}", sub_id)))?;

        if before.active {
            self.monitor.unwatch(&before.symbol).await;
            info!(
                "[SUBSCRIPTIONS] {} unsubscribed from zone {} ({})",
                before.user_id, before.zone_id, before.symbol
            );
        }

        let mut after = before;
        after.active = false;
        Ok(after)
    }

    pub async fn active_subscriptions(&self, user_id: &str) -> EngineResult<Vec<AlertSubscription>> {
        self.subscriptions.active_for_user(user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::entitlement::StaticTierResolver;
    use crate::feed::{ChannelFeed, PriceFeedProvider};
    use crate::storage::memory::MemoryStore;
    use crate::storage::QuotaRepository;
    use crate::types::RawZoneDefinition;

    struct Fixture {
        store: Arc<MemoryStore>,
        zones: Arc<ZoneLifecycleStore>,
        monitor: Arc<StreamMonitor>,
        gate: Arc<EntitlementGate>,
        service: AlertSubscriptionService,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let zones = Arc::new(ZoneLifecycleStore::new(
            Arc::clone(&store) as Arc<dyn crate::storage::ZoneRepository>,
            30,
        ));
        let feed = Arc::new(ChannelFeed::new());
        let (monitor, _events_rx) = StreamMonitor::new(
            Arc::clone(&zones),
            feed as Arc<dyn PriceFeedProvider>,
            EngineConfig::default(),
        );
        let monitor = Arc::new(monitor);
        let resolver = StaticTierResolver::new("free")
            .with_user("pro-user", "pro")
            .with_user("vip", "elite");
        let gate = Arc::new(EntitlementGate::new(
            Arc::new(resolver),
            Arc::clone(&store) as Arc<dyn QuotaRepository>,
            Arc::clone(&store) as Arc<dyn SubscriptionRepository>,
        ));
        let service = AlertSubscriptionService::new(
            Arc::clone(&zones),
            Arc::clone(&store) as Arc<dyn SubscriptionRepository>,
            Arc::clone(&gate),
            Arc::clone(&monitor),
        );
        Fixture {
            store,
            zones,
            monitor,
            gate,
            service,
        }
    }

    async fn make_zone(zones: &ZoneLifecycleStore, symbol: &str) -> String {
        let raw: RawZoneDefinition = serde_json::from_value(serde_json::json!({
            "symbol": symbol, "timeframe": "1h", "zone_type": "hfz",
            "high": 1.1000, "low": 1.0950
        }))
        .unwrap();
        zones.create_zone(raw).await.unwrap().id
    }

    #[tokio::test]
    async fn free_tier_cannot_subscribe_and_nothing_is_persisted() {
        let fx = fixture();
        let zone_id = make_zone(&fx.zones, "EURUSD").await;

        let err = fx
            .service
            .subscribe("free-user", &zone_id, vec![AlertCategory::Retest])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::EntitlementDenied(_)));
        assert_eq!(fx.store.active_count("free-user").await.unwrap(), 0);
        assert!(!fx.monitor.is_watched("EURUSD").await);
    }

    #[tokio::test]
    async fn unlimited_tier_is_never_capped() {
        let fx = fixture();
        for i in 0..30 {
            let zone_id = make_zone(&fx.zones, &format!("SYM{i}")).await;
            fx.service
                .subscribe("vip", &zone_id, vec![AlertCategory::Broken])
                .await
                .unwrap();
        }
        assert_eq!(fx.store.active_count("vip").await.unwrap(), 30);
    }

    #[tokio::test]
    async fn active_cap_surfaces_quota_exceeded() {
        let fx = fixture();
        // Pro tier allows 20 active subscriptions.
        for i in 0..20 {
            let zone_id = make_zone(&fx.zones, &format!("SYM{i}")).await;
            fx.service
                .subscribe("pro-user", &zone_id, vec![AlertCategory::Retest])
                .await
                .unwrap();
        }

        let zone_id = make_zone(&fx.zones, "EXTRA").await;
        let err = fx
            .service
            .subscribe("pro-user", &zone_id, vec![AlertCategory::Retest])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::QuotaExceeded { limit: 20, .. }));
    }

    #[tokio::test]
    async fn quota_status_reflects_slots_taken_by_subscribe() {
        let fx = fixture();
        for i in 0..20 {
            let zone_id = make_zone(&fx.zones, &format!("SYM{i}")).await;
            fx.service
                .subscribe("pro-user", &zone_id, vec![AlertCategory::Retest])
                .await
                .unwrap();
        }

        // A fully subscribed user must not be reported as having grants left.
        let status = fx
            .gate
            .check_quota("pro-user", crate::entitlement::QuotaKind::ZoneAlerts)
            .await
            .unwrap();
        assert!(!status.allowed);
        assert_eq!(status.remaining, 0);
        assert_eq!(status.limit, 20);

        let sub = fx.store.active_for_user("pro-user").await.unwrap();
        fx.service.unsubscribe(&sub[0].id).await.unwrap();
        let status = fx
            .gate
            .check_quota("pro-user", crate::entitlement::QuotaKind::ZoneAlerts)
            .await
            .unwrap();
        assert!(status.allowed);
        assert_eq!(status.remaining, 1);
    }

    #[tokio::test]
    async fn unknown_zone_is_not_found() {
        let fx = fixture();
        let err = fx
            .service
            .subscribe("pro-user", "missing", vec![AlertCategory::Retest])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn subscription_refcounts_drive_the_feed() {
        let fx = fixture();
        let zone_id = make_zone(&fx.zones, "EURUSD").await;

        let s1 = fx
            .service
            .subscribe("pro-user", &zone_id, vec![AlertCategory::Retest])
            .await
            .unwrap();
        let s2 = fx
            .service
            .subscribe("vip", &zone_id, vec![AlertCategory::Broken])
            .await
            .unwrap();
        assert!(fx.monitor.is_watched("EURUSD").await);

        fx.service.unsubscribe(&s1.id).await.unwrap();
        assert!(fx.monitor.is_watched("EURUSD").await);

        // Repeating an unsubscribe must not double-release the refcount.
        fx.service.unsubscribe(&s1.id).await.unwrap();
        assert!(fx.monitor.is_watched("EURUSD").await);

        fx.service.unsubscribe(&s2.id).await.unwrap();
        assert!(!fx.monitor.is_watched("EURUSD").await);
    }
}
