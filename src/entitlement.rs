// src/entitlement.rs
// Tier entitlement gate: maps tier labels to capability flags and enforces
// date-bucketed quota counters. The tier label itself comes from an external
// resolver (account/billing system); unknown labels fall back to the lowest
// tier rather than failing.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::errors::{EngineError, EngineResult};
use crate::storage::{QuotaRepository, SubscriptionRepository};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Free,
    Pro,
    Elite,
}

impl Tier {
    /// Fail-safe parse: an unrecognized label gets the lowest tier's
    /// capabilities, never an error and never a free upgrade.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "free" => Tier::Free,
            "pro" => Tier::Pro,
            "elite" => Tier::Elite,
            other => {
                warn!("[ENTITLEMENT] Unknown tier label '{}', falling back to free", other);
                Tier::Free
            }
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Pro => "pro",
            Tier::Elite => "elite",
        }
    }
}

/// Immutable capability map for one tier. Quotas of -1 mean unlimited.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TierCapabilities {
    pub max_zones_displayed: u32,
    pub zone_alerts_quota: i64,
    pub can_view_historical: bool,
    pub can_customize_colors: bool,
    pub can_export_zones: bool,
    pub mtf_timeframes: u32,
    pub scan_quota_per_day: i64,
}

impl TierCapabilities {
    pub fn for_tier(tier: Tier) -> Self {
        match tier {
            Tier::Free => Self {
                max_zones_displayed: 3,
                zone_alerts_quota: 0,
                can_view_historical: false,
                can_customize_colors: false,
                can_export_zones: false,
                mtf_timeframes: 1,
                scan_quota_per_day: 5,
            },
            Tier::Pro => Self {
                max_zones_displayed: 10,
                zone_alerts_quota: 20,
                can_view_historical: true,
                can_customize_colors: true,
                can_export_zones: false,
                mtf_timeframes: 3,
                scan_quota_per_day: 50,
            },
            Tier::Elite => Self {
                max_zones_displayed: 50,
                zone_alerts_quota: -1,
                can_view_historical: true,
                can_customize_colors: true,
                can_export_zones: true,
                mtf_timeframes: 6,
                scan_quota_per_day: -1,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuotaKind {
    ZoneAlerts,
    DailyScans,
}

impl QuotaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaKind::ZoneAlerts => "zone_alerts",
            QuotaKind::DailyScans => "daily_scans",
        }
    }

    fn limit(&self, caps: &TierCapabilities) -> i64 {
        match self {
            QuotaKind::ZoneAlerts => caps.zone_alerts_quota,
            QuotaKind::DailyScans => caps.scan_quota_per_day,
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct QuotaStatus {
    pub allowed: bool,
    /// Remaining grants in the current bucket; -1 when unlimited.
    pub remaining: i64,
    pub limit: i64,
    pub reset_at: DateTime<Utc>,
}

/// Resolves a user id to a tier label; owned by the account system.
#[async_trait]
pub trait TierResolver: Send + Sync {
    async fn tier_label(&self, user_id: &str) -> EngineResult<String>;
}

/// Static resolver for tests and single-process deployments.
pub struct StaticTierResolver {
    tiers: HashMap<String, String>,
    default_tier: String,
}

impl StaticTierResolver {
    pub fn new(default_tier: &str) -> Self {
        Self {
            tiers: HashMap::new(),
            default_tier: default_tier.to_string(),
        }
    }

    pub fn with_user(mut self, user_id: &str, tier: &str) -> Self {
        self.tiers.insert(user_id.to_string(), tier.to_string());
        self
    }
}

#[async_trait]
impl TierResolver for StaticTierResolver {
    async fn tier_label(&self, user_id: &str) -> EngineResult<String> {
        Ok(self
            .tiers
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| self.default_tier.clone()))
    }
}

/// Every user shares one reset instant: midnight in the reference timezone
/// (UTC), not the caller's local time.
pub fn day_bucket(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}

pub fn next_reset(now: DateTime<Utc>) -> DateTime<Utc> {
    (now.date_naive() + Duration::days(1))
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always a valid time")
        .and_utc()
}

pub struct EntitlementGate {
    resolver: Arc<dyn TierResolver>,
    quotas: Arc<dyn QuotaRepository>,
    subscriptions: Arc<dyn SubscriptionRepository>,
}

impl EntitlementGate {
    pub fn new(
        resolver: Arc<dyn TierResolver>,
        quotas: Arc<dyn QuotaRepository>,
        subscriptions: Arc<dyn SubscriptionRepository>,
    ) -> Self {
        Self {
            resolver,
            quotas,
            subscriptions,
        }
    }

    pub fn capabilities(tier: Tier) -> TierCapabilities {
        TierCapabilities::for_tier(tier)
    }

    pub async fn capabilities_for(&self, user_id: &str) -> EngineResult<TierCapabilities> {
        let label = self.resolver.tier_label(user_id).await?;
        Ok(TierCapabilities::for_tier(Tier::from_label(&label)))
    }

    /// Read-only quota view. Zone-alert usage is the user's live count of
    /// active subscriptions (the same number `insert_capped` enforces);
    /// day-bucketed kinds read the consumption counter. Unlimited tiers
    /// always come back allowed.
    pub async fn check_quota(&self, user_id: &str, kind: QuotaKind) -> EngineResult<QuotaStatus> {
        let caps = self.capabilities_for(user_id).await?;
        let limit = kind.limit(&caps);
        let now = Utc::now();
        let reset_at = next_reset(now);

        if limit < 0 {
            return Ok(QuotaStatus {
                allowed: true,
                remaining: -1,
                limit,
                reset_at,
            });
        }

        let used = match kind {
            QuotaKind::ZoneAlerts => self.subscriptions.active_count(user_id).await? as i64,
            QuotaKind::DailyScans => i64::from(
                self.quotas
                    .current_usage(user_id, kind.as_str(), &day_bucket(now))
                    .await?,
            ),
        };
        let remaining = (limit - used).max(0);
        Ok(QuotaStatus {
            allowed: remaining > 0,
            remaining,
            limit,
            reset_at,
        })
    }

    /// Atomically consume one grant from the current day bucket. The
    /// increment happens at the storage layer so concurrent callers can
    /// never exceed the cap. Zone-alert slots are not consumed here: they
    /// are claimed by the subscription store's capped insert.
    pub async fn consume_quota(&self, user_id: &str, kind: QuotaKind) -> EngineResult<QuotaStatus> {
        if kind == QuotaKind::ZoneAlerts {
            return Err(EngineError::Validation(
                "zone alert slots are claimed by subscription inserts".to_string(),
            ));
        }

        let caps = self.capabilities_for(user_id).await?;
        let limit = kind.limit(&caps);
        let now = Utc::now();
        let reset_at = next_reset(now);

        if limit < 0 {
            return Ok(QuotaStatus {
                allowed: true,
                remaining: -1,
                limit,
                reset_at,
            });
        }

        let outcome = self
            .quotas
            .try_consume(user_id, kind.as_str(), &day_bucket(now), limit)
            .await?;

        if !outcome.allowed {
            return Err(EngineError::QuotaExceeded {
                kind: kind.as_str().to_string(),
                limit,
                reset_at,
            });
        }

        Ok(QuotaStatus {
            allowed: true,
            remaining: (limit - i64::from(outcome.used)).max(0),
            limit,
            reset_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;
    use chrono::TimeZone;

    fn gate_for(users: &[(&str, &str)]) -> (EntitlementGate, Arc<MemoryStore>) {
        let mut resolver = StaticTierResolver::new("free");
        for (user, tier) in users {
            resolver = resolver.with_user(user, tier);
        }
        let store = Arc::new(MemoryStore::new());
        let gate = EntitlementGate::new(
            Arc::new(resolver),
            Arc::clone(&store) as Arc<dyn QuotaRepository>,
            Arc::clone(&store) as Arc<dyn SubscriptionRepository>,
        );
        (gate, store)
    }

    #[test]
    fn unknown_tier_falls_back_to_free() {
        assert_eq!(Tier::from_label("platinum_legacy"), Tier::Free);
        assert_eq!(Tier::from_label("ELITE"), Tier::Elite);
    }

    #[test]
    fn day_bucket_uses_one_reference_midnight() {
        let late = Utc.with_ymd_and_hms(2026, 8, 30, 23, 59, 59).unwrap();
        let early = Utc.with_ymd_and_hms(2026, 8, 30, 0, 0, 1).unwrap();
        assert_eq!(day_bucket(late), day_bucket(early));
        assert_eq!(
            next_reset(late),
            Utc.with_ymd_and_hms(2026, 8, 31, 0, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn consume_until_exceeded_surfaces_reset_instant() {
        let (gate, _store) = gate_for(&[("u1", "free")]);

        for _ in 0..5 {
            gate.consume_quota("u1", QuotaKind::DailyScans).await.unwrap();
        }

        let err = gate
            .consume_quota("u1", QuotaKind::DailyScans)
            .await
            .unwrap_err();
        match err {
            EngineError::QuotaExceeded { limit, .. } => assert_eq!(limit, 5),
            other => panic!("expected QuotaExceeded, got {other:?}"),
        }

        let status = gate.check_quota("u1", QuotaKind::DailyScans).await.unwrap();
        assert!(!status.allowed);
        assert_eq!(status.remaining, 0);
    }

    #[tokio::test]
    async fn unlimited_tier_is_never_blocked() {
        let (gate, _store) = gate_for(&[("vip", "elite")]);
        for _ in 0..200 {
            let status = gate.consume_quota("vip", QuotaKind::DailyScans).await.unwrap();
            assert!(status.allowed);
            assert_eq!(status.remaining, -1);
        }
    }

    #[tokio::test]
    async fn unknown_user_gets_default_tier_capabilities() {
        let (gate, _store) = gate_for(&[]);
        let caps = gate.capabilities_for("stranger").await.unwrap();
        assert_eq!(caps.zone_alerts_quota, 0);
        assert_eq!(caps.max_zones_displayed, 3);
    }

    #[tokio::test]
    async fn zone_alert_quota_reads_active_subscription_count() {
        let (gate, store) = gate_for(&[("u2", "pro")]);

        let sub = |id: &str| crate::types::AlertSubscription {
            id: id.to_string(),
            user_id: "u2".to_string(),
            zone_id: "z1".to_string(),
            symbol: "EURUSD".to_string(),
            zone_type: crate::types::ZoneType::Hfz,
            price_high: 1.1,
            price_low: 1.09,
            alert_types: vec![crate::types::AlertCategory::Retest],
            active: true,
            created_at: Utc::now(),
        };
        for i in 0..20 {
            assert!(store.insert_capped(sub(&format!("s{i}")), 20).await.unwrap());
        }

        // Every slot occupied: the reported quota must agree with the cap
        // insert_capped enforces.
        let status = gate.check_quota("u2", QuotaKind::ZoneAlerts).await.unwrap();
        assert!(!status.allowed);
        assert_eq!(status.remaining, 0);
        assert_eq!(status.limit, 20);

        // Releasing one active slot frees exactly one grant.
        store.deactivate("s0").await.unwrap();
        let status = gate.check_quota("u2", QuotaKind::ZoneAlerts).await.unwrap();
        assert!(status.allowed);
        assert_eq!(status.remaining, 1);
    }

    #[tokio::test]
    async fn zone_alert_slots_cannot_be_consumed_as_day_grants() {
        let (gate, _store) = gate_for(&[("u3", "pro")]);
        let err = gate
            .consume_quota("u3", QuotaKind::ZoneAlerts)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }
}
