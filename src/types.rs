// src/types.rs
// Canonical data model for zones, tests, subscriptions and notifications.
// All zone data entering the engine goes through RawZoneDefinition so the
// historical field-name variants are collapsed in exactly one place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::errors::{EngineError, EngineResult};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ZoneType {
    /// Supply / resistance band; price approaches from below.
    Hfz,
    /// Demand / support band; price approaches from above.
    Lfz,
}

impl ZoneType {
    pub fn label(&self) -> &'static str {
        match self {
            ZoneType::Hfz => "supply",
            ZoneType::Lfz => "demand",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ZoneStatus {
    Fresh,
    Tested1x,
    Tested2x,
    Tested3xPlus,
    Broken,
    Expired,
}

impl ZoneStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ZoneStatus::Broken | ZoneStatus::Expired)
    }

    /// Status implied by a touch count. Terminal states are never produced here.
    pub fn from_touches(touches: u32) -> Self {
        match touches {
            0 => ZoneStatus::Fresh,
            1 => ZoneStatus::Tested1x,
            2 => ZoneStatus::Tested2x,
            _ => ZoneStatus::Tested3xPlus,
        }
    }

    /// Sort key for freshness ordering: FRESH before TESTED_1X before TESTED_2X...
    pub fn freshness_rank(&self) -> u8 {
        match self {
            ZoneStatus::Fresh => 0,
            ZoneStatus::Tested1x => 1,
            ZoneStatus::Tested2x => 2,
            ZoneStatus::Tested3xPlus => 3,
            ZoneStatus::Broken => 4,
            ZoneStatus::Expired => 5,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Zone {
    pub id: String,
    pub symbol: String,
    pub timeframe: String,
    pub zone_type: ZoneType,
    pub price_high: f64,
    pub price_low: f64,
    pub status: ZoneStatus,
    pub touches: u32,
    pub strength: f64,
    pub grade: Option<String>,
    /// Producer-supplied break confirmation buffer; overrides the engine default.
    pub break_buffer_pct: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub last_tested_at: Option<DateTime<Utc>>,
}

impl Zone {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn contains(&self, price: f64) -> bool {
        price >= self.price_low && price <= self.price_high
    }

    /// Entry side of the zone: low for supply (price enters from below),
    /// high for demand (price enters from above).
    pub fn proximal_line(&self) -> f64 {
        match self.zone_type {
            ZoneType::Hfz => self.price_low,
            ZoneType::Lfz => self.price_high,
        }
    }

    /// Invalidation side of the zone.
    pub fn distal_line(&self) -> f64 {
        match self.zone_type {
            ZoneType::Hfz => self.price_high,
            ZoneType::Lfz => self.price_low,
        }
    }

    /// Price past which a break is confirmed, given a fallback buffer from config.
    pub fn break_confirm_level(&self, default_buffer_pct: f64) -> f64 {
        let buffer = self.break_buffer_pct.unwrap_or(default_buffer_pct);
        match self.zone_type {
            ZoneType::Hfz => self.price_high * (1.0 + buffer),
            ZoneType::Lfz => self.price_low * (1.0 - buffer),
        }
    }
}

/// Raw zone payload from the pattern producer. Older producers emitted several
/// field-name conventions for the same concepts; the aliases below are the one
/// normalization point, so every consumer downstream sees the canonical schema.
#[derive(Deserialize, Debug, Clone)]
pub struct RawZoneDefinition {
    pub symbol: String,
    pub timeframe: String,
    #[serde(alias = "type")]
    pub zone_type: ZoneType,
    #[serde(alias = "zone_high", alias = "price_high")]
    pub high: f64,
    #[serde(alias = "zone_low", alias = "price_low")]
    pub low: f64,
    #[serde(default, alias = "quality_score")]
    pub strength: Option<f64>,
    #[serde(default)]
    pub grade: Option<String>,
    #[serde(default, alias = "confirmation_buffer")]
    pub break_buffer_pct: Option<f64>,
}

impl RawZoneDefinition {
    pub fn validate(&self) -> EngineResult<()> {
        if !self.high.is_finite() || !self.low.is_finite() {
            return Err(EngineError::Validation(format!(
                "non-finite zone boundaries for {}: high={}, low={}",
                self.symbol, self.high, self.low
            )));
        }
        if self.high <= self.low {
            return Err(EngineError::Validation(format!(
                "zone high must exceed low for {}: high={}, low={}",
                self.symbol, self.high, self.low
            )));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TestOutcome {
    Hold,
    Break,
    /// Recorded from a live retest before the excursion resolves.
    Pending,
}

/// Append-only audit record of a price test against a zone. The id is the
/// test-event id: replaying the same event must not double-count a touch.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ZoneTest {
    pub id: String,
    pub zone_id: String,
    pub price_at_test: f64,
    pub outcome: TestOutcome,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AlertCategory {
    Retest,
    Broken,
    Approaching,
}

impl AlertCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertCategory::Retest => "retest",
            AlertCategory::Broken => "broken",
            AlertCategory::Approaching => "approaching",
        }
    }
}

/// A user's standing request to be alerted about one zone. Boundaries are a
/// denormalized snapshot so the subscription stays evaluable after the source
/// zone expires. Soft-deleted on unsubscribe; counts against the user's alert
/// quota only while active.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AlertSubscription {
    pub id: String,
    pub user_id: String,
    pub zone_id: String,
    pub symbol: String,
    pub zone_type: ZoneType,
    pub price_high: f64,
    pub price_low: f64,
    pub alert_types: Vec<AlertCategory>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle/alert event raised by the stream monitor for one zone on one tick.
#[derive(Serialize, Debug, Clone)]
pub struct ZoneEvent {
    pub category: AlertCategory,
    pub zone_id: String,
    pub symbol: String,
    pub timeframe: String,
    pub zone_type: ZoneType,
    pub price: f64,
    pub price_high: f64,
    pub price_low: f64,
    pub timestamp: DateTime<Utc>,
}

impl ZoneEvent {
    pub fn from_zone(category: AlertCategory, zone: &Zone, price: f64) -> Self {
        Self {
            category,
            zone_id: zone.id.clone(),
            symbol: zone.symbol.clone(),
            timeframe: zone.timeframe.clone(),
            zone_type: zone.zone_type,
            price,
            price_high: zone.price_high,
            price_low: zone.price_low,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPriority {
    Low,
    Normal,
    High,
}

/// Write-once audit row for a delivered (or attempted) notification.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NotificationEvent {
    pub id: String,
    pub event_type: AlertCategory,
    pub priority: NotificationPriority,
    pub user_id: String,
    pub zone_id: String,
    pub symbol: String,
    pub title: String,
    pub body: String,
    pub dedupe_key: String,
    pub sent_at: DateTime<Utc>,
}

/// Per-user alert and display preferences. Defaults keep every category on so
/// a user with no stored row still receives alerts they subscribed to.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ZoneAlertPreferences {
    pub user_id: String,
    pub show_hfz: bool,
    pub show_lfz: bool,
    pub notify_on_retest: bool,
    pub notify_on_broken: bool,
    pub notify_on_approaching: bool,
    pub max_zones: Option<u32>,
    #[serde(default)]
    pub custom_colors: HashMap<String, String>,
}

impl ZoneAlertPreferences {
    pub fn default_for(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            show_hfz: true,
            show_lfz: true,
            notify_on_retest: true,
            notify_on_broken: true,
            notify_on_approaching: true,
            max_zones: None,
            custom_colors: HashMap::new(),
        }
    }

    pub fn allows(&self, category: AlertCategory) -> bool {
        match category {
            AlertCategory::Retest => self.notify_on_retest,
            AlertCategory::Broken => self.notify_on_broken,
            AlertCategory::Approaching => self.notify_on_approaching,
        }
    }
}

/// A single price observation from the feed provider.
#[derive(Deserialize, Debug, Clone)]
pub struct PriceTick {
    pub symbol: String,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_from_touches_matches_freshness_ladder() {
        assert_eq!(ZoneStatus::from_touches(0), ZoneStatus::Fresh);
        assert_eq!(ZoneStatus::from_touches(1), ZoneStatus::Tested1x);
        assert_eq!(ZoneStatus::from_touches(2), ZoneStatus::Tested2x);
        assert_eq!(ZoneStatus::from_touches(3), ZoneStatus::Tested3xPlus);
        assert_eq!(ZoneStatus::from_touches(17), ZoneStatus::Tested3xPlus);
    }

    #[test]
    fn proximal_and_distal_lines_by_zone_type() {
        let mut zone = test_zone(ZoneType::Hfz, 1.1000, 1.0950);
        assert_eq!(zone.proximal_line(), 1.0950);
        assert_eq!(zone.distal_line(), 1.1000);

        zone.zone_type = ZoneType::Lfz;
        assert_eq!(zone.proximal_line(), 1.1000);
        assert_eq!(zone.distal_line(), 1.0950);
    }

    #[test]
    fn producer_buffer_overrides_engine_default() {
        let mut zone = test_zone(ZoneType::Hfz, 105.0, 100.0);
        assert!((zone.break_confirm_level(0.005) - 105.525).abs() < 1e-9);

        zone.break_buffer_pct = Some(0.01);
        assert!((zone.break_confirm_level(0.005) - 106.05).abs() < 1e-9);
    }

    #[test]
    fn raw_definition_rejects_inverted_boundaries() {
        let raw: RawZoneDefinition = serde_json::from_value(serde_json::json!({
            "symbol": "EURUSD",
            "timeframe": "1h",
            "type": "hfz",
            "high": 1.0900,
            "low": 1.0950
        }))
        .unwrap();
        assert!(raw.validate().is_err());
    }

    #[test]
    fn raw_definition_accepts_legacy_field_names() {
        let raw: RawZoneDefinition = serde_json::from_value(serde_json::json!({
            "symbol": "EURUSD",
            "timeframe": "4h",
            "zone_type": "lfz",
            "zone_high": 1.0950,
            "zone_low": 1.0900,
            "quality_score": 82.5
        }))
        .unwrap();
        assert!(raw.validate().is_ok());
        assert_eq!(raw.strength, Some(82.5));
    }

    fn test_zone(zone_type: ZoneType, high: f64, low: f64) -> Zone {
        Zone {
            id: "z1".to_string(),
            symbol: "EURUSD".to_string(),
            timeframe: "1h".to_string(),
            zone_type,
            price_high: high,
            price_low: low,
            status: ZoneStatus::Fresh,
            touches: 0,
            strength: 75.0,
            grade: None,
            break_buffer_pct: None,
            created_at: Utc::now(),
            last_tested_at: None,
        }
    }
}
