// src/zone_store.rs
// Zone lifecycle store: creation, the status state machine and touch
// bookkeeping. Mutations on the same zone id serialize through a per-zone
// lock so near-simultaneous ticks never double-count a touch or race a
// break/test transition.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::entitlement::TierCapabilities;
use crate::errors::{EngineError, EngineResult};
use crate::storage::ZoneRepository;
use crate::types::{RawZoneDefinition, TestOutcome, Zone, ZoneStatus, ZoneTest};

pub struct ZoneLifecycleStore {
    repo: Arc<dyn ZoneRepository>,
    zone_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>, // per-zone locks
    max_age_days: i64,
}

impl ZoneLifecycleStore {
    pub fn new(repo: Arc<dyn ZoneRepository>, max_age_days: i64) -> Self {
        Self {
            repo,
            zone_locks: Mutex::new(HashMap::new()),
            max_age_days,
        }
    }

    async fn lock_for(&self, zone_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.zone_locks.lock().await;
        locks
            .entry(zone_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Terminal zones take no further transitions, so their lock entry is
    /// dead weight. Late callers get a fresh lock from `lock_for`, which is
    /// harmless: every terminal operation is a no-op.
    async fn release_lock(&self, zone_id: &str) {
        self.zone_locks.lock().await.remove(zone_id);
    }

    /// Create a zone from a producer definition. Rejects inverted or
    /// non-finite boundaries synchronously; every new zone starts FRESH with
    /// zero touches.
    pub async fn create_zone(&self, raw: RawZoneDefinition) -> EngineResult<Zone> {
        raw.validate()?;

        let zone = Zone {
            id: Uuid::new_v4().to_string(),
            symbol: raw.symbol,
            timeframe: raw.timeframe,
            zone_type: raw.zone_type,
            price_high: raw.high,
            price_low: raw.low,
            status: ZoneStatus::Fresh,
            touches: 0,
            strength: raw.strength.unwrap_or(50.0).clamp(0.0, 100.0),
            grade: raw.grade,
            break_buffer_pct: raw.break_buffer_pct,
            created_at: Utc::now(),
            last_tested_at: None,
        };

        self.repo.insert_zone(zone.clone()).await?;
        info!(
            "[ZONE_STORE] Created {} zone {} for {}/{} [{:.5}-{:.5}]",
            zone.zone_type.label(),
            zone.id,
            zone.symbol,
            zone.timeframe,
            zone.price_low,
            zone.price_high
        );
        Ok(zone)
    }

    /// Append a test event and advance the freshness ladder. Idempotent per
    /// test-event id: replaying the same event never double-counts a touch.
    /// Terminal zones are left untouched.
    pub async fn record_test(
        &self,
        zone_id: &str,
        test_event_id: &str,
        price: f64,
        outcome: TestOutcome,
    ) -> EngineResult<Zone> {
        let lock = self.lock_for(zone_id).await;
        let _guard = lock.lock().await;

        let mut zone = self.get_zone_required(zone_id).await?;
        if zone.is_terminal() {
            debug!(
                "[ZONE_STORE] Ignoring test on terminal zone {} ({:?})",
                zone_id, zone.status
            );
            drop(_guard);
            self.release_lock(zone_id).await;
            return Ok(zone);
        }

        let test = ZoneTest {
            id: test_event_id.to_string(),
            zone_id: zone_id.to_string(),
            price_at_test: price,
            outcome,
            created_at: Utc::now(),
        };

        if !self.repo.insert_test(&test).await? {
            // Replay of an already-recorded excursion.
            return Ok(zone);
        }

        zone.touches += 1;
        zone.status = ZoneStatus::from_touches(zone.touches);
        zone.last_tested_at = Some(test.created_at);
        self.repo.update_zone(&zone).await?;

        info!(
            "[ZONE_STORE] Zone {} tested at {:.5} ({:?}) -> touches={}, status={:?}",
            zone_id, price, outcome, zone.touches, zone.status
        );
        Ok(zone)
    }

    /// Force the transition to BROKEN from any non-terminal state. A no-op
    /// when the zone is already terminal.
    pub async fn mark_broken(&self, zone_id: &str) -> EngineResult<Zone> {
        let lock = self.lock_for(zone_id).await;
        let _guard = lock.lock().await;

        let mut zone = self.get_zone_required(zone_id).await?;
        if zone.is_terminal() {
            drop(_guard);
            self.release_lock(zone_id).await;
            return Ok(zone);
        }

        zone.status = ZoneStatus::Broken;
        self.repo.update_zone(&zone).await?;
        drop(_guard);
        self.release_lock(zone_id).await;
        info!("[ZONE_STORE] Zone {} marked BROKEN", zone_id);
        Ok(zone)
    }

    /// Expire a zone. Idempotent; BROKEN zones stay BROKEN.
    pub async fn expire(&self, zone_id: &str) -> EngineResult<Zone> {
        let lock = self.lock_for(zone_id).await;
        let _guard = lock.lock().await;

        let mut zone = self.get_zone_required(zone_id).await?;
        if zone.is_terminal() {
            drop(_guard);
            self.release_lock(zone_id).await;
            return Ok(zone);
        }

        zone.status = ZoneStatus::Expired;
        self.repo.update_zone(&zone).await?;
        drop(_guard);
        self.release_lock(zone_id).await;
        info!("[ZONE_STORE] Zone {} EXPIRED", zone_id);
        Ok(zone)
    }

    pub async fn get_zone(&self, zone_id: &str) -> EngineResult<Option<Zone>> {
        self.repo.get_zone(zone_id).await
    }

    async fn get_zone_required(&self, zone_id: &str) -> EngineResult<Zone> {
        self.repo
            .get_zone(zone_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("zone {}", zone_id)))
    }

    /// Active (non-terminal) zones for a symbol, strongest first, ties broken
    /// by freshness then recency, capped by the caller's tier display limit.
    pub async fn get_active_zones(
        &self,
        symbol: &str,
        timeframe: Option<&str>,
        caps: Option<&TierCapabilities>,
    ) -> EngineResult<Vec<Zone>> {
        let mut zones: Vec<Zone> = self
            .repo
            .zones_for_symbol(symbol, timeframe)
            .await?
            .into_iter()
            .filter(|z| !z.is_terminal())
            .collect();

        zones.sort_by(|a, b| {
            b.strength
                .partial_cmp(&a.strength)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.status.freshness_rank().cmp(&b.status.freshness_rank()))
                .then(b.created_at.cmp(&a.created_at))
        });

        if let Some(caps) = caps {
            zones.truncate(caps.max_zones_displayed as usize);
        }
        Ok(zones)
    }

    /// Expire every active zone on (symbol, timeframe, type) that has been
    /// superseded by a more recently created one.
    pub async fn expire_superseded(&self, symbol: &str, timeframe: &str) -> EngineResult<usize> {
        let zones = self.repo.zones_for_symbol(symbol, Some(timeframe)).await?;
        let mut newest: HashMap<crate::types::ZoneType, DateTime<Utc>> = HashMap::new();
        for zone in zones.iter().filter(|z| !z.is_terminal()) {
            let entry = newest.entry(zone.zone_type).or_insert(zone.created_at);
            if zone.created_at > *entry {
                *entry = zone.created_at;
            }
        }

        let mut expired = 0;
        for zone in zones.iter().filter(|z| !z.is_terminal()) {
            if let Some(latest) = newest.get(&zone.zone_type) {
                if zone.created_at < *latest {
                    self.expire(&zone.id).await?;
                    expired += 1;
                }
            }
        }
        Ok(expired)
    }

    /// One sweep over every zone: age-based expiry plus supersession. Both
    /// triggers are independent; either alone is enough to expire a zone.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> EngineResult<usize> {
        let horizon = now - Duration::days(self.max_age_days);
        let zones = self.repo.all_zones().await?;

        let mut expired = 0;
        let mut pairs: Vec<(String, String)> = Vec::new();
        for zone in zones.iter().filter(|z| !z.is_terminal()) {
            if zone.created_at < horizon {
                self.expire(&zone.id).await?;
                expired += 1;
            } else if !pairs.contains(&(zone.symbol.clone(), zone.timeframe.clone())) {
                pairs.push((zone.symbol.clone(), zone.timeframe.clone()));
            }
        }

        for (symbol, timeframe) in pairs {
            expired += self.expire_superseded(&symbol, &timeframe).await?;
        }

        if expired > 0 {
            info!("[ZONE_STORE] Lifecycle sweep expired {} zones", expired);
        }
        Ok(expired)
    }

    /// Periodic lifecycle sweeper; runs until the shutdown signal flips.
    pub async fn run_lifecycle_sweeper(
        self: Arc<Self>,
        interval_secs: u64,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        if interval_secs == 0 {
            info!("[ZONE_STORE] Sweep interval is 0, lifecycle sweeper won't run.");
            return;
        }

        let mut timer = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        timer.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if let Err(e) = self.sweep_expired(Utc::now()).await {
                        warn!("[ZONE_STORE] Lifecycle sweep failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("[ZONE_STORE] Lifecycle sweeper shutting down");
                        return;
                    }
                }
            }
        }
    }
}
