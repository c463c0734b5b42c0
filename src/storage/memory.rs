// src/storage/memory.rs
// In-memory reference backend. Used by the test suite and as the default
// store when no external persistence engine is wired up.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::errors::EngineResult;
use crate::storage::{
    NotificationLogRepository, PreferenceRepository, QuotaConsumption, QuotaRepository,
    SubscriptionRepository, ZoneRepository,
};
use crate::types::{
    AlertSubscription, NotificationEvent, Zone, ZoneAlertPreferences, ZoneTest,
};

#[derive(Default)]
pub struct MemoryStore {
    zones: RwLock<HashMap<String, Zone>>,
    tests: RwLock<HashMap<String, ZoneTest>>, // keyed by test-event id
    subscriptions: RwLock<HashMap<String, AlertSubscription>>,
    // DashMap entry access gives the atomic compare-and-increment the quota
    // contract requires; key = "user:kind:day".
    quota_counters: DashMap<String, u32>,
    notification_log: RwLock<Vec<NotificationEvent>>,
    preferences: RwLock<HashMap<String, ZoneAlertPreferences>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn quota_key(user_id: &str, kind: &str, day_bucket: &str) -> String {
        format!("{}:{}:{}", user_id, kind, day_bucket)
    }
}

#[async_trait]
impl ZoneRepository for MemoryStore {
    async fn insert_zone(&self, zone: Zone) -> EngineResult<()> {
        self.zones.write().await.insert(zone.id.clone(), zone);
        Ok(())
    }

    async fn get_zone(&self, zone_id: &str) -> EngineResult<Option<Zone>> {
        Ok(self.zones.read().await.get(zone_id).cloned())
    }

    async fn update_zone(&self, zone: &Zone) -> EngineResult<()> {
        self.zones
            .write()
            .await
            .insert(zone.id.clone(), zone.clone());
        Ok(())
    }

    async fn zones_for_symbol(
        &self,
        symbol: &str,
        timeframe: Option<&str>,
    ) -> EngineResult<Vec<Zone>> {
        let zones = self.zones.read().await;
        Ok(zones
            .values()
            .filter(|z| z.symbol == symbol)
            .filter(|z| timeframe.map_or(true, |tf| z.timeframe == tf))
            .cloned()
            .collect())
    }

    async fn all_zones(&self) -> EngineResult<Vec<Zone>> {
        Ok(self.zones.read().await.values().cloned().collect())
    }

    async fn insert_test(&self, test: &ZoneTest) -> EngineResult<bool> {
        let mut tests = self.tests.write().await;
        if tests.contains_key(&test.id) {
            debug!("[MEMORY_STORE] Duplicate test event {} ignored", test.id);
            return Ok(false);
        }
        tests.insert(test.id.clone(), test.clone());
        Ok(true)
    }

    async fn tests_for_zone(&self, zone_id: &str) -> EngineResult<Vec<ZoneTest>> {
        let tests = self.tests.read().await;
        let mut out: Vec<ZoneTest> = tests
            .values()
            .filter(|t| t.zone_id == zone_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }
}

#[async_trait]
impl SubscriptionRepository for MemoryStore {
    async fn insert_capped(&self, sub: AlertSubscription, max_active: i64) -> EngineResult<bool> {
        // Single write lock makes the count-and-insert atomic.
        let mut subs = self.subscriptions.write().await;
        if max_active >= 0 {
            let active = subs
                .values()
                .filter(|s| s.user_id == sub.user_id && s.active)
                .count() as i64;
            if active >= max_active {
                return Ok(false);
            }
        }
        subs.insert(sub.id.clone(), sub);
        Ok(true)
    }

    async fn get(&self, sub_id: &str) -> EngineResult<Option<AlertSubscription>> {
        Ok(self.subscriptions.read().await.get(sub_id).cloned())
    }

    async fn deactivate(&self, sub_id: &str) -> EngineResult<Option<AlertSubscription>> {
        let mut subs = self.subscriptions.write().await;
        match subs.get_mut(sub_id) {
            Some(sub) => {
                let before = sub.clone();
                sub.active = false;
                Ok(Some(before))
            }
            None => Ok(None),
        }
    }

    async fn active_for_user(&self, user_id: &str) -> EngineResult<Vec<AlertSubscription>> {
        let subs = self.subscriptions.read().await;
        Ok(subs
            .values()
            .filter(|s| s.user_id == user_id && s.active)
            .cloned()
            .collect())
    }

    async fn active_count(&self, user_id: &str) -> EngineResult<usize> {
        let subs = self.subscriptions.read().await;
        Ok(subs
            .values()
            .filter(|s| s.user_id == user_id && s.active)
            .count())
    }

    async fn active_for_zone(&self, zone_id: &str) -> EngineResult<Vec<AlertSubscription>> {
        let subs = self.subscriptions.read().await;
        Ok(subs
            .values()
            .filter(|s| s.zone_id == zone_id && s.active)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl QuotaRepository for MemoryStore {
    async fn try_consume(
        &self,
        user_id: &str,
        kind: &str,
        day_bucket: &str,
        limit: i64,
    ) -> EngineResult<QuotaConsumption> {
        let key = Self::quota_key(user_id, kind, day_bucket);
        // The entry holds a shard lock for the whole check-and-increment, so
        // concurrent callers can never push the counter past the limit.
        let mut entry = self.quota_counters.entry(key).or_insert(0);
        if limit >= 0 && i64::from(*entry) >= limit {
            return Ok(QuotaConsumption {
                allowed: false,
                used: *entry,
            });
        }
        *entry += 1;
        Ok(QuotaConsumption {
            allowed: true,
            used: *entry,
        })
    }

    async fn current_usage(
        &self,
        user_id: &str,
        kind: &str,
        day_bucket: &str,
    ) -> EngineResult<u32> {
        let key = Self::quota_key(user_id, kind, day_bucket);
        Ok(self.quota_counters.get(&key).map(|v| *v).unwrap_or(0))
    }
}

#[async_trait]
impl NotificationLogRepository for MemoryStore {
    async fn append(&self, event: NotificationEvent) -> EngineResult<()> {
        self.notification_log.write().await.push(event);
        Ok(())
    }

    async fn for_user(&self, user_id: &str) -> EngineResult<Vec<NotificationEvent>> {
        let log = self.notification_log.read().await;
        Ok(log.iter().filter(|e| e.user_id == user_id).cloned().collect())
    }
}

#[async_trait]
impl PreferenceRepository for MemoryStore {
    async fn get(&self, user_id: &str) -> EngineResult<Option<ZoneAlertPreferences>> {
        Ok(self.preferences.read().await.get(user_id).cloned())
    }

    async fn upsert(&self, prefs: ZoneAlertPreferences) -> EngineResult<()> {
        self.preferences
            .write()
            .await
            .insert(prefs.user_id.clone(), prefs);
        Ok(())
    }
}
