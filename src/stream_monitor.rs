// src/stream_monitor.rs
// Real-time stream monitor: one task per watched symbol owning a queue of
// ticks. Tick handling for a symbol is strictly sequential; symbols run
// independently of each other. Each task holds the in-memory snapshot of its
// symbol's active zones; nothing else mutates that snapshot.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::feed::PriceFeedProvider;
use crate::types::{AlertCategory, PriceTick, TestOutcome, Zone, ZoneEvent, ZoneType};
use crate::zone_store::ZoneLifecycleStore;

struct WatchEntry {
    refcount: usize,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct StreamMonitor {
    store: Arc<ZoneLifecycleStore>,
    feed: Arc<dyn PriceFeedProvider>,
    events_tx: mpsc::Sender<ZoneEvent>,
    watches: Mutex<HashMap<String, WatchEntry>>,
    config: EngineConfig,
}

impl StreamMonitor {
    /// Build a monitor and hand back the event stream the dispatcher drains.
    pub fn new(
        store: Arc<ZoneLifecycleStore>,
        feed: Arc<dyn PriceFeedProvider>,
        config: EngineConfig,
    ) -> (Self, mpsc::Receiver<ZoneEvent>) {
        let (events_tx, events_rx) = mpsc::channel(512);
        (
            Self {
                store,
                feed,
                events_tx,
                watches: Mutex::new(HashMap::new()),
                config,
            },
            events_rx,
        )
    }

    /// Open a feed for a symbol, or bump its refcount if one is already
    /// open. Idempotent per caller: each watch is balanced by one unwatch.
    pub async fn watch(&self, symbol: &str) {
        let mut watches = self.watches.lock().await;
        if let Some(entry) = watches.get_mut(symbol) {
            entry.refcount += 1;
            debug!(
                "[MONITOR] {} already watched, refcount now {}",
                symbol, entry.refcount
            );
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_symbol_task(
            Arc::clone(&self.store),
            Arc::clone(&self.feed),
            self.events_tx.clone(),
            symbol.to_string(),
            self.config.clone(),
            shutdown_rx,
        ));

        watches.insert(
            symbol.to_string(),
            WatchEntry {
                refcount: 1,
                shutdown_tx,
                task,
            },
        );
        info!("[MONITOR] Opened feed for {}", symbol);
    }

    /// Drop one reference; the symbol's feed task is cancelled and its zone
    /// snapshot discarded once the last reference is gone.
    pub async fn unwatch(&self, symbol: &str) {
        let mut watches = self.watches.lock().await;
        let Some(entry) = watches.get_mut(symbol) else {
            debug!("[MONITOR] unwatch({}) with no open feed", symbol);
            return;
        };

        entry.refcount -= 1;
        if entry.refcount > 0 {
            debug!("[MONITOR] {} refcount now {}", symbol, entry.refcount);
            return;
        }

        let entry = watches.remove(symbol).expect("entry checked above");
        let _ = entry.shutdown_tx.send(true);
        entry.task.abort();
        info!("[MONITOR] Closed feed for {} (last subscription removed)", symbol);
    }

    pub async fn is_watched(&self, symbol: &str) -> bool {
        self.watches.lock().await.contains_key(symbol)
    }

    pub async fn watched_symbols(&self) -> Vec<String> {
        self.watches.lock().await.keys().cloned().collect()
    }

    /// Cancel every feed task and clear all watch state.
    pub async fn shutdown(&self) {
        let mut watches = self.watches.lock().await;
        for (symbol, entry) in watches.drain() {
            let _ = entry.shutdown_tx.send(true);
            entry.task.abort();
            info!("[MONITOR] Shut down feed for {}", symbol);
        }
    }
}

/// In-memory view one symbol task works against between snapshot refreshes.
struct SymbolState {
    zones: Vec<Zone>,
    last_price: Option<f64>,
}

async fn run_symbol_task(
    store: Arc<ZoneLifecycleStore>,
    feed: Arc<dyn PriceFeedProvider>,
    events_tx: mpsc::Sender<ZoneEvent>,
    symbol: String,
    config: EngineConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut state = SymbolState {
        zones: Vec::new(),
        last_price: None,
    };
    refresh_snapshot(&store, &symbol, &mut state).await;

    let mut refresh = tokio::time::interval(Duration::from_secs(config.zone_refresh_secs.max(1)));
    refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    refresh.tick().await; // consume the immediate first tick

    let mut backoff = config.reconnect_base_secs.max(1);

    loop {
        let mut ticks = match feed.subscribe(&symbol).await {
            Ok(rx) => {
                info!("[MONITOR] {} feed connected", symbol);
                backoff = config.reconnect_base_secs.max(1);
                rx
            }
            Err(e) => {
                warn!("[MONITOR] {} feed subscribe failed: {}", symbol, e);
                if wait_backoff(&mut backoff, config.reconnect_max_secs, &mut shutdown).await {
                    return;
                }
                continue;
            }
        };

        loop {
            tokio::select! {
                maybe_tick = ticks.recv() => match maybe_tick {
                    Some(tick) => {
                        handle_tick(&store, &events_tx, &mut state, &config, &tick).await;
                    }
                    None => {
                        warn!("[MONITOR] {} feed lost, reconnecting", symbol);
                        break;
                    }
                },
                _ = refresh.tick() => {
                    refresh_snapshot(&store, &symbol, &mut state).await;
                }
                changed = shutdown.changed() => {
                    // A dropped sender counts as shutdown too.
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("[MONITOR] {} task cancelled", symbol);
                        return;
                    }
                }
            }
        }

        if wait_backoff(&mut backoff, config.reconnect_max_secs, &mut shutdown).await {
            return;
        }
    }
}

/// Sleep for the current backoff step, doubling it toward the ceiling.
/// Returns true when shutdown was signalled during the wait.
async fn wait_backoff(
    backoff: &mut u64,
    ceiling: u64,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    debug!("[MONITOR] Reconnecting in {}s", backoff);
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(*backoff)) => {
            *backoff = (*backoff * 2).min(ceiling.max(1));
            false
        }
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

/// Re-pull the active zone snapshot so zones created or broken elsewhere are
/// picked up without restarting the feed.
async fn refresh_snapshot(store: &ZoneLifecycleStore, symbol: &str, state: &mut SymbolState) {
    match store.get_active_zones(symbol, None, None).await {
        Ok(zones) => {
            debug!("[MONITOR] {} snapshot refreshed: {} active zones", symbol, zones.len());
            state.zones = zones;
        }
        Err(e) => {
            // Transient persistence failures keep the stale snapshot; the
            // next refresh retries.
            warn!("[MONITOR] {} snapshot refresh failed: {}", symbol, e);
        }
    }
}

/// Pure per-zone evaluation, priority order break > retest > approach.
/// At most one category fires per tick per zone.
fn evaluate_zone(
    zone: &Zone,
    prev_price: Option<f64>,
    price: f64,
    config: &EngineConfig,
) -> Option<AlertCategory> {
    if zone.is_terminal() {
        return None;
    }

    let confirm = zone.break_confirm_level(config.break_buffer_pct);
    let beyond = |p: f64| match zone.zone_type {
        ZoneType::Hfz => p > confirm,
        ZoneType::Lfz => p < confirm,
    };
    if beyond(price) && !prev_price.map_or(false, beyond) {
        return Some(AlertCategory::Broken);
    }

    if zone.contains(price) && prev_price.map_or(false, |p| !zone.contains(p)) {
        return Some(AlertCategory::Retest);
    }

    // Approach alerts cover the proximal (entry) side only. Beyond the
    // distal boundary price is inside the break buffer and its next state
    // change is a confirmed break, not an approach.
    if !zone.contains(price) {
        let proximal = zone.proximal_line();
        let approaching = match zone.zone_type {
            ZoneType::Hfz => price < proximal && proximal - price <= proximal * config.approach_band_pct,
            ZoneType::Lfz => price > proximal && price - proximal <= proximal * config.approach_band_pct,
        };
        if approaching {
            return Some(AlertCategory::Approaching);
        }
    }

    None
}

async fn handle_tick(
    store: &ZoneLifecycleStore,
    events_tx: &mpsc::Sender<ZoneEvent>,
    state: &mut SymbolState,
    config: &EngineConfig,
    tick: &PriceTick,
) {
    // Malformed ticks are dropped and logged, never propagated as errors.
    if !tick.price.is_finite() || tick.price <= 0.0 {
        warn!(
            "[MONITOR] Dropping malformed tick for {}: {}",
            tick.symbol, tick.price
        );
        return;
    }

    let prev_price = state.last_price;
    for zone in state.zones.iter_mut() {
        let Some(category) = evaluate_zone(zone, prev_price, tick.price, config) else {
            continue;
        };

        // Store errors are logged and the loop continues with the other
        // zones; one bad zone never aborts the tick.
        match category {
            AlertCategory::Broken => {
                match store.mark_broken(&zone.id).await {
                    Ok(updated) => *zone = updated,
                    Err(e) => {
                        error!("[MONITOR] mark_broken({}) failed: {}", zone.id, e);
                        continue;
                    }
                }
            }
            AlertCategory::Retest => {
                let event_id = Uuid::new_v4().to_string();
                match store
                    .record_test(&zone.id, &event_id, tick.price, TestOutcome::Pending)
                    .await
                {
                    Ok(updated) => *zone = updated,
                    Err(e) => {
                        error!("[MONITOR] record_test({}) failed: {}", zone.id, e);
                        continue;
                    }
                }
            }
            AlertCategory::Approaching => {}
        }

        let event = ZoneEvent::from_zone(category, zone, tick.price);
        info!(
            "[MONITOR] {} {:?} on {} zone {} @ {:.5}",
            tick.symbol,
            category,
            zone.zone_type.label(),
            zone.id,
            tick.price
        );
        if events_tx.send(event).await.is_err() {
            debug!("[MONITOR] Event channel closed, dropping event");
        }
    }

    state.last_price = Some(tick.price);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::ChannelFeed;
    use crate::storage::memory::MemoryStore;
    use crate::types::{RawZoneDefinition, ZoneStatus};

    fn config() -> EngineConfig {
        EngineConfig {
            zone_refresh_secs: 3600,
            ..EngineConfig::default()
        }
    }

    fn hfz_zone(high: f64, low: f64) -> Zone {
        Zone {
            id: "z1".to_string(),
            symbol: "EURUSD".to_string(),
            timeframe: "1h".to_string(),
            zone_type: ZoneType::Hfz,
            price_high: high,
            price_low: low,
            status: ZoneStatus::Fresh,
            touches: 0,
            strength: 80.0,
            grade: None,
            break_buffer_pct: None,
            created_at: chrono::Utc::now(),
            last_tested_at: None,
        }
    }

    #[test]
    fn break_requires_confirmation_buffer() {
        let zone = hfz_zone(105.0, 100.0);
        let cfg = config();

        // 105.5 is above the boundary but inside the 0.5% buffer.
        assert_eq!(evaluate_zone(&zone, Some(104.0), 105.5, &cfg), None);
        assert_eq!(
            evaluate_zone(&zone, Some(104.0), 106.1, &cfg),
            Some(AlertCategory::Broken)
        );
        // Previous tick already beyond the confirm level: no repeat break.
        assert_eq!(evaluate_zone(&zone, Some(106.1), 106.5, &cfg), None);
    }

    #[test]
    fn retest_needs_entry_from_outside() {
        let zone = hfz_zone(105.0, 100.0);
        let cfg = config();

        assert_eq!(
            evaluate_zone(&zone, Some(99.0), 102.0, &cfg),
            Some(AlertCategory::Retest)
        );
        // Already inside on the previous tick: nothing new.
        assert_eq!(evaluate_zone(&zone, Some(102.0), 103.0, &cfg), None);
        // No previous tick: cannot know it entered.
        assert_eq!(evaluate_zone(&zone, None, 102.0, &cfg), None);
    }

    #[test]
    fn approach_fires_only_near_the_proximal_side() {
        let zone = hfz_zone(105.0, 100.0);
        let cfg = config();

        // Within 1% below the proximal low.
        assert_eq!(
            evaluate_zone(&zone, Some(98.0), 99.5, &cfg),
            Some(AlertCategory::Approaching)
        );
        // Too far away.
        assert_eq!(evaluate_zone(&zone, Some(97.0), 98.0, &cfg), None);
    }

    #[test]
    fn demand_zone_break_is_downward() {
        let mut zone = hfz_zone(105.0, 100.0);
        zone.zone_type = ZoneType::Lfz;
        let cfg = config();

        assert_eq!(
            evaluate_zone(&zone, Some(101.0), 99.4, &cfg),
            Some(AlertCategory::Broken)
        );
        assert_eq!(evaluate_zone(&zone, Some(101.0), 99.8, &cfg), None);
    }

    #[test]
    fn terminal_zones_are_silent() {
        let mut zone = hfz_zone(105.0, 100.0);
        zone.status = ZoneStatus::Broken;
        assert_eq!(evaluate_zone(&zone, Some(99.0), 102.0, &config()), None);
    }

    async fn setup_monitor() -> (
        Arc<ZoneLifecycleStore>,
        Arc<ChannelFeed>,
        StreamMonitor,
        mpsc::Receiver<ZoneEvent>,
    ) {
        let store = Arc::new(ZoneLifecycleStore::new(Arc::new(MemoryStore::new()), 30));
        let feed = Arc::new(ChannelFeed::new());
        let (monitor, events_rx) = StreamMonitor::new(
            Arc::clone(&store),
            Arc::clone(&feed) as Arc<dyn PriceFeedProvider>,
            config(),
        );
        (store, feed, monitor, events_rx)
    }

    #[tokio::test]
    async fn retest_then_confirmed_break_then_silence() {
        let (store, feed, monitor, mut events_rx) = setup_monitor().await;

        let raw: RawZoneDefinition = serde_json::from_value(serde_json::json!({
            "symbol": "EURUSD", "timeframe": "1h", "zone_type": "hfz",
            "high": 105.0, "low": 100.0
        }))
        .unwrap();
        let zone = store.create_zone(raw).await.unwrap();

        monitor.watch("EURUSD").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Outside (clear of the approach band), then inside: retest.
        assert!(feed.push("EURUSD", 98.0));
        assert!(feed.push("EURUSD", 102.0));

        let event = tokio::time::timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.category, AlertCategory::Retest);

        let tested = store.get_zone(&zone.id).await.unwrap().unwrap();
        assert_eq!(tested.touches, 1);
        assert_eq!(tested.status, ZoneStatus::Tested1x);

        // Past 105 * 1.005: confirmed break.
        assert!(feed.push("EURUSD", 106.1));
        let event = tokio::time::timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.category, AlertCategory::Broken);
        assert_eq!(
            store.get_zone(&zone.id).await.unwrap().unwrap().status,
            ZoneStatus::Broken
        );

        // Terminal zone: further ticks produce nothing.
        assert!(feed.push("EURUSD", 102.0));
        assert!(feed.push("EURUSD", 106.5));
        let silence =
            tokio::time::timeout(Duration::from_millis(300), events_rx.recv()).await;
        assert!(silence.is_err());

        monitor.shutdown().await;
    }

    #[tokio::test]
    async fn malformed_ticks_are_dropped_without_state_change() {
        let (store, feed, monitor, mut events_rx) = setup_monitor().await;

        let raw: RawZoneDefinition = serde_json::from_value(serde_json::json!({
            "symbol": "EURUSD", "timeframe": "1h", "zone_type": "hfz",
            "high": 105.0, "low": 100.0
        }))
        .unwrap();
        let zone = store.create_zone(raw).await.unwrap();

        monitor.watch("EURUSD").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(feed.push("EURUSD", f64::NAN));
        assert!(feed.push("EURUSD", -3.0));
        let silence =
            tokio::time::timeout(Duration::from_millis(300), events_rx.recv()).await;
        assert!(silence.is_err());
        assert_eq!(store.get_zone(&zone.id).await.unwrap().unwrap().touches, 0);

        monitor.shutdown().await;
    }

    #[tokio::test]
    async fn dropping_the_monitor_stops_symbol_tasks() {
        let (_store, feed, monitor, _events_rx) = setup_monitor().await;

        monitor.watch("EURUSD").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(feed.is_connected("EURUSD"));

        // No shutdown() call: dropping the monitor drops every watch
        // sender, and the symbol task must exit instead of spinning.
        drop(monitor);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!feed.is_connected("EURUSD"));
    }

    #[tokio::test]
    async fn last_unwatch_closes_the_feed() {
        let (_store, feed, monitor, _events_rx) = setup_monitor().await;

        monitor.watch("GBPUSD").await;
        monitor.watch("GBPUSD").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(feed.is_connected("GBPUSD"));

        monitor.unwatch("GBPUSD").await;
        assert!(monitor.is_watched("GBPUSD").await);

        monitor.unwatch("GBPUSD").await;
        assert!(!monitor.is_watched("GBPUSD").await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!feed.is_connected("GBPUSD"));
    }
}
