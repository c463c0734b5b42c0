// src/config.rs
// Engine configuration loaded from environment variables with sensible defaults.
// Policy constants (break buffer, cooldown, refresh cadence) live here rather
// than in code so they can be tuned without a rebuild.

use std::env;
use tracing::info;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Fractional buffer past a zone boundary required to confirm a break (0.005 = 0.5%).
    /// A zone carrying its own buffer from the pattern producer takes precedence.
    pub break_buffer_pct: f64,
    /// Fractional band around the proximal boundary that counts as "approaching" (0.01 = 1%).
    pub approach_band_pct: f64,
    /// Minimum seconds between notifications for the same (user, event, symbol).
    pub cooldown_secs: u64,
    /// How often each watched symbol re-pulls its active zone snapshot.
    pub zone_refresh_secs: u64,
    /// Zones older than this are expired by the lifecycle sweeper.
    pub zone_max_age_days: i64,
    /// How often the lifecycle sweeper runs.
    pub sweep_interval_secs: u64,
    /// Initial delay before a feed reconnect attempt.
    pub reconnect_base_secs: u64,
    /// Backoff ceiling for feed reconnect attempts.
    pub reconnect_max_secs: u64,
    /// Bind address for the status/subscription API.
    pub api_bind: String,
    /// WebSocket URL of the upstream price feed.
    pub feed_ws_url: String,
    /// Optional webhook URL for push delivery; push is disabled when unset.
    pub push_webhook_url: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            break_buffer_pct: 0.005,
            approach_band_pct: 0.01,
            cooldown_secs: 60,
            zone_refresh_secs: 300,
            zone_max_age_days: 30,
            sweep_interval_secs: 600,
            reconnect_base_secs: 2,
            reconnect_max_secs: 60,
            api_bind: "0.0.0.0:8080".to_string(),
            feed_ws_url: "ws://127.0.0.1:8081/ws".to_string(),
            push_webhook_url: None,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let config = Self {
            break_buffer_pct: env_or("ZONE_BREAK_BUFFER_PCT", defaults.break_buffer_pct),
            approach_band_pct: env_or("ZONE_APPROACH_BAND_PCT", defaults.approach_band_pct),
            cooldown_secs: env_or("NOTIFICATION_COOLDOWN_SECS", defaults.cooldown_secs),
            zone_refresh_secs: env_or("ZONE_REFRESH_INTERVAL_SECS", defaults.zone_refresh_secs),
            zone_max_age_days: env_or("ZONE_MAX_AGE_DAYS", defaults.zone_max_age_days),
            sweep_interval_secs: env_or("ZONE_SWEEP_INTERVAL_SECS", defaults.sweep_interval_secs),
            reconnect_base_secs: env_or("FEED_RECONNECT_BASE_SECS", defaults.reconnect_base_secs),
            reconnect_max_secs: env_or("FEED_RECONNECT_MAX_SECS", defaults.reconnect_max_secs),
            api_bind: env::var("API_BIND").unwrap_or(defaults.api_bind),
            feed_ws_url: env::var("FEED_WS_URL").unwrap_or(defaults.feed_ws_url),
            push_webhook_url: env::var("PUSH_WEBHOOK_URL").ok(),
        };

        info!("[CONFIG] Engine configuration loaded:");
        info!(
            "[CONFIG]   break buffer: {:.2}%, approach band: {:.2}%",
            config.break_buffer_pct * 100.0,
            config.approach_band_pct * 100.0
        );
        info!(
            "[CONFIG]   cooldown: {}s, zone refresh: {}s, sweep: {}s",
            config.cooldown_secs, config.zone_refresh_secs, config.sweep_interval_secs
        );

        config
    }
}
