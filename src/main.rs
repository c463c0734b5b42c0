// src/main.rs
// Zone engine entry point. Services are constructed explicitly and passed by
// reference; there are no global singletons and no load-time side effects.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use zone_engine::config::EngineConfig;
use zone_engine::dispatcher::NotificationDispatcher;
use zone_engine::entitlement::{EntitlementGate, QuotaKind, StaticTierResolver};
use zone_engine::errors::EngineError;
use zone_engine::feed::PriceFeedProvider;
use zone_engine::push::WebhookPush;
use zone_engine::storage::memory::MemoryStore;
use zone_engine::storage::{
    NotificationLogRepository, PreferenceRepository, QuotaRepository, SubscriptionRepository,
    ZoneRepository,
};
use zone_engine::stream_monitor::StreamMonitor;
use zone_engine::subscriptions::AlertSubscriptionService;
use zone_engine::types::{AlertCategory, RawZoneDefinition, Zone};
use zone_engine::ws_feed::WsFeedProvider;
use zone_engine::zone_store::ZoneLifecycleStore;

#[derive(Clone)]
struct AppState {
    zones: Arc<ZoneLifecycleStore>,
    gate: Arc<EntitlementGate>,
    subscriptions: Arc<AlertSubscriptionService>,
    monitor: Arc<StreamMonitor>,
}

fn error_response(err: EngineError) -> (StatusCode, Json<Value>) {
    let (status, upgrade) = match &err {
        EngineError::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, false),
        EngineError::NotFound(_) => (StatusCode::NOT_FOUND, false),
        // Quota and entitlement rejections surface as explicit upgrade
        // prompts, never generic failures.
        EngineError::QuotaExceeded { .. } | EngineError::EntitlementDenied(_) => {
            (StatusCode::FORBIDDEN, true)
        }
        EngineError::TransientIo(_) => (StatusCode::SERVICE_UNAVAILABLE, false),
        EngineError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, false),
    };
    let mut body = json!({ "error": err.to_string() });
    if upgrade {
        body["upgrade_required"] = json!(true);
    }
    (status, Json(body))
}

#[derive(Deserialize)]
struct ZonesQuery {
    timeframe: Option<String>,
    user_id: Option<String>,
}

async fn zones_api(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
    Query(query): Query<ZonesQuery>,
) -> Result<Json<Vec<Zone>>, (StatusCode, Json<Value>)> {
    let caps = match &query.user_id {
        Some(user_id) => Some(
            state
                .gate
                .capabilities_for(user_id)
                .await
                .map_err(error_response)?,
        ),
        None => None,
    };
    let zones = state
        .zones
        .get_active_zones(&symbol, query.timeframe.as_deref(), caps.as_ref())
        .await
        .map_err(error_response)?;
    Ok(Json(zones))
}

async fn create_zone_api(
    State(state): State<AppState>,
    Json(raw): Json<RawZoneDefinition>,
) -> Result<(StatusCode, Json<Zone>), (StatusCode, Json<Value>)> {
    let zone = state.zones.create_zone(raw).await.map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(zone)))
}

#[derive(Deserialize)]
struct SubscribeRequest {
    user_id: String,
    zone_id: String,
    alert_types: Vec<AlertCategory>,
}

async fn subscribe_api(
    State(state): State<AppState>,
    Json(req): Json<SubscribeRequest>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let sub = state
        .subscriptions
        .subscribe(&req.user_id, &req.zone_id, req.alert_types)
        .await
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(json!(sub))))
}

async fn unsubscribe_api(
    State(state): State<AppState>,
    Path(sub_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let sub = state
        .subscriptions
        .unsubscribe(&sub_id)
        .await
        .map_err(error_response)?;
    Ok(Json(json!(sub)))
}

async fn quota_api(
    State(state): State<AppState>,
    Path((user_id, kind)): Path<(String, String)>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let kind = match kind.as_str() {
        "zone_alerts" => QuotaKind::ZoneAlerts,
        "daily_scans" => QuotaKind::DailyScans,
        other => {
            return Err(error_response(EngineError::Validation(format!(
                "unknown quota kind '{}'",
                other
            ))))
        }
    };
    let status = state
        .gate
        .check_quota(&user_id, kind)
        .await
        .map_err(error_response)?;
    Ok(Json(json!(status)))
}

async fn status_api(State(state): State<AppState>) -> Json<Value> {
    let symbols = state.monitor.watched_symbols().await;
    Json(json!({
        "watched_symbols": symbols,
        "status": "running",
    }))
}

async fn health_api() -> &'static str {
    "OK"
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    let config = EngineConfig::from_env();

    // Backing store and external collaborators. The in-memory store stands
    // in until a persistence engine is wired through the storage traits.
    let store = Arc::new(MemoryStore::new());
    let resolver = Arc::new(StaticTierResolver::new(
        &std::env::var("DEFAULT_TIER").unwrap_or_else(|_| "free".to_string()),
    ));
    let push = Arc::new(WebhookPush::new(config.push_webhook_url.clone()));
    let feed = Arc::new(WsFeedProvider::new(&config.feed_ws_url));

    // Core services, leaves first: gate, store, monitor, dispatcher.
    let gate = Arc::new(EntitlementGate::new(
        resolver,
        Arc::clone(&store) as Arc<dyn QuotaRepository>,
        Arc::clone(&store) as Arc<dyn SubscriptionRepository>,
    ));
    let zones = Arc::new(ZoneLifecycleStore::new(
        Arc::clone(&store) as Arc<dyn ZoneRepository>,
        config.zone_max_age_days,
    ));
    let (monitor, events_rx) = StreamMonitor::new(
        Arc::clone(&zones),
        Arc::clone(&feed) as Arc<dyn PriceFeedProvider>,
        config.clone(),
    );
    let monitor = Arc::new(monitor);
    let dispatcher = Arc::new(NotificationDispatcher::new(
        Arc::clone(&gate),
        Arc::clone(&store) as Arc<dyn SubscriptionRepository>,
        Arc::clone(&store) as Arc<dyn PreferenceRepository>,
        Arc::clone(&store) as Arc<dyn NotificationLogRepository>,
        push,
        config.cooldown_secs,
    ));
    let subscriptions = Arc::new(AlertSubscriptionService::new(
        Arc::clone(&zones),
        Arc::clone(&store) as Arc<dyn SubscriptionRepository>,
        Arc::clone(&gate),
        Arc::clone(&monitor),
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let dispatch_task = tokio::spawn(Arc::clone(&dispatcher).run_dispatch_loop(events_rx));
    let sweeper_task = tokio::spawn(
        Arc::clone(&zones).run_lifecycle_sweeper(config.sweep_interval_secs, shutdown_rx),
    );

    let app_state = AppState {
        zones,
        gate,
        subscriptions,
        monitor: Arc::clone(&monitor),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health_api))
        .route("/status", get(status_api))
        .route("/zones", post(create_zone_api))
        .route("/zones/:symbol", get(zones_api))
        .route("/subscriptions", post(subscribe_api))
        .route("/subscriptions/:sub_id", delete(unsubscribe_api))
        .route("/quota/:user_id/:kind", get(quota_api))
        .layer(cors)
        .with_state(app_state);

    let listener = match tokio::net::TcpListener::bind(&config.api_bind).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {}", config.api_bind, e);
            return;
        }
    };
    info!("🚀 Zone engine API listening on {}", config.api_bind);

    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await;
    if let Err(e) = serve_result {
        error!("Server error: {}", e);
    }

    // Tear down: cancel every feed task, stop the sweeper, let the
    // dispatcher drain whatever is left in the event queue.
    monitor.shutdown().await;
    let _ = shutdown_tx.send(true);
    sweeper_task.abort();
    dispatch_task.abort();
    info!("Zone engine stopped");
}
