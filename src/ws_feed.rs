// src/ws_feed.rs
// WebSocket-backed price feed provider. One connection per subscribed
// symbol; the tick channel closes when the connection drops and the stream
// monitor re-subscribes with backoff.

use async_trait::async_trait;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::errors::{EngineError, EngineResult};
use crate::feed::PriceFeedProvider;
use crate::types::PriceTick;

pub struct WsFeedProvider {
    url: String,
}

impl WsFeedProvider {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl PriceFeedProvider for WsFeedProvider {
    async fn subscribe(&self, symbol: &str) -> EngineResult<mpsc::Receiver<PriceTick>> {
        let (ws_stream, _) = connect_async(&self.url)
            .await
            .map_err(|e| EngineError::TransientIo(format!("feed connect: {}", e)))?;
        info!("[WS_FEED] Connected to {} for {}", self.url, symbol);

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(run_feed_connection(ws_stream, symbol.to_string(), tx));
        Ok(rx)
    }
}

async fn run_feed_connection(
    ws_stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    symbol: String,
    tx: mpsc::Sender<PriceTick>,
) {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let subscribe_msg = json!({
        "type": "SUBSCRIBE",
        "symbol": symbol,
    });
    if let Err(e) = ws_sender
        .send(Message::Text(subscribe_msg.to_string()))
        .await
    {
        error!("[WS_FEED] Failed to send subscription for {}: {}", symbol, e);
        return;
    }
    debug!("[WS_FEED] Subscribed to {}", symbol);

    let mut message_count: u64 = 0;
    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                message_count += 1;
                if let Some(tick) = parse_tick(&text, &symbol) {
                    if tx.send(tick).await.is_err() {
                        // Subscriber torn down; nothing left to feed.
                        debug!("[WS_FEED] {} receiver dropped, closing", symbol);
                        return;
                    }
                }
            }
            Ok(Message::Ping(payload)) => {
                if let Err(e) = ws_sender.send(Message::Pong(payload)).await {
                    error!("[WS_FEED] Failed to send pong: {}", e);
                }
            }
            Ok(Message::Close(_)) => {
                warn!("[WS_FEED] {} connection closed by server", symbol);
                break;
            }
            Err(e) => {
                error!("[WS_FEED] {} connection error: {}", symbol, e);
                break;
            }
            _ => {}
        }
    }

    info!(
        "[WS_FEED] {} feed ended after {} messages",
        symbol, message_count
    );
    // Dropping tx closes the channel; the monitor reconnects with backoff.
}

fn parse_tick(text: &str, expected_symbol: &str) -> Option<PriceTick> {
    let data: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!("[WS_FEED] Unparseable message: {}", e);
            return None;
        }
    };

    match data.get("type").and_then(|t| t.as_str()) {
        Some("TICK") => {
            let symbol = data.get("symbol").and_then(|s| s.as_str()).unwrap_or("");
            if symbol != expected_symbol {
                debug!("[WS_FEED] Ignoring tick for {}", symbol);
                return None;
            }
            // Non-numeric prices become NaN here and are dropped (and
            // logged) by the monitor's malformed-tick guard.
            let price = data
                .get("price")
                .and_then(|p| p.as_f64())
                .unwrap_or(f64::NAN);
            let timestamp = data
                .get("timestamp")
                .and_then(|t| t.as_str())
                .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(Utc::now);
            Some(PriceTick {
                symbol: symbol.to_string(),
                price,
                timestamp,
            })
        }
        Some("SUBSCRIPTION_CONFIRMED") => {
            debug!("[WS_FEED] Subscription confirmed: {:?}", data.get("symbol"));
            None
        }
        Some("ERROR") => {
            error!("[WS_FEED] Server error: {:?}", data);
            None
        }
        other => {
            debug!("[WS_FEED] Unknown message type: {:?}", other);
            None
        }
    }
}
