// src/feed.rs
// Price-feed provider contract. The transport is an external collaborator;
// the monitor only sees a channel of ticks per symbol.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::errors::EngineResult;
use crate::types::PriceTick;

#[async_trait]
pub trait PriceFeedProvider: Send + Sync {
    /// Open a logical feed for one symbol. The receiver closes when the
    /// upstream connection is lost; the caller re-subscribes with backoff.
    async fn subscribe(&self, symbol: &str) -> EngineResult<mpsc::Receiver<PriceTick>>;
}

/// Channel-backed feed for tests and local runs: ticks are injected by hand
/// instead of arriving over a socket.
#[derive(Default)]
pub struct ChannelFeed {
    senders: DashMap<String, mpsc::Sender<PriceTick>>,
}

impl ChannelFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject one tick. Returns false when no live subscription exists for
    /// the symbol (never opened, or the monitor tore it down).
    pub fn push(&self, symbol: &str, price: f64) -> bool {
        match self.senders.get(symbol) {
            Some(sender) => sender
                .try_send(PriceTick {
                    symbol: symbol.to_string(),
                    price,
                    timestamp: Utc::now(),
                })
                .is_ok(),
            None => false,
        }
    }

    /// Simulate a feed loss by closing the upstream side.
    pub fn disconnect(&self, symbol: &str) {
        self.senders.remove(symbol);
    }

    /// True while a subscriber still holds the receiving end.
    pub fn is_connected(&self, symbol: &str) -> bool {
        self.senders
            .get(symbol)
            .map(|s| !s.is_closed())
            .unwrap_or(false)
    }
}

#[async_trait]
impl PriceFeedProvider for ChannelFeed {
    async fn subscribe(&self, symbol: &str) -> EngineResult<mpsc::Receiver<PriceTick>> {
        let (tx, rx) = mpsc::channel(256);
        self.senders.insert(symbol.to_string(), tx);
        Ok(rx)
    }
}
