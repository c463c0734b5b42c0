// src/lib.rs
pub mod config;
pub mod dispatcher;
pub mod entitlement;
pub mod errors;
pub mod feed;
pub mod push;
pub mod storage;
pub mod stream_monitor;
pub mod subscriptions;
pub mod types;
pub mod ws_feed;
pub mod zone_store;
