//! Order Analytics Service
//!
//! Consumes order lifecycle events from the broker and produces:
//! - Live aggregates (order count, revenue, status distribution, hourly buckets)
//! - A bounded recent-activity window mirrored into Redis
//! - Periodic `RealtimeStats` pushes to connected dashboards
//! - Thin HTTP query endpoints over the current snapshot
//!
//! Delivery is at-least-once: offsets are stored only after an event has
//! been decoded and routed (or rejected as poison).
//!
//! # Architecture
//!
//! ```text
//!   Kafka (order-events, order-analytics)
//!        │
//!    ┌───▼────┐
//!    │Ingest  │  ← poll, backoff, offset commit
//!    └───┬────┘
//!    ┌───▼────┐
//!    │Decode  │  ← malformed payloads skipped
//!    └───┬────┘
//!    ┌───▼────┐
//!    │Route   │
//!    └─┬────┬─┘
//!      │    │ (Created only)
//! ┌────▼──┐ ┌▼─────────┐
//! │Aggreg.│ │CacheSync │ → Redis recent_orders
//! └──┬──┬─┘ └────┬─────┘
//!    │  │        │
//!    │ ┌▼────────▼──┐
//!    │ │Broadcaster │  ← every 5s, skip if busy
//!    │ └─────┬──────┘
//!    │       │
//! ┌──▼───┐ ┌─▼─────────────┐
//! │ HTTP │ │ WebSocket subs│
//! └──────┘ └───────────────┘
//! ```

pub mod aggregator;
pub mod api;
pub mod broadcast;
pub mod cache;
pub mod config;
pub mod decoder;
pub mod error;
pub mod events;
pub mod ingestion;
pub mod metrics;
pub mod router;
pub mod service;
pub mod websocket;

// Library version
pub const SERVICE_VERSION: &str = "0.1.0";
