//! Recent activity cache sync
//!
//! Mirrors a bounded, most-recent-first window of raw Created payloads and
//! two "today" counters into a fast external store, so dashboards and
//! restarted processes can read recent activity without replaying the
//! broker.
//!
//! The mirror is best effort. The authoritative state is the aggregator plus
//! the committed broker offsets, so every store failure is logged, counted
//! and swallowed here.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Serialize;
use tracing::{debug, info, warn};
use types::numeric::Amount;

use crate::error::MirrorError;
use crate::events::OrderEvent;
use crate::metrics::ServiceMetrics;

/// Bounded list of raw recent order payloads.
pub const RECENT_ORDERS_KEY: &str = "recent_orders";
/// Scalar counter incremented once per mirrored order.
pub const ORDERS_TODAY_KEY: &str = "total_orders_today";
/// Scalar float counter incremented by each mirrored order's amount.
pub const REVENUE_TODAY_KEY: &str = "revenue_today";

/// Default window capacity.
pub const DEFAULT_WINDOW_CAPACITY: usize = 100;

/// The "today" counters. Reset by an external day-boundary job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyCounters {
    pub orders_today: u64,
    pub revenue_today: Amount,
}

/// External store holding the recent-activity window.
#[async_trait]
pub trait ActivityStore: Send + Sync {
    /// Push `entry` to the front of the window, trim the window to
    /// `capacity`, and bump both counters, as one unit.
    async fn push_recent(
        &self,
        entry: String,
        amount: Amount,
        capacity: usize,
    ) -> Result<(), MirrorError>;

    /// Up to `limit` entries, most recent first.
    async fn recent(&self, limit: usize) -> Result<Vec<String>, MirrorError>;

    async fn counters(&self) -> Result<DailyCounters, MirrorError>;

    /// Short name for health reporting.
    fn backend(&self) -> &'static str;
}

/// Redis-backed store (LPUSH/LTRIM list plus INCR/INCRBYFLOAT counters).
pub struct RedisActivityStore {
    conn: ConnectionManager,
}

impl RedisActivityStore {
    pub async fn connect(url: &str) -> Result<Self, MirrorError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        info!(url, "Connected to Redis activity store");
        Ok(Self { conn })
    }
}

#[async_trait]
impl ActivityStore for RedisActivityStore {
    async fn push_recent(
        &self,
        entry: String,
        amount: Amount,
        capacity: usize,
    ) -> Result<(), MirrorError> {
        let mut conn = self.conn.clone();
        let last = capacity.saturating_sub(1) as isize;
        redis::pipe()
            .atomic()
            .lpush(RECENT_ORDERS_KEY, entry)
            .ignore()
            .ltrim(RECENT_ORDERS_KEY, 0, last)
            .ignore()
            .incr(ORDERS_TODAY_KEY, 1)
            .ignore()
            .cmd("INCRBYFLOAT")
            .arg(REVENUE_TODAY_KEY)
            .arg(amount.to_string())
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<String>, MirrorError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let entries: Vec<String> = conn
            .lrange(RECENT_ORDERS_KEY, 0, limit as isize - 1)
            .await?;
        Ok(entries)
    }

    async fn counters(&self) -> Result<DailyCounters, MirrorError> {
        let mut conn = self.conn.clone();
        let (orders, revenue): (Option<u64>, Option<String>) = redis::pipe()
            .get(ORDERS_TODAY_KEY)
            .get(REVENUE_TODAY_KEY)
            .query_async(&mut conn)
            .await?;

        let revenue_today = match revenue {
            Some(raw) => raw
                .parse::<Amount>()
                .map_err(|e| MirrorError::Corrupt(e.to_string()))?,
            None => Amount::ZERO,
        };
        Ok(DailyCounters {
            orders_today: orders.unwrap_or(0),
            revenue_today,
        })
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

#[derive(Debug, Default)]
struct LocalWindow {
    entries: VecDeque<String>,
    counters: DailyCounters,
}

/// In-process store, used when no Redis URL is configured.
#[derive(Debug, Default)]
pub struct InMemoryActivityStore {
    window: Mutex<LocalWindow>,
}

impl InMemoryActivityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ActivityStore for InMemoryActivityStore {
    async fn push_recent(
        &self,
        entry: String,
        amount: Amount,
        capacity: usize,
    ) -> Result<(), MirrorError> {
        let mut window = self.window.lock();
        window.entries.push_front(entry);
        window.entries.truncate(capacity);
        window.counters.orders_today += 1;
        window.counters.revenue_today = window.counters.revenue_today.saturating_add(amount);
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<String>, MirrorError> {
        let window = self.window.lock();
        Ok(window.entries.iter().take(limit).cloned().collect())
    }

    async fn counters(&self) -> Result<DailyCounters, MirrorError> {
        Ok(self.window.lock().counters)
    }

    fn backend(&self) -> &'static str {
        "in-memory"
    }
}

/// Configuration for the cache sync.
#[derive(Debug, Clone)]
pub struct CacheSyncConfig {
    pub window_capacity: usize,
    /// Upper bound on a single store round trip.
    pub op_timeout: Duration,
}

impl Default for CacheSyncConfig {
    fn default() -> Self {
        Self {
            window_capacity: DEFAULT_WINDOW_CAPACITY,
            op_timeout: Duration::from_millis(1000),
        }
    }
}

/// Writes Created events into the recent-activity window.
pub struct CacheSync {
    store: Arc<dyn ActivityStore>,
    config: CacheSyncConfig,
    metrics: Arc<ServiceMetrics>,
}

impl CacheSync {
    pub fn new(
        store: Arc<dyn ActivityStore>,
        config: CacheSyncConfig,
        metrics: Arc<ServiceMetrics>,
    ) -> Self {
        info!(
            backend = store.backend(),
            window_capacity = config.window_capacity,
            "CacheSync initialized"
        );
        Self {
            store,
            config,
            metrics,
        }
    }

    /// Mirror a Created event. Never fails; store errors are logged.
    pub async fn mirror(&self, event: &OrderEvent) {
        if let Err(err) = self.try_mirror(event).await {
            self.metrics.record_mirror_failure();
            warn!(
                order_id = %event.order_id,
                error = %err,
                "Failed to mirror order into recent activity window"
            );
        }
    }

    async fn try_mirror(&self, event: &OrderEvent) -> Result<(), MirrorError> {
        let amount = event.total_amount().unwrap_or(Amount::ZERO);
        let push = self
            .store
            .push_recent(event.raw_json(), amount, self.config.window_capacity);
        self.bounded(push).await?;
        debug!(order_id = %event.order_id, "Mirrored order");
        Ok(())
    }

    /// Most recent raw payloads, newest first.
    pub async fn recent_orders(&self, limit: usize) -> Result<Vec<String>, MirrorError> {
        let limit = limit.min(self.config.window_capacity);
        self.bounded(self.store.recent(limit)).await
    }

    pub async fn daily_counters(&self) -> Result<DailyCounters, MirrorError> {
        self.bounded(self.store.counters()).await
    }

    pub fn window_capacity(&self) -> usize {
        self.config.window_capacity
    }

    pub fn backend(&self) -> &'static str {
        self.store.backend()
    }

    async fn bounded<T>(
        &self,
        op: impl std::future::Future<Output = Result<T, MirrorError>>,
    ) -> Result<T, MirrorError> {
        match tokio::time::timeout(self.config.op_timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(MirrorError::Timeout(
                self.config.op_timeout.as_millis() as u64,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::decode;

    /// Store that is never reachable.
    struct DownStore;

    #[async_trait]
    impl ActivityStore for DownStore {
        async fn push_recent(&self, _: String, _: Amount, _: usize) -> Result<(), MirrorError> {
            Err(MirrorError::Unavailable("connection refused".to_string()))
        }

        async fn recent(&self, _: usize) -> Result<Vec<String>, MirrorError> {
            Err(MirrorError::Unavailable("connection refused".to_string()))
        }

        async fn counters(&self) -> Result<DailyCounters, MirrorError> {
            Err(MirrorError::Unavailable("connection refused".to_string()))
        }

        fn backend(&self) -> &'static str {
            "down"
        }
    }

    /// Store that never answers.
    struct StalledStore;

    #[async_trait]
    impl ActivityStore for StalledStore {
        async fn push_recent(&self, _: String, _: Amount, _: usize) -> Result<(), MirrorError> {
            std::future::pending().await
        }

        async fn recent(&self, _: usize) -> Result<Vec<String>, MirrorError> {
            std::future::pending().await
        }

        async fn counters(&self) -> Result<DailyCounters, MirrorError> {
            std::future::pending().await
        }

        fn backend(&self) -> &'static str {
            "stalled"
        }
    }

    fn created_event(order: usize, amount: u64) -> OrderEvent {
        let raw = format!(
            r#"{{"eventType":"ORDER_CREATED","orderId":"o-{}","userId":"u","timestamp":"2024-01-01T10:00:00","totalAmount":{}}}"#,
            order, amount
        );
        decode(raw.as_bytes()).unwrap()
    }

    fn sync_with(
        store: Arc<dyn ActivityStore>,
        capacity: usize,
    ) -> (CacheSync, Arc<ServiceMetrics>) {
        let metrics = Arc::new(ServiceMetrics::new());
        let config = CacheSyncConfig {
            window_capacity: capacity,
            op_timeout: Duration::from_millis(50),
        };
        (CacheSync::new(store, config, Arc::clone(&metrics)), metrics)
    }

    #[tokio::test]
    async fn test_window_trims_to_capacity_most_recent_first() {
        let store = Arc::new(InMemoryActivityStore::new());
        let (sync, _) = sync_with(store.clone(), 100);

        for i in 0..105 {
            sync.mirror(&created_event(i, 1)).await;
        }

        let recent = sync.recent_orders(1_000).await.unwrap();
        assert_eq!(recent.len(), 100);
        assert!(recent[0].contains("\"o-104\""));
        assert!(recent[99].contains("\"o-5\""));
    }

    #[tokio::test]
    async fn test_counters_move_in_lockstep() {
        let store = Arc::new(InMemoryActivityStore::new());
        let (sync, _) = sync_with(store, 3);

        sync.mirror(&created_event(1, 10)).await;
        sync.mirror(&created_event(2, 15)).await;
        sync.mirror(&created_event(3, 5)).await;
        sync.mirror(&created_event(4, 20)).await;

        let counters = sync.daily_counters().await.unwrap();
        assert_eq!(counters.orders_today, 4);
        assert_eq!(counters.revenue_today, Amount::from_u64(50));
        assert_eq!(sync.recent_orders(10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_mirror_failure_is_swallowed() {
        let (sync, metrics) = sync_with(Arc::new(DownStore), 100);

        sync.mirror(&created_event(1, 10)).await;

        assert_eq!(metrics.export()["mirror_failures"], 1);
        assert!(sync.recent_orders(10).await.is_err());
    }

    #[tokio::test]
    async fn test_stalled_store_times_out() {
        let (sync, metrics) = sync_with(Arc::new(StalledStore), 100);

        sync.mirror(&created_event(1, 10)).await;

        assert_eq!(metrics.export()["mirror_failures"], 1);
        assert_eq!(
            sync.daily_counters().await,
            Err(MirrorError::Timeout(50))
        );
    }
}
