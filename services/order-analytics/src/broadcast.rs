//! Snapshot broadcaster
//!
//! On a fixed period takes one aggregator snapshot, enriches it with
//! recent-activity data into a `RealtimeStats` message, and fans it out to
//! every connected subscriber.
//!
//! Each subscriber owns a bounded outbound queue drained by its own writer
//! task, so the broadcaster only ever does a non-blocking enqueue. A full
//! queue (lagging) or a closed one (gone) removes that subscriber on the
//! spot; nothing is retried. A cycle that fires while the previous one is
//! still running is skipped, never queued.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use types::numeric::Amount;

use crate::aggregator::{MetricsAggregator, Snapshot};
use crate::cache::CacheSync;
use crate::decoder::decode;
use crate::error::{DeliveryError, LifecycleError};
use crate::ingestion::StopOutcome;
use crate::metrics::ServiceMetrics;

/// Unique subscriber identifier.
pub type SubscriberId = u64;

/// Per-product aggregate over the recent-activity window.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductMetrics {
    pub product_id: String,
    pub product_name: String,
    pub total_quantity_sold: u64,
    pub total_revenue: Amount,
    pub order_count: u64,
}

/// The live push message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeStats {
    pub current_orders_per_minute: f64,
    pub revenue_per_minute: Amount,
    pub active_users: u64,
    pub top_products: Vec<ProductMetrics>,
    pub recent_orders: Vec<Value>,
    pub total_orders: u64,
    pub total_revenue: Amount,
    pub avg_order_value: Amount,
    pub cancelled_orders: u64,
    pub timestamp: DateTime<Utc>,
}

/// Knobs for deriving `RealtimeStats`.
#[derive(Debug, Clone)]
pub struct StatsConfig {
    pub recent_orders: usize,
    pub top_products: usize,
    pub active_user_window: Duration,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            recent_orders: 10,
            top_products: 5,
            active_user_window: Duration::from_secs(300),
        }
    }
}

/// Derive the live message from one snapshot and the recent-activity
/// window (most recent first). Entries that do not decode are skipped.
pub fn build_realtime_stats(
    snapshot: &Snapshot,
    window: &[String],
    now: DateTime<Utc>,
    config: &StatsConfig,
) -> RealtimeStats {
    let minute_ago = now - chrono::Duration::seconds(60);
    let active_since = now
        - chrono::Duration::from_std(config.active_user_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));

    let mut orders_last_minute = 0u64;
    let mut revenue_last_minute = Amount::ZERO;
    let mut active_users = BTreeSet::new();
    let mut products: BTreeMap<String, ProductMetrics> = BTreeMap::new();
    let mut recent_orders = Vec::with_capacity(config.recent_orders);

    for entry in window {
        let Ok(event) = decode(entry.as_bytes()) else {
            debug!("Skipping unreadable recent-activity entry");
            continue;
        };

        let in_window = |since: DateTime<Utc>| event.timestamp > since && event.timestamp <= now;

        if in_window(minute_ago) {
            orders_last_minute += 1;
            let amount = event.total_amount().unwrap_or(Amount::ZERO);
            revenue_last_minute = revenue_last_minute.saturating_add(amount);
        }
        if in_window(active_since) && !event.user_id.is_empty() {
            active_users.insert(event.user_id.as_str().to_string());
        }
        if let Some(Value::Array(items)) = event.payload.get("items") {
            for item in items {
                accumulate_item(&mut products, item);
            }
        }
        if recent_orders.len() < config.recent_orders {
            recent_orders.push(Value::Object(event.payload));
        }
    }

    let top_products = rank(products, config.top_products);

    RealtimeStats {
        current_orders_per_minute: orders_last_minute as f64,
        revenue_per_minute: revenue_last_minute,
        active_users: active_users.len() as u64,
        top_products,
        recent_orders,
        total_orders: snapshot.total_orders,
        total_revenue: snapshot.total_revenue,
        avg_order_value: snapshot.avg_order_value,
        cancelled_orders: snapshot.cancelled_orders,
        timestamp: now,
    }
}

/// Product aggregates over the `items` of every readable window entry,
/// highest revenue first, at most `limit` of them.
pub fn top_products(window: &[String], limit: usize) -> Vec<ProductMetrics> {
    let mut products = BTreeMap::new();
    for event in window.iter().filter_map(|entry| decode(entry.as_bytes()).ok()) {
        if let Some(Value::Array(items)) = event.payload.get("items") {
            for item in items {
                accumulate_item(&mut products, item);
            }
        }
    }
    rank(products, limit)
}

fn rank(products: BTreeMap<String, ProductMetrics>, limit: usize) -> Vec<ProductMetrics> {
    let mut ranked: Vec<ProductMetrics> = products.into_values().collect();
    ranked.sort_by(|a, b| {
        b.total_revenue
            .cmp(&a.total_revenue)
            .then_with(|| a.product_id.cmp(&b.product_id))
    });
    ranked.truncate(limit);
    ranked
}

fn accumulate_item(products: &mut BTreeMap<String, ProductMetrics>, item: &Value) {
    let name = item
        .get("productName")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty());
    let id = match item.get("productId") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => match name {
            Some(name) => name.to_string(),
            None => return,
        },
    };

    let quantity = match item.get("quantity") {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    };
    let revenue = match item.get("totalPrice") {
        Some(v) if !v.is_null() => Amount::from_json(v).unwrap_or(Amount::ZERO),
        _ => item
            .get("unitPrice")
            .and_then(|v| Amount::from_json(v).ok())
            .map(|unit| unit.saturating_times(quantity))
            .unwrap_or(Amount::ZERO),
    };

    let product = products.entry(id.clone()).or_insert_with(|| ProductMetrics {
        product_id: id.clone(),
        product_name: name.unwrap_or(id.as_str()).to_string(),
        total_quantity_sold: 0,
        total_revenue: Amount::ZERO,
        order_count: 0,
    });
    product.total_quantity_sold = product.total_quantity_sold.saturating_add(quantity);
    product.total_revenue = product.total_revenue.saturating_add(revenue);
    product.order_count += 1;
}

/// Result of one fan-out.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub dropped: Vec<(SubscriberId, DeliveryError)>,
}

/// Connected subscribers and their outbound queues.
///
/// Safe to register and remove concurrently with `deliver`. A subscriber
/// registered during a delivery may or may not receive that message; a
/// removed one never receives anything afterwards because its sender is
/// gone.
pub struct SubscriberRegistry {
    subscribers: DashMap<SubscriberId, mpsc::Sender<Arc<str>>>,
    next_id: AtomicU64,
    queue_capacity: usize,
    metrics: Arc<ServiceMetrics>,
}

impl SubscriberRegistry {
    pub fn new(queue_capacity: usize, metrics: Arc<ServiceMetrics>) -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
            metrics,
        }
    }

    /// Register a new subscriber and return its id and outbound queue.
    pub fn register(&self) -> (SubscriberId, mpsc::Receiver<Arc<str>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        self.subscribers.insert(id, tx);
        self.metrics
            .set_connected_subscribers(self.subscribers.len() as u64);
        info!(subscriber_id = id, "Subscriber connected");
        (id, rx)
    }

    /// Remove a subscriber. Returns false if it was already gone.
    pub fn remove(&self, id: SubscriberId) -> bool {
        let removed = self.subscribers.remove(&id).is_some();
        if removed {
            self.metrics
                .set_connected_subscribers(self.subscribers.len() as u64);
            info!(subscriber_id = id, "Subscriber disconnected");
        }
        removed
    }

    pub fn count(&self) -> usize {
        self.subscribers.len()
    }

    /// Enqueue `payload` for every subscriber without waiting.
    pub fn deliver(&self, payload: Arc<str>) -> DeliveryReport {
        let mut report = DeliveryReport::default();

        for entry in self.subscribers.iter() {
            match entry.value().try_send(Arc::clone(&payload)) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    report.dropped.push((*entry.key(), DeliveryError::Lagging))
                }
                Err(TrySendError::Closed(_)) => {
                    report.dropped.push((*entry.key(), DeliveryError::Closed))
                }
            }
        }

        // Iteration guards are released; safe to mutate the map now.
        for (id, reason) in &report.dropped {
            if self.subscribers.remove(id).is_some() {
                self.metrics.record_subscriber_dropped();
                warn!(subscriber_id = *id, reason = %reason, "Dropping subscriber");
            }
        }
        if !report.dropped.is_empty() {
            self.metrics
                .set_connected_subscribers(self.subscribers.len() as u64);
        }

        report
    }
}

/// What a single broadcast cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastOutcome {
    Delivered(DeliveryReport),
    /// Nobody is listening
    Idle,
    /// The previous cycle was still running
    Skipped,
    Failed,
}

/// Configuration for the broadcaster.
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    pub interval: Duration,
    pub stats: StatsConfig,
    pub shutdown_grace: Duration,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            stats: StatsConfig::default(),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct RunningTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Periodic fan-out of `RealtimeStats`.
pub struct SnapshotBroadcaster {
    aggregator: Arc<MetricsAggregator>,
    cache: Arc<CacheSync>,
    registry: Arc<SubscriberRegistry>,
    metrics: Arc<ServiceMetrics>,
    config: BroadcastConfig,
    in_flight: AtomicBool,
    task: Mutex<Option<RunningTask>>,
}

impl SnapshotBroadcaster {
    pub fn new(
        aggregator: Arc<MetricsAggregator>,
        cache: Arc<CacheSync>,
        registry: Arc<SubscriberRegistry>,
        metrics: Arc<ServiceMetrics>,
        config: BroadcastConfig,
    ) -> Self {
        info!(
            interval_ms = config.interval.as_millis() as u64,
            "SnapshotBroadcaster initialized"
        );
        Self {
            aggregator,
            cache,
            registry,
            metrics,
            config,
            in_flight: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> Arc<SubscriberRegistry> {
        Arc::clone(&self.registry)
    }

    /// Compute the live message now. One snapshot, one window read.
    pub async fn realtime_stats(&self) -> RealtimeStats {
        let snapshot = self.aggregator.snapshot();
        let window = match self.cache.recent_orders(self.cache.window_capacity()).await {
            Ok(window) => window,
            Err(err) => {
                warn!(error = %err, "Recent activity unavailable, broadcasting totals only");
                Vec::new()
            }
        };
        build_realtime_stats(&snapshot, &window, Utc::now(), &self.config.stats)
    }

    /// Run one broadcast cycle unless another is still in flight.
    pub async fn broadcast_once(&self) -> BroadcastOutcome {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            self.metrics.record_broadcast_skipped();
            debug!("Previous broadcast still running, skipping cycle");
            return BroadcastOutcome::Skipped;
        }
        let _guard = InFlight(&self.in_flight);

        if self.registry.count() == 0 {
            return BroadcastOutcome::Idle;
        }

        let started = Instant::now();
        let stats = self.realtime_stats().await;
        let payload: Arc<str> = match serde_json::to_string(&stats) {
            Ok(json) => Arc::from(json),
            Err(err) => {
                error!(error = %err, "Failed to serialize realtime stats");
                return BroadcastOutcome::Failed;
            }
        };

        let report = self.registry.deliver(payload);
        self.metrics
            .record_broadcast(report.delivered as u64, started.elapsed().as_nanos() as u64);
        debug!(
            delivered = report.delivered,
            dropped = report.dropped.len(),
            "Broadcast cycle complete"
        );
        BroadcastOutcome::Delivered(report)
    }

    /// Spawn the periodic loop. The first cycle runs one interval from now.
    pub fn start(self: &Arc<Self>) -> Result<(), LifecycleError> {
        let mut slot = self.task.lock();
        if slot.is_some() {
            return Err(LifecycleError::AlreadyRunning("snapshot broadcaster"));
        }

        let token = CancellationToken::new();
        let this = Arc::clone(self);
        let cancelled = token.clone();
        let handle = tokio::spawn(async move { this.run(cancelled).await });
        *slot = Some(RunningTask { token, handle });
        Ok(())
    }

    async fn run(&self, token: CancellationToken) {
        let period = self.config.interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Broadcast loop running");

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    self.broadcast_once().await;
                }
            }
        }

        info!("Broadcast loop stopped");
    }

    /// Stop the loop, waiting at most the shutdown grace period.
    pub async fn stop(&self) -> StopOutcome {
        let Some(task) = self.task.lock().take() else {
            return StopOutcome::NotRunning;
        };
        task.token.cancel();

        let mut handle = task.handle;
        match tokio::time::timeout(self.config.shutdown_grace, &mut handle).await {
            Ok(Ok(())) => StopOutcome::Graceful,
            Ok(Err(join_err)) => {
                error!(error = %join_err, "Broadcast task ended abnormally");
                StopOutcome::Forced
            }
            Err(_) => {
                handle.abort();
                warn!("Broadcast loop did not stop in time, aborted");
                StopOutcome::Forced
            }
        }
    }
}
