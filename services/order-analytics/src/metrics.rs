//! Observability counters for the analytics service
//!
//! Tracks ingestion throughput and failures, mirror health, broadcast
//! cycles and subscriber churn. Exported as a flat name → value map on the
//! health endpoint.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Core metrics for the analytics service.
pub struct ServiceMetrics {
    // Ingestion
    pub events_processed: AtomicU64,
    pub events_rejected: AtomicU64,
    pub events_ignored: AtomicU64,
    pub route_failures: AtomicU64,
    pub broker_errors: AtomicU64,
    pub event_processing_ns: Mutex<LatencyTracker>,

    // Mirror
    pub mirror_failures: AtomicU64,

    // Broadcasting
    pub broadcasts_sent: AtomicU64,
    pub broadcasts_skipped: AtomicU64,
    pub deliveries: AtomicU64,
    pub broadcast_latency_ns: Mutex<LatencyTracker>,

    // Subscribers
    pub connected_subscribers: AtomicU64,
    pub subscribers_dropped: AtomicU64,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            events_processed: AtomicU64::new(0),
            events_rejected: AtomicU64::new(0),
            events_ignored: AtomicU64::new(0),
            route_failures: AtomicU64::new(0),
            broker_errors: AtomicU64::new(0),
            event_processing_ns: Mutex::new(LatencyTracker::new(1000)),
            mirror_failures: AtomicU64::new(0),
            broadcasts_sent: AtomicU64::new(0),
            broadcasts_skipped: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
            broadcast_latency_ns: Mutex::new(LatencyTracker::new(100)),
            connected_subscribers: AtomicU64::new(0),
            subscribers_dropped: AtomicU64::new(0),
        }
    }

    /// Record an event routed to an aggregator mutation.
    pub fn record_event_processed(&self, latency_ns: u64) {
        self.events_processed.fetch_add(1, Ordering::Relaxed);
        self.event_processing_ns.lock().record(latency_ns);
    }

    /// Record a message that failed to decode.
    pub fn record_event_rejected(&self) {
        self.events_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a decoded event of an unknown type.
    pub fn record_event_ignored(&self) {
        self.events_ignored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_route_failure(&self) {
        self.route_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_broker_error(&self) {
        self.broker_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_mirror_failure(&self) {
        self.mirror_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed broadcast cycle.
    pub fn record_broadcast(&self, delivered: u64, latency_ns: u64) {
        self.broadcasts_sent.fetch_add(1, Ordering::Relaxed);
        self.deliveries.fetch_add(delivered, Ordering::Relaxed);
        self.broadcast_latency_ns.lock().record(latency_ns);
    }

    /// Record a cycle skipped because the previous one was still running.
    pub fn record_broadcast_skipped(&self) {
        self.broadcasts_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_connected_subscribers(&self, count: u64) {
        self.connected_subscribers.store(count, Ordering::Relaxed);
    }

    pub fn record_subscriber_dropped(&self) {
        self.subscribers_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Export metrics as a BTreeMap for Prometheus-style exposition.
    pub fn export(&self) -> BTreeMap<String, u64> {
        let mut m = BTreeMap::new();
        m.insert("events_processed".to_string(), self.events_processed.load(Ordering::Relaxed));
        m.insert("events_rejected".to_string(), self.events_rejected.load(Ordering::Relaxed));
        m.insert("events_ignored".to_string(), self.events_ignored.load(Ordering::Relaxed));
        m.insert("route_failures".to_string(), self.route_failures.load(Ordering::Relaxed));
        m.insert("broker_errors".to_string(), self.broker_errors.load(Ordering::Relaxed));
        m.insert("mirror_failures".to_string(), self.mirror_failures.load(Ordering::Relaxed));
        m.insert("broadcasts_sent".to_string(), self.broadcasts_sent.load(Ordering::Relaxed));
        m.insert("broadcasts_skipped".to_string(), self.broadcasts_skipped.load(Ordering::Relaxed));
        m.insert("deliveries".to_string(), self.deliveries.load(Ordering::Relaxed));
        m.insert(
            "connected_subscribers".to_string(),
            self.connected_subscribers.load(Ordering::Relaxed),
        );
        m.insert(
            "subscribers_dropped".to_string(),
            self.subscribers_dropped.load(Ordering::Relaxed),
        );
        if let Some(p99) = self.event_processing_ns.lock().percentile(99) {
            m.insert("event_processing_p99_ns".to_string(), p99);
        }
        if let Some(p99) = self.broadcast_latency_ns.lock().percentile(99) {
            m.insert("broadcast_p99_ns".to_string(), p99);
        }
        m
    }
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks latency samples for percentile calculation.
pub struct LatencyTracker {
    samples: VecDeque<u64>,
    max_samples: usize,
}

impl LatencyTracker {
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_samples),
            max_samples,
        }
    }

    /// Record a latency sample, evicting the oldest once full.
    pub fn record(&mut self, value: u64) {
        if self.samples.len() >= self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    /// Get a percentile value (0-100).
    pub fn percentile(&self, p: usize) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }

        let mut sorted: Vec<u64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();

        let idx = (p as f64 / 100.0 * (sorted.len() - 1) as f64) as usize;
        Some(sorted[idx.min(sorted.len() - 1)])
    }

    /// Number of samples recorded.
    pub fn count(&self) -> usize {
        self.samples.len()
    }
}
