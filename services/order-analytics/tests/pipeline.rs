//! End-to-end pipeline tests for the Order Analytics Service
//!
//! Drives the fully wired service through an in-process broker source and
//! the in-process activity store:
//! - Reference event sequence → snapshot
//! - Poison messages interleaved with valid ones
//! - Live subscriber receives periodic pushes
//! - Orderly shutdown commits offsets

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use order_analytics::cache::InMemoryActivityStore;
use order_analytics::config::ServiceConfig;
use order_analytics::error::BrokerError;
use order_analytics::ingestion::{InboundMessage, IngestionState, MessageSource, StopOutcome};
use order_analytics::service::AnalyticsService;
use types::numeric::Amount;

#[derive(Debug, Default)]
struct Offsets {
    marked: Vec<i64>,
    committed: bool,
}

struct TestSource {
    rx: mpsc::UnboundedReceiver<InboundMessage>,
    offsets: Arc<Mutex<Offsets>>,
}

#[async_trait]
impl MessageSource for TestSource {
    async fn poll(&mut self) -> Result<Option<InboundMessage>, BrokerError> {
        Ok(tokio::time::timeout(Duration::from_millis(20), self.rx.recv())
            .await
            .ok()
            .flatten())
    }

    fn mark_consumed(&mut self, message: &InboundMessage) -> Result<(), BrokerError> {
        self.offsets.lock().marked.push(message.offset);
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), BrokerError> {
        self.offsets.lock().committed = true;
        Ok(())
    }

    async fn close(&mut self) {}

    fn describe(&self) -> String {
        "test".to_string()
    }
}

struct Harness {
    service: AnalyticsService,
    feed: mpsc::UnboundedSender<InboundMessage>,
    offsets: Arc<Mutex<Offsets>>,
    next_offset: i64,
}

impl Harness {
    fn start(broadcast_ms: u64) -> Self {
        let mut config = ServiceConfig::default();
        config.broadcast.interval_ms = broadcast_ms;
        config.shutdown_grace_ms = 2000;

        let service = AnalyticsService::init(config, Arc::new(InMemoryActivityStore::new()));
        let (feed, rx) = mpsc::unbounded_channel();
        let offsets = Arc::new(Mutex::new(Offsets::default()));
        service
            .start(TestSource {
                rx,
                offsets: Arc::clone(&offsets),
            })
            .unwrap();

        Self {
            service,
            feed,
            offsets,
            next_offset: 0,
        }
    }

    fn send(&mut self, payload: Value) {
        self.send_raw(payload.to_string().into_bytes());
    }

    fn send_raw(&mut self, payload: Vec<u8>) {
        self.feed
            .send(InboundMessage {
                topic: "order-events".to_string(),
                partition: 0,
                offset: self.next_offset,
                payload: Some(payload),
            })
            .unwrap();
        self.next_offset += 1;
    }

    async fn drain(&self) {
        let expected = self.next_offset as usize;
        for _ in 0..300 {
            if self.offsets.lock().marked.len() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("pipeline did not consume {} messages", expected);
    }
}

fn created(order: &str, amount: u64, ts: &str) -> Value {
    json!({
        "eventType": "ORDER_CREATED",
        "orderId": order,
        "userId": "user-1",
        "timestamp": ts,
        "totalAmount": amount,
        "items": [{"productId": "p1", "productName": "Widget", "quantity": 1, "totalPrice": amount}],
    })
}

#[tokio::test]
async fn test_reference_sequence_end_to_end() {
    let mut h = Harness::start(60_000);

    h.send(created("o1", 10, "2024-01-01T10:05:00"));
    h.send(created("o2", 20, "2024-01-01T10:50:00"));
    h.send(json!({
        "eventType": "ORDER_STATUS_CHANGED",
        "orderId": "o1",
        "timestamp": "2024-01-01T10:55:00",
        "oldStatus": "PENDING",
        "newStatus": "CONFIRMED",
    }));
    h.send(json!({
        "eventType": "ORDER_CANCELLED",
        "orderId": "o2",
        "timestamp": "2024-01-01T10:56:00",
        "reason": "out of stock",
    }));
    h.drain().await;

    let snap = h.service.aggregator().snapshot();
    assert_eq!(snap.total_orders, 2);
    assert_eq!(snap.total_revenue, Amount::from_u64(30));
    assert_eq!(snap.avg_order_value, Amount::from_u64(15));
    assert_eq!(snap.orders_per_hour.get("2024-01-01-10"), Some(&2));
    assert_eq!(snap.orders_by_status.get("PENDING"), Some(&0));
    assert_eq!(snap.orders_by_status.get("CONFIRMED"), Some(&1));
    assert_eq!(snap.cancelled_orders, 1);

    let recent = h.service.cache().recent_orders(10).await.unwrap();
    assert_eq!(recent.len(), 2);
    assert!(recent[0].contains("\"o2\""));

    let report = h.service.stop().await;
    assert_eq!(report.ingestion, StopOutcome::Graceful);
    assert_eq!(report.broadcast, StopOutcome::Graceful);
    assert!(h.offsets.lock().committed);
    assert_eq!(h.service.ingestion_state(), IngestionState::Stopped);
}

#[tokio::test]
async fn test_poison_messages_are_consumed_and_skipped() {
    let mut h = Harness::start(60_000);

    h.send_raw(b"\x00\x01 garbage".to_vec());
    h.send(created("o1", 5, "2024-01-01T10:00:00"));
    h.send(json!({"eventType": "ORDER_CREATED", "orderId": "o2", "timestamp": "yesterday"}));
    h.send(json!({"eventType": "ORDER_SHIPPED", "orderId": "o1", "timestamp": "2024-01-01T11:00:00"}));
    h.send(created("o3", 7, "2024-01-01T11:00:00"));
    h.drain().await;

    assert_eq!(h.offsets.lock().marked, vec![0, 1, 2, 3, 4]);
    let snap = h.service.aggregator().snapshot();
    assert_eq!(snap.total_orders, 2);
    assert_eq!(snap.total_revenue, Amount::from_u64(12));

    let exported = h.service.metrics().export();
    assert_eq!(exported["events_rejected"], 2);
    assert_eq!(exported["events_ignored"], 1);
    assert_eq!(exported["events_processed"], 2);

    h.service.stop().await;
}

#[tokio::test]
async fn test_subscriber_receives_periodic_stats() {
    let mut h = Harness::start(50);
    let (id, mut rx) = h.service.broadcaster().registry().register();

    let now = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string();
    h.send(created("o1", 25, &now));
    h.drain().await;

    let mut latest = None;
    for _ in 0..20 {
        let msg = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let stats: Value = serde_json::from_str(&msg).unwrap();
        if stats["totalOrders"] == 1 {
            latest = Some(stats);
            break;
        }
    }

    let stats = latest.expect("no broadcast reflected the created order");
    assert_eq!(stats["currentOrdersPerMinute"], 1.0);
    assert_eq!(stats["revenuePerMinute"], 25.0);
    assert_eq!(stats["activeUsers"], 1);
    assert_eq!(stats["topProducts"][0]["productId"], "p1");
    assert_eq!(stats["recentOrders"][0]["orderId"], "o1");

    assert!(h.service.broadcaster().registry().remove(id));
    h.service.stop().await;
}

#[tokio::test]
async fn test_lagging_subscriber_dropped_without_blocking_others() {
    let h = Harness::start(20);
    let registry = h.service.broadcaster().registry();
    let (_slow, _slow_rx) = registry.register();
    let (_fast, mut fast_rx) = registry.register();

    // Queue depth is 8; the slow subscriber never reads.
    for _ in 0..12 {
        let msg = tokio::time::timeout(Duration::from_secs(1), fast_rx.recv()).await;
        assert!(msg.unwrap().is_some());
    }

    assert_eq!(registry.count(), 1);
    assert!(h.service.metrics().export()["subscribers_dropped"] >= 1);

    h.service.stop().await;
}

#[tokio::test]
async fn test_service_cannot_start_twice() {
    let h = Harness::start(60_000);
    let (_tx, rx) = mpsc::unbounded_channel();

    let second = h.service.start(TestSource {
        rx,
        offsets: Arc::new(Mutex::new(Offsets::default())),
    });

    assert!(second.is_err());
    h.service.stop().await;
}

#[test]
fn test_config_file_round_trip_into_service() {
    let config = ServiceConfig::from_toml_str(
        r#"
        [broadcast]
        interval_ms = 1000
        recent_orders = 3

        [cache]
        window_capacity = 20
        "#,
    )
    .unwrap();

    assert_eq!(config.broadcast_config().interval, Duration::from_secs(1));
    assert_eq!(config.broadcast_config().stats.recent_orders, 3);
    assert_eq!(config.cache_sync_config().window_capacity, 20);
}
