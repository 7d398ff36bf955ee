//! Event ingestion loop
//!
//! Pulls messages from the subscribed broker topics, runs each through
//! decode → route, and marks the offset consumed afterwards (at-least-once).
//! A message that fails to decode or route is logged and still marked
//! consumed, so a poison message never blocks its partition.
//!
//! Lifecycle: `Stopped → Running → Stopping → Stopped`. `stop` may be called
//! from any task; it cancels the loop, lets the in-flight message finish,
//! commits pending offsets and closes the source, or aborts the task once
//! the shutdown grace period runs out.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::decoder::decode;
use crate::error::{BrokerError, DecodeError, LifecycleError, RouteError};
use crate::metrics::ServiceMetrics;
use crate::router::{DispatchRouter, RouteOutcome};

/// A message pulled from the broker, detached from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Option<Vec<u8>>,
}

/// A source of broker messages.
#[async_trait]
pub trait MessageSource: Send {
    /// Wait a bounded time for the next message. `Ok(None)` means the wait
    /// elapsed with nothing to read.
    async fn poll(&mut self) -> Result<Option<InboundMessage>, BrokerError>;

    /// Mark a message as processed so its offset is included in the next
    /// commit.
    fn mark_consumed(&mut self, message: &InboundMessage) -> Result<(), BrokerError>;

    /// Commit everything marked so far.
    async fn commit(&mut self) -> Result<(), BrokerError>;

    async fn close(&mut self);

    fn describe(&self) -> String;
}

/// Broker connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    pub brokers: String,
    pub group_id: String,
    pub topics: Vec<String>,
    pub auto_offset_reset: String,
    pub poll_timeout_ms: u64,
    pub session_timeout_ms: u64,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            group_id: "analytics-service".to_string(),
            topics: vec!["order-events".to_string(), "order-analytics".to_string()],
            auto_offset_reset: "latest".to_string(),
            poll_timeout_ms: 500,
            session_timeout_ms: 6000,
        }
    }
}

/// Kafka consumer group member.
///
/// Auto-commit is on but offsets are only *stored* explicitly after
/// processing, so the background commit never covers unprocessed messages.
pub struct KafkaSource {
    consumer: StreamConsumer,
    poll_timeout: Duration,
    description: String,
    uncommitted: bool,
}

impl KafkaSource {
    pub fn connect(config: &KafkaConfig) -> Result<Self, BrokerError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .create()
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let topics: Vec<&str> = config.topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topics)
            .map_err(|e| BrokerError::Subscription(e.to_string()))?;

        info!(
            brokers = %config.brokers,
            group_id = %config.group_id,
            topics = ?config.topics,
            "Kafka consumer subscribed"
        );

        Ok(Self {
            consumer,
            poll_timeout: Duration::from_millis(config.poll_timeout_ms),
            description: format!("kafka://{}/{}", config.brokers, config.group_id),
            uncommitted: false,
        })
    }
}

#[async_trait]
impl MessageSource for KafkaSource {
    async fn poll(&mut self) -> Result<Option<InboundMessage>, BrokerError> {
        match tokio::time::timeout(self.poll_timeout, self.consumer.recv()).await {
            Err(_) => Ok(None),
            Ok(Ok(msg)) => Ok(Some(InboundMessage {
                topic: msg.topic().to_string(),
                partition: msg.partition(),
                offset: msg.offset(),
                payload: msg.payload().map(<[u8]>::to_vec),
            })),
            Ok(Err(e)) => Err(BrokerError::Connection(e.to_string())),
        }
    }

    fn mark_consumed(&mut self, message: &InboundMessage) -> Result<(), BrokerError> {
        // Committed offset is the next record to read.
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(
            &message.topic,
            message.partition,
            Offset::Offset(message.offset + 1),
        )
        .map_err(|e| BrokerError::Commit(e.to_string()))?;
        self.consumer
            .store_offsets(&tpl)
            .map_err(|e| BrokerError::Commit(e.to_string()))?;
        self.uncommitted = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), BrokerError> {
        if !self.uncommitted {
            return Ok(());
        }
        self.consumer
            .commit_consumer_state(CommitMode::Sync)
            .map_err(|e| BrokerError::Commit(e.to_string()))?;
        self.uncommitted = false;
        Ok(())
    }

    async fn close(&mut self) {
        self.consumer.unsubscribe();
        info!(source = %self.description, "Kafka consumer closed");
    }

    fn describe(&self) -> String {
        self.description.clone()
    }
}

/// Result of handling one broker message. Every variant counts as consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Routed(RouteOutcome),
    Rejected(DecodeError),
    Failed(RouteError),
    EmptyPayload,
}

/// Decode → route for a single message, with logging and metrics.
pub struct MessageProcessor {
    router: Arc<DispatchRouter>,
    metrics: Arc<ServiceMetrics>,
}

impl MessageProcessor {
    pub fn new(router: Arc<DispatchRouter>, metrics: Arc<ServiceMetrics>) -> Self {
        Self { router, metrics }
    }

    pub async fn process(&self, message: &InboundMessage) -> ProcessOutcome {
        let Some(payload) = message.payload.as_deref() else {
            warn!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                "Message has no payload, skipping"
            );
            self.metrics.record_event_rejected();
            return ProcessOutcome::EmptyPayload;
        };

        let started = Instant::now();
        let event = match decode(payload) {
            Ok(event) => event,
            Err(err) => {
                self.metrics.record_event_rejected();
                warn!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    error = %err,
                    "Dropping undecodable message"
                );
                return ProcessOutcome::Rejected(err);
            }
        };

        debug!(
            event_type = event.event_type_label(),
            order_id = %event.order_id,
            offset = message.offset,
            "Received event"
        );

        match self.router.route(&event).await {
            Ok(RouteOutcome::Ignored) => {
                self.metrics.record_event_ignored();
                ProcessOutcome::Routed(RouteOutcome::Ignored)
            }
            Ok(outcome) => {
                self.metrics
                    .record_event_processed(started.elapsed().as_nanos() as u64);
                ProcessOutcome::Routed(outcome)
            }
            Err(err) => {
                self.metrics.record_route_failure();
                warn!(
                    event_type = event.event_type_label(),
                    order_id = %event.order_id,
                    error = %err,
                    "Failed to apply event"
                );
                ProcessOutcome::Failed(err)
            }
        }
    }
}

/// Exponential retry delay for broker failures.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    /// Delay before the next retry: base, 2×base, 4×base, … capped at max.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32 << self.attempt.min(16);
        self.attempt = self.attempt.saturating_add(1);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Broker health as seen by the ingestion loop, read by the health check.
#[derive(Debug)]
pub struct IngestionHealth {
    consecutive_failures: AtomicU32,
    degraded_after: u32,
    degraded: AtomicBool,
}

impl IngestionHealth {
    pub fn new(degraded_after: u32) -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            degraded_after: degraded_after.max(1),
            degraded: AtomicBool::new(false),
        }
    }

    /// Returns the number of consecutive failures including this one.
    pub fn record_failure(&self) -> u32 {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= self.degraded_after && !self.degraded.swap(true, Ordering::AcqRel) {
            error!(failures, "Broker unreachable, ingestion degraded");
        }
        failures
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        if self.degraded.swap(false, Ordering::AcqRel) {
            info!("Broker reachable again, ingestion healthy");
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }
}

/// Ingestion loop lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IngestionState {
    Stopped = 0,
    Running = 1,
    Stopping = 2,
}

impl IngestionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => IngestionState::Running,
            2 => IngestionState::Stopping,
            _ => IngestionState::Stopped,
        }
    }
}

/// How a background task ended when asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Graceful,
    /// Grace period elapsed; the task was aborted
    Forced,
    NotRunning,
}

/// Tunables for the ingestion loop.
#[derive(Debug, Clone)]
pub struct IngestionConfig {
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub degraded_after_failures: u32,
    pub shutdown_grace: Duration,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            degraded_after_failures: 3,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

struct RunningTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owner of the ingestion task.
pub struct IngestionLoop {
    processor: Arc<MessageProcessor>,
    metrics: Arc<ServiceMetrics>,
    health: Arc<IngestionHealth>,
    state: Arc<AtomicU8>,
    config: IngestionConfig,
    task: Mutex<Option<RunningTask>>,
}

impl IngestionLoop {
    pub fn new(
        router: Arc<DispatchRouter>,
        metrics: Arc<ServiceMetrics>,
        config: IngestionConfig,
    ) -> Self {
        Self {
            processor: Arc::new(MessageProcessor::new(router, Arc::clone(&metrics))),
            metrics,
            health: Arc::new(IngestionHealth::new(config.degraded_after_failures)),
            state: Arc::new(AtomicU8::new(IngestionState::Stopped as u8)),
            config,
            task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> IngestionState {
        IngestionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn health(&self) -> Arc<IngestionHealth> {
        Arc::clone(&self.health)
    }

    /// Spawn the loop over `source`. Fails unless currently stopped.
    pub fn start<S>(&self, source: S) -> Result<(), LifecycleError>
    where
        S: MessageSource + 'static,
    {
        let mut slot = self.task.lock();
        self.state
            .compare_exchange(
                IngestionState::Stopped as u8,
                IngestionState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| LifecycleError::AlreadyRunning("ingestion loop"))?;

        let token = CancellationToken::new();
        let worker = Worker {
            source,
            processor: Arc::clone(&self.processor),
            metrics: Arc::clone(&self.metrics),
            health: Arc::clone(&self.health),
            backoff: Backoff::new(self.config.backoff_base, self.config.backoff_max),
            token: token.clone(),
        };
        let handle = tokio::spawn(worker.run());
        *slot = Some(RunningTask { token, handle });
        Ok(())
    }

    /// Stop the loop, waiting at most the shutdown grace period.
    pub async fn stop(&self) -> StopOutcome {
        let Some(task) = self.task.lock().take() else {
            return StopOutcome::NotRunning;
        };
        self.state
            .store(IngestionState::Stopping as u8, Ordering::Release);
        task.token.cancel();

        let mut handle = task.handle;
        let outcome = match tokio::time::timeout(self.config.shutdown_grace, &mut handle).await {
            Ok(Ok(())) => StopOutcome::Graceful,
            Ok(Err(join_err)) => {
                error!(error = %join_err, "Ingestion task ended abnormally");
                StopOutcome::Forced
            }
            Err(_) => {
                handle.abort();
                warn!(
                    grace_ms = self.config.shutdown_grace.as_millis() as u64,
                    "Ingestion loop did not stop in time, aborted"
                );
                StopOutcome::Forced
            }
        };

        self.state
            .store(IngestionState::Stopped as u8, Ordering::Release);
        outcome
    }
}

struct Worker<S> {
    source: S,
    processor: Arc<MessageProcessor>,
    metrics: Arc<ServiceMetrics>,
    health: Arc<IngestionHealth>,
    backoff: Backoff,
    token: CancellationToken,
}

impl<S: MessageSource> Worker<S> {
    async fn run(mut self) {
        info!(source = %self.source.describe(), "Ingestion loop running");

        loop {
            let polled = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                polled = self.source.poll() => polled,
            };

            match polled {
                Ok(Some(message)) => {
                    self.backoff.reset();
                    self.health.record_success();
                    self.processor.process(&message).await;
                    if let Err(err) = self.source.mark_consumed(&message) {
                        warn!(
                            topic = %message.topic,
                            partition = message.partition,
                            offset = message.offset,
                            error = %err,
                            "Failed to store offset"
                        );
                    }
                }
                Ok(None) => {
                    self.backoff.reset();
                    self.health.record_success();
                }
                Err(err) => {
                    self.metrics.record_broker_error();
                    let failures = self.health.record_failure();
                    let delay = self.backoff.next_delay();
                    warn!(
                        error = %err,
                        failures,
                        retry_in_ms = delay.as_millis() as u64,
                        "Broker error, backing off"
                    );
                    tokio::select! {
                        _ = self.token.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        if let Err(err) = self.source.commit().await {
            warn!(error = %err, "Final offset commit failed");
        }
        self.source.close().await;
        info!("Ingestion loop stopped");
    }
}
