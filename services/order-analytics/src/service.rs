//! Service wiring
//!
//! Builds the component graph once (`init`), spawns the two background
//! tasks (`start`) and tears them down within the shutdown grace period
//! (`stop`). There is no global state: every component is reached through
//! the handles created here.

use std::sync::Arc;

use tracing::{info, warn};

use crate::aggregator::MetricsAggregator;
use crate::api::AppState;
use crate::broadcast::{SnapshotBroadcaster, SubscriberRegistry};
use crate::cache::{ActivityStore, CacheSync, InMemoryActivityStore, RedisActivityStore};
use crate::config::ServiceConfig;
use crate::error::{LifecycleError, MirrorError};
use crate::ingestion::{IngestionLoop, IngestionState, MessageSource, StopOutcome};
use crate::metrics::ServiceMetrics;
use crate::router::DispatchRouter;

/// How each background task ended during shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub ingestion: StopOutcome,
    pub broadcast: StopOutcome,
}

pub struct AnalyticsService {
    config: ServiceConfig,
    metrics: Arc<ServiceMetrics>,
    aggregator: Arc<MetricsAggregator>,
    cache: Arc<CacheSync>,
    ingestion: IngestionLoop,
    broadcaster: Arc<SnapshotBroadcaster>,
}

impl AnalyticsService {
    /// Open the configured activity store, falling back to the in-process
    /// window when Redis is not configured or not reachable.
    pub async fn connect_store(config: &ServiceConfig) -> Arc<dyn ActivityStore> {
        let Some(url) = config.cache.redis_url.as_deref() else {
            info!("No Redis URL configured, keeping recent activity in-process");
            return Arc::new(InMemoryActivityStore::new());
        };

        let timeout = config.cache_sync_config().op_timeout;
        let connected = tokio::time::timeout(timeout, RedisActivityStore::connect(url))
            .await
            .unwrap_or(Err(MirrorError::Timeout(timeout.as_millis() as u64)));

        match connected {
            Ok(store) => Arc::new(store),
            Err(err) => {
                warn!(error = %err, "Redis unavailable, keeping recent activity in-process");
                Arc::new(InMemoryActivityStore::new())
            }
        }
    }

    /// Construct every component. Nothing runs until `start`.
    pub fn init(config: ServiceConfig, store: Arc<dyn ActivityStore>) -> Self {
        let metrics = Arc::new(ServiceMetrics::new());
        let aggregator = Arc::new(MetricsAggregator::new(config.aggregator.clone()));
        let cache = Arc::new(CacheSync::new(
            store,
            config.cache_sync_config(),
            Arc::clone(&metrics),
        ));
        let router = Arc::new(DispatchRouter::new(
            Arc::clone(&aggregator),
            Arc::clone(&cache),
        ));
        let ingestion = IngestionLoop::new(router, Arc::clone(&metrics), config.ingestion_config());
        let registry = Arc::new(SubscriberRegistry::new(
            config.broadcast.subscriber_queue,
            Arc::clone(&metrics),
        ));
        let broadcaster = Arc::new(SnapshotBroadcaster::new(
            Arc::clone(&aggregator),
            Arc::clone(&cache),
            registry,
            Arc::clone(&metrics),
            config.broadcast_config(),
        ));

        info!(
            topics = ?config.kafka.topics,
            window_capacity = config.cache.window_capacity,
            "AnalyticsService initialized"
        );

        Self {
            config,
            metrics,
            aggregator,
            cache,
            ingestion,
            broadcaster,
        }
    }

    /// Spawn ingestion over `source` and the periodic broadcaster.
    pub fn start<S>(&self, source: S) -> Result<(), LifecycleError>
    where
        S: MessageSource + 'static,
    {
        self.ingestion.start(source)?;
        self.broadcaster.start()?;
        info!("AnalyticsService started");
        Ok(())
    }

    /// Stop both tasks concurrently, each bounded by the shutdown grace.
    pub async fn stop(&self) -> ShutdownReport {
        let (ingestion, broadcast) = tokio::join!(self.ingestion.stop(), self.broadcaster.stop());
        let report = ShutdownReport {
            ingestion,
            broadcast,
        };
        info!(?report, "AnalyticsService stopped");
        report
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            aggregator: Arc::clone(&self.aggregator),
            cache: Arc::clone(&self.cache),
            broadcaster: Arc::clone(&self.broadcaster),
            metrics: Arc::clone(&self.metrics),
            health: self.ingestion.health(),
            write_timeout: self.config.write_timeout(),
        }
    }

    pub fn aggregator(&self) -> Arc<MetricsAggregator> {
        Arc::clone(&self.aggregator)
    }

    pub fn cache(&self) -> Arc<CacheSync> {
        Arc::clone(&self.cache)
    }

    pub fn broadcaster(&self) -> Arc<SnapshotBroadcaster> {
        Arc::clone(&self.broadcaster)
    }

    pub fn metrics(&self) -> Arc<ServiceMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn ingestion_state(&self) -> IngestionState {
        self.ingestion.state()
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_store_without_url_is_in_memory() {
        let store = AnalyticsService::connect_store(&ServiceConfig::default()).await;
        assert_eq!(store.backend(), "in-memory");
    }

    #[tokio::test]
    async fn test_connect_store_falls_back_on_bad_url() {
        let mut config = ServiceConfig::default();
        config.cache.redis_url = Some("not a redis url".to_string());

        let store = AnalyticsService::connect_store(&config).await;
        assert_eq!(store.backend(), "in-memory");
    }

    #[tokio::test]
    async fn test_init_wires_shared_handles() {
        let service = AnalyticsService::init(
            ServiceConfig::default(),
            Arc::new(InMemoryActivityStore::new()),
        );
        let state = service.app_state();

        assert!(Arc::ptr_eq(&state.aggregator, &service.aggregator()));
        assert!(Arc::ptr_eq(&state.cache, &service.cache()));
        assert_eq!(service.ingestion_state(), IngestionState::Stopped);
        assert_eq!(service.cache().window_capacity(), 100);
    }
}
