//! Service configuration
//!
//! Layered with the `config` crate, lowest priority first:
//! 1. Built-in defaults (`Default` impls below)
//! 2. Optional TOML file (`ANALYTICS_CONFIG`, default `config/analytics`)
//! 3. Environment variables, e.g. `ANALYTICS__KAFKA__BROKERS=host:9092`
//!    or `ANALYTICS__KAFKA__TOPICS=order-events,order-analytics`
//!
//! Read once at process start.

use std::env;
use std::time::Duration;

use ::config::{builder::DefaultState, Config, ConfigBuilder, Environment, File, FileFormat};
use serde::Deserialize;

use crate::aggregator::AggregatorConfig;
use crate::broadcast::{BroadcastConfig, StatsConfig};
use crate::cache::{CacheSyncConfig, DEFAULT_WINDOW_CAPACITY};
use crate::error::ConfigError;
use crate::ingestion::{IngestionConfig, KafkaConfig};

/// Config file used when `ANALYTICS_CONFIG` is not set. May be absent.
pub const DEFAULT_CONFIG_PATH: &str = "config/analytics";

const ENV_PREFIX: &str = "ANALYTICS";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// `redis://` URL of the activity store. Unset keeps the window in-process.
    pub redis_url: Option<String>,
    pub window_capacity: usize,
    pub op_timeout_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            redis_url: None,
            window_capacity: DEFAULT_WINDOW_CAPACITY,
            op_timeout_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BroadcastSettings {
    pub interval_ms: u64,
    /// Outbound queue depth per subscriber before it counts as lagging
    pub subscriber_queue: usize,
    pub write_timeout_ms: u64,
    pub recent_orders: usize,
    pub top_products: usize,
    pub active_user_window_secs: u64,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            interval_ms: 5000,
            subscriber_queue: 8,
            write_timeout_ms: 2000,
            recent_orders: 10,
            top_products: 5,
            active_user_window_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct IngestionSettings {
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub degraded_after_failures: u32,
}

impl Default for IngestionSettings {
    fn default() -> Self {
        Self {
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            degraded_after_failures: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub bind: String,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8091".to_string(),
        }
    }
}

/// Top-level configuration for the analytics service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub kafka: KafkaConfig,
    pub cache: CacheSettings,
    pub broadcast: BroadcastSettings,
    pub aggregator: AggregatorConfig,
    pub ingestion: IngestionSettings,
    pub http: HttpSettings,
    pub shutdown_grace_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            kafka: KafkaConfig::default(),
            cache: CacheSettings::default(),
            broadcast: BroadcastSettings::default(),
            aggregator: AggregatorConfig::default(),
            ingestion: IngestionSettings::default(),
            http: HttpSettings::default(),
            shutdown_grace_ms: 5000,
        }
    }
}

impl ServiceConfig {
    /// Load from the optional config file and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let path = env::var("ANALYTICS_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let builder = Config::builder().add_source(File::with_name(&path).required(false));
        Self::finish(builder.add_source(env_source()))
    }

    /// Load from an in-memory TOML document, without the environment.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        Self::finish(Config::builder().add_source(File::from_str(toml, FileFormat::Toml)))
    }

    fn finish(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
        let config: ServiceConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (self.kafka.topics.is_empty(), "kafka.topics must not be empty"),
            (self.kafka.poll_timeout_ms == 0, "kafka.poll_timeout_ms must be > 0"),
            (self.cache.window_capacity == 0, "cache.window_capacity must be > 0"),
            (self.cache.op_timeout_ms == 0, "cache.op_timeout_ms must be > 0"),
            (self.broadcast.interval_ms == 0, "broadcast.interval_ms must be > 0"),
            (self.broadcast.subscriber_queue == 0, "broadcast.subscriber_queue must be > 0"),
            (self.broadcast.write_timeout_ms == 0, "broadcast.write_timeout_ms must be > 0"),
            (self.ingestion.backoff_base_ms == 0, "ingestion.backoff_base_ms must be > 0"),
            (
                self.ingestion.backoff_max_ms < self.ingestion.backoff_base_ms,
                "ingestion.backoff_max_ms must be >= backoff_base_ms",
            ),
            (self.aggregator.hour_retention == Some(0), "aggregator.hour_retention must be > 0"),
        ];
        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, msg)) => Err(ConfigError::Invalid((*msg).to_string())),
            None => Ok(()),
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn cache_sync_config(&self) -> CacheSyncConfig {
        CacheSyncConfig {
            window_capacity: self.cache.window_capacity,
            op_timeout: Duration::from_millis(self.cache.op_timeout_ms),
        }
    }

    pub fn broadcast_config(&self) -> BroadcastConfig {
        BroadcastConfig {
            interval: Duration::from_millis(self.broadcast.interval_ms),
            stats: StatsConfig {
                recent_orders: self.broadcast.recent_orders,
                top_products: self.broadcast.top_products,
                active_user_window: Duration::from_secs(self.broadcast.active_user_window_secs),
            },
            shutdown_grace: self.shutdown_grace(),
        }
    }

    pub fn ingestion_config(&self) -> IngestionConfig {
        IngestionConfig {
            backoff_base: Duration::from_millis(self.ingestion.backoff_base_ms),
            backoff_max: Duration::from_millis(self.ingestion.backoff_max_ms),
            degraded_after_failures: self.ingestion.degraded_after_failures,
            shutdown_grace: self.shutdown_grace(),
        }
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.broadcast.write_timeout_ms)
    }
}

fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .ignore_empty(true)
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("kafka.topics")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.kafka.brokers, "localhost:9092");
        assert_eq!(config.kafka.group_id, "analytics-service");
        assert_eq!(config.kafka.topics, vec!["order-events", "order-analytics"]);
        assert_eq!(config.kafka.auto_offset_reset, "latest");
        assert_eq!(config.cache.window_capacity, 100);
        assert_eq!(config.cache.redis_url, None);
        assert_eq!(config.broadcast.interval_ms, 5000);
        assert_eq!(config.aggregator.hour_retention, None);
        assert_eq!(config.http.bind, "0.0.0.0:8091");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_document_yields_defaults() {
        let config = ServiceConfig::from_toml_str("").unwrap();
        assert_eq!(config, ServiceConfig::default());
    }

    #[test]
    fn test_partial_override() {
        let config = ServiceConfig::from_toml_str(
            r#"
            shutdown_grace_ms = 1000

            [kafka]
            brokers = "kafka-1:9092,kafka-2:9092"
            topics = ["order-events"]

            [cache]
            redis_url = "redis://cache:6379"
            window_capacity = 50

            [aggregator]
            hour_retention = 48
            "#,
        )
        .unwrap();

        assert_eq!(config.kafka.brokers, "kafka-1:9092,kafka-2:9092");
        assert_eq!(config.kafka.topics, vec!["order-events"]);
        assert_eq!(config.kafka.group_id, "analytics-service");
        assert_eq!(config.cache.redis_url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(config.cache_sync_config().window_capacity, 50);
        assert_eq!(config.aggregator.hour_retention, Some(48));
        assert_eq!(config.broadcast_config().shutdown_grace, Duration::from_secs(1));
        assert_eq!(config.ingestion_config().shutdown_grace, Duration::from_secs(1));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let result = ServiceConfig::from_toml_str("[cache]\nwindow_capacity = 0\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));

        let result = ServiceConfig::from_toml_str("[kafka]\ntopics = []\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));

        let result = ServiceConfig::from_toml_str("[broadcast]\ninterval_ms = \"soon\"\n");
        assert!(matches!(result, Err(ConfigError::Load(_))));
    }
}
