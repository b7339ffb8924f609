//! mqbridge Configuration System
//!
//! TOML-based configuration with environment variable override support.
//! Durations are stored as integer seconds or milliseconds and exposed as
//! `Duration` through accessor methods.

use mqb_common::ConnectorDefinition;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Default maximum message size in bytes, used for request and response limits.
pub const DEFAULT_MESSAGE_MAX_BYTES: i64 = 2_621_440;

/// Upper bound on listeners started by one inbound module.
pub const DEFAULT_MAX_LISTENERS: u32 = 1000;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Root application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub cache: CacheSettings,
    pub listener: ListenerSettings,
    pub routing: RoutingSettings,
    pub broker: DevBrokerConfig,

    /// Connector definitions served by the static configuration source.
    pub connectors: Vec<ConnectorDefinition>,

    /// Credentials keyed by the `password_ref` of a connector.
    pub credentials: BTreeMap<String, String>,

    /// Cluster-wide properties (pool defaults, cache tuning).
    pub properties: BTreeMap<String, String>,
}

/// Connection cache maintenance settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheSettings {
    /// Maximum connection age; 0 disables age eviction.
    pub max_age_secs: u64,
    /// Maximum idle time; 0 disables idle eviction.
    pub max_idle_secs: u64,
    pub max_size: usize,
    pub maintenance_interval_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_age_secs: 600,
            max_idle_secs: 300,
            max_size: 100,
            maintenance_interval_secs: 60,
        }
    }
}

impl CacheSettings {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs.max(1))
    }
}

/// Inbound listener settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ListenerSettings {
    /// How long one receive waits for a message.
    pub poll_interval_ms: u64,
    /// Short sleep after a receive failure.
    pub retry_delay_ms: u64,
    /// Long sleep once consecutive failures hit the ceiling.
    pub long_retry_delay_ms: u64,
    pub max_listeners: u32,
    /// Workers shared by every listener for message handling.
    pub worker_pool_size: usize,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            retry_delay_ms: 5_000,
            long_retry_delay_ms: 60_000,
            max_listeners: DEFAULT_MAX_LISTENERS,
            worker_pool_size: 20,
        }
    }
}

impl ListenerSettings {
    pub const MIN_LONG_RETRY: Duration = Duration::from_secs(10);
    pub const MAX_LONG_RETRY: Duration = Duration::from_secs(24 * 60 * 60);

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Long retry delay clamped to [10s, 24h].
    pub fn long_retry_delay(&self) -> Duration {
        Duration::from_millis(self.long_retry_delay_ms)
            .clamp(Self::MIN_LONG_RETRY, Self::MAX_LONG_RETRY)
    }
}

/// Outbound routing settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RoutingSettings {
    pub retry_delay_ms: u64,
    pub max_attempts: u32,
    /// Concurrent connection failures after which routing short-circuits.
    pub failure_threshold: u32,
    pub response_timeout_ms: u64,
    pub max_message_bytes: i64,
    pub pool: PoolDefaults,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self {
            retry_delay_ms: 1_000,
            max_attempts: 5,
            failure_threshold: 10,
            response_timeout_ms: 10_000,
            max_message_bytes: DEFAULT_MESSAGE_MAX_BYTES,
            pool: PoolDefaults::default(),
        }
    }
}

impl RoutingSettings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

/// Pool parameters used when neither the connector nor a cluster property sets them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PoolDefaults {
    pub max_active: u32,
    pub max_idle: u32,
    pub max_wait_ms: u64,
}

impl Default for PoolDefaults {
    fn default() -> Self {
        Self {
            max_active: 20,
            max_idle: 8,
            max_wait_ms: 10_000,
        }
    }
}

/// Queues defined on the in-memory broker used by the dev binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DevBrokerConfig {
    pub queue_manager_name: String,
    pub queues: Vec<String>,
    pub model_queues: Vec<String>,
}

impl Default for DevBrokerConfig {
    fn default() -> Self {
        Self {
            queue_manager_name: "QM.DEV".to_string(),
            queues: vec!["DEV.REQUEST".to_string(), "DEV.REPLY".to_string()],
            model_queues: vec!["SYSTEM.DEFAULT.MODEL.QUEUE".to_string()],
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Load configuration with environment variable override
    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }

    /// Check settings that would otherwise fail at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.routing.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "routing.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.routing.max_message_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "routing.max_message_bytes must not be 0".to_string(),
            ));
        }
        if self.listener.worker_pool_size == 0 {
            return Err(ConfigError::ValidationError(
                "listener.worker_pool_size must be at least 1".to_string(),
            ));
        }
        if self.listener.max_listeners == 0 || self.listener.max_listeners > DEFAULT_MAX_LISTENERS {
            return Err(ConfigError::ValidationError(format!(
                "listener.max_listeners must be between 1 and {}",
                DEFAULT_MAX_LISTENERS
            )));
        }

        let mut seen = HashSet::new();
        for connector in &self.connectors {
            if connector.id.is_empty() {
                return Err(ConfigError::ValidationError(
                    "connector id must not be empty".to_string(),
                ));
            }
            if !seen.insert(connector.id.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate connector id '{}'",
                    connector.id
                )));
            }
        }

        Ok(())
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# mqbridge configuration
# Environment variables (MQBRIDGE_*) override these settings

[cache]
max_age_secs = 600
max_idle_secs = 300
max_size = 100
maintenance_interval_secs = 60

[listener]
poll_interval_ms = 5000
retry_delay_ms = 5000
long_retry_delay_ms = 60000
max_listeners = 1000
worker_pool_size = 20

[routing]
retry_delay_ms = 1000
max_attempts = 5
failure_threshold = 10
response_timeout_ms = 10000
max_message_bytes = 2621440

[routing.pool]
max_active = 20
max_idle = 8
max_wait_ms = 10000

[broker]
queue_manager_name = "QM.DEV"
queues = ["DEV.REQUEST", "DEV.REPLY"]
model_queues = ["SYSTEM.DEFAULT.MODEL.QUEUE"]

[credentials]
dev-password = "changeit"

[[connectors]]
id = "dev-inbound"
name = "Dev Inbound"
inbound = true
queueManagerName = "QM.DEV"
targetQueue = "DEV.REQUEST"
replyMode = "AUTOMATIC"
passwordRef = "dev-password"
"#
        .to_string()
    }
}
