//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "mqbridge.toml",
    "./config/mqbridge.toml",
    "/etc/mqbridge/mqbridge.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config);
        config.validate()?;

        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("MQBRIDGE_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }

    fn apply_env_overrides(&self, config: &mut AppConfig) {
        // Cache
        if let Some(v) = parsed("MQBRIDGE_CACHE_MAX_AGE_SECS") {
            config.cache.max_age_secs = v;
        }
        if let Some(v) = parsed("MQBRIDGE_CACHE_MAX_IDLE_SECS") {
            config.cache.max_idle_secs = v;
        }
        if let Some(v) = parsed("MQBRIDGE_CACHE_MAX_SIZE") {
            config.cache.max_size = v;
        }
        if let Some(v) = parsed("MQBRIDGE_CACHE_MAINTENANCE_INTERVAL_SECS") {
            config.cache.maintenance_interval_secs = v;
        }

        // Listener
        if let Some(v) = parsed("MQBRIDGE_LISTENER_POLL_INTERVAL_MS") {
            config.listener.poll_interval_ms = v;
        }
        if let Some(v) = parsed("MQBRIDGE_LISTENER_RETRY_DELAY_MS") {
            config.listener.retry_delay_ms = v;
        }
        if let Some(v) = parsed("MQBRIDGE_LISTENER_LONG_RETRY_DELAY_MS") {
            config.listener.long_retry_delay_ms = v;
        }
        if let Some(v) = parsed("MQBRIDGE_LISTENER_MAX_LISTENERS") {
            config.listener.max_listeners = v;
        }
        if let Some(v) = parsed("MQBRIDGE_LISTENER_WORKER_POOL_SIZE") {
            config.listener.worker_pool_size = v;
        }

        // Routing
        if let Some(v) = parsed("MQBRIDGE_ROUTING_RETRY_DELAY_MS") {
            config.routing.retry_delay_ms = v;
        }
        if let Some(v) = parsed("MQBRIDGE_ROUTING_MAX_ATTEMPTS") {
            config.routing.max_attempts = v;
        }
        if let Some(v) = parsed("MQBRIDGE_ROUTING_FAILURE_THRESHOLD") {
            config.routing.failure_threshold = v;
        }
        if let Some(v) = parsed("MQBRIDGE_ROUTING_RESPONSE_TIMEOUT_MS") {
            config.routing.response_timeout_ms = v;
        }
        if let Some(v) = parsed("MQBRIDGE_ROUTING_MAX_MESSAGE_BYTES") {
            config.routing.max_message_bytes = v;
        }
        if let Some(v) = parsed("MQBRIDGE_POOL_MAX_ACTIVE") {
            config.routing.pool.max_active = v;
        }
        if let Some(v) = parsed("MQBRIDGE_POOL_MAX_IDLE") {
            config.routing.pool.max_idle = v;
        }
        if let Some(v) = parsed("MQBRIDGE_POOL_MAX_WAIT_MS") {
            config.routing.pool.max_wait_ms = v;
        }

        // Dev broker
        if let Ok(val) = env::var("MQBRIDGE_BROKER_QUEUE_MANAGER") {
            config.broker.queue_manager_name = val;
        }
        if let Ok(val) = env::var("MQBRIDGE_BROKER_QUEUES") {
            config.broker.queues = val.split(',').map(|s| s.trim().to_string()).collect();
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|val| val.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_from_explicit_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[listener]
poll_interval_ms = 250
worker_pool_size = 4

[[connectors]]
id = "in-1"
inbound = true
targetQueue = "Q.IN"
"#
        )
        .unwrap();

        let config = ConfigLoader::with_path(file.path()).load().unwrap();
        assert_eq!(config.listener.poll_interval_ms, 250);
        assert_eq!(config.listener.worker_pool_size, 4);
        assert_eq!(config.connectors[0].target_queue, "Q.IN");
        // untouched sections keep their defaults
        assert_eq!(config.routing.max_attempts, 5);
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[routing]\nmax_attempts = 0").unwrap();

        let result = ConfigLoader::with_path(file.path()).load();
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }
}
