//! External collaborators: where connector definitions, credentials and
//! cluster properties come from.
//!
//! Each has a trait used by the connector and a simple in-memory
//! implementation used by the dev binary and the tests.

use async_trait::async_trait;
use mqb_common::{ConfigChange, ConnectorDefinition};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::Result;

/// Cluster property names read by the connector.
pub mod property {
    pub const POOL_MAX_ACTIVE: &str = "mq.pool.maxActive";
    pub const POOL_MAX_IDLE: &str = "mq.pool.maxIdle";
    pub const POOL_MAX_WAIT: &str = "mq.pool.maxWait";
    pub const CACHE_MAX_AGE: &str = "mq.cache.maxAge";
    pub const CACHE_MAX_IDLE: &str = "mq.cache.maxIdle";
    pub const CACHE_MAX_SIZE: &str = "mq.cache.maxSize";

    pub const POOL_PREFIX: &str = "mq.pool.";
    pub const CACHE_PREFIX: &str = "mq.cache.";
}

/// Provides connector definitions and announces when they change.
#[async_trait]
pub trait ConnectorSource: Send + Sync {
    async fn find_connector(&self, id: &str) -> Result<Option<ConnectorDefinition>>;

    async fn find_connectors(&self) -> Result<Vec<ConnectorDefinition>>;

    /// Change notifications for connectors and cluster properties.
    fn subscribe(&self) -> broadcast::Receiver<ConfigChange>;
}

/// Resolves password references to secrets.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn find_password(&self, reference: &str) -> Result<Option<String>>;
}

/// Live cluster-wide settings.
pub trait ClusterProperties: Send + Sync {
    fn get(&self, name: &str) -> Option<String>;

    /// Parsed value; unparsable values are logged and treated as unset.
    fn get_parsed<T: FromStr>(&self, name: &str) -> Option<T>
    where
        Self: Sized,
    {
        parse_property(self.get(name), name)
    }
}

pub(crate) fn parse_property<T: FromStr>(raw: Option<String>, name: &str) -> Option<T> {
    let raw = raw?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(property = name, value = %raw, "Ignoring unparsable property value");
            None
        }
    }
}

// ============================================================================
// In-memory implementations
// ============================================================================

/// Connector definitions held in memory; every change is broadcast.
pub struct InMemoryConnectorSource {
    connectors: RwLock<HashMap<String, ConnectorDefinition>>,
    changes: broadcast::Sender<ConfigChange>,
}

impl InMemoryConnectorSource {
    pub fn new(definitions: impl IntoIterator<Item = ConnectorDefinition>) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            connectors: RwLock::new(definitions.into_iter().map(|d| (d.id.clone(), d)).collect()),
            changes,
        }
    }

    /// Save a definition, bumping its version when it replaces an existing one.
    pub fn upsert(&self, mut definition: ConnectorDefinition) -> u64 {
        let id = definition.id.clone();
        {
            let mut connectors = self.connectors.write();
            if let Some(existing) = connectors.get(&id) {
                definition.version = definition.version.max(existing.version + 1);
            }
            connectors.insert(id.clone(), definition.clone());
        }
        self.publish(ConfigChange::connector(id));
        definition.version
    }

    pub fn remove(&self, id: &str) -> bool {
        let removed = self.connectors.write().remove(id).is_some();
        if removed {
            self.publish(ConfigChange::connector(id));
        }
        removed
    }

    pub fn publish(&self, change: ConfigChange) {
        // No subscribers is fine.
        if self.changes.send(change.clone()).is_err() {
            debug!(?change, "No subscribers for config change");
        }
    }
}

#[async_trait]
impl ConnectorSource for InMemoryConnectorSource {
    async fn find_connector(&self, id: &str) -> Result<Option<ConnectorDefinition>> {
        Ok(self.connectors.read().get(id).cloned())
    }

    async fn find_connectors(&self) -> Result<Vec<ConnectorDefinition>> {
        let mut all: Vec<_> = self.connectors.read().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.changes.subscribe()
    }
}

/// Fixed credentials keyed by reference.
#[derive(Debug, Default)]
pub struct StaticCredentialStore {
    secrets: BTreeMap<String, String>,
}

impl StaticCredentialStore {
    pub fn new(secrets: BTreeMap<String, String>) -> Self {
        Self { secrets }
    }
}

#[async_trait]
impl CredentialStore for StaticCredentialStore {
    async fn find_password(&self, reference: &str) -> Result<Option<String>> {
        Ok(self.secrets.get(reference).cloned())
    }
}

/// Mutable property map.
#[derive(Debug, Default)]
pub struct PropertyMap {
    values: RwLock<BTreeMap<String, String>>,
}

impl PropertyMap {
    pub fn new(values: BTreeMap<String, String>) -> Self {
        Self {
            values: RwLock::new(values),
        }
    }

    /// Set a value. Callers announce the change through their source.
    pub fn set(&self, name: impl Into<String>, value: impl Into<String>) {
        self.values.write().insert(name.into(), value.into());
    }

    pub fn unset(&self, name: &str) {
        self.values.write().remove(name);
    }
}

impl ClusterProperties for PropertyMap {
    fn get(&self, name: &str) -> Option<String> {
        self.values.read().get(name).cloned()
    }
}
