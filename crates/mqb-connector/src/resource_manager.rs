//! Connection Resource Manager - keyed cache of broker connections
//!
//! Provides:
//! - One cached connection per [`EndpointKey`], created under a per-key lock
//! - Reference counting: the cache holds one reference, every
//!   [`ConnectionLease`] holds another, and the last release disconnects
//! - Eviction by age, idle time and size from a background maintenance task
//! - Invalidation on connector change events and settings reload on
//!   cache property changes
//!
//! Borrowers never hold a lock across broker I/O; a lease only pins a
//! reference (and a borrow slot when the pool bounds concurrency).

use dashmap::DashMap;
use mqb_broker::{BrokerConnector, QueueManagerSession};
use mqb_common::ConfigChange;
use mqb_config::CacheSettings;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::endpoint::{EndpointConfig, EndpointKey};
use crate::source::{parse_property, property, ClusterProperties};
use crate::{ConnectorError, Result};

/// Upper bounds accepted from cluster properties.
const MAX_AGE_LIMIT_SECS: u64 = 24 * 60 * 60;
const MAX_IDLE_LIMIT_SECS: u64 = 24 * 60 * 60;
const MAX_SIZE_LIMIT: usize = 10_000;

struct CachedConnection {
    key: EndpointKey,
    session: Box<dyn QueueManagerSession>,
    refs: AtomicUsize,
    created_at: Instant,
    last_access: Mutex<Instant>,
    borrow_slots: Option<Arc<Semaphore>>,
}

impl CachedConnection {
    /// Add a reference unless the count already reached zero.
    fn try_reference(&self) -> bool {
        self.refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if n == 0 {
                    None
                } else {
                    Some(n + 1)
                }
            })
            .is_ok()
    }

    fn release(&self) {
        let previous = self
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if previous == Ok(1) {
            self.close();
        }
    }

    /// Drop every reference and close now.
    fn force_release(&self) {
        if self.refs.swap(0, Ordering::AcqRel) > 0 {
            self.close();
        }
    }

    fn close(&self) {
        debug!(key = %self.key, "Closing cached connection");
        self.session.disconnect();
        metrics::counter!("mqbridge_connections_closed_total").increment(1);
    }

    fn touch(&self) {
        *self.last_access.lock() = Instant::now();
    }
}

/// A borrowed connection. Dropping it releases the reference.
pub struct ConnectionLease {
    connection: Arc<CachedConnection>,
    _slot: Option<OwnedSemaphorePermit>,
}

impl ConnectionLease {
    pub fn session(&self) -> &dyn QueueManagerSession {
        self.connection.session.as_ref()
    }

    pub fn key(&self) -> &EndpointKey {
        &self.connection.key
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.connection.release();
    }
}

impl std::fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLease").field("key", &self.connection.key).finish()
    }
}

pub struct ConnectionResourceManager {
    connector: Arc<dyn BrokerConnector>,
    properties: Arc<dyn ClusterProperties>,
    connections: DashMap<EndpointKey, Arc<CachedConnection>>,
    creation_locks: DashMap<EndpointKey, Arc<tokio::sync::Mutex<()>>>,
    defaults: CacheSettings,
    settings: RwLock<CacheSettings>,
    closed: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionResourceManager {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        properties: Arc<dyn ClusterProperties>,
        settings: CacheSettings,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let manager = Self {
            connector,
            properties,
            connections: DashMap::new(),
            creation_locks: DashMap::new(),
            defaults: settings.clone(),
            settings: RwLock::new(settings),
            closed: AtomicBool::new(false),
            shutdown_tx,
            task: Mutex::new(None),
        };
        manager.reload_settings();
        manager
    }

    /// Start the maintenance task and follow configuration changes.
    pub fn start(self: &Arc<Self>, mut changes: broadcast::Receiver<ConfigChange>) {
        let mut guard = self.task.lock();
        if guard.is_some() {
            return;
        }

        let manager = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = self.settings.read().maintenance_interval();

        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            let mut changes_open = true;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = manager.run_maintenance();
                        if evicted > 0 {
                            debug!(evicted, "Connection cache maintenance evicted entries");
                        }
                    }
                    change = changes.recv(), if changes_open => {
                        match change {
                            Ok(change) => manager.on_config_change(&change),
                            Err(broadcast::error::RecvError::Lagged(missed)) => {
                                warn!(missed, "Missed config changes, invalidating all connections");
                                manager.invalidate_all();
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                changes_open = false;
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Connection resource manager shutting down");
                        break;
                    }
                }
            }
        }));
    }

    /// Borrow the connection for `endpoint`, creating it on a miss.
    pub async fn acquire(&self, endpoint: &EndpointConfig) -> Result<ConnectionLease> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnectorError::ManagerShutdown);
        }

        if let Some(connection) = self.referenced(&endpoint.key) {
            return self.lease(connection, endpoint).await;
        }

        let lock = self
            .creation_locks
            .entry(endpoint.key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let creating = lock.lock().await;

        if let Some(connection) = self.referenced(&endpoint.key) {
            drop(creating);
            return self.lease(connection, endpoint).await;
        }

        let session = self
            .connector
            .connect(&endpoint.connect)
            .await
            .map_err(|e| {
                warn!(key = %endpoint.key, error = %e, "Failed to create broker connection");
                ConnectorError::ConnectionUnavailable(e)
            })?;

        let slots = match (endpoint.is_transactional(), endpoint.pool.max_active) {
            (true, _) => Some(Arc::new(Semaphore::new(1))),
            (false, 0) => None,
            (false, n) => Some(Arc::new(Semaphore::new(n as usize))),
        };
        let now = Instant::now();
        let connection = Arc::new(CachedConnection {
            key: endpoint.key.clone(),
            session,
            // the cache's own reference plus the caller's
            refs: AtomicUsize::new(2),
            created_at: now,
            last_access: Mutex::new(now),
            borrow_slots: slots,
        });

        if let Some(replaced) = self.connections.insert(endpoint.key.clone(), connection.clone()) {
            replaced.release();
        }
        drop(creating);

        info!(key = %endpoint.key, target = %endpoint.target_description(), "Created cached broker connection");
        metrics::counter!("mqbridge_connections_created_total").increment(1);
        metrics::gauge!("mqbridge_connection_cache_size").set(self.connections.len() as f64);

        self.lease(connection, endpoint).await
    }

    fn referenced(&self, key: &EndpointKey) -> Option<Arc<CachedConnection>> {
        let connection = self.connections.get(key).map(|e| e.value().clone())?;
        if connection.try_reference() {
            Some(connection)
        } else {
            None
        }
    }

    /// Turn a referenced connection into a lease, waiting for a borrow slot.
    async fn lease(
        &self,
        connection: Arc<CachedConnection>,
        endpoint: &EndpointConfig,
    ) -> Result<ConnectionLease> {
        let slot = match &connection.borrow_slots {
            None => None,
            Some(slots) => {
                let slots = slots.clone();
                let wait = endpoint.pool.max_wait;
                let acquired = if wait.is_zero() {
                    slots.acquire_owned().await.ok()
                } else {
                    tokio::time::timeout(wait, slots.acquire_owned())
                        .await
                        .ok()
                        .and_then(|r| r.ok())
                };
                match acquired {
                    Some(permit) => Some(permit),
                    None => {
                        connection.release();
                        return Err(ConnectorError::BorrowTimeout(wait));
                    }
                }
            }
        };

        connection.touch();
        Ok(ConnectionLease {
            connection,
            _slot: slot,
        })
    }

    /// Remove the entry and release the cache's reference. Current
    /// borrowers keep working; the connection closes when they release.
    pub fn invalidate(&self, key: &EndpointKey) -> bool {
        match self.connections.remove(key) {
            Some((_, connection)) => {
                debug!(key = %key, "Invalidated cached connection");
                connection.release();
                metrics::gauge!("mqbridge_connection_cache_size").set(self.connections.len() as f64);
                true
            }
            None => false,
        }
    }

    /// Invalidate every entry built for a connector, whatever its version.
    pub fn invalidate_connector(&self, connector_id: &str) -> usize {
        let keys: Vec<EndpointKey> = self
            .connections
            .iter()
            .filter(|e| e.key().identity == connector_id)
            .map(|e| e.key().clone())
            .collect();
        keys.iter().filter(|k| self.invalidate(k)).count()
    }

    pub fn invalidate_all(&self) -> usize {
        let keys: Vec<EndpointKey> = self.connections.iter().map(|e| e.key().clone()).collect();
        keys.iter().filter(|k| self.invalidate(k)).count()
    }

    /// Evict by age, idle time and size. Returns the number evicted.
    pub fn run_maintenance(&self) -> usize {
        let settings = self.settings.read().clone();
        let max_age = settings.max_age();
        let max_idle = settings.max_idle();
        let now = Instant::now();

        let expired: Vec<EndpointKey> = self
            .connections
            .iter()
            .filter(|e| {
                let c = e.value();
                let too_old = !max_age.is_zero() && now.duration_since(c.created_at) >= max_age;
                let too_idle =
                    !max_idle.is_zero() && now.duration_since(*c.last_access.lock()) >= max_idle;
                too_old || too_idle
            })
            .map(|e| e.key().clone())
            .collect();

        let mut evicted = expired.iter().filter(|k| self.invalidate(k)).count();

        let size = self.connections.len();
        if size > settings.max_size {
            let mut by_age: Vec<(Instant, EndpointKey)> = self
                .connections
                .iter()
                .map(|e| (e.value().created_at, e.key().clone()))
                .collect();
            by_age.sort();
            evicted += by_age
                .iter()
                .take(size - settings.max_size)
                .filter(|(_, k)| self.invalidate(k))
                .count();
        }

        // creation locks nobody holds and nothing is cached under
        self.creation_locks
            .retain(|key, lock| self.connections.contains_key(key) || Arc::strong_count(lock) > 1);

        if evicted > 0 {
            metrics::counter!("mqbridge_connections_evicted_total").increment(evicted as u64);
        }
        evicted
    }

    fn on_config_change(&self, change: &ConfigChange) {
        match change {
            ConfigChange::Connector { ids } => {
                for id in ids {
                    let count = self.invalidate_connector(id);
                    if count > 0 {
                        info!(connector = %id, count, "Connector changed, invalidated cached connections");
                    }
                }
            }
            ConfigChange::Property { name } if name.starts_with(property::CACHE_PREFIX) => {
                self.reload_settings();
            }
            ConfigChange::Property { .. } => {}
        }
    }

    /// Re-read maintenance limits from cluster properties. Values outside
    /// their range fall back to the configured defaults.
    pub fn reload_settings(&self) {
        let age = bounded(
            parse_property(self.properties.get(property::CACHE_MAX_AGE), property::CACHE_MAX_AGE),
            MAX_AGE_LIMIT_SECS as i64,
            self.defaults.max_age_secs as i64,
            property::CACHE_MAX_AGE,
        );
        let idle = bounded(
            parse_property(self.properties.get(property::CACHE_MAX_IDLE), property::CACHE_MAX_IDLE),
            MAX_IDLE_LIMIT_SECS as i64,
            self.defaults.max_idle_secs as i64,
            property::CACHE_MAX_IDLE,
        );
        let size = bounded(
            parse_property(self.properties.get(property::CACHE_MAX_SIZE), property::CACHE_MAX_SIZE),
            MAX_SIZE_LIMIT as i64,
            self.defaults.max_size as i64,
            property::CACHE_MAX_SIZE,
        );

        let mut settings = self.settings.write();
        settings.max_age_secs = age as u64;
        settings.max_idle_secs = idle as u64;
        settings.max_size = size as usize;
        debug!(max_age_secs = age, max_idle_secs = idle, max_size = size, "Connection cache settings loaded");
    }

    pub fn settings(&self) -> CacheSettings {
        self.settings.read().clone()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Stop maintenance and close every cached connection, borrowed or not.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(());

        let task = self.task.lock().take();
        if let Some(task) = task {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                warn!("Maintenance task did not stop in time");
            }
        }

        let entries: Vec<Arc<CachedConnection>> =
            self.connections.iter().map(|e| e.value().clone()).collect();
        self.connections.clear();
        self.creation_locks.clear();
        for connection in &entries {
            connection.force_release();
        }
        metrics::gauge!("mqbridge_connection_cache_size").set(0.0);
        info!(closed = entries.len(), "Connection resource manager stopped");
    }
}

/// Accept `value` when it lies in [0, max], otherwise log and use `default`.
fn bounded(value: Option<i64>, max: i64, default: i64, name: &str) -> i64 {
    match value {
        None => default,
        Some(v) if (0..=max).contains(&v) => v,
        Some(v) => {
            warn!(property = name, value = v, max, default, "Property out of range, using default");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded() {
        assert_eq!(bounded(None, 100, 7, "p"), 7);
        assert_eq!(bounded(Some(0), 100, 7, "p"), 0);
        assert_eq!(bounded(Some(100), 100, 7, "p"), 100);
        assert_eq!(bounded(Some(101), 100, 7, "p"), 7);
        assert_eq!(bounded(Some(-1), 100, 7, "p"), 7);
    }
}
