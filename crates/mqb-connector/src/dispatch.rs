//! Bounded worker pool shared by all inbound listeners.
//!
//! A submission either gets a worker slot immediately or is rejected with
//! `PoolExhausted`; there is no queueing. Shutdown rejects new work and
//! waits for running work to drain.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::{ConnectorError, Result};

pub struct WorkerPool {
    name: String,
    size: usize,
    slots: Arc<Semaphore>,
    running: AtomicBool,
    active: Arc<AtomicU32>,
}

struct ActiveGuard(Arc<AtomicU32>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        let size = size.max(1);
        Self {
            name: name.into(),
            size,
            slots: Arc::new(Semaphore::new(size)),
            running: AtomicBool::new(true),
            active: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Run `task` on a worker if one is free.
    pub fn try_submit<F>(&self, task: F) -> Result<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if !self.running.load(Ordering::SeqCst) {
            return Err(ConnectorError::PoolShutdown);
        }

        let permit = self.slots.clone().try_acquire_owned().map_err(|_| {
            metrics::counter!("mqbridge_worker_pool_rejected_total").increment(1);
            ConnectorError::PoolExhausted(format!("{} ({} workers busy)", self.name, self.size))
        })?;

        self.active.fetch_add(1, Ordering::SeqCst);
        let guard = ActiveGuard(self.active.clone());

        Ok(tokio::spawn(async move {
            let _permit = permit;
            let _guard = guard;
            task.await
        }))
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn active(&self) -> u32 {
        self.active.load(Ordering::SeqCst)
    }

    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Reject new work and wait up to `timeout` for running work.
    pub async fn shutdown(&self, timeout: Duration) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        match tokio::time::timeout(timeout, self.slots.acquire_many(self.size as u32)).await {
            Ok(Ok(_all)) => info!(pool = %self.name, "Worker pool drained"),
            Ok(Err(_)) => {}
            Err(_) => warn!(pool = %self.name, active = self.active(), "Worker pool shutdown timed out"),
        }
        self.slots.close();
    }
}
