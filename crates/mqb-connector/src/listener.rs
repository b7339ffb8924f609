//! Inbound listener - one polling task per enabled inbound endpoint
//!
//! Phases: `Starting -> Polling <-> Dispatching -> (error) ShortBackoff |
//! LongBackoff -> Polling -> ... -> Stopping -> Stopped`.
//!
//! Each receive is a timed syncpoint get through the listener's own
//! [`ReconnectingClient`]. A received message goes to the injected
//! [`MessageHandler`] and is handled to completion before the next receive.
//! Receive failures tear the connection down and back off: a short delay
//! while the consecutive failure count is below [`MAX_OOPSES`], then one
//! long delay after which the count starts over.

use async_trait::async_trait;
use mqb_broker::{BrokerMessage, GetOptions};
use mqb_config::ListenerSettings;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditLevel, AuditRecord, AuditSink, QuietWindow, NOTIFICATION_QUIET_WINDOW};
use crate::client::ReconnectingClient;
use crate::error::FaultKind;
use crate::{ConnectorError, Result};

/// Consecutive failures before the long backoff.
pub const MAX_OOPSES: u32 = 5;

/// How long `ensure_stopped` waits for the task to finish.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(7);

/// Handles one received message. Runs inside the listener's unit of work.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(&self, client: Arc<ReconnectingClient>, message: BrokerMessage) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    pub poll_interval: Duration,
    pub retry_delay: Duration,
    pub long_retry_delay: Duration,
}

impl From<&ListenerSettings> for ListenerConfig {
    fn from(settings: &ListenerSettings) -> Self {
        Self {
            poll_interval: settings.poll_interval(),
            retry_delay: settings.retry_delay(),
            long_retry_delay: settings.long_retry_delay(),
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self::from(&ListenerSettings::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerPhase {
    Created,
    Starting,
    Polling,
    Dispatching,
    ShortBackoff,
    LongBackoff,
    Stopping,
    Stopped,
}

/// The oops counter.
#[derive(Debug, Clone)]
pub struct Backoff {
    count: u32,
    short: Duration,
    long: Duration,
}

impl Backoff {
    pub fn new(short: Duration, long: Duration) -> Self {
        Self { count: 0, short, long }
    }

    /// Count a failure and return how long to sleep.
    pub fn record_failure(&mut self) -> (Duration, ListenerPhase) {
        self.count += 1;
        if self.count < MAX_OOPSES {
            (self.short, ListenerPhase::ShortBackoff)
        } else {
            self.count = 0;
            (self.long, ListenerPhase::LongBackoff)
        }
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

/// Point-in-time view of a listener's runtime state.
#[derive(Debug, Clone)]
pub struct ListenerSnapshot {
    pub phase: ListenerPhase,
    pub consecutive_errors: u32,
    pub stop_requested: bool,
    pub last_stop_requested_at: Option<Instant>,
    pub last_error_audit_at: Option<Instant>,
    pub messages_received: u64,
}

struct ListenerShared {
    display_name: String,
    stop_requested: AtomicBool,
    stop_signal: Notify,
    phase: Mutex<ListenerPhase>,
    consecutive_errors: AtomicU32,
    last_stop_requested_at: Mutex<Option<Instant>>,
    error_audits: QuietWindow,
    messages_received: AtomicU64,
}

impl ListenerShared {
    fn set_phase(&self, phase: ListenerPhase) {
        *self.phase.lock() = phase;
    }

    fn stopped(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }
}

pub struct Listener {
    shared: Arc<ListenerShared>,
    client: Arc<ReconnectingClient>,
    handler: Arc<dyn MessageHandler>,
    audit: Arc<dyn AuditSink>,
    config: ListenerConfig,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Listener {
    pub fn new(
        display_name: impl Into<String>,
        client: Arc<ReconnectingClient>,
        handler: Arc<dyn MessageHandler>,
        audit: Arc<dyn AuditSink>,
        config: ListenerConfig,
    ) -> Self {
        Self {
            shared: Arc::new(ListenerShared {
                display_name: display_name.into(),
                stop_requested: AtomicBool::new(false),
                stop_signal: Notify::new(),
                phase: Mutex::new(ListenerPhase::Created),
                consecutive_errors: AtomicU32::new(0),
                last_stop_requested_at: Mutex::new(None),
                error_audits: QuietWindow::new(NOTIFICATION_QUIET_WINDOW),
                messages_received: AtomicU64::new(0),
            }),
            client,
            handler,
            audit,
            config,
            task: Mutex::new(None),
        }
    }

    /// Stable identity for logs and audits.
    pub fn display_name(&self) -> &str {
        &self.shared.display_name
    }

    /// Spawn the polling task. Fails if there is no runtime or the
    /// listener was already started.
    pub fn start(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ConnectorError::ListenerStart(format!("{}: {}", self.display_name(), e)))?;

        let mut task = self.task.lock();
        if task.is_some() || self.shared.stopped() {
            return Err(ConnectorError::ListenerStart(format!(
                "{} was already started",
                self.display_name()
            )));
        }

        self.shared.set_phase(ListenerPhase::Starting);
        let worker = PollLoop {
            shared: self.shared.clone(),
            client: self.client.clone(),
            handler: self.handler.clone(),
            audit: self.audit.clone(),
            backoff: Backoff::new(self.config.retry_delay, self.config.long_retry_delay),
            poll_interval: self.config.poll_interval,
            retry_delay: self.config.retry_delay,
        };
        *task = Some(runtime.spawn(worker.run()));
        Ok(())
    }

    /// Ask the task to stop before its next dispatch. Safe to call repeatedly.
    pub fn stop(&self) {
        if !self.shared.stop_requested.swap(true, Ordering::SeqCst) {
            *self.shared.last_stop_requested_at.lock() = Some(Instant::now());
            self.shared.stop_signal.notify_one();
            debug!(listener = %self.display_name(), "Stop requested");
        }
    }

    /// Stop and wait up to [`JOIN_TIMEOUT`] for the task. A task still
    /// running after that is left to finish on its own.
    pub async fn ensure_stopped(&self) {
        self.stop();
        let task = self.task.lock().take();
        let Some(task) = task else {
            return;
        };

        match tokio::time::timeout(JOIN_TIMEOUT, task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(listener = %self.display_name(), error = %e, "Listener task failed"),
            Err(_) => warn!(
                listener = %self.display_name(),
                timeout_secs = JOIN_TIMEOUT.as_secs(),
                "Listener still running after join timeout, abandoning it"
            ),
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().map_or(false, |t| !t.is_finished())
    }

    pub fn snapshot(&self) -> ListenerSnapshot {
        ListenerSnapshot {
            phase: *self.shared.phase.lock(),
            consecutive_errors: self.shared.consecutive_errors.load(Ordering::SeqCst),
            stop_requested: self.shared.stopped(),
            last_stop_requested_at: *self.shared.last_stop_requested_at.lock(),
            last_error_audit_at: self.shared.error_audits.last_fired(),
            messages_received: self.shared.messages_received.load(Ordering::SeqCst),
        }
    }
}

struct PollLoop {
    shared: Arc<ListenerShared>,
    client: Arc<ReconnectingClient>,
    handler: Arc<dyn MessageHandler>,
    audit: Arc<dyn AuditSink>,
    backoff: Backoff,
    poll_interval: Duration,
    retry_delay: Duration,
}

impl PollLoop {
    async fn run(mut self) {
        info!(listener = %self.shared.display_name, "Listener started");

        while !self.shared.stopped() {
            self.shared.set_phase(ListenerPhase::Polling);

            match self.receive().await {
                Ok(Some(message)) => {
                    if self.shared.stopped() {
                        self.return_message().await;
                        break;
                    }
                    self.backoff.reset();
                    self.shared.consecutive_errors.store(0, Ordering::SeqCst);
                    self.shared.messages_received.fetch_add(1, Ordering::SeqCst);
                    metrics::counter!("mqbridge_messages_received_total").increment(1);

                    self.shared.set_phase(ListenerPhase::Dispatching);
                    if let Err(e) = self.handler.handle_message(self.client.clone(), message).await {
                        self.on_dispatch_error(e).await;
                    }
                }
                Ok(None) => {}
                Err(ConnectorError::Interrupted) => {}
                Err(e) => self.on_error(e).await,
            }
        }

        self.shared.set_phase(ListenerPhase::Stopping);
        self.client.close().await;
        self.shared.set_phase(ListenerPhase::Stopped);
        info!(listener = %self.shared.display_name, "Listener stopped");
    }

    async fn receive(&self) -> Result<Option<BrokerMessage>> {
        let options = GetOptions {
            wait: Some(self.poll_interval),
            syncpoint: true,
            ..Default::default()
        };

        let received = self
            .client
            .do_work(true, move |bag| Box::pin(async move { bag.target().get(&options).await }))
            .await;

        match received {
            Ok(message) => Ok(Some(message)),
            Err(e) if e.is_no_message() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// A message taken after stop was requested goes back to the queue.
    async fn return_message(&self) {
        let result = self
            .client
            .do_work(false, |bag| Box::pin(async move { bag.session().backout().await }))
            .await;
        if let Err(e) = result {
            warn!(listener = %self.shared.display_name, error = %e, "Backout after stop failed");
        }
    }

    async fn on_dispatch_error(&mut self, err: ConnectorError) {
        match err.kind() {
            FaultKind::Interruption => {}
            FaultKind::ResourceExhaustion => {
                warn!(listener = %self.shared.display_name, error = %err, "Message handling rejected");
                self.audit.audit(
                    AuditRecord::new(&self.shared.display_name, AuditLevel::Warning, "Worker pool exhausted")
                        .with_detail(err.to_string()),
                );
                metrics::counter!("mqbridge_listener_rejections_total").increment(1);
                // keeps a full pool from spinning on the same backed-out message
                self.pause(self.retry_delay).await;
            }
            _ => self.on_error(err).await,
        }
    }

    async fn on_error(&mut self, err: ConnectorError) {
        metrics::counter!("mqbridge_listener_errors_total").increment(1);

        if self.shared.error_audits.try_fire() {
            self.audit.audit(
                AuditRecord::new(&self.shared.display_name, AuditLevel::Error, "Error receiving message")
                    .with_detail(err.to_string()),
            );
        }

        self.client.close().await;

        let (delay, phase) = self.backoff.record_failure();
        self.shared.consecutive_errors.store(self.backoff.count(), Ordering::SeqCst);
        self.shared.set_phase(phase);
        warn!(
            listener = %self.shared.display_name,
            error = %err,
            phase = ?phase,
            delay_ms = delay.as_millis() as u64,
            "Receive failed, backing off"
        );

        self.pause(delay).await;
    }

    /// Sleep, returning early if stop is requested.
    async fn pause(&self, delay: Duration) {
        if self.shared.stopped() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.shared.stop_signal.notified() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_switches_to_long_after_ceiling() {
        let short = Duration::from_secs(5);
        let long = Duration::from_secs(60);
        let mut backoff = Backoff::new(short, long);

        for expected_count in 1..MAX_OOPSES {
            assert_eq!(backoff.record_failure(), (short, ListenerPhase::ShortBackoff));
            assert_eq!(backoff.count(), expected_count);
        }
        assert_eq!(backoff.record_failure(), (long, ListenerPhase::LongBackoff));
        assert_eq!(backoff.count(), 0);

        // the cycle starts over
        assert_eq!(backoff.record_failure(), (short, ListenerPhase::ShortBackoff));
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(10));
        backoff.record_failure();
        backoff.record_failure();
        backoff.reset();
        assert_eq!(backoff.count(), 0);
    }

    #[test]
    fn test_config_clamps_long_delay() {
        let settings = ListenerSettings {
            long_retry_delay_ms: 500,
            ..Default::default()
        };
        let config = ListenerConfig::from(&settings);
        assert_eq!(config.long_retry_delay, Duration::from_secs(10));
    }
}
