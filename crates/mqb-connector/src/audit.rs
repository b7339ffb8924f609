//! Audit records and notification rate limiting.
//!
//! Connection-established and connection-error notifications, and listener
//! error audits, are suppressed inside a quiet window so that a sustained
//! outage produces one record per window instead of one per retry.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Quiet window applied to connection notifications.
pub const NOTIFICATION_QUIET_WINDOW: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub component: String,
    pub level: AuditLevel,
    pub message: String,
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(component: impl Into<String>, level: AuditLevel, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            level,
            message: message.into(),
            detail: None,
            at: Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Destination for audit records.
pub trait AuditSink: Send + Sync {
    fn audit(&self, record: AuditRecord);
}

/// Writes audit records to the tracing log.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn audit(&self, record: AuditRecord) {
        let detail = record.detail.as_deref().unwrap_or("");
        match record.level {
            AuditLevel::Info => info!(component = %record.component, detail, "{}", record.message),
            AuditLevel::Warning => warn!(component = %record.component, detail, "{}", record.message),
            AuditLevel::Error => error!(component = %record.component, detail, "{}", record.message),
        }
    }
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct RecordingAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl RecordingAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }

    pub fn count(&self, level: AuditLevel) -> usize {
        self.records.lock().iter().filter(|r| r.level == level).count()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.records.lock().iter().any(|r| r.message.contains(needle))
    }
}

impl AuditSink for RecordingAuditSink {
    fn audit(&self, record: AuditRecord) {
        self.records.lock().push(record);
    }
}

/// Lets an event through at most once per window.
#[derive(Debug)]
pub struct QuietWindow {
    window: Duration,
    last_fired: Mutex<Option<Instant>>,
}

impl QuietWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_fired: Mutex::new(None),
        }
    }

    /// Returns true, and records the time, if the window has passed.
    pub fn try_fire(&self) -> bool {
        let now = Instant::now();
        let mut last = self.last_fired.lock();
        match *last {
            Some(at) if now.duration_since(at) < self.window => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    pub fn last_fired(&self) -> Option<Instant> {
        *self.last_fired.lock()
    }
}

/// Rate-limited connection notifications for one component.
pub struct ConnectionNotifier {
    component: String,
    audit: Arc<dyn AuditSink>,
    established: QuietWindow,
    errors: QuietWindow,
}

impl ConnectionNotifier {
    pub fn new(component: impl Into<String>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            component: component.into(),
            audit,
            established: QuietWindow::new(NOTIFICATION_QUIET_WINDOW),
            errors: QuietWindow::new(NOTIFICATION_QUIET_WINDOW),
        }
    }

    pub fn connected(&self, target: &str) {
        if self.established.try_fire() {
            self.audit.audit(
                AuditRecord::new(&self.component, AuditLevel::Info, "Connection established")
                    .with_detail(target),
            );
        } else {
            debug!(component = %self.component, target, "Connection established (notification suppressed)");
        }
    }

    pub fn connection_error(&self, target: &str, err: &dyn Display) {
        if self.errors.try_fire() {
            self.audit.audit(
                AuditRecord::new(&self.component, AuditLevel::Error, "Connection error")
                    .with_detail(format!("{}: {}", target, err)),
            );
        } else {
            debug!(component = %self.component, target, error = %err, "Connection error (notification suppressed)");
        }
    }
}
