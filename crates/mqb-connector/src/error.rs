use mqb_broker::framing::FramingError;
use mqb_broker::{completion, reason, BrokerError};
use std::time::Duration;
use thiserror::Error;

/// Broad fault classes; each class has one handling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Invalid or missing settings. Never retried.
    Configuration,
    /// Connect, open, get or put failures. Retried after invalidating the connection.
    Transport,
    /// Worker pool full or shut down. Audited, never triggers reconnect.
    ResourceExhaustion,
    /// Malformed framing or unusable replies. Surfaced, not retried.
    Protocol,
    /// Cooperative cancellation.
    Interruption,
}

#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration source error: {0}")]
    Source(String),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Unable to obtain broker connection: {0}")]
    ConnectionUnavailable(#[source] BrokerError),

    #[error("Connection lost and reconnect not allowed")]
    ConnectionLost,

    #[error("Timed out after {0:?} waiting for a pooled connection")]
    BorrowTimeout(Duration),

    #[error("Connection resource manager is shut down")]
    ManagerShutdown,

    #[error("Worker pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("Worker pool is shut down")]
    PoolShutdown,

    #[error("Worker failed: {0}")]
    Worker(String),

    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("No response received within {0:?}")]
    NoResponse(Duration),

    #[error("Response of {size} bytes exceeds limit of {limit} bytes")]
    ResponseTooLarge { size: usize, limit: usize },

    #[error("Interrupted")]
    Interrupted,

    #[error("Listener failed to start: {0}")]
    ListenerStart(String),
}

impl ConnectorError {
    pub fn kind(&self) -> FaultKind {
        match self {
            ConnectorError::Config(_)
            | ConnectorError::Source(_)
            | ConnectorError::ListenerStart(_) => FaultKind::Configuration,
            ConnectorError::Broker(_)
            | ConnectorError::ConnectionUnavailable(_)
            | ConnectorError::ConnectionLost
            | ConnectorError::BorrowTimeout(_)
            | ConnectorError::ManagerShutdown
            | ConnectorError::Worker(_) => FaultKind::Transport,
            ConnectorError::PoolExhausted(_) | ConnectorError::PoolShutdown => {
                FaultKind::ResourceExhaustion
            }
            ConnectorError::Framing(_)
            | ConnectorError::NoResponse(_)
            | ConnectorError::ResponseTooLarge { .. } => FaultKind::Protocol,
            ConnectorError::Interrupted => FaultKind::Interruption,
        }
    }

    /// The broker fault behind this error, if there is one.
    pub fn broker_error(&self) -> Option<&BrokerError> {
        match self {
            ConnectorError::Broker(e) | ConnectorError::ConnectionUnavailable(e) => Some(e),
            _ => None,
        }
    }

    /// Completion and reason codes reported for this error.
    pub fn codes(&self) -> (i32, i32) {
        match self.broker_error() {
            Some(e) => (e.completion, e.reason),
            None if matches!(self, ConnectorError::NoResponse(_)) => {
                (completion::FAILED, reason::NO_MSG_AVAILABLE)
            }
            None if matches!(self, ConnectorError::ResponseTooLarge { .. }) => {
                (completion::FAILED, reason::TRUNCATED_MSG_FAILED)
            }
            None if self.kind() == FaultKind::Transport => {
                (completion::FAILED, reason::Q_MGR_NOT_AVAILABLE)
            }
            None => (completion::FAILED, reason::NONE),
        }
    }

    pub fn is_no_message(&self) -> bool {
        self.broker_error().map_or(false, BrokerError::is_no_message)
    }
}
