use thiserror::Error;

/// Completion codes reported with every broker call.
pub mod completion {
    pub const OK: i32 = 0;
    pub const WARNING: i32 = 1;
    pub const FAILED: i32 = 2;
}

/// Reason codes the connector branches on.
pub mod reason {
    pub const NONE: i32 = 0;
    pub const CONNECTION_BROKEN: i32 = 2009;
    pub const HOBJ_ERROR: i32 = 2019;
    pub const NO_MSG_AVAILABLE: i32 = 2033;
    pub const NOT_AUTHORIZED: i32 = 2035;
    pub const NOT_OPEN_FOR_INPUT: i32 = 2037;
    pub const NOT_OPEN_FOR_OUTPUT: i32 = 2039;
    pub const PRIORITY_EXCEEDS_MAXIMUM: i32 = 2049;
    pub const Q_MGR_NAME_ERROR: i32 = 2058;
    pub const Q_MGR_NOT_AVAILABLE: i32 = 2059;
    pub const TRUNCATED_MSG_FAILED: i32 = 2080;
    pub const UNKNOWN_OBJECT_NAME: i32 = 2085;
    pub const Q_MGR_QUIESCING: i32 = 2161;
    pub const Q_MGR_STOPPING: i32 = 2162;
    pub const UNEXPECTED_ERROR: i32 = 2195;
}

/// A fault reported by the broker, carrying its completion and reason codes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("broker call failed (completion {completion}, reason {reason}): {message}")]
pub struct BrokerError {
    pub completion: i32,
    pub reason: i32,
    pub message: String,
}

impl BrokerError {
    pub fn new(completion: i32, reason: i32, message: impl Into<String>) -> Self {
        Self {
            completion,
            reason,
            message: message.into(),
        }
    }

    pub fn failed(reason: i32, message: impl Into<String>) -> Self {
        Self::new(completion::FAILED, reason, message)
    }

    pub fn no_message() -> Self {
        Self::failed(reason::NO_MSG_AVAILABLE, "no message available")
    }

    pub fn connection_broken() -> Self {
        Self::failed(reason::CONNECTION_BROKEN, "connection to queue manager is broken")
    }

    pub fn unavailable() -> Self {
        Self::failed(reason::Q_MGR_NOT_AVAILABLE, "queue manager not available")
    }

    /// The "queue empty" outcome of a get, which callers treat as no message.
    pub fn is_no_message(&self) -> bool {
        self.reason == reason::NO_MSG_AVAILABLE
    }

    /// Warnings complete the operation; the codes are informational.
    pub fn is_warning(&self) -> bool {
        self.completion == completion::WARNING
    }

    /// Faults that mean the connection itself is gone.
    pub fn is_connection_fault(&self) -> bool {
        matches!(
            self.reason,
            reason::CONNECTION_BROKEN
                | reason::Q_MGR_NOT_AVAILABLE
                | reason::Q_MGR_QUIESCING
                | reason::Q_MGR_STOPPING
        )
    }
}
