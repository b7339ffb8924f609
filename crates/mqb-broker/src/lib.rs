//! Broker client surface.
//!
//! The connector never speaks a wire protocol itself; it drives a broker
//! client through the traits in this crate:
//! - [`BrokerConnector`] opens a [`QueueManagerSession`]
//! - a session opens [`BrokerQueue`] handles and owns the unit of work
//! - every failure is a [`BrokerError`] carrying completion and reason codes
//!
//! [`memory::InMemoryBroker`] implements the surface for development and tests.

use async_trait::async_trait;
use std::time::Duration;

pub mod error;
pub mod framing;
pub mod memory;
pub mod message;

pub use error::{completion, reason, BrokerError};
pub use message::{BrokerMessage, Persistence};

pub type Result<T> = std::result::Result<T, BrokerError>;

/// Everything needed to reach one queue manager.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ConnectProperties {
    pub host: String,
    pub port: u16,
    pub channel: String,
    pub queue_manager_name: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls_enabled: bool,
    pub cipher_spec: Option<String>,
    pub tls_peer_name: Option<String>,
}

impl ConnectProperties {
    /// `host(port)` form used in logs.
    pub fn connection_name(&self) -> String {
        format!("{}({})", self.host, self.port)
    }
}

/// How a queue handle is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenOptions {
    pub input: bool,
    pub output: bool,
    pub inquire: bool,
    pub fail_if_quiescing: bool,
}

impl OpenOptions {
    pub fn input() -> Self {
        Self {
            input: true,
            inquire: true,
            fail_if_quiescing: true,
            ..Default::default()
        }
    }

    pub fn output() -> Self {
        Self {
            output: true,
            fail_if_quiescing: true,
            ..Default::default()
        }
    }

    pub fn input_output() -> Self {
        Self {
            input: true,
            output: true,
            inquire: true,
            fail_if_quiescing: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PutOptions {
    pub syncpoint: bool,
    pub new_message_id: bool,
    pub new_correlation_id: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GetOptions {
    /// How long to wait for a message; `None` returns immediately.
    pub wait: Option<Duration>,
    pub syncpoint: bool,
    pub match_message_id: Option<[u8; message::ID_LENGTH]>,
    pub match_correlation_id: Option<[u8; message::ID_LENGTH]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueDefinitionType {
    Predefined,
    Model,
    TemporaryDynamic,
    PermanentDynamic,
}

/// Opens sessions against a queue manager.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self, properties: &ConnectProperties) -> Result<Box<dyn QueueManagerSession>>;
}

/// A live connection to one queue manager.
///
/// `disconnect` is synchronous so a session can be torn down from `Drop`.
#[async_trait]
pub trait QueueManagerSession: Send + Sync {
    fn queue_manager_name(&self) -> &str;

    async fn open_queue(&self, name: &str, options: OpenOptions) -> Result<Box<dyn BrokerQueue>>;

    /// Open a model queue, creating a dynamic queue named from `dynamic_name`
    /// (a trailing `*` is replaced by a generated suffix).
    async fn open_model_queue(
        &self,
        model: &str,
        dynamic_name: &str,
        options: OpenOptions,
    ) -> Result<Box<dyn BrokerQueue>>;

    async fn commit(&self) -> Result<()>;

    async fn backout(&self) -> Result<()>;

    /// Liveness probe used before a held session is reused.
    fn is_connected(&self) -> bool;

    fn disconnect(&self);
}

/// An opened queue handle.
#[async_trait]
pub trait BrokerQueue: Send + Sync {
    fn name(&self) -> &str;

    fn definition_type(&self) -> QueueDefinitionType;

    /// Put a message; generated identifiers are written back into `message`.
    async fn put(&self, message: &mut BrokerMessage, options: &PutOptions) -> Result<()>;

    async fn get(&self, options: &GetOptions) -> Result<BrokerMessage>;

    /// Close the handle. Closing a temporary dynamic queue deletes it.
    fn close(&self);
}
