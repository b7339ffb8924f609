//! Broker connector runtime.
//!
//! - [`resource_manager::ConnectionResourceManager`]: keyed, reference-counted
//!   cache of pooled broker connections for outbound routes
//! - [`client::ReconnectingClient`]: one long-lived connection per listener
//! - [`listener::Listener`]: polling task with escalating backoff
//! - [`inbound::InboundModule`]: owns the listeners and handles received messages
//! - [`outbound::OutboundRoutingDriver`]: request/reply exchanges with bounded retry

pub mod audit;
pub mod client;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod inbound;
pub mod listener;
pub mod outbound;
pub mod processor;
pub mod resource_manager;
pub mod source;

pub use audit::{AuditLevel, AuditRecord, AuditSink, RecordingAuditSink, TracingAuditSink};
pub use client::{ClientBag, ReconnectingClient};
pub use endpoint::{EndpointConfig, EndpointKey, PoolParameters};
pub use error::{ConnectorError, FaultKind};
pub use inbound::{InboundModule, InboundServices};
pub use listener::{Listener, ListenerConfig, MessageHandler};
pub use outbound::{
    OutboundRequest, OutboundRoutingDriver, OutboundServices, RouteDefinition, RoutingOutcome,
    RoutingStatus,
};
pub use processor::{EchoProcessor, MessageProcessor, ProcessingResult};
pub use resource_manager::{ConnectionLease, ConnectionResourceManager};
pub use source::{
    ClusterProperties, ConnectorSource, CredentialStore, InMemoryConnectorSource, PropertyMap,
    StaticCredentialStore,
};

pub type Result<T> = std::result::Result<T, ConnectorError>;
