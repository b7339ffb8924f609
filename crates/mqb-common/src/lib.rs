//! Shared types for the mqbridge workspace.
//!
//! Holds the connector definition entity as it is stored by the
//! configuration source, the enums describing reply and acknowledgement
//! behaviour, and the change events that drive cache invalidation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod logging;

// ============================================================================
// Connector behaviour enums
// ============================================================================

/// How replies are exchanged for a connector.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplyMode {
    /// No reply is expected or sent.
    None,
    /// A temporary queue created from a model queue carries the reply.
    #[default]
    Automatic,
    /// A fixed, configured reply queue carries the reply.
    SpecifiedQueue,
}

/// When a received inbound message is acknowledged.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AcknowledgementMode {
    /// Commit as soon as the message is taken off the queue.
    #[default]
    OnTake,
    /// Commit only after processing and reply succeeded (transactional).
    OnCompletion,
}

impl AcknowledgementMode {
    pub fn is_transactional(&self) -> bool {
        matches!(self, AcknowledgementMode::OnCompletion)
    }
}

// ============================================================================
// Connector definition entity
// ============================================================================

/// TLS settings for the broker channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct TlsSettings {
    pub enabled: bool,
    pub cipher_spec: Option<String>,
    pub peer_name: Option<String>,
    pub key_store_ref: Option<String>,
}

/// A connector definition as stored by the configuration source.
///
/// The `version` increments on every save; anything cached from a
/// definition is keyed on it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectorDefinition {
    pub id: String,
    pub name: String,
    pub version: u64,
    pub enabled: bool,
    /// Inbound connectors get listeners; outbound ones are used by routing.
    pub inbound: bool,

    pub host: String,
    pub port: u16,
    pub channel: String,
    pub queue_manager_name: String,
    pub target_queue: String,

    pub reply_mode: ReplyMode,
    pub reply_queue_name: Option<String>,
    pub reply_model_queue_name: Option<String>,
    pub copy_correlation_id: bool,
    pub acknowledgement_mode: AcknowledgementMode,
    pub failure_queue_name: Option<String>,

    pub username: Option<String>,
    /// Reference into the credential store, never the password itself.
    pub password_ref: Option<String>,
    pub tls: TlsSettings,

    /// Number of listeners polling the target queue (inbound only).
    pub concurrent_listeners: u32,
    pub content_type: Option<String>,
    /// Request size limit in bytes; unset falls back to the routing default.
    pub request_size_limit: Option<i64>,

    pub pool_max_active: Option<u32>,
    pub pool_max_idle: Option<u32>,
    pub pool_max_wait_ms: Option<u64>,

    /// Message descriptor and property overrides applied on put.
    pub message_overrides: BTreeMap<String, String>,
}

impl Default for ConnectorDefinition {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            version: 1,
            enabled: true,
            inbound: false,
            host: "localhost".to_string(),
            port: 1414,
            channel: "SYSTEM.DEF.SVRCONN".to_string(),
            queue_manager_name: String::new(),
            target_queue: String::new(),
            reply_mode: ReplyMode::default(),
            reply_queue_name: None,
            reply_model_queue_name: None,
            copy_correlation_id: false,
            acknowledgement_mode: AcknowledgementMode::default(),
            failure_queue_name: None,
            username: None,
            password_ref: None,
            tls: TlsSettings::default(),
            concurrent_listeners: 1,
            content_type: None,
            request_size_limit: None,
            pool_max_active: None,
            pool_max_idle: None,
            pool_max_wait_ms: None,
            message_overrides: BTreeMap::new(),
        }
    }
}

impl ConnectorDefinition {
    /// Name used in logs and audits, falling back to the id.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// Whether this definition should have running listeners.
    pub fn wants_listeners(&self) -> bool {
        self.enabled && self.inbound
    }
}

// ============================================================================
// Change notifications
// ============================================================================

/// Invalidation event published by the configuration source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ConfigChange {
    /// One or more connector definitions were saved or deleted.
    Connector { ids: Vec<String> },
    /// A cluster-wide property changed.
    Property { name: String },
}

impl ConfigChange {
    pub fn connector(id: impl Into<String>) -> Self {
        ConfigChange::Connector { ids: vec![id.into()] }
    }

    pub fn property(name: impl Into<String>) -> Self {
        ConfigChange::Property { name: name.into() }
    }

    pub fn affects_connector(&self, id: &str) -> bool {
        match self {
            ConfigChange::Connector { ids } => ids.iter().any(|i| i == id),
            ConfigChange::Property { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connector_definition_camel_case() {
        let json = r#"{
            "id": "orders-in",
            "inbound": true,
            "queueManagerName": "QM1",
            "targetQueue": "ORDERS.IN",
            "replyMode": "SPECIFIED_QUEUE",
            "replyQueueName": "ORDERS.OUT",
            "acknowledgementMode": "ON_COMPLETION"
        }"#;

        let def: ConnectorDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(def.queue_manager_name, "QM1");
        assert_eq!(def.reply_mode, ReplyMode::SpecifiedQueue);
        assert!(def.acknowledgement_mode.is_transactional());
        assert_eq!(def.port, 1414);
        assert_eq!(def.concurrent_listeners, 1);
        assert_eq!(def.display_name(), "orders-in");
        assert!(def.wants_listeners());
    }

    #[test]
    fn test_config_change_matching() {
        let change = ConfigChange::connector("a");
        assert!(change.affects_connector("a"));
        assert!(!change.affects_connector("b"));
        assert!(!ConfigChange::property("mq.cache.maxAge").affects_connector("a"));
    }
}
