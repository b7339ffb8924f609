//! Endpoint configuration snapshots and cache keys.
//!
//! An [`EndpointConfig`] is derived once per connector definition version
//! and never mutated. Its [`EndpointKey`] identifies pooled connections: it
//! carries every value that changes what a cached connection is.

use mqb_broker::ConnectProperties;
use mqb_common::{AcknowledgementMode, ConnectorDefinition, ReplyMode};
use mqb_config::{PoolDefaults, RoutingSettings};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crate::source::{parse_property, property, ClusterProperties, CredentialStore};
use crate::{ConnectorError, Result};

/// Model queue used for automatic replies when none is configured.
pub const DEFAULT_MODEL_QUEUE: &str = "SYSTEM.DEFAULT.MODEL.QUEUE";

/// Content type assumed for inbound messages when none is configured.
pub const DEFAULT_CONTENT_TYPE: &str = "text/xml; charset=utf-8";

/// Pool sizing for one cached connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolParameters {
    /// Concurrent borrowers allowed; 0 is unbounded.
    pub max_active: u32,
    pub max_idle: u32,
    /// How long a borrower waits for a slot; zero waits indefinitely.
    pub max_wait: Duration,
}

impl PoolParameters {
    /// Connector value first, then cluster property, then the configured default.
    pub fn resolve(
        definition: &ConnectorDefinition,
        properties: &dyn ClusterProperties,
        defaults: &PoolDefaults,
    ) -> Self {
        let max_active = definition
            .pool_max_active
            .or_else(|| parse_property(properties.get(property::POOL_MAX_ACTIVE), property::POOL_MAX_ACTIVE))
            .unwrap_or(defaults.max_active);
        let max_idle = definition
            .pool_max_idle
            .or_else(|| parse_property(properties.get(property::POOL_MAX_IDLE), property::POOL_MAX_IDLE))
            .unwrap_or(defaults.max_idle);
        let max_wait_ms = definition
            .pool_max_wait_ms
            .or_else(|| parse_property(properties.get(property::POOL_MAX_WAIT), property::POOL_MAX_WAIT))
            .unwrap_or(defaults.max_wait_ms);

        Self {
            max_active,
            max_idle,
            max_wait: Duration::from_millis(max_wait_ms),
        }
    }
}

impl From<&PoolDefaults> for PoolParameters {
    fn from(defaults: &PoolDefaults) -> Self {
        Self {
            max_active: defaults.max_active,
            max_idle: defaults.max_idle,
            max_wait: Duration::from_millis(defaults.max_wait_ms),
        }
    }
}

/// Cache key for pooled connections.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointKey {
    pub identity: String,
    pub version: u64,
    pub pool_max_active: u32,
    pub pool_max_idle: u32,
    pub pool_max_wait_ms: u64,
}

impl EndpointKey {
    pub fn new(identity: impl Into<String>, version: u64, pool: &PoolParameters) -> Self {
        Self {
            identity: identity.into(),
            version,
            pool_max_active: pool.max_active,
            pool_max_idle: pool.max_idle,
            pool_max_wait_ms: pool.max_wait.as_millis() as u64,
        }
    }
}

impl std::fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}@v{}[{}/{}/{}ms]",
            self.identity, self.version, self.pool_max_active, self.pool_max_idle, self.pool_max_wait_ms
        )
    }
}

/// Queue names resolved per request for dynamic routes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DynamicProperties {
    pub queue_name: Option<String>,
    pub reply_queue_name: Option<String>,
}

/// Immutable snapshot of one connector's settings.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub connector_id: String,
    pub name: String,
    pub key: EndpointKey,
    pub queue_manager_name: String,
    pub queue_name: String,
    pub reply_mode: ReplyMode,
    pub reply_queue_name: Option<String>,
    pub reply_model_queue_name: Option<String>,
    pub copy_correlation_id: bool,
    pub acknowledgement_mode: AcknowledgementMode,
    pub failure_queue_name: Option<String>,
    pub connect: ConnectProperties,
    pub pool: PoolParameters,
    /// Request size limit in bytes; 0 means unlimited.
    pub message_size_limit: usize,
    pub content_type: String,
    pub message_overrides: BTreeMap<String, String>,
    /// Built from per-request values; never cached.
    pub dynamic: bool,
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl EndpointConfig {
    pub fn from_definition(
        definition: &ConnectorDefinition,
        password: Option<String>,
        pool: PoolParameters,
        default_size_limit: i64,
    ) -> Result<Self> {
        let limit = match definition.request_size_limit {
            Some(limit) if limit >= 0 => limit,
            _ => default_size_limit,
        };

        let config = Self {
            connector_id: definition.id.clone(),
            name: definition.display_name().to_string(),
            key: EndpointKey::new(&definition.id, definition.version, &pool),
            queue_manager_name: definition.queue_manager_name.clone(),
            queue_name: definition.target_queue.trim().to_string(),
            reply_mode: definition.reply_mode,
            reply_queue_name: non_empty(&definition.reply_queue_name),
            reply_model_queue_name: non_empty(&definition.reply_model_queue_name),
            copy_correlation_id: definition.copy_correlation_id,
            acknowledgement_mode: definition.acknowledgement_mode,
            failure_queue_name: non_empty(&definition.failure_queue_name),
            connect: ConnectProperties {
                host: definition.host.clone(),
                port: definition.port,
                channel: definition.channel.clone(),
                queue_manager_name: definition.queue_manager_name.clone(),
                username: definition.username.clone(),
                password,
                tls_enabled: definition.tls.enabled,
                cipher_spec: definition.tls.cipher_spec.clone(),
                tls_peer_name: definition.tls.peer_name.clone(),
            },
            pool,
            message_size_limit: limit.max(0) as usize,
            content_type: definition
                .content_type
                .clone()
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            message_overrides: definition.message_overrides.clone(),
            dynamic: false,
        };
        config.validate()?;
        Ok(config)
    }

    /// Build a snapshot for `definition`: look up its password, resolve pool
    /// parameters and fall back to the routing defaults.
    pub async fn resolve(
        definition: &ConnectorDefinition,
        credentials: &dyn CredentialStore,
        properties: &dyn ClusterProperties,
        routing: &RoutingSettings,
    ) -> Result<Self> {
        let password = match &definition.password_ref {
            Some(reference) => Some(credentials.find_password(reference).await?.ok_or_else(|| {
                ConnectorError::Config(format!(
                    "connector '{}' references unknown password '{}'",
                    definition.display_name(),
                    reference
                ))
            })?),
            None => None,
        };
        let pool = PoolParameters::resolve(definition, properties, &routing.pool);
        Self::from_definition(definition, password, pool, routing.max_message_bytes)
    }

    /// Apply per-request queue names. The result is marked dynamic.
    pub fn with_dynamic(mut self, dynamic: &DynamicProperties) -> Result<Self> {
        if let Some(queue) = non_empty(&dynamic.queue_name) {
            self.queue_name = queue;
        }
        if let Some(reply) = non_empty(&dynamic.reply_queue_name) {
            self.reply_queue_name = Some(reply);
        }
        self.dynamic = true;
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_name.is_empty() {
            return Err(ConnectorError::Config(format!(
                "connector '{}' has no target queue",
                self.name
            )));
        }
        if self.reply_mode == ReplyMode::SpecifiedQueue && self.reply_queue_name.is_none() {
            return Err(ConnectorError::Config(format!(
                "connector '{}' uses a specified reply queue but none is named",
                self.name
            )));
        }
        if self.connect.tls_enabled && self.connect.cipher_spec.is_none() {
            return Err(ConnectorError::Config(format!(
                "connector '{}' enables TLS without a cipher spec",
                self.name
            )));
        }
        Ok(())
    }

    pub fn is_transactional(&self) -> bool {
        self.acknowledgement_mode.is_transactional()
    }

    pub fn reply_model_queue(&self) -> &str {
        self.reply_model_queue_name.as_deref().unwrap_or(DEFAULT_MODEL_QUEUE)
    }

    pub fn target_description(&self) -> String {
        format!(
            "{} {}/{}",
            self.connect.connection_name(),
            self.queue_manager_name,
            self.queue_name
        )
    }
}

/// Expand `${name}` placeholders from request variables.
pub fn expand_template(template: &str, variables: &HashMap<String, String>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or_else(|| {
            ConnectorError::Config(format!("unterminated variable in '{}'", template))
        })?;
        let name = &after[..end];
        let value = variables.get(name).ok_or_else(|| {
            ConnectorError::Config(format!("variable '{}' is not set", name))
        })?;
        out.push_str(value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// True when `size` is over `limit`. A limit of 0 never rejects.
pub fn exceeds_size_limit(size: usize, limit: usize) -> bool {
    limit > 0 && size > limit
}
