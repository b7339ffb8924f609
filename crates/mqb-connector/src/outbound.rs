//! Outbound Routing Driver - request/reply exchanges against a connector
//!
//! Each invocation borrows a pooled connection from the
//! [`ConnectionResourceManager`], puts the request (and waits for a
//! correlated reply) or gets a message, and reports a [`RoutingOutcome`]
//! carrying the broker completion and reason codes.
//!
//! Transport faults before anything was sent or received are retried with a
//! fixed delay after invalidating the connection. Faults after that point
//! are surfaced, never retried. A process-wide [`FailurePressure`] counter
//! short-circuits invocations while many of them are failing at once.

use bytes::Bytes;
use mqb_broker::framing::{apply_overrides, merge_header_payload, split_header_payload};
use mqb_broker::message::format;
use mqb_broker::{
    completion, reason, BrokerError, BrokerMessage, GetOptions, OpenOptions, PutOptions,
    QueueDefinitionType, QueueManagerSession,
};
use mqb_common::{ConfigChange, ReplyMode};
use mqb_config::RoutingSettings;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::client::ScopedQueue;
use crate::endpoint::{exceeds_size_limit, expand_template, DynamicProperties, EndpointConfig};
use crate::error::FaultKind;
use crate::resource_manager::ConnectionResourceManager;
use crate::source::{property, ClusterProperties, ConnectorSource, CredentialStore};
use crate::{ConnectorError, Result};

/// Output variable carrying the broker completion code.
pub const COMPLETION_CODE_VARIABLE: &str = "mq.completion.code";
/// Output variable carrying the broker reason code.
pub const REASON_CODE_VARIABLE: &str = "mq.reason.code";

/// Outbound invocations currently failing to reach the broker.
#[derive(Debug, Default)]
pub struct FailurePressure(AtomicU32);

impl FailurePressure {
    pub fn increment(&self) -> u32 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn decrement(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub fn current(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything outbound routes share.
pub struct OutboundServices {
    pub resources: Arc<ConnectionResourceManager>,
    pub source: Arc<dyn ConnectorSource>,
    pub credentials: Arc<dyn CredentialStore>,
    pub properties: Arc<dyn ClusterProperties>,
    pub settings: RoutingSettings,
    pub failure_pressure: FailurePressure,
}

impl OutboundServices {
    pub fn new(
        resources: Arc<ConnectionResourceManager>,
        source: Arc<dyn ConnectorSource>,
        credentials: Arc<dyn CredentialStore>,
        properties: Arc<dyn ClusterProperties>,
        settings: RoutingSettings,
    ) -> Self {
        Self {
            resources,
            source,
            credentials,
            properties,
            settings,
            failure_pressure: FailurePressure::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Put { reply_expected: bool },
    Get,
}

/// How one route talks to its connector.
#[derive(Debug, Clone)]
pub struct RouteDefinition {
    pub connector_id: String,
    pub direction: Direction,
    /// Queue name, optionally with `${var}` placeholders.
    pub queue_template: Option<String>,
    pub reply_queue_template: Option<String>,
    pub response_timeout: Option<Duration>,
    /// Reply size limit in bytes; negative means the default maximum, 0 means unlimited.
    pub response_size_limit: Option<i64>,
    pub message_overrides: BTreeMap<String, String>,
}

impl RouteDefinition {
    pub fn put(connector_id: impl Into<String>, reply_expected: bool) -> Self {
        Self::new(connector_id, Direction::Put { reply_expected })
    }

    pub fn get(connector_id: impl Into<String>) -> Self {
        Self::new(connector_id, Direction::Get)
    }

    fn new(connector_id: impl Into<String>, direction: Direction) -> Self {
        Self {
            connector_id: connector_id.into(),
            direction,
            queue_template: None,
            reply_queue_template: None,
            response_timeout: None,
            response_size_limit: None,
            message_overrides: BTreeMap::new(),
        }
    }

    fn has_queue_overrides(&self) -> bool {
        self.queue_template.is_some() || self.reply_queue_template.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct OutboundRequest {
    pub header: Option<Bytes>,
    pub payload: Bytes,
    /// Values for `${var}` placeholders in queue templates.
    pub variables: HashMap<String, String>,
    pub overrides: BTreeMap<String, String>,
}

impl OutboundRequest {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            ..Default::default()
        }
    }

    fn size(&self) -> usize {
        self.payload.len() + self.header.as_ref().map_or(0, Bytes::len)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingStatus {
    Routed,
    /// The request was too large to send.
    BadRequest,
    /// Short-circuited while the broker is unreachable.
    Falsified,
    /// Configuration fault, no reply, or an unusable reply.
    Failed,
    /// Transport fault after retries or after the request was sent.
    ServerError,
}

#[derive(Debug, Clone)]
pub struct RoutedResponse {
    pub header: Option<Bytes>,
    pub payload: Bytes,
    pub message: BrokerMessage,
}

#[derive(Debug, Clone)]
pub struct RoutingOutcome {
    pub status: RoutingStatus,
    pub completion_code: i32,
    pub reason_code: i32,
    pub response: Option<RoutedResponse>,
    pub error: Option<String>,
}

impl RoutingOutcome {
    fn routed(response: Option<RoutedResponse>, warning: Option<&BrokerError>) -> Self {
        let (completion_code, reason_code) =
            warning.map_or((completion::OK, reason::NONE), |w| (w.completion, w.reason));
        Self {
            status: RoutingStatus::Routed,
            completion_code,
            reason_code,
            response,
            error: None,
        }
    }

    fn failure(status: RoutingStatus, err: &ConnectorError) -> Self {
        let (completion_code, reason_code) = err.codes();
        Self {
            status,
            completion_code,
            reason_code,
            response: None,
            error: Some(err.to_string()),
        }
    }

    pub fn is_routed(&self) -> bool {
        self.status == RoutingStatus::Routed
    }

    pub fn output_variables(&self) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        vars.insert(COMPLETION_CODE_VARIABLE.to_string(), self.completion_code.to_string());
        vars.insert(REASON_CODE_VARIABLE.to_string(), self.reason_code.to_string());
        vars
    }
}

/// What one exchange produced.
struct Exchanged {
    response: Option<RoutedResponse>,
    warning: Option<BrokerError>,
}

/// Set once a message left or arrived; faults after that are not retried.
#[derive(Default)]
struct Progress {
    transferred: bool,
}

pub struct OutboundRoutingDriver {
    services: Arc<OutboundServices>,
    route: RouteDefinition,
    endpoint: Mutex<Option<Arc<EndpointConfig>>>,
    needs_update: Arc<AtomicBool>,
    watcher: JoinHandle<()>,
}

impl OutboundRoutingDriver {
    /// Create the driver and start following changes to its connector.
    pub fn start(services: Arc<OutboundServices>, route: RouteDefinition) -> Self {
        let needs_update = Arc::new(AtomicBool::new(false));
        let watcher = spawn_watcher(
            services.source.subscribe(),
            route.connector_id.clone(),
            needs_update.clone(),
        );
        Self {
            services,
            route,
            endpoint: Mutex::new(None),
            needs_update,
            watcher,
        }
    }

    pub fn route_definition(&self) -> &RouteDefinition {
        &self.route
    }

    /// Run one exchange.
    pub async fn route(&self, request: &OutboundRequest) -> RoutingOutcome {
        let endpoint = match self.endpoint(request).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!(connector = %self.route.connector_id, error = %e, "Outbound endpoint unusable");
                return RoutingOutcome::failure(RoutingStatus::Failed, &e);
            }
        };

        if matches!(self.route.direction, Direction::Put { .. })
            && exceeds_size_limit(request.size(), endpoint.message_size_limit)
        {
            warn!(
                endpoint = %endpoint.name,
                size = request.size(),
                limit = endpoint.message_size_limit,
                "Outbound request too large"
            );
            return RoutingOutcome {
                status: RoutingStatus::BadRequest,
                completion_code: completion::FAILED,
                reason_code: reason::NONE,
                response: None,
                error: Some(format!(
                    "request of {} bytes exceeds limit of {} bytes",
                    request.size(),
                    endpoint.message_size_limit
                )),
            };
        }

        let settings = &self.services.settings;
        let pressure = &self.services.failure_pressure;
        let mut attempts = 0;
        let mut counted = false;

        let outcome = loop {
            attempts += 1;
            let mut progress = Progress::default();

            let err = match self.exchange(&endpoint, request, &mut progress).await {
                Ok(done) => break RoutingOutcome::routed(done.response, done.warning.as_ref()),
                Err(e) => e,
            };

            match err.kind() {
                FaultKind::Transport if !progress.transferred => {
                    if !counted {
                        pressure.increment();
                        counted = true;
                    }
                    self.services.resources.invalidate(&endpoint.key);

                    if pressure.current() >= settings.failure_threshold {
                        warn!(
                            endpoint = %endpoint.name,
                            pressure = pressure.current(),
                            error = %err,
                            "Broker unavailable, short-circuiting"
                        );
                        metrics::counter!("mqbridge_outbound_short_circuits_total").increment(1);
                        break RoutingOutcome::failure(RoutingStatus::Falsified, &err);
                    }
                    if attempts >= settings.max_attempts {
                        error!(endpoint = %endpoint.name, attempts, error = %err, "Outbound retries exhausted");
                        break RoutingOutcome::failure(RoutingStatus::ServerError, &err);
                    }

                    warn!(endpoint = %endpoint.name, attempt = attempts, error = %err, "Outbound attempt failed, retrying");
                    metrics::counter!("mqbridge_outbound_retries_total").increment(1);
                    tokio::time::sleep(settings.retry_delay()).await;
                }
                FaultKind::Transport => {
                    self.services.resources.invalidate(&endpoint.key);
                    error!(endpoint = %endpoint.name, error = %err, "Outbound fault after transfer, not retrying");
                    break RoutingOutcome::failure(RoutingStatus::ServerError, &err);
                }
                FaultKind::Configuration | FaultKind::Protocol => {
                    warn!(endpoint = %endpoint.name, error = %err, "Outbound exchange failed");
                    break RoutingOutcome::failure(RoutingStatus::Failed, &err);
                }
                FaultKind::ResourceExhaustion | FaultKind::Interruption => {
                    break RoutingOutcome::failure(RoutingStatus::ServerError, &err);
                }
            }
        };

        if counted {
            pressure.decrement();
        }

        let status = format!("{:?}", outcome.status);
        metrics::counter!("mqbridge_outbound_requests_total", "status" => status).increment(1);
        outcome
    }

    /// The connector's endpoint, rebuilt after a change, with per-request
    /// queue names applied. Per-request endpoints are never cached.
    async fn endpoint(&self, request: &OutboundRequest) -> Result<Arc<EndpointConfig>> {
        let base = {
            let mut cached = self.endpoint.lock().await;
            if self.needs_update.swap(false, Ordering::SeqCst) {
                *cached = None;
            }
            match cached.as_ref() {
                Some(endpoint) => endpoint.clone(),
                None => {
                    let endpoint = Arc::new(self.load_endpoint().await?);
                    debug_assert!(!endpoint.dynamic, "per-request endpoints are not cached");
                    debug!(key = %endpoint.key, "Built outbound endpoint");
                    *cached = Some(endpoint.clone());
                    endpoint
                }
            }
        };

        if !self.route.has_queue_overrides() {
            return Ok(base);
        }

        let expand = |template: &Option<String>| {
            template
                .as_deref()
                .map(|t| expand_template(t, &request.variables))
                .transpose()
        };
        let dynamic = DynamicProperties {
            queue_name: expand(&self.route.queue_template)?,
            reply_queue_name: expand(&self.route.reply_queue_template)?,
        };
        Ok(Arc::new(base.as_ref().clone().with_dynamic(&dynamic)?))
    }

    async fn load_endpoint(&self) -> Result<EndpointConfig> {
        let definition = self
            .services
            .source
            .find_connector(&self.route.connector_id)
            .await?
            .ok_or_else(|| {
                ConnectorError::Config(format!("connector '{}' not found", self.route.connector_id))
            })?;
        if !definition.enabled {
            return Err(ConnectorError::Config(format!(
                "connector '{}' is disabled",
                definition.display_name()
            )));
        }

        EndpointConfig::resolve(
            &definition,
            self.services.credentials.as_ref(),
            self.services.properties.as_ref(),
            &self.services.settings,
        )
        .await
    }

    async fn exchange(
        &self,
        endpoint: &EndpointConfig,
        request: &OutboundRequest,
        progress: &mut Progress,
    ) -> Result<Exchanged> {
        let lease = self.services.resources.acquire(endpoint).await?;
        let session = lease.session();

        match self.route.direction {
            Direction::Put { reply_expected } => {
                self.put_exchange(session, endpoint, request, reply_expected, progress)
                    .await
            }
            Direction::Get => self.get_exchange(session, endpoint, progress).await,
        }
    }

    async fn put_exchange(
        &self,
        session: &dyn QueueManagerSession,
        endpoint: &EndpointConfig,
        request: &OutboundRequest,
        reply_expected: bool,
        progress: &mut Progress,
    ) -> Result<Exchanged> {
        let reply_mode = if reply_expected {
            endpoint.reply_mode
        } else {
            ReplyMode::None
        };

        let target = ScopedQueue::new(
            session
                .open_queue(&endpoint.queue_name, OpenOptions::output())
                .await?,
        );
        let reply_queue = self.open_reply_queue(session, endpoint, reply_mode).await?;

        let mut message = BrokerMessage::default();
        merge_header_payload(&mut message, request.header.as_deref(), &request.payload)?;
        if request.header.is_none() {
            message.format = format::STRING.to_string();
        }
        apply_overrides(&mut message, &endpoint.message_overrides)?;
        apply_overrides(&mut message, &self.route.message_overrides)?;
        apply_overrides(&mut message, &request.overrides)?;
        if let Some(reply_queue) = &reply_queue {
            message.reply_to_queue = reply_queue.name().to_string();
            message.reply_to_queue_manager = session.queue_manager_name().to_string();
        }

        let syncpoint = endpoint.is_transactional() && reply_queue.is_none();
        let options = PutOptions {
            syncpoint,
            new_message_id: true,
            new_correlation_id: endpoint.copy_correlation_id && reply_mode == ReplyMode::SpecifiedQueue,
        };

        let warning = match target.put(&mut message, &options).await {
            Ok(()) => None,
            Err(e) if e.is_warning() => Some(e),
            Err(e) => {
                if syncpoint {
                    backout(session, &endpoint.name).await;
                }
                return Err(e.into());
            }
        };
        progress.transferred = true;
        debug!(endpoint = %endpoint.name, message_id = %message.message_id_hex(), "Request sent");

        if syncpoint {
            commit(session, &endpoint.name).await;
        }

        let Some(reply_queue) = reply_queue else {
            return Ok(Exchanged {
                response: None,
                warning,
            });
        };

        let selector = match reply_mode {
            ReplyMode::Automatic => None,
            _ if endpoint.copy_correlation_id => Some(message.correlation_id),
            _ => Some(message.message_id),
        };
        let timeout = self.response_timeout();
        let options = GetOptions {
            wait: Some(timeout),
            match_correlation_id: selector,
            ..Default::default()
        };

        let reply = match reply_queue.get(&options).await {
            Ok(reply) => reply,
            Err(e) if e.is_no_message() => return Err(ConnectorError::NoResponse(timeout)),
            Err(e) => return Err(e.into()),
        };

        self.check_size(&reply)?;
        let split = split_header_payload(&reply)?;
        Ok(Exchanged {
            response: Some(RoutedResponse {
                header: split.header,
                payload: split.payload,
                message: reply,
            }),
            warning,
        })
    }

    async fn open_reply_queue(
        &self,
        session: &dyn QueueManagerSession,
        endpoint: &EndpointConfig,
        reply_mode: ReplyMode,
    ) -> Result<Option<ScopedQueue>> {
        match reply_mode {
            ReplyMode::None => Ok(None),
            ReplyMode::Automatic => {
                let model = endpoint.reply_model_queue();
                let queue = ScopedQueue::new(
                    session
                        .open_model_queue(model, &format!("{}.*", model), OpenOptions::input())
                        .await?,
                );
                if queue.definition_type() == QueueDefinitionType::Predefined {
                    return Err(ConnectorError::Config(format!(
                        "reply model queue '{}' is not a model queue",
                        model
                    )));
                }
                Ok(Some(queue))
            }
            ReplyMode::SpecifiedQueue => {
                let name = endpoint.reply_queue_name.as_deref().ok_or_else(|| {
                    ConnectorError::Config(format!("connector '{}' has no reply queue", endpoint.name))
                })?;
                Ok(Some(ScopedQueue::new(
                    session.open_queue(name, OpenOptions::input()).await?,
                )))
            }
        }
    }

    async fn get_exchange(
        &self,
        session: &dyn QueueManagerSession,
        endpoint: &EndpointConfig,
        progress: &mut Progress,
    ) -> Result<Exchanged> {
        let queue = ScopedQueue::new(
            session
                .open_queue(&endpoint.queue_name, OpenOptions::input())
                .await?,
        );
        let transactional = endpoint.is_transactional();
        let timeout = self.response_timeout();
        let options = GetOptions {
            wait: Some(timeout),
            syncpoint: transactional,
            ..Default::default()
        };

        let message = match queue.get(&options).await {
            Ok(message) => message,
            Err(e) if e.is_no_message() => return Err(ConnectorError::NoResponse(timeout)),
            Err(e) => return Err(e.into()),
        };
        progress.transferred = true;

        let checked = self
            .check_size(&message)
            .and_then(|()| split_header_payload(&message).map_err(ConnectorError::from));

        match checked {
            Ok(split) => {
                if transactional {
                    commit(session, &endpoint.name).await;
                }
                Ok(Exchanged {
                    response: Some(RoutedResponse {
                        header: split.header,
                        payload: split.payload,
                        message,
                    }),
                    warning: None,
                })
            }
            Err(e) => {
                if transactional {
                    let posted = post_to_failure_queue(session, endpoint, &message).await;
                    if posted {
                        commit(session, &endpoint.name).await;
                    } else {
                        backout(session, &endpoint.name).await;
                    }
                }
                Err(e)
            }
        }
    }

    fn response_timeout(&self) -> Duration {
        self.route
            .response_timeout
            .unwrap_or_else(|| self.services.settings.response_timeout())
    }

    fn check_size(&self, message: &BrokerMessage) -> Result<()> {
        let limit = match self.route.response_size_limit {
            Some(limit) if limit >= 0 => limit,
            _ => self.services.settings.max_message_bytes,
        }
        .max(0) as usize;

        let size = message.total_length();
        if exceeds_size_limit(size, limit) {
            return Err(ConnectorError::ResponseTooLarge { size, limit });
        }
        Ok(())
    }
}

impl Drop for OutboundRoutingDriver {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

fn spawn_watcher(
    mut changes: broadcast::Receiver<ConfigChange>,
    connector_id: String,
    needs_update: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(ConfigChange::Property { name }) if name.starts_with(property::POOL_PREFIX) => {
                    needs_update.store(true, Ordering::SeqCst);
                }
                Ok(change) if change.affects_connector(&connector_id) => {
                    info!(connector = %connector_id, "Connector changed, outbound endpoint will be rebuilt");
                    needs_update.store(true, Ordering::SeqCst);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    needs_update.store(true, Ordering::SeqCst);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

async fn commit(session: &dyn QueueManagerSession, endpoint: &str) {
    if let Err(e) = session.commit().await {
        error!(endpoint, error = %e, "Commit failed");
    }
}

async fn backout(session: &dyn QueueManagerSession, endpoint: &str) {
    if let Err(e) = session.backout().await {
        error!(endpoint, error = %e, "Backout failed");
    }
}

async fn post_to_failure_queue(
    session: &dyn QueueManagerSession,
    endpoint: &EndpointConfig,
    message: &BrokerMessage,
) -> bool {
    let Some(name) = endpoint.failure_queue_name.as_deref() else {
        return false;
    };

    let posted: std::result::Result<(), BrokerError> = async {
        let queue = ScopedQueue::new(session.open_queue(name, OpenOptions::output()).await?);
        let mut message = message.clone();
        let options = PutOptions {
            syncpoint: true,
            ..Default::default()
        };
        match queue.put(&mut message, &options).await {
            Err(e) if !e.is_warning() => Err(e),
            _ => Ok(()),
        }
    }
    .await;

    match posted {
        Ok(()) => true,
        Err(e) => {
            error!(endpoint = %endpoint.name, queue = name, error = %e, "Failed to post to failure queue");
            false
        }
    }
}
