//! Inbound Module - owns the listeners of every inbound connector
//!
//! Provides:
//! - Listener lifecycle per connector, bounded by a module-wide ceiling
//! - Restart on connector change, stop on removal or disable
//! - Message handling on the shared worker pool: process, reply, and
//!   settle the unit of work according to the acknowledgement mode

use async_trait::async_trait;
use futures::future::join_all;
use mqb_broker::framing::{apply_overrides, merge_header_payload, split_header_payload};
use mqb_broker::message::format;
use mqb_broker::{reason, BrokerConnector, BrokerError, BrokerMessage, OpenOptions, PutOptions};
use mqb_common::{ConfigChange, ConnectorDefinition, ReplyMode};
use mqb_config::{ListenerSettings, RoutingSettings};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::audit::AuditSink;
use crate::client::{ReconnectingClient, ScopedQueue};
use crate::dispatch::WorkerPool;
use crate::endpoint::{exceeds_size_limit, EndpointConfig};
use crate::listener::{Listener, ListenerConfig, MessageHandler, JOIN_TIMEOUT};
use crate::processor::{
    fault_payload, InboundRequest, MessageProcessor, ProcessedResponse, ProcessingResult,
    ProcessingStatus,
};
use crate::source::{ClusterProperties, ConnectorSource, CredentialStore};
use crate::{ConnectorError, Result};

/// Collaborators the inbound module is built from.
#[derive(Clone)]
pub struct InboundServices {
    pub connector: Arc<dyn BrokerConnector>,
    pub source: Arc<dyn ConnectorSource>,
    pub credentials: Arc<dyn CredentialStore>,
    pub properties: Arc<dyn ClusterProperties>,
    pub processor: Arc<dyn MessageProcessor>,
    pub audit: Arc<dyn AuditSink>,
}

pub struct InboundModule {
    services: InboundServices,
    listener_settings: ListenerSettings,
    routing: RoutingSettings,
    pool: Arc<WorkerPool>,
    listeners: Mutex<HashMap<String, Vec<Listener>>>,
    stopped: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    events: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl InboundModule {
    pub fn new(services: InboundServices, listener_settings: ListenerSettings, routing: RoutingSettings) -> Self {
        let pool = Arc::new(WorkerPool::new("inbound", listener_settings.worker_pool_size));
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            services,
            listener_settings,
            routing,
            pool,
            listeners: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
            shutdown_tx,
            events: parking_lot::Mutex::new(None),
        }
    }

    /// Start listeners for every inbound connector and follow changes.
    /// Returns the number of listeners started.
    pub async fn start(self: &Arc<Self>) -> Result<usize> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ConnectorError::ListenerStart("inbound module was stopped".to_string()));
        }

        // Subscribe before loading so no change slips between the two.
        let changes = self.services.source.subscribe();

        let mut started = 0;
        for definition in self.services.source.find_connectors().await? {
            if !definition.wants_listeners() {
                continue;
            }
            match self.start_connector(&definition).await {
                Ok(count) => started += count,
                Err(e) => error!(connector = %definition.id, error = %e, "Failed to start listeners"),
            }
        }

        self.spawn_event_loop(changes);
        info!(listeners = started, "Inbound module started");
        Ok(started)
    }

    fn spawn_event_loop(self: &Arc<Self>, mut changes: broadcast::Receiver<ConfigChange>) {
        let mut guard = self.events.lock();
        if guard.is_some() {
            return;
        }

        let module = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        *guard = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    change = changes.recv() => {
                        match change {
                            Ok(ConfigChange::Connector { ids }) => {
                                for id in ids {
                                    module.refresh_connector(&id).await;
                                }
                            }
                            Ok(ConfigChange::Property { .. }) => {}
                            Err(broadcast::error::RecvError::Lagged(missed)) => {
                                warn!(missed, "Missed config changes, refreshing all inbound connectors");
                                module.refresh_all().await;
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            debug!("Inbound change loop stopped");
        }));
    }

    /// Start listeners for one connector. A connector that already has
    /// listeners is left alone.
    pub async fn start_connector(&self, definition: &ConnectorDefinition) -> Result<usize> {
        let endpoint = Arc::new(
            EndpointConfig::resolve(
                definition,
                self.services.credentials.as_ref(),
                self.services.properties.as_ref(),
                &self.routing,
            )
            .await?,
        );

        let mut listeners = self.listeners.lock().await;
        if listeners.contains_key(&definition.id) {
            return Ok(0);
        }

        let running: usize = listeners.values().map(Vec::len).sum();
        let remaining = (self.listener_settings.max_listeners as usize).saturating_sub(running);
        let wanted = definition.concurrent_listeners.max(1) as usize;
        let count = wanted.min(remaining);
        if count < wanted {
            warn!(
                connector = %endpoint.name,
                wanted,
                count,
                max_listeners = self.listener_settings.max_listeners,
                "Listener ceiling reached, starting fewer listeners"
            );
        }
        if count == 0 {
            return Ok(0);
        }

        let handler: Arc<dyn MessageHandler> = Arc::new(InboundHandler {
            endpoint: endpoint.clone(),
            processor: self.services.processor.clone(),
            pool: self.pool.clone(),
        });
        let config = ListenerConfig::from(&self.listener_settings);

        let mut started = Vec::with_capacity(count);
        for index in 0..count {
            let client = Arc::new(ReconnectingClient::new(
                endpoint.clone(),
                self.services.connector.clone(),
                self.services.audit.clone(),
            ));
            let listener = Listener::new(
                format!("mq-listener[{}#{}]", endpoint.name, index + 1),
                client,
                handler.clone(),
                self.services.audit.clone(),
                config.clone(),
            );
            if let Err(e) = listener.start() {
                join_all(started.iter().map(Listener::ensure_stopped)).await;
                return Err(e);
            }
            started.push(listener);
        }

        info!(connector = %endpoint.name, listeners = count, queue = %endpoint.queue_name, "Started inbound listeners");
        metrics::gauge!("mqbridge_inbound_listeners").set((running + count) as f64);
        listeners.insert(definition.id.clone(), started);
        Ok(count)
    }

    /// Stop and join every listener of one connector.
    pub async fn stop_connector(&self, connector_id: &str) -> usize {
        let removed = self.listeners.lock().await.remove(connector_id);
        let Some(removed) = removed else {
            return 0;
        };

        join_all(removed.iter().map(Listener::ensure_stopped)).await;
        info!(connector = %connector_id, listeners = removed.len(), "Stopped inbound listeners");
        removed.len()
    }

    /// Rebuild a connector's listeners from its current definition.
    pub async fn refresh_connector(&self, connector_id: &str) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        self.stop_connector(connector_id).await;

        match self.services.source.find_connector(connector_id).await {
            Ok(Some(definition)) if definition.wants_listeners() => {
                if let Err(e) = self.start_connector(&definition).await {
                    error!(connector = %connector_id, error = %e, "Failed to restart listeners");
                }
            }
            Ok(_) => debug!(connector = %connector_id, "Connector removed or not inbound"),
            Err(e) => error!(connector = %connector_id, error = %e, "Failed to load connector"),
        }
    }

    async fn refresh_all(&self) {
        let mut ids: Vec<String> = self.listeners.lock().await.keys().cloned().collect();
        match self.services.source.find_connectors().await {
            Ok(definitions) => ids.extend(definitions.into_iter().map(|d| d.id)),
            Err(e) => error!(error = %e, "Failed to load connectors"),
        }
        ids.sort();
        ids.dedup();
        for id in ids {
            self.refresh_connector(&id).await;
        }
    }

    pub async fn listener_count(&self) -> usize {
        self.listeners.lock().await.values().map(Vec::len).sum()
    }

    pub async fn listener_count_for(&self, connector_id: &str) -> usize {
        self.listeners.lock().await.get(connector_id).map_or(0, Vec::len)
    }

    /// Stop every listener, then drain the worker pool.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(());

        let events = self.events.lock().take();
        if let Some(events) = events {
            if tokio::time::timeout(Duration::from_secs(5), events).await.is_err() {
                warn!("Inbound change loop did not stop in time");
            }
        }

        let all: Vec<Listener> = self
            .listeners
            .lock()
            .await
            .drain()
            .flat_map(|(_, listeners)| listeners)
            .collect();
        join_all(all.iter().map(Listener::ensure_stopped)).await;

        self.pool.shutdown(JOIN_TIMEOUT).await;
        metrics::gauge!("mqbridge_inbound_listeners").set(0.0);
        info!(listeners = all.len(), "Inbound module stopped");
    }
}

/// Hands each received message to the worker pool and waits for it.
struct InboundHandler {
    endpoint: Arc<EndpointConfig>,
    processor: Arc<dyn MessageProcessor>,
    pool: Arc<WorkerPool>,
}

#[async_trait]
impl MessageHandler for InboundHandler {
    async fn handle_message(&self, client: Arc<ReconnectingClient>, message: BrokerMessage) -> Result<()> {
        let job = MessageJob {
            endpoint: self.endpoint.clone(),
            processor: self.processor.clone(),
            client: client.clone(),
            message,
        };

        match self.pool.try_submit(job.run()) {
            Ok(handle) => match handle.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Err(ConnectorError::Interrupted),
                Err(e) => Err(ConnectorError::Worker(e.to_string())),
            },
            Err(rejected) => {
                // the receive was under syncpoint, put the message back
                let backout = client
                    .do_work(false, |bag| Box::pin(async move { bag.session().backout().await }))
                    .await;
                if let Err(e) = backout {
                    warn!(endpoint = %self.endpoint.name, error = %e, "Backout after rejected dispatch failed");
                }
                Err(rejected)
            }
        }
    }
}

/// One message's trip through processing, reply and settlement.
struct MessageJob {
    endpoint: Arc<EndpointConfig>,
    processor: Arc<dyn MessageProcessor>,
    client: Arc<ReconnectingClient>,
    message: BrokerMessage,
}

impl MessageJob {
    async fn run(self) -> Result<()> {
        let transactional = self.endpoint.is_transactional();

        // acknowledge on take
        if !transactional {
            self.client
                .do_work(false, |bag| Box::pin(async move { bag.session().commit().await }))
                .await?;
        }

        let result = self.process().await;
        let replied = self.send_response(&result).await;

        let status = match result.status {
            ProcessingStatus::Success => "success",
            ProcessingStatus::Failed => "failed",
        };
        metrics::counter!("mqbridge_messages_processed_total", "status" => status).increment(1);

        if transactional {
            let handled =
                result.status == ProcessingStatus::Success || self.post_to_failure_queue().await;
            if replied && handled {
                self.settle(true).await;
            } else {
                self.settle(false).await;
            }
        }
        Ok(())
    }

    async fn process(&self) -> ProcessingResult {
        let split = match split_header_payload(&self.message) {
            Ok(split) => split,
            Err(e) => {
                warn!(endpoint = %self.endpoint.name, error = %e, "Malformed message framing");
                return fault("Client", &format!("Malformed message: {}", e));
            }
        };

        if exceeds_size_limit(split.payload.len(), self.endpoint.message_size_limit) {
            warn!(
                endpoint = %self.endpoint.name,
                size = split.payload.len(),
                limit = self.endpoint.message_size_limit,
                "Rejecting oversized message"
            );
            return fault("Client", "Message too large");
        }

        let request = InboundRequest {
            connector_id: self.endpoint.connector_id.clone(),
            connector_name: self.endpoint.name.clone(),
            content_type: self.endpoint.content_type.clone(),
            header: split.header,
            payload: split.payload,
            message: self.message.clone(),
            reply_expected: self.endpoint.reply_mode != ReplyMode::None,
        };

        match self.processor.process(request).await {
            Ok(result) if result.status == ProcessingStatus::Failed && result.response.is_none() => {
                fault("Server", "Message processing failed")
            }
            Ok(result) => result,
            Err(e) => {
                warn!(endpoint = %self.endpoint.name, error = %e, "Message processing fault");
                fault("Server", &e.0)
            }
        }
    }

    /// Returns false only when a required reply could not be sent.
    async fn send_response(&self, result: &ProcessingResult) -> bool {
        if self.endpoint.reply_mode == ReplyMode::None {
            return true;
        }
        let Some(response) = &result.response else {
            return true;
        };

        let reply = match self.build_reply(response) {
            Ok(reply) => reply,
            Err(e) => {
                error!(endpoint = %self.endpoint.name, error = %e, "Failed to frame reply");
                return self.endpoint.reply_mode != ReplyMode::SpecifiedQueue;
            }
        };

        let transactional = self.endpoint.is_transactional();
        let options = PutOptions {
            syncpoint: transactional,
            new_message_id: true,
            new_correlation_id: false,
        };

        match self.endpoint.reply_mode {
            ReplyMode::None => true,
            ReplyMode::Automatic => {
                let Some(reply_to) = self.message.reply_to().map(str::to_string) else {
                    warn!(endpoint = %self.endpoint.name, message_id = %self.message.message_id_hex(), "No reply-to queue on request, reply dropped");
                    return true;
                };
                let mut reply = reply;
                let sent = self
                    .client
                    .do_work(!transactional, move |bag| {
                        Box::pin(async move {
                            let queue = ScopedQueue::new(
                                bag.session().open_queue(&reply_to, OpenOptions::output()).await?,
                            );
                            queue.put(&mut reply, &options).await
                        })
                    })
                    .await;
                if let Err(e) = sent {
                    if !warning_only(&e) {
                        error!(endpoint = %self.endpoint.name, error = %e, "Failed to send reply");
                    }
                }
                true
            }
            ReplyMode::SpecifiedQueue => {
                let mut reply = reply;
                let sent = self
                    .client
                    .do_work(!transactional, move |bag| {
                        Box::pin(async move {
                            match bag.reply() {
                                Some(queue) => queue.put(&mut reply, &options).await,
                                None => Err(BrokerError::failed(
                                    reason::UNKNOWN_OBJECT_NAME,
                                    "reply queue is not open",
                                )),
                            }
                        })
                    })
                    .await;
                match sent {
                    Ok(()) => true,
                    Err(e) if warning_only(&e) => true,
                    Err(e) => {
                        error!(endpoint = %self.endpoint.name, error = %e, "Failed to send reply");
                        false
                    }
                }
            }
        }
    }

    fn build_reply(&self, response: &ProcessedResponse) -> Result<BrokerMessage> {
        let mut reply = BrokerMessage::default();
        merge_header_payload(&mut reply, response.header.as_deref(), &response.payload)?;
        if response.header.is_none() {
            reply.format = format::STRING.to_string();
        }
        reply.correlation_id = if self.endpoint.copy_correlation_id {
            self.message.correlation_id
        } else {
            self.message.message_id
        };
        apply_overrides(&mut reply, &self.endpoint.message_overrides)?;
        apply_overrides(&mut reply, &response.overrides)?;
        Ok(reply)
    }

    /// Put the request on the failure queue under syncpoint.
    async fn post_to_failure_queue(&self) -> bool {
        let Some(failure_queue) = self.endpoint.failure_queue_name.clone() else {
            return false;
        };

        let mut message = self.message.clone();
        let options = PutOptions {
            syncpoint: true,
            ..Default::default()
        };
        let queue_name = failure_queue.clone();
        let posted = self
            .client
            .do_work(false, move |bag| {
                Box::pin(async move {
                    let queue = ScopedQueue::new(
                        bag.session().open_queue(&queue_name, OpenOptions::output()).await?,
                    );
                    queue.put(&mut message, &options).await
                })
            })
            .await;

        match posted {
            Ok(()) => true,
            Err(e) if warning_only(&e) => true,
            Err(e) => {
                error!(endpoint = %self.endpoint.name, queue = %failure_queue, error = %e, "Failed to post to failure queue");
                false
            }
        }
    }

    async fn settle(&self, commit: bool) {
        let outcome = self
            .client
            .do_work(false, move |bag| {
                Box::pin(async move {
                    if commit {
                        bag.session().commit().await
                    } else {
                        bag.session().backout().await
                    }
                })
            })
            .await;

        match outcome {
            Ok(()) if commit => debug!(endpoint = %self.endpoint.name, "Committed message"),
            Ok(()) => info!(endpoint = %self.endpoint.name, message_id = %self.message.message_id_hex(), "Backed out message"),
            Err(e) => error!(endpoint = %self.endpoint.name, commit, error = %e, "Failed to settle unit of work"),
        }
    }
}

fn fault(code: &str, reason: &str) -> ProcessingResult {
    ProcessingResult::failed(Some(ProcessedResponse::new(fault_payload(code, reason))))
}

fn warning_only(err: &ConnectorError) -> bool {
    err.broker_error().map_or(false, BrokerError::is_warning)
}
