//! Long-lived broker connection for an inbound listener.
//!
//! A [`ReconnectingClient`] owns at most one [`ClientBag`]: the session plus
//! the opened target queue and, when configured, the reply queue. Work runs
//! through [`ReconnectingClient::do_work`], which checks liveness first and
//! either reconnects or fails, so a callback never sees a half-open bag.

use futures::future::BoxFuture;
use mqb_broker::{BrokerConnector, BrokerError, BrokerQueue, OpenOptions, QueueManagerSession};
use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::audit::{AuditSink, ConnectionNotifier};
use crate::endpoint::EndpointConfig;
use crate::{ConnectorError, Result};

/// An opened queue handle that closes itself when dropped.
pub struct ScopedQueue(Box<dyn BrokerQueue>);

impl ScopedQueue {
    pub fn new(queue: Box<dyn BrokerQueue>) -> Self {
        Self(queue)
    }
}

impl Deref for ScopedQueue {
    type Target = dyn BrokerQueue;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Drop for ScopedQueue {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// One broker session with its opened queues.
pub struct ClientBag {
    session: Box<dyn QueueManagerSession>,
    target: ScopedQueue,
    reply: Option<ScopedQueue>,
}

impl ClientBag {
    pub fn session(&self) -> &dyn QueueManagerSession {
        self.session.as_ref()
    }

    pub fn target(&self) -> &dyn BrokerQueue {
        &*self.target
    }

    /// The configured reply queue, when one was opened.
    pub fn reply(&self) -> Option<&dyn BrokerQueue> {
        self.reply.as_deref()
    }

    fn is_live(&self) -> bool {
        self.session.is_connected()
    }

    /// Close queues, then the session.
    fn close(self) {
        let ClientBag {
            session,
            target,
            reply,
        } = self;
        drop(reply);
        drop(target);
        session.disconnect();
    }
}

pub struct ReconnectingClient {
    endpoint: Arc<EndpointConfig>,
    connector: Arc<dyn BrokerConnector>,
    bag: Mutex<Option<ClientBag>>,
    notifier: ConnectionNotifier,
}

impl ReconnectingClient {
    pub fn new(
        endpoint: Arc<EndpointConfig>,
        connector: Arc<dyn BrokerConnector>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let notifier = ConnectionNotifier::new(format!("mq-client[{}]", endpoint.name), audit);
        Self {
            endpoint,
            connector,
            bag: Mutex::new(None),
            notifier,
        }
    }

    pub fn endpoint(&self) -> &Arc<EndpointConfig> {
        &self.endpoint
    }

    /// Run `work` against a live bag.
    ///
    /// A missing or dead bag is closed and, if `reconnect_allowed`, replaced
    /// before `work` runs; otherwise the call fails with `ConnectionLost`.
    /// The bag stays locked while `work` runs.
    pub async fn do_work<T, F>(&self, reconnect_allowed: bool, work: F) -> Result<T>
    where
        T: Send,
        F: for<'b> FnOnce(&'b ClientBag) -> BoxFuture<'b, mqb_broker::Result<T>> + Send,
    {
        let mut guard = self.bag.lock().await;

        if !guard.as_ref().map_or(false, ClientBag::is_live) {
            if let Some(stale) = guard.take() {
                debug!(endpoint = %self.endpoint.name, "Discarding stale connection");
                stale.close();
            }
            if !reconnect_allowed {
                return Err(ConnectorError::ConnectionLost);
            }
            *guard = Some(self.connect().await?);
        }

        match guard.as_ref() {
            Some(bag) => work(bag).await.map_err(ConnectorError::from),
            None => Err(ConnectorError::ConnectionLost),
        }
    }

    /// Tear down the held connection, if any.
    pub async fn close(&self) {
        if let Some(bag) = self.bag.lock().await.take() {
            bag.close();
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.bag.lock().await.as_ref().map_or(false, ClientBag::is_live)
    }

    async fn connect(&self) -> Result<ClientBag> {
        let target_desc = self.endpoint.target_description();

        match self.open_bag().await {
            Ok(bag) => {
                info!(endpoint = %self.endpoint.name, target = %target_desc, "Connected to queue manager");
                self.notifier.connected(&target_desc);
                Ok(bag)
            }
            Err(e) => {
                self.notifier.connection_error(&target_desc, &e);
                Err(ConnectorError::ConnectionUnavailable(e))
            }
        }
    }

    /// Open session, target and reply queue; anything opened is closed on failure.
    async fn open_bag(&self) -> std::result::Result<ClientBag, BrokerError> {
        let session = self.connector.connect(&self.endpoint.connect).await?;

        let target = match session
            .open_queue(&self.endpoint.queue_name, OpenOptions::input())
            .await
        {
            Ok(queue) => ScopedQueue::new(queue),
            Err(e) => {
                session.disconnect();
                return Err(e);
            }
        };

        let reply = match &self.endpoint.reply_queue_name {
            Some(name) => match session.open_queue(name, OpenOptions::output()).await {
                Ok(queue) => Some(ScopedQueue::new(queue)),
                Err(e) => {
                    drop(target);
                    session.disconnect();
                    return Err(e);
                }
            },
            None => None,
        };

        Ok(ClientBag {
            session,
            target,
            reply,
        })
    }
}

impl Drop for ReconnectingClient {
    fn drop(&mut self) {
        if let Some(bag) = self.bag.get_mut().take() {
            bag.close();
        }
    }
}
