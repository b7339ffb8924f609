//! In-memory queue manager.
//!
//! Implements the broker surface without a network:
//! - predefined and model queues, with temporary dynamic queues created
//!   from models and deleted when their handle closes
//! - one unit of work per session (syncpoint puts become visible on
//!   commit, syncpoint gets return to the head of their queue on backout)
//! - timed gets that wake on put and commit
//! - fault injection for connects, puts and gets
//!
//! Used by the dev binary and throughout the connector tests.

use crate::error::{completion, reason};
use crate::message::{generate_id, BrokerMessage, ID_LENGTH};
use crate::{
    BrokerConnector, BrokerError, BrokerQueue, ConnectProperties, GetOptions, OpenOptions,
    PutOptions, QueueDefinitionType, QueueManagerSession, Result,
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tracing::debug;

struct QueueState {
    definition: QueueDefinitionType,
    messages: VecDeque<BrokerMessage>,
}

#[derive(Default)]
struct UnitOfWork {
    puts: Vec<(String, BrokerMessage)>,
    gets: Vec<(String, BrokerMessage)>,
}

struct SessionState {
    id: u64,
    connected: AtomicBool,
    unit_of_work: Mutex<UnitOfWork>,
}

struct BrokerState {
    queue_manager_name: String,
    queues: Mutex<HashMap<String, QueueState>>,
    arrivals: Notify,
    sessions: Mutex<Vec<Weak<SessionState>>>,
    available: AtomicBool,
    fail_connects: AtomicU32,
    fail_puts: AtomicU32,
    fail_gets: AtomicU32,
    warn_puts: AtomicU32,
    connect_attempts: AtomicU32,
    connects: AtomicU32,
    sequence: AtomicU64,
}

/// Shared handle to an in-memory queue manager. Clones refer to the same broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

fn take_fault(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn matches(message: &BrokerMessage, options: &GetOptions) -> bool {
    options
        .match_message_id
        .map_or(true, |id| message.message_id == id)
        && options
            .match_correlation_id
            .map_or(true, |id| message.correlation_id == id)
}

impl InMemoryBroker {
    pub fn new(queue_manager_name: impl Into<String>) -> Self {
        Self {
            state: Arc::new(BrokerState {
                queue_manager_name: queue_manager_name.into(),
                queues: Mutex::new(HashMap::new()),
                arrivals: Notify::new(),
                sessions: Mutex::new(Vec::new()),
                available: AtomicBool::new(true),
                fail_connects: AtomicU32::new(0),
                fail_puts: AtomicU32::new(0),
                fail_gets: AtomicU32::new(0),
                warn_puts: AtomicU32::new(0),
                connect_attempts: AtomicU32::new(0),
                connects: AtomicU32::new(0),
                sequence: AtomicU64::new(0),
            }),
        }
    }

    pub fn queue_manager_name(&self) -> &str {
        &self.state.queue_manager_name
    }

    pub fn define_queue(&self, name: &str) -> &Self {
        self.define(name, QueueDefinitionType::Predefined);
        self
    }

    pub fn define_model_queue(&self, name: &str) -> &Self {
        self.define(name, QueueDefinitionType::Model);
        self
    }

    fn define(&self, name: &str, definition: QueueDefinitionType) {
        self.state
            .queues
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| QueueState {
                definition,
                messages: VecDeque::new(),
            });
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.state.queues.lock().contains_key(name)
    }

    /// Put a message outside any session, returning its message id.
    pub fn put_message(&self, queue: &str, mut message: BrokerMessage) -> Result<[u8; ID_LENGTH]> {
        if !message.has_message_id() {
            message.message_id = generate_id();
        }
        message.put_time = Some(Utc::now());
        let id = message.message_id;
        self.state.enqueue(queue, message)?;
        self.state.arrivals.notify_waiters();
        Ok(id)
    }

    /// Take the next message outside any session, waiting up to `wait`.
    pub async fn receive(&self, queue: &str, wait: std::time::Duration) -> Option<BrokerMessage> {
        let options = GetOptions {
            wait: Some(wait),
            ..Default::default()
        };
        self.state.get_wait(queue, &options, None).await.ok()
    }

    pub fn depth(&self, queue: &str) -> usize {
        self.state
            .queues
            .lock()
            .get(queue)
            .map_or(0, |q| q.messages.len())
    }

    /// Copies of the committed messages on a queue, head first.
    pub fn browse(&self, queue: &str) -> Vec<BrokerMessage> {
        self.state
            .queues
            .lock()
            .get(queue)
            .map(|q| q.messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    /// Sessions successfully created since the broker was built.
    pub fn connect_count(&self) -> u32 {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Sessions still connected and not dropped.
    pub fn active_sessions(&self) -> usize {
        let mut sessions = self.state.sessions.lock();
        sessions.retain(|s| s.strong_count() > 0);
        sessions
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|s| s.connected.load(Ordering::SeqCst))
            .count()
    }

    pub fn set_available(&self, available: bool) {
        self.state.available.store(available, Ordering::SeqCst);
    }

    pub fn fail_next_connects(&self, count: u32) {
        self.state.fail_connects.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_puts(&self, count: u32) {
        self.state.fail_puts.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_gets(&self, count: u32) {
        self.state.fail_gets.store(count, Ordering::SeqCst);
    }

    /// The next puts complete but report a warning completion code.
    pub fn warn_next_puts(&self, count: u32) {
        self.state.warn_puts.store(count, Ordering::SeqCst);
    }

    /// Drop every live session as if the network went away.
    pub fn break_connections(&self) {
        let sessions: Vec<_> = self
            .state
            .sessions
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for session in sessions {
            self.state.end_session(&session);
        }
    }
}

impl BrokerState {
    fn enqueue(&self, queue: &str, message: BrokerMessage) -> Result<()> {
        let mut queues = self.queues.lock();
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| unknown_object(queue))?;
        state.messages.push_back(message);
        Ok(())
    }

    async fn get_wait(
        &self,
        queue: &str,
        options: &GetOptions,
        session: Option<&SessionState>,
    ) -> Result<BrokerMessage> {
        let deadline = options.wait.map(|w| tokio::time::Instant::now() + w);

        loop {
            let notified = self.arrivals.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(session) = session {
                if !session.connected.load(Ordering::SeqCst) {
                    return Err(BrokerError::connection_broken());
                }
            }

            let taken = {
                let mut queues = self.queues.lock();
                let state = queues
                    .get_mut(queue)
                    .ok_or_else(|| unknown_object(queue))?;
                state
                    .messages
                    .iter()
                    .position(|m| matches(m, options))
                    .and_then(|idx| state.messages.remove(idx))
            };

            if let Some(message) = taken {
                if let (Some(session), true) = (session, options.syncpoint) {
                    session
                        .unit_of_work
                        .lock()
                        .gets
                        .push((queue.to_string(), message.clone()));
                }
                return Ok(message);
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(BrokerError::no_message());
                    }
                }
                None => return Err(BrokerError::no_message()),
            }
        }
    }

    fn commit(&self, session: &SessionState) {
        let work = std::mem::take(&mut *session.unit_of_work.lock());
        {
            let mut queues = self.queues.lock();
            for (queue, message) in work.puts {
                if let Some(state) = queues.get_mut(&queue) {
                    state.messages.push_back(message);
                }
            }
        }
        self.arrivals.notify_waiters();
    }

    fn backout(&self, session: &SessionState) {
        let work = std::mem::take(&mut *session.unit_of_work.lock());
        {
            let mut queues = self.queues.lock();
            for (queue, mut message) in work.gets.into_iter().rev() {
                if let Some(state) = queues.get_mut(&queue) {
                    message.backout_count += 1;
                    state.messages.push_front(message);
                }
            }
        }
        self.arrivals.notify_waiters();
    }

    /// Broken or closed sessions back out whatever they had in flight.
    fn end_session(&self, session: &SessionState) {
        if session.connected.swap(false, Ordering::SeqCst) {
            debug!(session = session.id, "In-memory session ended");
            self.backout(session);
        }
    }
}

fn unknown_object(name: &str) -> BrokerError {
    BrokerError::failed(reason::UNKNOWN_OBJECT_NAME, format!("unknown object name '{}'", name))
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    async fn connect(&self, properties: &ConnectProperties) -> Result<Box<dyn QueueManagerSession>> {
        self.state.connect_attempts.fetch_add(1, Ordering::SeqCst);

        if !self.state.available.load(Ordering::SeqCst) || take_fault(&self.state.fail_connects) {
            return Err(BrokerError::unavailable());
        }
        if !properties.queue_manager_name.is_empty()
            && properties.queue_manager_name != self.state.queue_manager_name
        {
            return Err(BrokerError::failed(
                reason::Q_MGR_NAME_ERROR,
                format!("queue manager '{}' not known", properties.queue_manager_name),
            ));
        }

        let session = Arc::new(SessionState {
            id: self.state.sequence.fetch_add(1, Ordering::SeqCst),
            connected: AtomicBool::new(true),
            unit_of_work: Mutex::new(UnitOfWork::default()),
        });
        self.state.sessions.lock().push(Arc::downgrade(&session));
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        debug!(session = session.id, connection = %properties.connection_name(), "In-memory session created");

        Ok(Box::new(InMemorySession {
            broker: self.state.clone(),
            session,
        }))
    }
}

struct InMemorySession {
    broker: Arc<BrokerState>,
    session: Arc<SessionState>,
}

impl InMemorySession {
    fn ensure_connected(&self) -> Result<()> {
        if self.session.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::connection_broken())
        }
    }

    fn handle(&self, name: String, definition: QueueDefinitionType, options: OpenOptions) -> Box<dyn BrokerQueue> {
        Box::new(InMemoryQueue {
            broker: self.broker.clone(),
            session: self.session.clone(),
            name,
            definition,
            options,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl QueueManagerSession for InMemorySession {
    fn queue_manager_name(&self) -> &str {
        &self.broker.queue_manager_name
    }

    async fn open_queue(&self, name: &str, options: OpenOptions) -> Result<Box<dyn BrokerQueue>> {
        self.ensure_connected()?;
        let definition = self
            .broker
            .queues
            .lock()
            .get(name)
            .map(|q| q.definition)
            .ok_or_else(|| unknown_object(name))?;

        if definition == QueueDefinitionType::Model {
            return self.open_model_queue(name, "AMQ.*", options).await;
        }
        Ok(self.handle(name.to_string(), definition, options))
    }

    async fn open_model_queue(
        &self,
        model: &str,
        dynamic_name: &str,
        options: OpenOptions,
    ) -> Result<Box<dyn BrokerQueue>> {
        self.ensure_connected()?;
        let mut queues = self.broker.queues.lock();
        let definition = queues
            .get(model)
            .map(|q| q.definition)
            .ok_or_else(|| unknown_object(model))?;

        // A non-model name opens that queue and ignores the dynamic name.
        if definition != QueueDefinitionType::Model {
            return Ok(self.handle(model.to_string(), definition, options));
        }

        let suffix = format!("{:016X}", self.broker.sequence.fetch_add(1, Ordering::SeqCst));
        let name = match dynamic_name.strip_suffix('*') {
            Some(prefix) => format!("{}{}", prefix, suffix),
            None => dynamic_name.to_string(),
        };
        queues.insert(
            name.clone(),
            QueueState {
                definition: QueueDefinitionType::TemporaryDynamic,
                messages: VecDeque::new(),
            },
        );
        Ok(self.handle(name, QueueDefinitionType::TemporaryDynamic, options))
    }

    async fn commit(&self) -> Result<()> {
        self.ensure_connected()?;
        self.broker.commit(&self.session);
        Ok(())
    }

    async fn backout(&self) -> Result<()> {
        self.ensure_connected()?;
        self.broker.backout(&self.session);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session.connected.load(Ordering::SeqCst)
    }

    fn disconnect(&self) {
        self.broker.end_session(&self.session);
    }
}

struct InMemoryQueue {
    broker: Arc<BrokerState>,
    session: Arc<SessionState>,
    name: String,
    definition: QueueDefinitionType,
    options: OpenOptions,
    closed: AtomicBool,
}

impl InMemoryQueue {
    fn ensure_usable(&self) -> Result<()> {
        if !self.session.connected.load(Ordering::SeqCst) {
            return Err(BrokerError::connection_broken());
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::failed(reason::HOBJ_ERROR, "queue handle is closed"));
        }
        Ok(())
    }

    fn inject_fault(&self, counter: &AtomicU32) -> Result<()> {
        if take_fault(counter) {
            self.broker.end_session(&self.session);
            return Err(BrokerError::connection_broken());
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerQueue for InMemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn definition_type(&self) -> QueueDefinitionType {
        self.definition
    }

    async fn put(&self, message: &mut BrokerMessage, options: &PutOptions) -> Result<()> {
        self.ensure_usable()?;
        if !self.options.output {
            return Err(BrokerError::failed(reason::NOT_OPEN_FOR_OUTPUT, "queue not open for output"));
        }
        self.inject_fault(&self.broker.fail_puts)?;

        if options.new_message_id || !message.has_message_id() {
            message.message_id = generate_id();
        }
        if options.new_correlation_id {
            message.correlation_id = generate_id();
        }
        message.put_time = Some(Utc::now());

        if options.syncpoint {
            if !self.broker.queues.lock().contains_key(&self.name) {
                return Err(unknown_object(&self.name));
            }
            self.session
                .unit_of_work
                .lock()
                .puts
                .push((self.name.clone(), message.clone()));
        } else {
            self.broker.enqueue(&self.name, message.clone())?;
            self.broker.arrivals.notify_waiters();
        }

        if take_fault(&self.broker.warn_puts) {
            return Err(BrokerError::new(
                completion::WARNING,
                reason::PRIORITY_EXCEEDS_MAXIMUM,
                "message priority exceeds queue maximum",
            ));
        }
        Ok(())
    }

    async fn get(&self, options: &GetOptions) -> Result<BrokerMessage> {
        self.ensure_usable()?;
        if !self.options.input {
            return Err(BrokerError::failed(reason::NOT_OPEN_FOR_INPUT, "queue not open for input"));
        }
        self.inject_fault(&self.broker.fail_gets)?;
        self.broker.get_wait(&self.name, options, Some(&self.session)).await
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.definition == QueueDefinitionType::TemporaryDynamic {
            self.broker.queues.lock().remove(&self.name);
        }
    }
}
