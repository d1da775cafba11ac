//! In-process message broker.
//!
//! Queues deliver each message to one consumer, topics to every live
//! subscriber. Durable subscriptions keep collecting topic messages while
//! no consumer is attached. Delivery to consumers only happens while their
//! connection is started; sends are accepted regardless.
//!
//! Closing a resource twice is a no-op. Any other call on a closed resource
//! (or on a child of a closed resource) fails with `BrokerError::Closed`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashSet;
use tokio::sync::Notify;
use tracing::{debug, info};

use super::{
    AcknowledgeMode, BrokerError, Connection, ConnectionFactory, ConsumerOptions, Destination,
    Message, MessageConsumer, MessageProducer, ReceiveMode, Result, SendOptions, Session,
};

/// Operations whose failure can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailurePoint {
    CreateConnection,
    CreateSession,
    CreateProducer,
    CreateConsumer,
    Send,
    Receive,
    Close,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Broker state
// ============================================================================

#[derive(Default)]
struct Mailbox {
    messages: Mutex<VecDeque<Message>>,
    available: Notify,
}

impl Mailbox {
    fn push(&self, message: Message) {
        lock(&self.messages).push_back(message);
        self.available.notify_one();
    }

    /// Pop the next unexpired message.
    fn take(&self) -> Option<Message> {
        let now = Utc::now();
        let mut messages = lock(&self.messages);
        while let Some(message) = messages.pop_front() {
            if !message.is_expired(now) {
                return Some(message);
            }
            debug!(id = ?message.id, "Dropped expired message");
        }
        None
    }

    fn len(&self) -> usize {
        lock(&self.messages).len()
    }
}

struct Subscriber {
    mailbox: Weak<Mailbox>,
    connection_id: u64,
    no_local: bool,
}

struct DurableSubscription {
    topic: String,
    mailbox: Arc<Mailbox>,
    connection_id: u64,
    no_local: bool,
    active: bool,
}

#[derive(Default)]
struct BrokerState {
    queues: Mutex<HashMap<String, Arc<Mailbox>>>,
    subscribers: Mutex<HashMap<String, Vec<Subscriber>>>,
    durable: Mutex<HashMap<String, DurableSubscription>>,
    credentials: Option<(String, String)>,
    failures: DashSet<FailurePoint>,
    next_connection_id: AtomicU64,
    next_message_id: AtomicU64,
}

impl BrokerState {
    fn check(&self, point: FailurePoint) -> Result<()> {
        if self.failures.contains(&point) {
            return Err(BrokerError::Connection(format!(
                "Injected failure on {point:?}"
            )));
        }
        Ok(())
    }

    fn queue(&self, name: &str) -> Arc<Mailbox> {
        Arc::clone(lock(&self.queues).entry(name.to_string()).or_default())
    }

    fn deliver(&self, destination: &Destination, message: Message, origin: u64) {
        match destination {
            Destination::Queue(name) => self.queue(name).push(message),
            Destination::Topic(name) => {
                let mut targets = Vec::new();
                {
                    let mut subscribers = lock(&self.subscribers);
                    if let Some(list) = subscribers.get_mut(name) {
                        list.retain(|s| s.mailbox.strong_count() > 0);
                        targets.extend(
                            list.iter()
                                .filter(|s| !(s.no_local && s.connection_id == origin))
                                .filter_map(|s| s.mailbox.upgrade()),
                        );
                    }
                }
                targets.extend(
                    lock(&self.durable)
                        .values()
                        .filter(|d| d.topic == *name)
                        .filter(|d| !(d.no_local && d.connection_id == origin))
                        .map(|d| Arc::clone(&d.mailbox)),
                );
                debug!(topic = %name, subscribers = targets.len(), "Publishing to topic");
                for target in targets {
                    target.push(message.clone());
                }
            }
        }
    }
}

// ============================================================================
// Factory
// ============================================================================

/// In-process broker implementing the whole client contract.
///
/// Clones share the same queues and topics.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Broker that only accepts connections carrying these credentials.
    pub fn with_credentials(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            state: Arc::new(BrokerState {
                credentials: Some((username.into(), password.into())),
                ..BrokerState::default()
            }),
        }
    }

    /// Number of messages waiting on a queue.
    pub fn queue_depth(&self, name: &str) -> usize {
        lock(&self.state.queues)
            .get(name)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// Names of the durable subscriptions currently held.
    pub fn durable_subscriptions(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.state.durable).keys().cloned().collect();
        names.sort();
        names
    }

    pub(crate) fn set_failure(&self, point: FailurePoint, fail: bool) {
        if fail {
            self.state.failures.insert(point);
        } else {
            self.state.failures.remove(&point);
        }
    }

    fn open_connection(&self) -> Box<dyn Connection> {
        let id = self.state.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(connection = id, "Opened in-memory connection");
        Box::new(MemoryConnection {
            broker: Arc::clone(&self.state),
            shared: Arc::new(ConnectionShared {
                id,
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                changed: Notify::new(),
            }),
        })
    }
}

#[async_trait]
impl ConnectionFactory for InMemoryBroker {
    async fn create_connection(&self) -> Result<Box<dyn Connection>> {
        self.state.check(FailurePoint::CreateConnection)?;
        if self.state.credentials.is_some() {
            return Err(BrokerError::Connection(
                "Broker requires credentials".to_string(),
            ));
        }
        Ok(self.open_connection())
    }

    async fn create_connection_with_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Box<dyn Connection>> {
        self.state.check(FailurePoint::CreateConnection)?;
        if let Some((user, pass)) = &self.state.credentials {
            if user != username || pass != password {
                return Err(BrokerError::Connection(format!(
                    "Authentication failed for user '{username}'"
                )));
            }
        }
        Ok(self.open_connection())
    }
}

// ============================================================================
// Connection
// ============================================================================

struct ConnectionShared {
    id: u64,
    started: AtomicBool,
    closed: AtomicBool,
    /// Signalled on every start/stop/close inside this connection.
    changed: Notify,
}

impl ConnectionShared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }
}

struct MemoryConnection {
    broker: Arc<BrokerState>,
    shared: Arc<ConnectionShared>,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<()> {
        if self.shared.is_closed() {
            return Err(BrokerError::Closed("Connection"));
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn create_session(
        &self,
        transacted: bool,
        acknowledge_mode: AcknowledgeMode,
    ) -> Result<Box<dyn Session>> {
        self.ensure_open()?;
        self.broker.check(FailurePoint::CreateSession)?;
        Ok(Box::new(MemorySession {
            broker: Arc::clone(&self.broker),
            shared: Arc::new(SessionShared {
                connection: Arc::clone(&self.shared),
                closed: AtomicBool::new(false),
                transacted,
                acknowledge_mode,
                pending: Mutex::new(Vec::new()),
            }),
        }))
    }

    async fn start(&self) -> Result<()> {
        self.ensure_open()?;
        self.shared.started.store(true, Ordering::Release);
        self.shared.changed.notify_waiters();
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.ensure_open()?;
        self.shared.started.store(false, Ordering::Release);
        self.shared.changed.notify_waiters();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.broker.check(FailurePoint::Close)?;
        if !self.shared.closed.swap(true, Ordering::AcqRel) {
            self.shared.started.store(false, Ordering::Release);
            self.shared.changed.notify_waiters();
            info!(connection = self.shared.id, "Closed in-memory connection");
        }
        Ok(())
    }

    fn client_id(&self) -> Option<String> {
        Some(format!("mem-{}", self.shared.id))
    }
}

// ============================================================================
// Session
// ============================================================================

struct SessionShared {
    connection: Arc<ConnectionShared>,
    closed: AtomicBool,
    transacted: bool,
    acknowledge_mode: AcknowledgeMode,
    /// Sends buffered until commit in a transacted session.
    pending: Mutex<Vec<(Destination, Message)>>,
}

impl SessionShared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.connection.is_closed()
    }
}

struct MemorySession {
    broker: Arc<BrokerState>,
    shared: Arc<SessionShared>,
}

impl MemorySession {
    fn ensure_open(&self) -> Result<()> {
        if self.shared.is_closed() {
            return Err(BrokerError::Closed("Session"));
        }
        Ok(())
    }

    fn ensure_transacted(&self, operation: &str) -> Result<()> {
        if !self.shared.transacted {
            return Err(BrokerError::IllegalState(format!(
                "{operation} requires a transacted session"
            )));
        }
        Ok(())
    }

    fn consumer(
        &self,
        destination: Destination,
        mailbox: Arc<Mailbox>,
        options: ConsumerOptions,
        durable: Option<String>,
    ) -> Box<dyn MessageConsumer> {
        Box::new(MemoryConsumer {
            broker: Arc::clone(&self.broker),
            session: Arc::clone(&self.shared),
            destination,
            selector: options.selector,
            mailbox,
            durable,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn create_producer(
        &self,
        destination: Option<&Destination>,
    ) -> Result<Box<dyn MessageProducer>> {
        self.ensure_open()?;
        self.broker.check(FailurePoint::CreateProducer)?;
        Ok(Box::new(MemoryProducer {
            broker: Arc::clone(&self.broker),
            session: Arc::clone(&self.shared),
            destination: destination.cloned(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn create_consumer(
        &self,
        destination: &Destination,
        options: ConsumerOptions,
    ) -> Result<Box<dyn MessageConsumer>> {
        self.ensure_open()?;
        self.broker.check(FailurePoint::CreateConsumer)?;
        let mailbox = match destination {
            Destination::Queue(name) => self.broker.queue(name),
            Destination::Topic(name) => {
                let mailbox = Arc::new(Mailbox::default());
                lock(&self.broker.subscribers)
                    .entry(name.clone())
                    .or_default()
                    .push(Subscriber {
                        mailbox: Arc::downgrade(&mailbox),
                        connection_id: self.shared.connection.id,
                        no_local: options.no_local,
                    });
                mailbox
            }
        };
        Ok(self.consumer(destination.clone(), mailbox, options, None))
    }

    async fn create_durable_subscriber(
        &self,
        topic: &Destination,
        subscription: &str,
        options: ConsumerOptions,
    ) -> Result<Box<dyn MessageConsumer>> {
        self.ensure_open()?;
        self.broker.check(FailurePoint::CreateConsumer)?;
        let Destination::Topic(topic_name) = topic else {
            return Err(BrokerError::InvalidDestination(format!(
                "Durable subscriptions require a topic, got {topic}"
            )));
        };

        let mailbox = {
            let mut durable = lock(&self.broker.durable);
            match durable.get_mut(subscription) {
                Some(existing) if existing.active => {
                    return Err(BrokerError::IllegalState(format!(
                        "Durable subscription '{subscription}' already has an active consumer"
                    )));
                }
                Some(existing) if existing.topic == *topic_name => {
                    existing.active = true;
                    existing.connection_id = self.shared.connection.id;
                    existing.no_local = options.no_local;
                    Arc::clone(&existing.mailbox)
                }
                _ => {
                    // New subscription, or the topic changed: start from scratch.
                    let mailbox = Arc::new(Mailbox::default());
                    durable.insert(
                        subscription.to_string(),
                        DurableSubscription {
                            topic: topic_name.clone(),
                            mailbox: Arc::clone(&mailbox),
                            connection_id: self.shared.connection.id,
                            no_local: options.no_local,
                            active: true,
                        },
                    );
                    mailbox
                }
            }
        };
        debug!(subscription, topic = %topic_name, "Attached durable subscriber");
        Ok(self.consumer(
            topic.clone(),
            mailbox,
            options,
            Some(subscription.to_string()),
        ))
    }

    async fn unsubscribe(&self, subscription: &str) -> Result<()> {
        self.ensure_open()?;
        let mut durable = lock(&self.broker.durable);
        match durable.get(subscription) {
            None => Err(BrokerError::InvalidDestination(format!(
                "No durable subscription named '{subscription}'"
            ))),
            Some(existing) if existing.active => Err(BrokerError::IllegalState(format!(
                "Durable subscription '{subscription}' has an active consumer"
            ))),
            Some(_) => {
                durable.remove(subscription);
                Ok(())
            }
        }
    }

    async fn commit(&self) -> Result<()> {
        self.ensure_open()?;
        self.ensure_transacted("commit")?;
        let pending = std::mem::take(&mut *lock(&self.shared.pending));
        for (destination, message) in pending {
            self.broker
                .deliver(&destination, message, self.shared.connection.id);
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.ensure_open()?;
        self.ensure_transacted("rollback")?;
        lock(&self.shared.pending).clear();
        Ok(())
    }

    async fn recover(&self) -> Result<()> {
        self.ensure_open()?;
        if self.shared.transacted {
            return Err(BrokerError::IllegalState(
                "recover is not allowed in a transacted session".to_string(),
            ));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.broker.check(FailurePoint::Close)?;
        if !self.shared.closed.swap(true, Ordering::AcqRel) {
            lock(&self.shared.pending).clear();
            self.shared.connection.changed.notify_waiters();
        }
        Ok(())
    }

    fn transacted(&self) -> bool {
        self.shared.transacted
    }

    fn acknowledge_mode(&self) -> AcknowledgeMode {
        self.shared.acknowledge_mode
    }
}

// ============================================================================
// Producer
// ============================================================================

struct MemoryProducer {
    broker: Arc<BrokerState>,
    session: Arc<SessionShared>,
    destination: Option<Destination>,
    closed: AtomicBool,
}

#[async_trait]
impl MessageProducer for MemoryProducer {
    fn destination(&self) -> Option<Destination> {
        self.destination.clone()
    }

    async fn send_with_options(
        &self,
        destination: Option<&Destination>,
        mut message: Message,
        options: SendOptions,
    ) -> Result<()> {
        if self.closed.load(Ordering::Acquire) || self.session.is_closed() {
            return Err(BrokerError::Closed("MessageProducer"));
        }
        self.broker.check(FailurePoint::Send)?;
        let destination = destination
            .or(self.destination.as_ref())
            .cloned()
            .ok_or_else(|| {
                BrokerError::InvalidDestination("No destination given for send".to_string())
            })?;

        let now = Utc::now();
        let id = self.broker.next_message_id.fetch_add(1, Ordering::Relaxed) + 1;
        message.id = Some(format!("ID:mem-{id}"));
        message.destination = Some(destination.clone());
        message.timestamp = Some(now);
        message.delivery_mode = options.delivery_mode;
        message.priority = options.priority.min(9);
        message.expiration = options
            .time_to_live
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .map(|ttl| now + ttl);

        if self.session.transacted {
            lock(&self.session.pending).push((destination, message));
        } else {
            self.broker
                .deliver(&destination, message, self.session.connection.id);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.broker.check(FailurePoint::Close)?;
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

// ============================================================================
// Consumer
// ============================================================================

struct MemoryConsumer {
    broker: Arc<BrokerState>,
    session: Arc<SessionShared>,
    destination: Destination,
    selector: Option<String>,
    mailbox: Arc<Mailbox>,
    durable: Option<String>,
    closed: AtomicBool,
}

impl MemoryConsumer {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.session.is_closed()
    }

    fn try_take(&self) -> Option<Message> {
        if self.session.connection.is_started() {
            self.mailbox.take()
        } else {
            None
        }
    }

    async fn wait_for_message(&self) -> Option<Message> {
        let connection = &self.session.connection;
        loop {
            let arrived = self.mailbox.available.notified();
            let changed = connection.changed.notified();
            tokio::pin!(arrived, changed);
            changed.as_mut().enable();

            if self.is_closed() {
                return None;
            }
            if let Some(message) = self.try_take() {
                return Some(message);
            }
            tokio::select! {
                _ = &mut arrived => {}
                _ = &mut changed => {}
            }
        }
    }

    fn detach(&self) {
        match (&self.durable, &self.destination) {
            (Some(subscription), _) => {
                if let Some(existing) = lock(&self.broker.durable).get_mut(subscription) {
                    if Arc::ptr_eq(&existing.mailbox, &self.mailbox) {
                        existing.active = false;
                    }
                }
            }
            (None, Destination::Topic(name)) => {
                if let Some(list) = lock(&self.broker.subscribers).get_mut(name) {
                    list.retain(|s| {
                        s.mailbox
                            .upgrade()
                            .is_some_and(|m| !Arc::ptr_eq(&m, &self.mailbox))
                    });
                }
            }
            (None, Destination::Queue(_)) => {}
        }
    }
}

#[async_trait]
impl MessageConsumer for MemoryConsumer {
    fn destination(&self) -> Destination {
        self.destination.clone()
    }

    fn selector(&self) -> Option<String> {
        self.selector.clone()
    }

    async fn receive_with(&self, mode: ReceiveMode) -> Result<Option<Message>> {
        if self.is_closed() {
            return Err(BrokerError::Closed("MessageConsumer"));
        }
        self.broker.check(FailurePoint::Receive)?;
        match mode {
            ReceiveMode::NoWait => Ok(self.try_take()),
            ReceiveMode::Blocking => Ok(self.wait_for_message().await),
            ReceiveMode::Timeout(timeout) => {
                Ok(tokio::time::timeout(timeout, self.wait_for_message())
                    .await
                    .unwrap_or(None))
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.broker.check(FailurePoint::Close)?;
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.detach();
            self.session.connection.changed.notify_waiters();
        }
        Ok(())
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            self.detach();
        }
    }
}

#[cfg(test)]
mod tests;
