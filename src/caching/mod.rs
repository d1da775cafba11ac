//! Session-caching connection factory.
//!
//! `CachingConnectionFactory` hands out proxies onto one shared target
//! connection. Closing a proxy session returns it to an idle cache keyed by
//! transacted flag and acknowledge mode, up to `session_cache_size` per key.
//! Producers and consumers created on a cached session are cached too, and
//! closing them only detaches the caller.
//!
//! ```ignore
//! let caching = CachingConnectionFactory::new(Arc::new(managed))
//!     .with_name("orders")
//!     .with_session_cache_size(4)
//!     .publish(bus)?;
//! let connection = caching.create_connection().await?;
//! ```
//!
//! `reset_connection` closes the shared connection and every idle session;
//! the next use reconnects.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::broker::{
    AcknowledgeMode, BrokerError, Connection, ConnectionFactory, ConsumerOptions, Destination,
    Message, MessageConsumer, MessageProducer, ReceiveMode, Result, SendOptions, Session,
};
use crate::config::CachingConfig;
use crate::management::{
    self, AttributeInfo, AttributeValue, ManagedObject, ManagementBus, ManagementError,
    ObjectName, Published, DEFAULT_DOMAIN,
};

/// Operation discarding the shared connection and the idle sessions.
pub const RESET_CONNECTION: &str = "resetConnection";

pub(crate) const ATTRIBUTES: &[AttributeInfo] = &[
    AttributeInfo::read_write("SessionCacheSize", "Idle sessions kept per session kind"),
    AttributeInfo::read_write("CacheProducers", "Whether producers are cached per session"),
    AttributeInfo::read_write("CacheConsumers", "Whether consumers are cached per session"),
    AttributeInfo::read_write(
        "ReconnectOnException",
        "Whether a failure on the shared connection discards it",
    ),
    AttributeInfo::read_only("CachedSessionCount", "Idle sessions currently cached"),
    AttributeInfo::read_only("Connected", "Whether the shared connection is open"),
];

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Shared state
// ============================================================================

type SessionKey = (bool, AcknowledgeMode);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ConsumerKey {
    destination: Destination,
    selector: Option<String>,
    no_local: bool,
    subscription: Option<String>,
}

#[derive(Clone)]
struct SharedConnection {
    connection: Arc<dyn Connection>,
    generation: u64,
}

struct CacheState {
    target: Box<dyn ConnectionFactory>,
    connection: Mutex<Option<SharedConnection>>,
    connecting: tokio::sync::Mutex<()>,
    generation: AtomicU64,
    started: AtomicBool,
    idle: Mutex<HashMap<SessionKey, VecDeque<Arc<CachedSession>>>>,
    session_cache_size: AtomicUsize,
    cache_producers: AtomicBool,
    cache_consumers: AtomicBool,
    reconnect_on_exception: AtomicBool,
}

impl CacheState {
    fn current(&self) -> Option<SharedConnection> {
        lock(&self.connection).clone()
    }

    async fn shared_connection(&self) -> Result<SharedConnection> {
        if let Some(current) = self.current() {
            return Ok(current);
        }
        let _connecting = self.connecting.lock().await;
        if let Some(current) = self.current() {
            return Ok(current);
        }
        let generation = self.generation.load(Ordering::Acquire);
        let connection: Arc<dyn Connection> = Arc::from(self.target.create_connection().await?);
        if self.started.load(Ordering::Acquire) {
            connection.start().await?;
        }
        let shared = SharedConnection {
            connection,
            generation,
        };
        *lock(&self.connection) = Some(shared.clone());
        info!(generation, "Opened shared broker connection");
        Ok(shared)
    }

    /// Idle session of the given kind from the current generation.
    fn take_idle(&self, key: SessionKey) -> Option<Arc<CachedSession>> {
        lock(&self.idle).get_mut(&key).and_then(VecDeque::pop_front)
    }

    /// Park `session` in the idle cache. Fails when the cache for its kind
    /// is full or the session belongs to a discarded connection.
    fn park(&self, session: &Arc<CachedSession>) -> bool {
        let mut idle = lock(&self.idle);
        if session.generation != self.generation.load(Ordering::Acquire) {
            return false;
        }
        let limit = self.session_cache_size.load(Ordering::Acquire);
        let queue = idle.entry(session.key).or_default();
        if queue.len() >= limit {
            return false;
        }
        queue.push_back(Arc::clone(session));
        true
    }

    fn cached_session_count(&self) -> usize {
        lock(&self.idle).values().map(VecDeque::len).sum()
    }

    /// Forget the shared connection and the idle sessions. The caller
    /// closes what is returned.
    fn detach(&self) -> Detached {
        let mut idle = lock(&self.idle);
        self.generation.fetch_add(1, Ordering::AcqRel);
        let sessions: Vec<_> = idle.drain().flat_map(|(_, queue)| queue).collect();
        drop(idle);
        let connection = lock(&self.connection).take().map(|shared| shared.connection);
        Detached {
            connection,
            sessions,
        }
    }

    async fn reset(&self) {
        let detached = self.detach();
        let sessions = detached.sessions.len();
        detached.close().await;
        info!(sessions, "Reset shared broker connection");
    }
}

struct Detached {
    connection: Option<Arc<dyn Connection>>,
    sessions: Vec<Arc<CachedSession>>,
}

impl Detached {
    async fn close(self) {
        for session in self.sessions {
            if let Err(e) = session.close_physically().await {
                warn!(error = %e, "Failed to close cached session");
            }
        }
        if let Some(connection) = self.connection {
            if let Err(e) = connection.close().await {
                warn!(error = %e, "Failed to close shared connection");
            }
        }
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Connection factory sharing one target connection and caching sessions.
pub struct CachingConnectionFactory {
    state: Arc<CacheState>,
    domain: String,
    name: Option<String>,
    object_name: OnceLock<ObjectName>,
}

impl CachingConnectionFactory {
    pub fn new(target: impl ConnectionFactory + 'static) -> Self {
        Self {
            state: Arc::new(CacheState {
                target: Box::new(target),
                connection: Mutex::new(None),
                connecting: tokio::sync::Mutex::new(()),
                generation: AtomicU64::new(0),
                started: AtomicBool::new(false),
                idle: Mutex::new(HashMap::new()),
                session_cache_size: AtomicUsize::new(1),
                cache_producers: AtomicBool::new(true),
                cache_consumers: AtomicBool::new(true),
                reconnect_on_exception: AtomicBool::new(false),
            }),
            domain: DEFAULT_DOMAIN.to_string(),
            name: None,
            object_name: OnceLock::new(),
        }
    }

    /// Apply the tunables of a `caching` configuration section.
    pub fn from_config(target: impl ConnectionFactory + 'static, config: &CachingConfig) -> Self {
        let factory = Self::new(target);
        factory.set_session_cache_size(config.session_cache_size.max(1));
        factory.set_cache_producers(config.cache_producers);
        factory.set_cache_consumers(config.cache_consumers);
        factory.set_reconnect_on_exception(config.reconnect_on_exception);
        factory
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    /// Sizes below one are raised to one.
    pub fn with_session_cache_size(self, size: usize) -> Self {
        self.set_session_cache_size(size.max(1));
        self
    }

    pub fn session_cache_size(&self) -> usize {
        self.state.session_cache_size.load(Ordering::Acquire)
    }

    /// Change the per-kind idle limit. Zero is rejected.
    pub fn set_session_cache_size(&self, size: usize) -> bool {
        if size == 0 {
            return false;
        }
        self.state.session_cache_size.store(size, Ordering::Release);
        true
    }

    pub fn cache_producers(&self) -> bool {
        self.state.cache_producers.load(Ordering::Acquire)
    }

    pub fn set_cache_producers(&self, enabled: bool) {
        self.state.cache_producers.store(enabled, Ordering::Release);
    }

    pub fn cache_consumers(&self) -> bool {
        self.state.cache_consumers.load(Ordering::Acquire)
    }

    pub fn set_cache_consumers(&self, enabled: bool) {
        self.state.cache_consumers.store(enabled, Ordering::Release);
    }

    pub fn reconnect_on_exception(&self) -> bool {
        self.state.reconnect_on_exception.load(Ordering::Acquire)
    }

    pub fn set_reconnect_on_exception(&self, enabled: bool) {
        self.state
            .reconnect_on_exception
            .store(enabled, Ordering::Release);
    }

    pub fn cached_session_count(&self) -> usize {
        self.state.cached_session_count()
    }

    pub fn is_connected(&self) -> bool {
        self.state.current().is_some()
    }

    /// Close the shared connection and every idle session.
    pub async fn reset_connection(&self) {
        self.state.reset().await;
    }

    /// Publish this factory on `bus` for as long as the handle lives.
    pub fn publish(self, bus: Arc<dyn ManagementBus>) -> management::Result<Published<Self>> {
        let published = Published::publish(self, bus)?;
        if let Some(name) = published.object_name() {
            info!(name = %name, "Published caching connection factory");
        }
        Ok(published)
    }

    /// Reset from a synchronous caller. Closing happens on the current
    /// runtime; without one the closed resources are only dropped.
    fn reset_in_background(&self) {
        let detached = self.state.detach();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(detached.close());
            }
            Err(_) => warn!(
                sessions = detached.sessions.len(),
                "No async runtime; dropping cached resources without closing"
            ),
        }
    }
}

#[async_trait]
impl ConnectionFactory for CachingConnectionFactory {
    async fn create_connection(&self) -> Result<Box<dyn Connection>> {
        self.state.shared_connection().await?;
        Ok(Box::new(CachedConnection {
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        }))
    }

    /// Connections with explicit credentials bypass the cache.
    async fn create_connection_with_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Box<dyn Connection>> {
        debug!(username, "Uncached connection with credentials");
        self.state
            .target
            .create_connection_with_credentials(username, password)
            .await
    }
}

#[async_trait]
impl ConnectionFactory for Published<CachingConnectionFactory> {
    async fn create_connection(&self) -> Result<Box<dyn Connection>> {
        (**self).create_connection().await
    }

    async fn create_connection_with_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Box<dyn Connection>> {
        (**self)
            .create_connection_with_credentials(username, password)
            .await
    }
}

impl ManagedObject for CachingConnectionFactory {
    fn object_name(&self) -> ObjectName {
        self.object_name
            .get_or_init(|| {
                ObjectName::typed(&self.domain, "CachingConnectionFactory", self.name.as_deref())
            })
            .clone()
    }

    fn attributes(&self) -> Vec<AttributeInfo> {
        ATTRIBUTES.to_vec()
    }

    fn get_attribute(&self, attribute: &str) -> management::Result<AttributeValue> {
        let value: AttributeValue = match attribute {
            "SessionCacheSize" => self.session_cache_size().into(),
            "CacheProducers" => self.cache_producers().into(),
            "CacheConsumers" => self.cache_consumers().into(),
            "ReconnectOnException" => self.reconnect_on_exception().into(),
            "CachedSessionCount" => self.cached_session_count().into(),
            "Connected" => self.is_connected().into(),
            other => return Err(ManagementError::unknown_attribute(other)),
        };
        Ok(value)
    }

    fn set_attribute(&self, attribute: &str, value: AttributeValue) -> management::Result<()> {
        match attribute {
            "SessionCacheSize" => {
                let size = value.expect_i64(attribute)?;
                let accepted = usize::try_from(size)
                    .map(|size| self.set_session_cache_size(size))
                    .unwrap_or(false);
                if accepted {
                    Ok(())
                } else {
                    Err(ManagementError::InvalidValue {
                        attribute: attribute.to_string(),
                        reason: format!("{size} is not a positive size"),
                    })
                }
            }
            "CacheProducers" => {
                self.set_cache_producers(value.expect_bool(attribute)?);
                Ok(())
            }
            "CacheConsumers" => {
                self.set_cache_consumers(value.expect_bool(attribute)?);
                Ok(())
            }
            "ReconnectOnException" => {
                self.set_reconnect_on_exception(value.expect_bool(attribute)?);
                Ok(())
            }
            other if ATTRIBUTES.iter().any(|a| a.name == other) => {
                Err(ManagementError::read_only(other))
            }
            other => Err(ManagementError::unknown_attribute(other)),
        }
    }

    fn invoke(&self, operation: &str, _args: &[AttributeValue]) -> management::Result<AttributeValue> {
        match operation {
            RESET_CONNECTION => {
                self.reset_in_background();
                Ok(AttributeValue::Null)
            }
            other => Err(ManagementError::unknown_operation(other)),
        }
    }
}

// ============================================================================
// Connection proxy
// ============================================================================

struct CachedConnection {
    state: Arc<CacheState>,
    closed: AtomicBool,
}

impl CachedConnection {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed("Connection"));
        }
        Ok(())
    }

    async fn open_session(&self, key: SessionKey) -> Result<Arc<CachedSession>> {
        let shared = self.state.shared_connection().await?;
        match shared.connection.create_session(key.0, key.1).await {
            Ok(target) => Ok(Arc::new(CachedSession {
                target,
                generation: shared.generation,
                key,
                producers: Mutex::new(HashMap::new()),
                consumers: Mutex::new(HashMap::new()),
            })),
            Err(e) => {
                if self.state.reconnect_on_exception.load(Ordering::Acquire) {
                    warn!(error = %e, "Session creation failed; discarding shared connection");
                    self.state.reset().await;
                }
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Connection for CachedConnection {
    async fn create_session(
        &self,
        transacted: bool,
        acknowledge_mode: AcknowledgeMode,
    ) -> Result<Box<dyn Session>> {
        self.ensure_open()?;
        let key = (transacted, acknowledge_mode);
        let session = match self.state.take_idle(key) {
            Some(session) => {
                debug!(transacted, ?acknowledge_mode, "Reusing cached session");
                session
            }
            None => self.open_session(key).await?,
        };
        Ok(Box::new(SessionProxy {
            session,
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        }))
    }

    async fn start(&self) -> Result<()> {
        self.ensure_open()?;
        let shared = self.state.shared_connection().await?;
        shared.connection.start().await?;
        self.state.started.store(true, Ordering::Release);
        Ok(())
    }

    /// Other proxies share the connection, so delivery is left running.
    async fn stop(&self) -> Result<()> {
        self.ensure_open()?;
        debug!("Ignoring stop on shared connection");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("Released shared connection proxy");
        }
        Ok(())
    }

    fn client_id(&self) -> Option<String> {
        self.state
            .current()
            .and_then(|shared| shared.connection.client_id())
    }
}

// ============================================================================
// Sessions
// ============================================================================

struct CachedSession {
    target: Box<dyn Session>,
    generation: u64,
    key: SessionKey,
    producers: Mutex<HashMap<Option<Destination>, Arc<dyn MessageProducer>>>,
    consumers: Mutex<HashMap<ConsumerKey, Arc<dyn MessageConsumer>>>,
}

impl CachedSession {
    async fn producer(&self, destination: Option<&Destination>) -> Result<Arc<dyn MessageProducer>> {
        let key = destination.cloned();
        if let Some(existing) = lock(&self.producers).get(&key) {
            return Ok(Arc::clone(existing));
        }
        let created: Arc<dyn MessageProducer> =
            Arc::from(self.target.create_producer(destination).await?);
        let existing = {
            let mut producers = lock(&self.producers);
            match producers.get(&key) {
                Some(existing) => Some(Arc::clone(existing)),
                None => {
                    producers.insert(key, Arc::clone(&created));
                    None
                }
            }
        };
        match existing {
            Some(existing) => {
                created.close().await?;
                Ok(existing)
            }
            None => Ok(created),
        }
    }

    async fn consumer(&self, key: ConsumerKey) -> Result<Arc<dyn MessageConsumer>> {
        if let Some(existing) = lock(&self.consumers).get(&key) {
            return Ok(Arc::clone(existing));
        }
        let options = ConsumerOptions {
            selector: key.selector.clone(),
            no_local: key.no_local,
        };
        let created: Arc<dyn MessageConsumer> = Arc::from(match &key.subscription {
            Some(subscription) => {
                self.target
                    .create_durable_subscriber(&key.destination, subscription, options)
                    .await?
            }
            None => {
                self.target
                    .create_consumer(&key.destination, options)
                    .await?
            }
        });
        lock(&self.consumers).insert(key, Arc::clone(&created));
        Ok(created)
    }

    /// Close cached children, then the target session.
    async fn close_physically(&self) -> Result<()> {
        let producers: Vec<_> = lock(&self.producers).drain().map(|(_, p)| p).collect();
        let consumers: Vec<_> = lock(&self.consumers).drain().map(|(_, c)| c).collect();
        for producer in producers {
            if let Err(e) = producer.close().await {
                warn!(error = %e, "Failed to close cached producer");
            }
        }
        for consumer in consumers {
            if let Err(e) = consumer.close().await {
                warn!(error = %e, "Failed to close cached consumer");
            }
        }
        self.target.close().await
    }
}

/// What a caller holds: a view onto a cached session until closed.
struct SessionProxy {
    session: Arc<CachedSession>,
    state: Arc<CacheState>,
    closed: AtomicBool,
}

impl SessionProxy {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed("Session"));
        }
        Ok(())
    }

    async fn consumer(&self, key: ConsumerKey) -> Result<Box<dyn MessageConsumer>> {
        self.ensure_open()?;
        if !self.state.cache_consumers.load(Ordering::Acquire) {
            let options = ConsumerOptions {
                selector: key.selector,
                no_local: key.no_local,
            };
            return match key.subscription {
                Some(subscription) => {
                    self.session
                        .target
                        .create_durable_subscriber(&key.destination, &subscription, options)
                        .await
                }
                None => {
                    self.session
                        .target
                        .create_consumer(&key.destination, options)
                        .await
                }
            };
        }
        let consumer = self.session.consumer(key).await?;
        Ok(Box::new(CachedConsumer(consumer)))
    }
}

#[async_trait]
impl Session for SessionProxy {
    async fn create_producer(
        &self,
        destination: Option<&Destination>,
    ) -> Result<Box<dyn MessageProducer>> {
        self.ensure_open()?;
        if !self.state.cache_producers.load(Ordering::Acquire) {
            return self.session.target.create_producer(destination).await;
        }
        let producer = self.session.producer(destination).await?;
        Ok(Box::new(CachedProducer(producer)))
    }

    async fn create_consumer(
        &self,
        destination: &Destination,
        options: ConsumerOptions,
    ) -> Result<Box<dyn MessageConsumer>> {
        self.consumer(ConsumerKey {
            destination: destination.clone(),
            selector: options.selector,
            no_local: options.no_local,
            subscription: None,
        })
        .await
    }

    async fn create_durable_subscriber(
        &self,
        topic: &Destination,
        subscription: &str,
        options: ConsumerOptions,
    ) -> Result<Box<dyn MessageConsumer>> {
        self.consumer(ConsumerKey {
            destination: topic.clone(),
            selector: options.selector,
            no_local: options.no_local,
            subscription: Some(subscription.to_string()),
        })
        .await
    }

    /// A cached subscriber on `subscription` is closed first.
    async fn unsubscribe(&self, subscription: &str) -> Result<()> {
        self.ensure_open()?;
        let mut attached = Vec::new();
        lock(&self.session.consumers).retain(|key, consumer| {
            if key.subscription.as_deref() == Some(subscription) {
                attached.push(Arc::clone(consumer));
                false
            } else {
                true
            }
        });
        for consumer in attached {
            consumer.close().await?;
        }
        self.session.target.unsubscribe(subscription).await
    }

    async fn commit(&self) -> Result<()> {
        self.ensure_open()?;
        self.session.target.commit().await
    }

    async fn rollback(&self) -> Result<()> {
        self.ensure_open()?;
        self.session.target.rollback().await
    }

    async fn recover(&self) -> Result<()> {
        self.ensure_open()?;
        self.session.target.recover().await
    }

    /// Return the session to the idle cache, or close it when the cache is
    /// full or the shared connection was reset. Uncommitted work in a
    /// transacted session is rolled back first.
    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.session.target.transacted() {
            if let Err(e) = self.session.target.rollback().await {
                warn!(error = %e, "Rollback before caching failed; closing session");
                return self.session.close_physically().await;
            }
        }
        if self.state.park(&self.session) {
            debug!(transacted = self.session.key.0, "Returned session to cache");
            return Ok(());
        }
        self.session.close_physically().await
    }

    fn transacted(&self) -> bool {
        self.session.target.transacted()
    }

    fn acknowledge_mode(&self) -> AcknowledgeMode {
        self.session.target.acknowledge_mode()
    }
}

// ============================================================================
// Producers and consumers
// ============================================================================

/// Cached producer; closing it leaves the target open for the next caller.
struct CachedProducer(Arc<dyn MessageProducer>);

#[async_trait]
impl MessageProducer for CachedProducer {
    fn destination(&self) -> Option<Destination> {
        self.0.destination()
    }

    async fn send_with_options(
        &self,
        destination: Option<&Destination>,
        message: Message,
        options: SendOptions,
    ) -> Result<()> {
        self.0.send_with_options(destination, message, options).await
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct CachedConsumer(Arc<dyn MessageConsumer>);

#[async_trait]
impl MessageConsumer for CachedConsumer {
    fn destination(&self) -> Destination {
        self.0.destination()
    }

    fn selector(&self) -> Option<String> {
        self.0.selector()
    }

    async fn receive_with(&self, mode: ReceiveMode) -> Result<Option<Message>> {
        self.0.receive_with(mode).await
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests;
