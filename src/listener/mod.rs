//! Message-driven consumers with managed start/stop.
//!
//! `MessageListenerContainer` opens one connection, runs
//! `concurrent_consumers` receive loops on it and hands every message to a
//! `MessageListener`. Stopping pauses the loops without closing anything;
//! `shutdown` ends them and closes the connection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{
    AcknowledgeMode, BrokerError, Connection, ConnectionFactory, ConsumerOptions, Destination,
    Message, MessageConsumer, Session,
};
use crate::management::{
    self, AttributeInfo, AttributeValue, ManagedObject, ManagementBus, ManagementError,
    ObjectName, Published, DEFAULT_DOMAIN,
};

pub const START: &str = "start";
pub const STOP: &str = "stop";

/// Receive timeout of each loop; bounds how long shutdown waits.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);

/// Pause after a failed receive before trying again.
const RECOVERY_INTERVAL: Duration = Duration::from_millis(100);

pub(crate) const ATTRIBUTES: &[AttributeInfo] = &[
    AttributeInfo::read_only(
        "ContainerActiveConsumerCount",
        "Consumers currently receiving, paused ones excluded",
    ),
    AttributeInfo::read_only("ContainerConcurrentConsumers", "Configured number of consumers"),
    AttributeInfo::read_only("DurableSubscriptionName", "Durable subscription consumed, if any"),
    AttributeInfo::read_only("PausedTaskCount", "Consumers waiting for the container to start"),
    AttributeInfo::read_only("ContainerRunning", "Whether the container is started"),
];

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Errors
// ============================================================================

pub type Result<T> = std::result::Result<T, ListenerError>;

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("Invalid container configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Container is already initialized")]
    AlreadyInitialized,

    #[error("Container has been shut down")]
    ShutDown,
}

// ============================================================================
// Listener
// ============================================================================

/// Receives each message consumed by a container.
///
/// A failure is logged. In a transacted container it also rolls the
/// message back.
#[async_trait]
pub trait MessageListener: Send + Sync {
    async fn on_message(&self, message: Message) -> crate::broker::Result<()>;
}

// ============================================================================
// Container
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContainerState {
    Running,
    Stopped,
    ShutDown,
}

struct ContainerShared {
    state: watch::Sender<ContainerState>,
    live: AtomicUsize,
    paused: AtomicUsize,
}

impl ContainerShared {
    fn state(&self) -> ContainerState {
        *self.state.borrow()
    }
}

/// What every consumer loop of one container needs.
struct ConsumerLoop {
    name: String,
    listener: Arc<dyn MessageListener>,
    transacted: bool,
    receive_timeout: Duration,
    shared: Arc<ContainerShared>,
}

/// Runs listener loops over one connection.
///
/// # Example
///
/// ```ignore
/// let container = MessageListenerContainer::new(factory, Destination::queue("orders"), listener)
///     .with_name("orders")
///     .with_concurrent_consumers(4);
/// container.initialize().await?;
/// let container = container.publish(bus)?;
/// ```
pub struct MessageListenerContainer {
    name: String,
    factory: Arc<dyn ConnectionFactory>,
    listener: Arc<dyn MessageListener>,
    destination: Destination,
    selector: Option<String>,
    durable_subscription_name: Option<String>,
    concurrent_consumers: usize,
    transacted: bool,
    receive_timeout: Duration,
    shared: Arc<ContainerShared>,
    connection: Mutex<Option<Arc<dyn Connection>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    domain: String,
    object_name: OnceLock<ObjectName>,
}

impl MessageListenerContainer {
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        destination: Destination,
        listener: Arc<dyn MessageListener>,
    ) -> Self {
        let (state, _) = watch::channel(ContainerState::Stopped);
        Self {
            name: "container".to_string(),
            factory,
            listener,
            destination,
            selector: None,
            durable_subscription_name: None,
            concurrent_consumers: 1,
            transacted: false,
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            shared: Arc::new(ContainerShared {
                state,
                live: AtomicUsize::new(0),
                paused: AtomicUsize::new(0),
            }),
            connection: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            domain: DEFAULT_DOMAIN.to_string(),
            object_name: OnceLock::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    pub fn with_concurrent_consumers(mut self, consumers: usize) -> Self {
        self.concurrent_consumers = consumers;
        self
    }

    /// Consume through a durable subscription on a topic destination.
    pub fn with_durable_subscription_name(mut self, subscription: impl Into<String>) -> Self {
        self.durable_subscription_name = Some(subscription.into());
        self
    }

    pub fn with_message_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    /// Commit each message after the listener succeeds, roll back otherwise.
    pub fn with_session_transacted(mut self, transacted: bool) -> Self {
        self.transacted = transacted;
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn concurrent_consumers(&self) -> usize {
        self.concurrent_consumers
    }

    pub fn durable_subscription_name(&self) -> Option<&str> {
        self.durable_subscription_name.as_deref()
    }

    /// Consumers currently receiving, paused ones excluded.
    pub fn active_consumer_count(&self) -> usize {
        self.shared
            .live
            .load(Ordering::Acquire)
            .saturating_sub(self.shared.paused.load(Ordering::Acquire))
    }

    /// Consumers waiting for `start`.
    pub fn paused_task_count(&self) -> usize {
        self.shared.paused.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.shared.state() == ContainerState::Running
    }

    fn validate(&self) -> Result<()> {
        if self.concurrent_consumers == 0 {
            return Err(ListenerError::InvalidConfiguration(
                "concurrent_consumers must be positive".to_string(),
            ));
        }
        if self.durable_subscription_name.is_some() {
            if !self.destination.is_topic() {
                return Err(ListenerError::InvalidConfiguration(format!(
                    "durable subscription needs a topic, got {:?}",
                    self.destination
                )));
            }
            if self.concurrent_consumers > 1 {
                return Err(ListenerError::InvalidConfiguration(
                    "a durable subscription allows a single consumer".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Open the connection, create every consumer and start receiving.
    pub async fn initialize(&self) -> Result<()> {
        self.validate()?;
        if self.shared.state() == ContainerState::ShutDown {
            return Err(ListenerError::ShutDown);
        }
        if lock(&self.connection).is_some() {
            return Err(ListenerError::AlreadyInitialized);
        }

        let connection: Arc<dyn Connection> = Arc::from(self.factory.create_connection().await?);
        let consumers = match self.open_consumers(connection.as_ref()).await {
            Ok(consumers) => consumers,
            Err(e) => {
                if let Err(close_error) = connection.close().await {
                    warn!(container = %self.name, error = %close_error, "Failed to close connection");
                }
                return Err(e.into());
            }
        };
        connection.start().await?;

        let settings = Arc::new(ConsumerLoop {
            name: self.name.clone(),
            listener: Arc::clone(&self.listener),
            transacted: self.transacted,
            receive_timeout: self.receive_timeout,
            shared: Arc::clone(&self.shared),
        });
        let handles: Vec<_> = consumers
            .into_iter()
            .enumerate()
            .map(|(index, (session, consumer))| {
                self.shared.live.fetch_add(1, Ordering::AcqRel);
                tokio::spawn(consume(Arc::clone(&settings), index, session, consumer))
            })
            .collect();
        *lock(&self.connection) = Some(connection);
        lock(&self.tasks).extend(handles);

        self.shared.state.send_replace(ContainerState::Running);
        info!(
            container = %self.name,
            destination = %self.destination.name(),
            consumers = self.concurrent_consumers,
            "Listener container initialized"
        );
        Ok(())
    }

    async fn open_consumers(
        &self,
        connection: &dyn Connection,
    ) -> crate::broker::Result<Vec<(Box<dyn Session>, Box<dyn MessageConsumer>)>> {
        let acknowledge_mode = AcknowledgeMode::Auto;
        let mut consumers = Vec::with_capacity(self.concurrent_consumers);
        for _ in 0..self.concurrent_consumers {
            let session = connection
                .create_session(self.transacted, acknowledge_mode)
                .await?;
            let options = ConsumerOptions {
                selector: self.selector.clone(),
                no_local: false,
            };
            let consumer = match &self.durable_subscription_name {
                Some(subscription) => {
                    session
                        .create_durable_subscriber(&self.destination, subscription, options)
                        .await?
                }
                None => session.create_consumer(&self.destination, options).await?,
            };
            consumers.push((session, consumer));
        }
        Ok(consumers)
    }

    /// Resume every consumer.
    pub fn start(&self) -> Result<()> {
        self.transition(ContainerState::Stopped, ContainerState::Running)
    }

    /// Pause every consumer. Messages stay on the broker until `start`.
    pub fn stop(&self) -> Result<()> {
        self.transition(ContainerState::Running, ContainerState::Stopped)
    }

    fn transition(&self, from: ContainerState, to: ContainerState) -> Result<()> {
        let mut shut_down = false;
        let changed = self.shared.state.send_if_modified(|state| {
            shut_down = *state == ContainerState::ShutDown;
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
        if shut_down {
            return Err(ListenerError::ShutDown);
        }
        if changed {
            info!(container = %self.name, state = ?to, "Listener container state changed");
        }
        Ok(())
    }

    /// End every consumer, wait for them and close the connection.
    /// Calling it twice is a no-op.
    pub async fn shutdown(&self) {
        self.shared.state.send_replace(ContainerState::ShutDown);
        let handles = std::mem::take(&mut *lock(&self.tasks));
        for handle in handles {
            if let Err(e) = handle.await {
                error!(container = %self.name, error = %e, "Consumer task failed");
            }
        }
        let connection = lock(&self.connection).take();
        if let Some(connection) = connection {
            if let Err(e) = connection.close().await {
                warn!(container = %self.name, error = %e, "Failed to close connection");
            }
            info!(container = %self.name, "Listener container shut down");
        }
    }

    /// Publish this container on `bus` for as long as the handle lives.
    pub fn publish(self, bus: Arc<dyn ManagementBus>) -> management::Result<Published<Self>> {
        let published = Published::publish(self, bus)?;
        if let Some(name) = published.object_name() {
            info!(name = %name, "Published listener container");
        }
        Ok(published)
    }
}

impl Drop for MessageListenerContainer {
    fn drop(&mut self) {
        self.shared.state.send_replace(ContainerState::ShutDown);
    }
}

impl ManagedObject for MessageListenerContainer {
    fn object_name(&self) -> ObjectName {
        self.object_name
            .get_or_init(|| {
                ObjectName::typed(&self.domain, "MessageListenerContainer", Some(self.name()))
            })
            .clone()
    }

    fn attributes(&self) -> Vec<AttributeInfo> {
        ATTRIBUTES.to_vec()
    }

    fn get_attribute(&self, attribute: &str) -> management::Result<AttributeValue> {
        let value: AttributeValue = match attribute {
            "ContainerActiveConsumerCount" => self.active_consumer_count().into(),
            "ContainerConcurrentConsumers" => self.concurrent_consumers().into(),
            "DurableSubscriptionName" => self.durable_subscription_name().into(),
            "PausedTaskCount" => self.paused_task_count().into(),
            "ContainerRunning" => self.is_running().into(),
            other => return Err(ManagementError::unknown_attribute(other)),
        };
        Ok(value)
    }

    fn set_attribute(&self, attribute: &str, _value: AttributeValue) -> management::Result<()> {
        if ATTRIBUTES.iter().any(|a| a.name == attribute) {
            Err(ManagementError::read_only(attribute))
        } else {
            Err(ManagementError::unknown_attribute(attribute))
        }
    }

    fn invoke(&self, operation: &str, _args: &[AttributeValue]) -> management::Result<AttributeValue> {
        let result = match operation {
            START => self.start(),
            STOP => self.stop(),
            other => return Err(ManagementError::unknown_operation(other)),
        };
        result
            .map(|()| AttributeValue::Null)
            .map_err(|e| ManagementError::OperationFailed {
                operation: operation.to_string(),
                message: e.to_string(),
            })
    }
}

// ============================================================================
// Consumer loop
// ============================================================================

async fn consume(
    settings: Arc<ConsumerLoop>,
    index: usize,
    session: Box<dyn Session>,
    consumer: Box<dyn MessageConsumer>,
) {
    let shared = &settings.shared;
    let mut state = shared.state.subscribe();
    debug!(container = %settings.name, consumer = index, "Consumer started");
    loop {
        let current = *state.borrow_and_update();
        match current {
            ContainerState::ShutDown => break,
            ContainerState::Stopped => {
                shared.paused.fetch_add(1, Ordering::AcqRel);
                let resumed = state
                    .wait_for(|state| *state != ContainerState::Stopped)
                    .await
                    .is_ok();
                shared.paused.fetch_sub(1, Ordering::AcqRel);
                if !resumed {
                    break;
                }
                continue;
            }
            ContainerState::Running => {}
        }

        let received = tokio::select! {
            received = consumer.receive_timeout(settings.receive_timeout) => received,
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        };
        match received {
            Ok(Some(message)) => dispatch(&settings, index, session.as_ref(), message).await,
            Ok(None) => {}
            Err(e) => {
                warn!(container = %settings.name, consumer = index, error = %e, "Receive failed");
                tokio::time::sleep(RECOVERY_INTERVAL).await;
            }
        }
    }

    if let Err(e) = consumer.close().await {
        warn!(container = %settings.name, consumer = index, error = %e, "Failed to close consumer");
    }
    if let Err(e) = session.close().await {
        warn!(container = %settings.name, consumer = index, error = %e, "Failed to close session");
    }
    shared.live.fetch_sub(1, Ordering::AcqRel);
    debug!(container = %settings.name, consumer = index, "Consumer finished");
}

async fn dispatch(settings: &ConsumerLoop, index: usize, session: &dyn Session, message: Message) {
    let id = message.id.clone();
    match settings.listener.on_message(message).await {
        Ok(()) if settings.transacted => {
            if let Err(e) = session.commit().await {
                warn!(container = %settings.name, consumer = index, ?id, error = %e, "Commit failed");
            }
        }
        Ok(()) => {}
        Err(e) => {
            warn!(container = %settings.name, consumer = index, ?id, error = %e, "Listener failed");
            if settings.transacted {
                if let Err(e) = session.rollback().await {
                    warn!(container = %settings.name, consumer = index, error = %e, "Rollback failed");
                }
            }
        }
    }
}
