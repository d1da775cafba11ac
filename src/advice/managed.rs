//! Statistics-collecting broker decorators.
//!
//! Every wrapper forwards to its delegate and touches the shared
//! `BrokerStatistics`; children returned by a wrapper are wrapped too.
//! Failures from the delegate are returned unchanged.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tracing::{info, warn};

use super::statistics::{
    BrokerStatistics, CloseGuard, CreateAttempt, MessageOperation, OperationTimer, ResourceKind,
    ATTRIBUTES,
};
use crate::broker::{
    AcknowledgeMode, Connection, ConnectionFactory, ConsumerOptions, Destination, Message,
    MessageConsumer, MessageProducer, ReceiveMode, Result, SendOptions, Session,
};
use crate::leak::{LeakDetectorConnectionFactory, LeakSink, ResourceNode, TracingLeakSink};
use crate::management::{
    self, AttributeInfo, AttributeValue, ManagedObject, ManagementBus, ManagementError,
    ObjectName, Published, DEFAULT_DOMAIN,
};

/// Operation returning the leak-tree dump.
pub const DUMP_ALL_OPEN_RESOURCES: &str = "dumpAllOpenResources";

// ============================================================================
// Factory
// ============================================================================

/// Root decorator: owns the statistics and publishes them on the bus.
///
/// # Example
///
/// ```ignore
/// let factory = ManagedConnectionFactory::new(InMemoryBroker::new())
///     .with_name("orders")
///     .track_leaks(true)
///     .publish(bus)?;
/// let connection = factory.create_connection().await?;
/// ```
pub struct ManagedConnectionFactory {
    delegate: Box<dyn ConnectionFactory>,
    statistics: Arc<BrokerStatistics>,
    leak_root: Option<Arc<ResourceNode>>,
    domain: String,
    name: Option<String>,
    object_name: OnceLock<ObjectName>,
}

impl ManagedConnectionFactory {
    pub fn new(delegate: impl ConnectionFactory + 'static) -> Self {
        Self::from_boxed(Box::new(delegate))
    }

    pub fn from_boxed(delegate: Box<dyn ConnectionFactory>) -> Self {
        Self {
            delegate,
            statistics: Arc::new(BrokerStatistics::new()),
            leak_root: None,
            domain: DEFAULT_DOMAIN.to_string(),
            name: None,
            object_name: OnceLock::new(),
        }
    }

    /// Bean name used in the published object name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    /// Track open resources, reporting leaks as `warn!` events.
    pub fn track_leaks(self, enabled: bool) -> Self {
        if enabled {
            self.with_leak_sink(Arc::new(TracingLeakSink))
        } else {
            self
        }
    }

    /// Track open resources, reporting leaks to `sink`.
    pub fn with_leak_sink(mut self, sink: Arc<dyn LeakSink>) -> Self {
        if self.leak_root.is_some() {
            return self;
        }
        let detector = LeakDetectorConnectionFactory::with_sink(self.delegate, sink);
        self.leak_root = Some(Arc::clone(detector.root()));
        self.delegate = Box::new(detector);
        self
    }

    pub fn statistics(&self) -> &Arc<BrokerStatistics> {
        &self.statistics
    }

    pub fn is_tracking_leaks(&self) -> bool {
        self.leak_root.is_some()
    }

    /// Open-resource dump, empty when leak tracking is off.
    pub fn dump_all_open_resources(&self) -> Vec<String> {
        self.leak_root
            .as_ref()
            .map(|root| root.dump_all_open())
            .unwrap_or_default()
    }

    /// Publish this factory on `bus`. The returned handle owns the factory
    /// and unregisters it when closed or dropped.
    pub fn publish(self, bus: Arc<dyn ManagementBus>) -> management::Result<Published<Self>> {
        let track_leaks = self.is_tracking_leaks();
        let published = Published::publish(self, bus)?;
        if let Some(name) = published.object_name() {
            info!(name = %name, track_leaks, "Published connection factory");
        }
        Ok(published)
    }

    fn wrap(&self, connection: Box<dyn Connection>) -> Box<dyn Connection> {
        Box::new(ManagedConnection::new(connection, Arc::clone(&self.statistics)))
    }
}

#[async_trait]
impl ConnectionFactory for ManagedConnectionFactory {
    async fn create_connection(&self) -> Result<Box<dyn Connection>> {
        let attempt = CreateAttempt::begin(&self.statistics, ResourceKind::Connection);
        let connection = attempt.finish(self.delegate.create_connection().await)?;
        Ok(self.wrap(connection))
    }

    async fn create_connection_with_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Box<dyn Connection>> {
        let attempt = CreateAttempt::begin(&self.statistics, ResourceKind::Connection);
        let result = self
            .delegate
            .create_connection_with_credentials(username, password)
            .await;
        if let Err(e) = &result {
            warn!(username, error = %e, "Connection with credentials failed");
        }
        let connection = attempt.finish(result)?;
        Ok(self.wrap(connection))
    }
}

#[async_trait]
impl ConnectionFactory for Published<ManagedConnectionFactory> {
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

impl ManagedObject for ManagedConnectionFactory {
    fn object_name(&self) -> ObjectName {
        self.object_name
            .get_or_init(|| {
                ObjectName::typed(&self.domain, "ConnectionFactory", self.name.as_deref())
            })
            .clone()
    }

    fn attributes(&self) -> Vec<AttributeInfo> {
        ATTRIBUTES.to_vec()
    }

    fn get_attribute(&self, attribute: &str) -> management::Result<AttributeValue> {
        self.statistics
            .attribute(attribute)
            .ok_or_else(|| ManagementError::unknown_attribute(attribute))
    }

    fn invoke(&self, operation: &str, _args: &[AttributeValue]) -> management::Result<AttributeValue> {
        match operation {
            DUMP_ALL_OPEN_RESOURCES if self.is_tracking_leaks() => {
                Ok(AttributeValue::Text(self.dump_all_open_resources().join("\n")))
            }
            DUMP_ALL_OPEN_RESOURCES => Err(ManagementError::OperationFailed {
                operation: operation.to_string(),
                message: "leak tracking is disabled".to_string(),
            }),
            other => Err(ManagementError::unknown_operation(other)),
        }
    }
}

// ============================================================================
// Connection
// ============================================================================

pub struct ManagedConnection {
    delegate: Box<dyn Connection>,
    statistics: Arc<BrokerStatistics>,
}

impl ManagedConnection {
    pub fn new(delegate: Box<dyn Connection>, statistics: Arc<BrokerStatistics>) -> Self {
        Self {
            delegate,
            statistics,
        }
    }
}

#[async_trait]
impl Connection for ManagedConnection {
    async fn create_session(
        &self,
        transacted: bool,
        acknowledge_mode: AcknowledgeMode,
    ) -> Result<Box<dyn Session>> {
        let attempt = CreateAttempt::begin(&self.statistics, ResourceKind::Session);
        let session = attempt.finish(
            self.delegate
                .create_session(transacted, acknowledge_mode)
                .await,
        )?;
        Ok(Box::new(ManagedSession::new(
            session,
            Arc::clone(&self.statistics),
        )))
    }

    async fn start(&self) -> Result<()> {
        self.delegate.start().await
    }

    async fn stop(&self) -> Result<()> {
        self.delegate.stop().await
    }

    async fn close(&self) -> Result<()> {
        let _closed = CloseGuard::new(&self.statistics, ResourceKind::Connection);
        self.delegate.close().await
    }

    fn client_id(&self) -> Option<String> {
        self.delegate.client_id()
    }
}

// ============================================================================
// Session
// ============================================================================

pub struct ManagedSession {
    delegate: Box<dyn Session>,
    statistics: Arc<BrokerStatistics>,
}

impl ManagedSession {
    pub fn new(delegate: Box<dyn Session>, statistics: Arc<BrokerStatistics>) -> Self {
        Self {
            delegate,
            statistics,
        }
    }

    fn wrap_consumer(&self, consumer: Box<dyn MessageConsumer>) -> Box<dyn MessageConsumer> {
        Box::new(ManagedMessageConsumer::new(
            consumer,
            Arc::clone(&self.statistics),
        ))
    }
}

#[async_trait]
impl Session for ManagedSession {
    async fn create_producer(
        &self,
        destination: Option<&Destination>,
    ) -> Result<Box<dyn MessageProducer>> {
        let attempt = CreateAttempt::begin(&self.statistics, ResourceKind::MessageProducer);
        let producer = attempt.finish(self.delegate.create_producer(destination).await)?;
        Ok(Box::new(ManagedMessageProducer::new(
            producer,
            Arc::clone(&self.statistics),
        )))
    }

    async fn create_consumer(
        &self,
        destination: &Destination,
        options: ConsumerOptions,
    ) -> Result<Box<dyn MessageConsumer>> {
        let attempt = CreateAttempt::begin(&self.statistics, ResourceKind::MessageConsumer);
        let consumer =
            attempt.finish(self.delegate.create_consumer(destination, options).await)?;
        Ok(self.wrap_consumer(consumer))
    }

    async fn create_durable_subscriber(
        &self,
        topic: &Destination,
        subscription: &str,
        options: ConsumerOptions,
    ) -> Result<Box<dyn MessageConsumer>> {
        let attempt = CreateAttempt::begin(&self.statistics, ResourceKind::MessageConsumer);
        let consumer = attempt.finish(
            self.delegate
                .create_durable_subscriber(topic, subscription, options)
                .await,
        )?;
        Ok(self.wrap_consumer(consumer))
    }

    async fn unsubscribe(&self, subscription: &str) -> Result<()> {
        self.delegate.unsubscribe(subscription).await
    }

    async fn commit(&self) -> Result<()> {
        self.delegate.commit().await
    }

    async fn rollback(&self) -> Result<()> {
        self.delegate.rollback().await
    }

    async fn recover(&self) -> Result<()> {
        self.delegate.recover().await
    }

    async fn close(&self) -> Result<()> {
        let _closed = CloseGuard::new(&self.statistics, ResourceKind::Session);
        self.delegate.close().await
    }

    fn transacted(&self) -> bool {
        self.delegate.transacted()
    }

    fn acknowledge_mode(&self) -> AcknowledgeMode {
        self.delegate.acknowledge_mode()
    }
}

// ============================================================================
// Producer / consumer
// ============================================================================

pub struct ManagedMessageProducer {
    delegate: Box<dyn MessageProducer>,
    statistics: Arc<BrokerStatistics>,
}

impl ManagedMessageProducer {
    pub fn new(delegate: Box<dyn MessageProducer>, statistics: Arc<BrokerStatistics>) -> Self {
        Self {
            delegate,
            statistics,
        }
    }
}

#[async_trait]
impl MessageProducer for ManagedMessageProducer {
    fn destination(&self) -> Option<Destination> {
        self.delegate.destination()
    }

    async fn send_with_options(
        &self,
        destination: Option<&Destination>,
        message: Message,
        options: SendOptions,
    ) -> Result<()> {
        let timer = OperationTimer::start(&self.statistics, MessageOperation::Send);
        timer.finish(
            self.delegate
                .send_with_options(destination, message, options)
                .await,
        )
    }

    async fn close(&self) -> Result<()> {
        let _closed = CloseGuard::new(&self.statistics, ResourceKind::MessageProducer);
        self.delegate.close().await
    }
}

pub struct ManagedMessageConsumer {
    delegate: Box<dyn MessageConsumer>,
    statistics: Arc<BrokerStatistics>,
}

impl ManagedMessageConsumer {
    pub fn new(delegate: Box<dyn MessageConsumer>, statistics: Arc<BrokerStatistics>) -> Self {
        Self {
            delegate,
            statistics,
        }
    }
}

#[async_trait]
impl MessageConsumer for ManagedMessageConsumer {
    fn destination(&self) -> Destination {
        self.delegate.destination()
    }

    fn selector(&self) -> Option<String> {
        self.delegate.selector()
    }

    async fn receive_with(&self, mode: ReceiveMode) -> Result<Option<Message>> {
        let timer = OperationTimer::start(&self.statistics, MessageOperation::Receive);
        timer.finish(self.delegate.receive_with(mode).await)
    }

    async fn close(&self) -> Result<()> {
        let _closed = CloseGuard::new(&self.statistics, ResourceKind::MessageConsumer);
        self.delegate.close().await
    }
}
