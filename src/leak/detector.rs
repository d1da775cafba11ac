//! Broker wrappers that mirror open resources into a `ResourceNode` graph.

use std::sync::Arc;

use async_trait::async_trait;

use super::{LeakSink, ResourceNode, TracingLeakSink};
use crate::advice::ResourceKind;
use crate::broker::{
    AcknowledgeMode, Connection, ConnectionFactory, ConsumerOptions, Destination, Message,
    MessageConsumer, MessageProducer, ReceiveMode, Result, SendOptions, Session,
};

/// Report leaked children, close the delegate, then unregister.
async fn close_tracked<F>(node: &ResourceNode, sink: &dyn LeakSink, close: F) -> Result<()>
where
    F: std::future::Future<Output = Result<()>>,
{
    node.report_leaks(sink);
    close.await?;
    node.detach();
    Ok(())
}

// ============================================================================
// Factory
// ============================================================================

/// Connection factory that tracks every open connection and its children.
pub struct LeakDetectorConnectionFactory {
    delegate: Box<dyn ConnectionFactory>,
    root: Arc<ResourceNode>,
    sink: Arc<dyn LeakSink>,
}

impl LeakDetectorConnectionFactory {
    /// Track `delegate`, reporting leaks as `warn!` events.
    pub fn new(delegate: impl ConnectionFactory + 'static) -> Self {
        Self::with_sink(Box::new(delegate), Arc::new(TracingLeakSink))
    }

    pub fn with_sink(delegate: Box<dyn ConnectionFactory>, sink: Arc<dyn LeakSink>) -> Self {
        Self {
            delegate,
            root: ResourceNode::root("ConnectionFactory"),
            sink,
        }
    }

    /// Root of the open-resource graph.
    pub fn root(&self) -> &Arc<ResourceNode> {
        &self.root
    }

    pub fn open_connections(&self) -> Vec<Arc<ResourceNode>> {
        self.root.open_children()
    }

    /// Every open connection, session, producer and consumer.
    pub fn dump_all_open(&self) -> Vec<String> {
        self.root.dump_all_open()
    }

    fn track(&self, connection: Box<dyn Connection>) -> Box<dyn Connection> {
        let node = self
            .root
            .attach_child(ResourceKind::Connection, connection.client_id());
        Box::new(LeakDetectorConnection {
            delegate: connection,
            node,
            sink: Arc::clone(&self.sink),
        })
    }
}

#[async_trait]
impl ConnectionFactory for LeakDetectorConnectionFactory {
    async fn create_connection(&self) -> Result<Box<dyn Connection>> {
        let connection = self.delegate.create_connection().await?;
        Ok(self.track(connection))
    }

    async fn create_connection_with_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Box<dyn Connection>> {
        let connection = self
            .delegate
            .create_connection_with_credentials(username, password)
            .await?;
        Ok(self.track(connection))
    }
}

// ============================================================================
// Connection
// ============================================================================

pub struct LeakDetectorConnection {
    delegate: Box<dyn Connection>,
    node: Arc<ResourceNode>,
    sink: Arc<dyn LeakSink>,
}

impl LeakDetectorConnection {
    pub fn node(&self) -> &Arc<ResourceNode> {
        &self.node
    }
}

#[async_trait]
impl Connection for LeakDetectorConnection {
    async fn create_session(
        &self,
        transacted: bool,
        acknowledge_mode: AcknowledgeMode,
    ) -> Result<Box<dyn Session>> {
        let session = self
            .delegate
            .create_session(transacted, acknowledge_mode)
            .await?;
        let node = self.node.attach_child(
            ResourceKind::Session,
            Some(format!("transacted={transacted}, {acknowledge_mode:?}")),
        );
        Ok(Box::new(LeakDetectorSession {
            delegate: session,
            node,
            sink: Arc::clone(&self.sink),
        }))
    }

    async fn start(&self) -> Result<()> {
        self.delegate.start().await
    }

    async fn stop(&self) -> Result<()> {
        self.delegate.stop().await
    }

    async fn close(&self) -> Result<()> {
        close_tracked(&self.node, self.sink.as_ref(), self.delegate.close()).await
    }

    fn client_id(&self) -> Option<String> {
        self.delegate.client_id()
    }
}

// ============================================================================
// Session
// ============================================================================

pub struct LeakDetectorSession {
    delegate: Box<dyn Session>,
    node: Arc<ResourceNode>,
    sink: Arc<dyn LeakSink>,
}

impl LeakDetectorSession {
    pub fn node(&self) -> &Arc<ResourceNode> {
        &self.node
    }

    fn track_consumer(&self, consumer: Box<dyn MessageConsumer>) -> Box<dyn MessageConsumer> {
        let node = self.node.attach_child(
            ResourceKind::MessageConsumer,
            Some(consumer.destination().to_string()),
        );
        Box::new(LeakDetectorMessageConsumer {
            delegate: consumer,
            node,
            sink: Arc::clone(&self.sink),
        })
    }
}

#[async_trait]
impl Session for LeakDetectorSession {
    async fn create_producer(
        &self,
        destination: Option<&Destination>,
    ) -> Result<Box<dyn MessageProducer>> {
        let producer = self.delegate.create_producer(destination).await?;
        let node = self.node.attach_child(
            ResourceKind::MessageProducer,
            producer.destination().map(|d| d.to_string()),
        );
        Ok(Box::new(LeakDetectorMessageProducer {
            delegate: producer,
            node,
            sink: Arc::clone(&self.sink),
        }))
    }

    async fn create_consumer(
        &self,
        destination: &Destination,
        options: ConsumerOptions,
    ) -> Result<Box<dyn MessageConsumer>> {
        let consumer = self.delegate.create_consumer(destination, options).await?;
        Ok(self.track_consumer(consumer))
    }

    async fn create_durable_subscriber(
        &self,
        topic: &Destination,
        subscription: &str,
        options: ConsumerOptions,
    ) -> Result<Box<dyn MessageConsumer>> {
        let consumer = self
            .delegate
            .create_durable_subscriber(topic, subscription, options)
            .await?;
        Ok(self.track_consumer(consumer))
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
        close_tracked(&self.node, self.sink.as_ref(), self.delegate.close()).await
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

pub struct LeakDetectorMessageProducer {
    delegate: Box<dyn MessageProducer>,
    node: Arc<ResourceNode>,
    sink: Arc<dyn LeakSink>,
}

#[async_trait]
impl MessageProducer for LeakDetectorMessageProducer {
    fn destination(&self) -> Option<Destination> {
        self.delegate.destination()
    }

    async fn send_with_options(
        &self,
        destination: Option<&Destination>,
        message: Message,
        options: SendOptions,
    ) -> Result<()> {
        self.delegate
            .send_with_options(destination, message, options)
            .await
    }

    async fn close(&self) -> Result<()> {
        close_tracked(&self.node, self.sink.as_ref(), self.delegate.close()).await
    }
}

pub struct LeakDetectorMessageConsumer {
    delegate: Box<dyn MessageConsumer>,
    node: Arc<ResourceNode>,
    sink: Arc<dyn LeakSink>,
}

#[async_trait]
impl MessageConsumer for LeakDetectorMessageConsumer {
    fn destination(&self) -> Destination {
        self.delegate.destination()
    }

    fn selector(&self) -> Option<String> {
        self.delegate.selector()
    }

    async fn receive_with(&self, mode: ReceiveMode) -> Result<Option<Message>> {
        self.delegate.receive_with(mode).await
    }

    async fn close(&self) -> Result<()> {
        close_tracked(&self.node, self.sink.as_ref(), self.delegate.close()).await
    }
}
