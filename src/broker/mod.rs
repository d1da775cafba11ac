//! Message-broker client contract.
//!
//! This module contains:
//! - `ConnectionFactory` / `Connection` / `Session` / `MessageProducer` /
//!   `MessageConsumer` traits: the resource hierarchy every decorator wraps
//! - `Message`, `Destination` and per-call options
//! - `BrokerError`: failures raised by a broker client
//! - Implementations: `InMemoryBroker` (in-process), `MockConnectionFactory`
//!   (failure injection)
//!
//! Parents own children: closing a parent should close its children first.
//! Every method takes `&self`, so a resource may be closed more than once;
//! implementations decide what a second close means.

use std::time::Duration;

use async_trait::async_trait;

pub mod memory;
mod message;
pub mod mock;

pub use memory::{FailurePoint, InMemoryBroker};
pub use mock::MockConnectionFactory;
pub use message::{
    AcknowledgeMode, ConsumerOptions, DeliveryMode, Destination, Message, MessageBody,
    ReceiveMode, SendOptions,
};

// ============================================================================
// Errors
// ============================================================================

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors raised by a broker client.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Invalid destination: {0}")]
    InvalidDestination(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("{0} is closed")]
    Closed(&'static str),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{message}")]
    Other {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl BrokerError {
    pub fn other(message: impl Into<String>) -> Self {
        BrokerError::Other {
            message: message.into(),
            source: None,
        }
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Produces connections to a message broker.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Open a connection with the default identity.
    async fn create_connection(&self) -> Result<Box<dyn Connection>>;

    /// Open a connection with explicit credentials.
    async fn create_connection_with_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Box<dyn Connection>>;
}

#[async_trait]
impl<F: ConnectionFactory + ?Sized> ConnectionFactory for std::sync::Arc<F> {
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

/// An open connection to the broker.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn create_session(
        &self,
        transacted: bool,
        acknowledge_mode: AcknowledgeMode,
    ) -> Result<Box<dyn Session>>;

    /// Start (or resume) delivery of incoming messages.
    async fn start(&self) -> Result<()>;

    /// Pause delivery of incoming messages.
    async fn stop(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    fn client_id(&self) -> Option<String>;
}

/// A single-threaded context for producing and consuming messages.
#[async_trait]
pub trait Session: Send + Sync {
    /// Create a producer. `None` means every send names its destination.
    async fn create_producer(
        &self,
        destination: Option<&Destination>,
    ) -> Result<Box<dyn MessageProducer>>;

    async fn create_consumer(
        &self,
        destination: &Destination,
        options: ConsumerOptions,
    ) -> Result<Box<dyn MessageConsumer>>;

    /// Create (or reattach to) a durable subscription on a topic.
    async fn create_durable_subscriber(
        &self,
        topic: &Destination,
        subscription: &str,
        options: ConsumerOptions,
    ) -> Result<Box<dyn MessageConsumer>>;

    /// Delete a durable subscription.
    async fn unsubscribe(&self, subscription: &str) -> Result<()>;

    async fn commit(&self) -> Result<()>;

    async fn rollback(&self) -> Result<()>;

    async fn recover(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    fn transacted(&self) -> bool;

    fn acknowledge_mode(&self) -> AcknowledgeMode;
}

/// Sends messages.
#[async_trait]
pub trait MessageProducer: Send + Sync {
    /// Default destination, if one was given at creation.
    fn destination(&self) -> Option<Destination>;

    /// Send `message` to `destination` (or the default one) with `options`.
    async fn send_with_options(
        &self,
        destination: Option<&Destination>,
        message: Message,
        options: SendOptions,
    ) -> Result<()>;

    /// Send to the default destination.
    async fn send(&self, message: Message) -> Result<()> {
        self.send_with_options(None, message, SendOptions::default())
            .await
    }

    /// Send to an explicit destination.
    async fn send_to(&self, destination: &Destination, message: Message) -> Result<()> {
        self.send_with_options(Some(destination), message, SendOptions::default())
            .await
    }

    async fn close(&self) -> Result<()>;
}

/// Receives messages.
#[async_trait]
pub trait MessageConsumer: Send + Sync {
    fn destination(&self) -> Destination;

    fn selector(&self) -> Option<String>;

    /// Receive one message, waiting according to `mode`.
    ///
    /// `Ok(None)` means no message was available in time, or the consumer
    /// was closed while waiting.
    async fn receive_with(&self, mode: ReceiveMode) -> Result<Option<Message>>;

    async fn receive(&self) -> Result<Option<Message>> {
        self.receive_with(ReceiveMode::Blocking).await
    }

    async fn receive_timeout(&self, timeout: Duration) -> Result<Option<Message>> {
        self.receive_with(ReceiveMode::Timeout(timeout)).await
    }

    async fn receive_no_wait(&self) -> Result<Option<Message>> {
        self.receive_with(ReceiveMode::NoWait).await
    }

    async fn close(&self) -> Result<()>;
}
