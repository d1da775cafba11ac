//! Mock connection factory for testing.
//!
//! Wraps an `InMemoryBroker` and fails chosen operations on demand.

use async_trait::async_trait;

use super::memory::{FailurePoint, InMemoryBroker};
use super::{Connection, ConnectionFactory, Result};

/// Connection factory whose operations can be made to fail.
#[derive(Clone, Default)]
pub struct MockConnectionFactory {
    broker: InMemoryBroker,
}

impl MockConnectionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail (or stop failing) every call reaching `point`, on every
    /// resource created by this factory.
    pub fn set_fail_on(&self, point: FailurePoint, fail: bool) {
        self.broker.set_failure(point, fail);
    }

    /// The broker behind this factory.
    pub fn broker(&self) -> &InMemoryBroker {
        &self.broker
    }
}

#[async_trait]
impl ConnectionFactory for MockConnectionFactory {
    async fn create_connection(&self) -> Result<Box<dyn Connection>> {
        self.broker.create_connection().await
    }

    async fn create_connection_with_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Box<dyn Connection>> {
        self.broker
            .create_connection_with_credentials(username, password)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{AcknowledgeMode, Destination, Message};

    #[tokio::test]
    async fn test_mock_fail_on_send() {
        let factory = MockConnectionFactory::new();
        let connection = factory.create_connection().await.unwrap();
        let session = connection
            .create_session(false, AcknowledgeMode::Auto)
            .await
            .unwrap();
        let producer = session
            .create_producer(Some(&Destination::queue("q")))
            .await
            .unwrap();

        factory.set_fail_on(FailurePoint::Send, true);
        assert!(producer.send(Message::text("x")).await.is_err());
        assert_eq!(factory.broker().queue_depth("q"), 0);

        factory.set_fail_on(FailurePoint::Send, false);
        producer.send(Message::text("x")).await.unwrap();
        assert_eq!(factory.broker().queue_depth("q"), 1);
    }

    #[tokio::test]
    async fn test_mock_fail_on_create_session() {
        let factory = MockConnectionFactory::new();
        factory.set_fail_on(FailurePoint::CreateSession, true);
        let connection = factory.create_connection().await.unwrap();
        assert!(connection
            .create_session(false, AcknowledgeMode::Auto)
            .await
            .is_err());
    }
}
