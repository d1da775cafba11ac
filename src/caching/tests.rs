use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::advice::ManagedConnectionFactory;
use crate::broker::{FailurePoint, InMemoryBroker, MockConnectionFactory};
use crate::management::InMemoryManagementBus;

fn counter(factory: &ManagedConnectionFactory, attribute: &str) -> i64 {
    factory.get_attribute(attribute).unwrap().as_i64().unwrap()
}

/// Caching factory over a counting factory, so physical creations show up
/// in its statistics.
fn counted() -> (Arc<ManagedConnectionFactory>, CachingConnectionFactory) {
    let managed = Arc::new(ManagedConnectionFactory::new(InMemoryBroker::new()));
    let caching = CachingConnectionFactory::new(Arc::clone(&managed));
    (managed, caching)
}

#[tokio::test]
async fn test_connections_share_one_target() {
    let (managed, caching) = counted();
    let first = caching.create_connection().await.unwrap();
    let second = caching.create_connection().await.unwrap();

    assert_eq!(counter(&managed, "createConnection"), 1);
    first.close().await.unwrap();
    second.close().await.unwrap();
    assert_eq!(counter(&managed, "activeConnection"), 1);
    assert!(caching.is_connected());
}

#[tokio::test]
async fn test_closed_session_is_reused() {
    let (managed, caching) = counted();
    let connection = caching.create_connection().await.unwrap();

    let session = connection
        .create_session(false, AcknowledgeMode::Auto)
        .await
        .unwrap();
    session.close().await.unwrap();
    session.close().await.unwrap();
    assert_eq!(caching.cached_session_count(), 1);

    let again = connection
        .create_session(false, AcknowledgeMode::Auto)
        .await
        .unwrap();
    assert_eq!(counter(&managed, "createSession"), 1);
    assert_eq!(caching.cached_session_count(), 0);

    let other_kind = connection
        .create_session(false, AcknowledgeMode::Client)
        .await
        .unwrap();
    assert_eq!(counter(&managed, "createSession"), 2);
    assert_eq!(other_kind.acknowledge_mode(), AcknowledgeMode::Client);
    again.close().await.unwrap();
}

#[tokio::test]
async fn test_sessions_beyond_cache_size_are_closed() {
    let (managed, caching) = counted();
    let caching = caching.with_session_cache_size(2);
    let connection = caching.create_connection().await.unwrap();

    let mut sessions = Vec::new();
    for _ in 0..3 {
        sessions.push(
            connection
                .create_session(false, AcknowledgeMode::Auto)
                .await
                .unwrap(),
        );
    }
    for session in &sessions {
        session.close().await.unwrap();
    }

    assert_eq!(caching.cached_session_count(), 2);
    assert_eq!(counter(&managed, "activeSession"), 2);
}

#[tokio::test]
async fn test_closed_session_rejects_calls() {
    let (_managed, caching) = counted();
    let connection = caching.create_connection().await.unwrap();
    let session = connection
        .create_session(false, AcknowledgeMode::Auto)
        .await
        .unwrap();
    session.close().await.unwrap();

    assert!(matches!(
        session.create_producer(None).await,
        Err(BrokerError::Closed("Session"))
    ));
}

#[tokio::test]
async fn test_producers_are_cached_per_destination() {
    let (managed, caching) = counted();
    let connection = caching.create_connection().await.unwrap();
    let queue = Destination::queue("orders");

    let session = connection
        .create_session(false, AcknowledgeMode::Auto)
        .await
        .unwrap();
    let producer = session.create_producer(Some(&queue)).await.unwrap();
    producer.send(Message::text("one")).await.unwrap();
    producer.close().await.unwrap();
    session.close().await.unwrap();

    let session = connection
        .create_session(false, AcknowledgeMode::Auto)
        .await
        .unwrap();
    let producer = session.create_producer(Some(&queue)).await.unwrap();
    producer.send(Message::text("two")).await.unwrap();
    let _anonymous = session.create_producer(None).await.unwrap();

    assert_eq!(counter(&managed, "createMessageProducer"), 2);
    assert_eq!(counter(&managed, "sendMessage"), 2);
    assert_eq!(producer.destination(), Some(queue));
}

#[tokio::test]
async fn test_producer_caching_can_be_disabled() {
    let (managed, caching) = counted();
    caching.set_cache_producers(false);
    let connection = caching.create_connection().await.unwrap();
    let session = connection
        .create_session(false, AcknowledgeMode::Auto)
        .await
        .unwrap();
    let queue = Destination::queue("orders");

    session.create_producer(Some(&queue)).await.unwrap().close().await.unwrap();
    session.create_producer(Some(&queue)).await.unwrap().close().await.unwrap();

    assert_eq!(counter(&managed, "createMessageProducer"), 2);
    assert_eq!(counter(&managed, "activeMessageProducer"), 0);
}

#[tokio::test]
async fn test_consumers_are_cached_by_selector() {
    let (managed, caching) = counted();
    let connection = caching.create_connection().await.unwrap();
    connection.start().await.unwrap();
    let queue = Destination::queue("orders");
    let session = connection
        .create_session(false, AcknowledgeMode::Auto)
        .await
        .unwrap();

    let first = session
        .create_consumer(&queue, ConsumerOptions::default())
        .await
        .unwrap();
    first.close().await.unwrap();
    let second = session
        .create_consumer(&queue, ConsumerOptions::default())
        .await
        .unwrap();
    let _selected = session
        .create_consumer(&queue, ConsumerOptions::with_selector("kind = 'a'"))
        .await
        .unwrap();
    assert_eq!(counter(&managed, "createMessageConsumer"), 2);

    let producer = session.create_producer(Some(&queue)).await.unwrap();
    producer.send(Message::text("hello")).await.unwrap();
    let received = second
        .receive_timeout(Duration::from_millis(200))
        .await
        .unwrap();
    assert!(received.is_some());
}

#[tokio::test]
async fn test_unsubscribe_closes_cached_subscriber() {
    let (managed, caching) = counted();
    let connection = caching.create_connection().await.unwrap();
    let topic = Destination::topic("prices");
    let session = connection
        .create_session(false, AcknowledgeMode::Auto)
        .await
        .unwrap();

    let subscriber = session
        .create_durable_subscriber(&topic, "ticker", ConsumerOptions::default())
        .await
        .unwrap();
    subscriber.close().await.unwrap();
    assert_eq!(counter(&managed, "activeMessageConsumer"), 1);

    session.unsubscribe("ticker").await.unwrap();
    assert_eq!(counter(&managed, "activeMessageConsumer"), 0);
}

#[tokio::test]
async fn test_transacted_session_rolled_back_before_reuse() {
    let broker = InMemoryBroker::new();
    let caching = CachingConnectionFactory::new(broker.clone());
    let connection = caching.create_connection().await.unwrap();
    let queue = Destination::queue("payments");

    let session = connection
        .create_session(true, AcknowledgeMode::Auto)
        .await
        .unwrap();
    let producer = session.create_producer(Some(&queue)).await.unwrap();
    producer.send(Message::text("uncommitted")).await.unwrap();
    session.close().await.unwrap();
    assert_eq!(caching.cached_session_count(), 1);

    let session = connection
        .create_session(true, AcknowledgeMode::Auto)
        .await
        .unwrap();
    session.commit().await.unwrap();
    assert_eq!(broker.queue_depth("payments"), 0);
}

#[tokio::test]
async fn test_stop_leaves_shared_connection_delivering() {
    let (_managed, caching) = counted();
    let queue = Destination::queue("orders");
    let listener = caching.create_connection().await.unwrap();
    listener.start().await.unwrap();
    let sender = caching.create_connection().await.unwrap();
    sender.stop().await.unwrap();

    let session = listener
        .create_session(false, AcknowledgeMode::Auto)
        .await
        .unwrap();
    let consumer = session
        .create_consumer(&queue, ConsumerOptions::default())
        .await
        .unwrap();
    session
        .create_producer(Some(&queue))
        .await
        .unwrap()
        .send(Message::text("still flowing"))
        .await
        .unwrap();

    assert!(consumer.receive_no_wait().await.unwrap().is_some());
    assert!(sender.create_session(false, AcknowledgeMode::Auto).await.is_ok());
}

#[tokio::test]
async fn test_closed_connection_proxy_rejects_sessions() {
    let (_managed, caching) = counted();
    let connection = caching.create_connection().await.unwrap();
    connection.close().await.unwrap();
    assert!(matches!(
        connection.create_session(false, AcknowledgeMode::Auto).await,
        Err(BrokerError::Closed("Connection"))
    ));
}

#[tokio::test]
async fn test_reset_connection_reconnects_on_next_use() {
    let (managed, caching) = counted();
    let connection = caching.create_connection().await.unwrap();
    connection.start().await.unwrap();
    let session = connection
        .create_session(false, AcknowledgeMode::Auto)
        .await
        .unwrap();
    session.close().await.unwrap();

    caching.reset_connection().await;
    assert!(!caching.is_connected());
    assert_eq!(caching.cached_session_count(), 0);
    assert_eq!(counter(&managed, "activeConnection"), 0);
    assert_eq!(counter(&managed, "activeSession"), 0);

    let session = connection
        .create_session(false, AcknowledgeMode::Auto)
        .await
        .unwrap();
    assert_eq!(counter(&managed, "createConnection"), 2);
    assert_eq!(counter(&managed, "activeConnection"), 1);

    session.close().await.unwrap();
    assert_eq!(caching.cached_session_count(), 1);
}

#[tokio::test]
async fn test_session_from_discarded_connection_is_not_cached() {
    let (managed, caching) = counted();
    let connection = caching.create_connection().await.unwrap();
    let stale = connection
        .create_session(false, AcknowledgeMode::Auto)
        .await
        .unwrap();

    caching.reset_connection().await;
    stale.close().await.unwrap();

    assert_eq!(caching.cached_session_count(), 0);
    assert_eq!(counter(&managed, "activeSession"), 0);
}

#[tokio::test]
async fn test_reconnect_on_exception_discards_connection() {
    let mock = MockConnectionFactory::new();
    let caching = CachingConnectionFactory::new(mock.clone());
    let connection = caching.create_connection().await.unwrap();

    mock.set_fail_on(FailurePoint::CreateSession, true);
    assert!(connection
        .create_session(false, AcknowledgeMode::Auto)
        .await
        .is_err());
    assert!(caching.is_connected());

    caching.set_reconnect_on_exception(true);
    assert!(connection
        .create_session(false, AcknowledgeMode::Auto)
        .await
        .is_err());
    assert!(!caching.is_connected());

    mock.set_fail_on(FailurePoint::CreateSession, false);
    assert!(connection
        .create_session(false, AcknowledgeMode::Auto)
        .await
        .is_ok());
    assert!(caching.is_connected());
}

#[tokio::test]
async fn test_credentials_bypass_the_cache() {
    let (managed, caching) = counted();
    let _shared = caching.create_connection().await.unwrap();
    let own = caching
        .create_connection_with_credentials("audit", "secret")
        .await
        .unwrap();
    own.close().await.unwrap();

    assert_eq!(counter(&managed, "createConnection"), 2);
    assert_eq!(counter(&managed, "activeConnection"), 1);
}

// ============================================================================
// Publication
// ============================================================================

#[tokio::test]
async fn test_published_attributes_are_tunable() {
    let bus = Arc::new(InMemoryManagementBus::new());
    let caching = CachingConnectionFactory::new(InMemoryBroker::new())
        .with_domain("broker")
        .with_name("orders")
        .publish(bus.clone())
        .unwrap();
    let name = caching.object_name().unwrap();
    assert_eq!(
        name.to_string(),
        "broker:type=CachingConnectionFactory,name=orders"
    );

    assert_eq!(
        bus.get_attribute(&name, "SessionCacheSize").unwrap(),
        AttributeValue::Integer(1)
    );
    bus.set_attribute(&name, "SessionCacheSize", AttributeValue::Integer(5))
        .unwrap();
    bus.set_attribute(&name, "CacheProducers", AttributeValue::Bool(false))
        .unwrap();
    bus.set_attribute(&name, "ReconnectOnException", AttributeValue::Text("true".into()))
        .unwrap();
    assert_eq!(caching.session_cache_size(), 5);
    assert!(!caching.cache_producers());
    assert!(caching.reconnect_on_exception());

    assert!(matches!(
        bus.set_attribute(&name, "SessionCacheSize", AttributeValue::Integer(0)),
        Err(ManagementError::InvalidValue { .. })
    ));
    assert!(matches!(
        bus.set_attribute(&name, "CachedSessionCount", AttributeValue::Integer(3)),
        Err(ManagementError::ReadOnlyAttribute { .. })
    ));
    assert_eq!(
        bus.get_attribute(&name, "Connected").unwrap(),
        AttributeValue::Bool(false)
    );
}

#[tokio::test]
async fn test_reset_operation_on_bus() {
    let bus = Arc::new(InMemoryManagementBus::new());
    let managed = Arc::new(ManagedConnectionFactory::new(InMemoryBroker::new()));
    let caching = CachingConnectionFactory::new(Arc::clone(&managed))
        .with_name("orders")
        .publish(bus.clone())
        .unwrap();
    let name = caching.object_name().unwrap();

    let connection = caching.create_connection().await.unwrap();
    connection
        .create_session(false, AcknowledgeMode::Auto)
        .await
        .unwrap()
        .close()
        .await
        .unwrap();

    bus.invoke(&name, RESET_CONNECTION, &[]).unwrap();
    assert!(!caching.is_connected());
    assert_eq!(caching.cached_session_count(), 0);

    for _ in 0..50 {
        if counter(&managed, "activeConnection") == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(counter(&managed, "activeConnection"), 0);
    assert_eq!(counter(&managed, "activeSession"), 0);
}

#[test]
fn test_config_tunables_are_applied() {
    let config = CachingConfig {
        session_cache_size: 3,
        cache_producers: false,
        cache_consumers: true,
        reconnect_on_exception: true,
    };
    let caching = CachingConnectionFactory::from_config(InMemoryBroker::new(), &config);
    assert_eq!(caching.session_cache_size(), 3);
    assert!(!caching.cache_producers());
    assert!(caching.cache_consumers());
    assert!(caching.reconnect_on_exception());
}
