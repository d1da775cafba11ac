use std::time::Duration;

use super::*;

async fn started_session(broker: &InMemoryBroker) -> (Box<dyn Connection>, Box<dyn Session>) {
    let connection = broker.create_connection().await.unwrap();
    connection.start().await.unwrap();
    let session = connection
        .create_session(false, AcknowledgeMode::Auto)
        .await
        .unwrap();
    (connection, session)
}

#[tokio::test]
async fn test_queue_round_trip() {
    let broker = InMemoryBroker::new();
    let (_connection, session) = started_session(&broker).await;
    let queue = Destination::queue("q1");

    let producer = session.create_producer(Some(&queue)).await.unwrap();
    let consumer = session
        .create_consumer(&queue, ConsumerOptions::default())
        .await
        .unwrap();

    producer.send(Message::text("hello")).await.unwrap();
    let received = consumer.receive_no_wait().await.unwrap().unwrap();

    assert_eq!(received.text_body(), Some("hello"));
    assert_eq!(received.destination, Some(queue));
    assert!(received.id.is_some());
    assert!(consumer.receive_no_wait().await.unwrap().is_none());
}

#[tokio::test]
async fn test_delivery_waits_for_connection_start() {
    let broker = InMemoryBroker::new();
    let connection = broker.create_connection().await.unwrap();
    let session = connection
        .create_session(false, AcknowledgeMode::Auto)
        .await
        .unwrap();
    let queue = Destination::queue("gated");
    let producer = session.create_producer(None).await.unwrap();
    let consumer = session
        .create_consumer(&queue, ConsumerOptions::default())
        .await
        .unwrap();

    producer.send_to(&queue, Message::text("m")).await.unwrap();
    assert!(consumer.receive_no_wait().await.unwrap().is_none());
    assert_eq!(broker.queue_depth("gated"), 1);

    connection.start().await.unwrap();
    assert!(consumer.receive_no_wait().await.unwrap().is_some());
}

#[tokio::test]
async fn test_blocking_receive_wakes_on_send() {
    let broker = InMemoryBroker::new();
    let (_connection, session) = started_session(&broker).await;
    let queue = Destination::queue("wake");
    let consumer = session
        .create_consumer(&queue, ConsumerOptions::default())
        .await
        .unwrap();
    let producer = session.create_producer(Some(&queue)).await.unwrap();

    let receiver = tokio::spawn(async move { consumer.receive().await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    producer.send(Message::text("late")).await.unwrap();

    let received = receiver.await.unwrap().unwrap().unwrap();
    assert_eq!(received.text_body(), Some("late"));
}

#[tokio::test]
async fn test_receive_timeout_returns_none() {
    let broker = InMemoryBroker::new();
    let (_connection, session) = started_session(&broker).await;
    let consumer = session
        .create_consumer(&Destination::queue("empty"), ConsumerOptions::default())
        .await
        .unwrap();

    let result = consumer
        .receive_timeout(Duration::from_millis(20))
        .await
        .unwrap();
    assert!(result.is_none());
}

#[tokio::test]
async fn test_topic_delivers_to_every_subscriber() {
    let broker = InMemoryBroker::new();
    let (_connection, session) = started_session(&broker).await;
    let topic = Destination::topic("prices");

    let first = session
        .create_consumer(&topic, ConsumerOptions::default())
        .await
        .unwrap();
    let second = session
        .create_consumer(&topic, ConsumerOptions::default())
        .await
        .unwrap();
    let producer = session.create_producer(Some(&topic)).await.unwrap();
    producer.send(Message::text("tick")).await.unwrap();

    assert!(first.receive_no_wait().await.unwrap().is_some());
    assert!(second.receive_no_wait().await.unwrap().is_some());
}

#[tokio::test]
async fn test_no_local_skips_own_connection() {
    let broker = InMemoryBroker::new();
    let (_connection, session) = started_session(&broker).await;
    let topic = Destination::topic("chat");

    let consumer = session
        .create_consumer(
            &topic,
            ConsumerOptions {
                selector: None,
                no_local: true,
            },
        )
        .await
        .unwrap();
    let producer = session.create_producer(Some(&topic)).await.unwrap();
    producer.send(Message::text("echo")).await.unwrap();

    assert!(consumer.receive_no_wait().await.unwrap().is_none());
}

#[tokio::test]
async fn test_durable_subscription_survives_consumer_close() {
    let broker = InMemoryBroker::new();
    let (_connection, session) = started_session(&broker).await;
    let topic = Destination::topic("audit");

    let subscriber = session
        .create_durable_subscriber(&topic, "audit-log", ConsumerOptions::default())
        .await
        .unwrap();
    subscriber.close().await.unwrap();

    let producer = session.create_producer(Some(&topic)).await.unwrap();
    producer.send(Message::text("while away")).await.unwrap();

    let subscriber = session
        .create_durable_subscriber(&topic, "audit-log", ConsumerOptions::default())
        .await
        .unwrap();
    let received = subscriber.receive_no_wait().await.unwrap().unwrap();
    assert_eq!(received.text_body(), Some("while away"));

    assert!(session.unsubscribe("audit-log").await.is_err());
    subscriber.close().await.unwrap();
    session.unsubscribe("audit-log").await.unwrap();
    assert!(broker.durable_subscriptions().is_empty());
}

#[tokio::test]
async fn test_durable_subscriber_requires_topic() {
    let broker = InMemoryBroker::new();
    let (_connection, session) = started_session(&broker).await;
    let result = session
        .create_durable_subscriber(&Destination::queue("q"), "s", ConsumerOptions::default())
        .await;
    assert!(matches!(result, Err(BrokerError::InvalidDestination(_))));
}

#[tokio::test]
async fn test_transacted_session_buffers_until_commit() {
    let broker = InMemoryBroker::new();
    let connection = broker.create_connection().await.unwrap();
    let session = connection
        .create_session(true, AcknowledgeMode::Auto)
        .await
        .unwrap();
    let producer = session
        .create_producer(Some(&Destination::queue("tx")))
        .await
        .unwrap();

    producer.send(Message::text("rolled back")).await.unwrap();
    session.rollback().await.unwrap();
    assert_eq!(broker.queue_depth("tx"), 0);

    producer.send(Message::text("committed")).await.unwrap();
    assert_eq!(broker.queue_depth("tx"), 0);
    session.commit().await.unwrap();
    assert_eq!(broker.queue_depth("tx"), 1);
}

#[tokio::test]
async fn test_commit_requires_transacted_session() {
    let broker = InMemoryBroker::new();
    let (_connection, session) = started_session(&broker).await;
    assert!(matches!(
        session.commit().await,
        Err(BrokerError::IllegalState(_))
    ));
    session.recover().await.unwrap();
}

#[tokio::test]
async fn test_closed_parent_closes_children() {
    let broker = InMemoryBroker::new();
    let (connection, session) = started_session(&broker).await;
    let producer = session
        .create_producer(Some(&Destination::queue("q")))
        .await
        .unwrap();

    connection.close().await.unwrap();
    connection.close().await.unwrap();

    assert!(matches!(
        producer.send(Message::empty()).await,
        Err(BrokerError::Closed(_))
    ));
    assert!(session.create_producer(None).await.is_err());
}

#[tokio::test]
async fn test_send_without_destination_fails() {
    let broker = InMemoryBroker::new();
    let (_connection, session) = started_session(&broker).await;
    let producer = session.create_producer(None).await.unwrap();
    assert!(matches!(
        producer.send(Message::empty()).await,
        Err(BrokerError::InvalidDestination(_))
    ));
}

#[tokio::test]
async fn test_expired_messages_are_dropped() {
    let broker = InMemoryBroker::new();
    let (_connection, session) = started_session(&broker).await;
    let queue = Destination::queue("ttl");
    let producer = session.create_producer(Some(&queue)).await.unwrap();
    let consumer = session
        .create_consumer(&queue, ConsumerOptions::default())
        .await
        .unwrap();

    let options = SendOptions {
        time_to_live: Some(Duration::from_millis(1)),
        ..SendOptions::default()
    };
    producer
        .send_with_options(None, Message::text("stale"), options)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(consumer.receive_no_wait().await.unwrap().is_none());
}

#[tokio::test]
async fn test_credentials_are_checked() {
    let broker = InMemoryBroker::with_credentials("app", "secret");
    assert!(broker.create_connection().await.is_err());
    assert!(broker
        .create_connection_with_credentials("app", "wrong")
        .await
        .is_err());
    assert!(broker
        .create_connection_with_credentials("app", "secret")
        .await
        .is_ok());
}

#[tokio::test]
async fn test_injected_failure() {
    let broker = InMemoryBroker::new();
    broker.set_failure(FailurePoint::CreateConnection, true);
    assert!(broker.create_connection().await.is_err());
    broker.set_failure(FailurePoint::CreateConnection, false);
    assert!(broker.create_connection().await.is_ok());
}
