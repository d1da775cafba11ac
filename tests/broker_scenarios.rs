//! End-to-end broker scenarios through the managed connection factory.

use std::sync::Arc;

use warden::advice::{ManagedConnectionFactory, ResourceKind};
use warden::broker::{
    AcknowledgeMode, ConnectionFactory, ConsumerOptions, Destination, InMemoryBroker, Message,
};
use warden::leak::RecordingLeakSink;
use warden::management::{AttributeValue, InMemoryManagementBus, ManagedObject, ManagementBus};

fn integer(factory: &ManagedConnectionFactory, attribute: &str) -> i64 {
    match factory.get_attribute(attribute).unwrap() {
        AttributeValue::Integer(value) => value,
        other => panic!("{attribute} is not an integer: {other:?}"),
    }
}

#[tokio::test]
async fn test_send_round_trip_counts_every_step() {
    let bus = Arc::new(InMemoryManagementBus::new());
    let factory = ManagedConnectionFactory::new(InMemoryBroker::new())
        .with_name("orders")
        .publish(bus.clone())
        .unwrap();
    let name = factory.object_name().unwrap();

    let connection = factory.create_connection().await.unwrap();
    let session = connection
        .create_session(false, AcknowledgeMode::Auto)
        .await
        .unwrap();
    let producer = session
        .create_producer(Some(&Destination::queue("q1")))
        .await
        .unwrap();
    producer.send(Message::text("order-1")).await.unwrap();

    assert_eq!(integer(&factory, "createConnection"), 1);
    assert_eq!(integer(&factory, "createSession"), 1);
    assert_eq!(integer(&factory, "createMessageProducer"), 1);
    assert_eq!(integer(&factory, "sendMessage"), 1);
    assert_eq!(integer(&factory, "activeMessageProducer"), 1);
    assert!(integer(&factory, "sendMessageDuration") >= 0);
    assert_eq!(
        bus.get_attribute(&name, "sendMessage").unwrap(),
        AttributeValue::Integer(1)
    );

    producer.close().await.unwrap();
    session.close().await.unwrap();
    connection.close().await.unwrap();

    for attribute in ["activeConnection", "activeSession", "activeMessageProducer"] {
        assert_eq!(integer(&factory, attribute), 0, "{attribute}");
    }
}

#[tokio::test]
async fn test_receive_no_wait_on_empty_queue_counts_receive() {
    let factory = ManagedConnectionFactory::new(InMemoryBroker::new());
    let connection = factory.create_connection().await.unwrap();
    connection.start().await.unwrap();
    let session = connection
        .create_session(false, AcknowledgeMode::Auto)
        .await
        .unwrap();
    let consumer = session
        .create_consumer(&Destination::queue("q1"), ConsumerOptions::default())
        .await
        .unwrap();

    assert!(consumer.receive_no_wait().await.unwrap().is_none());

    assert_eq!(integer(&factory, "receiveMessage"), 1);
    assert_eq!(integer(&factory, "receiveMessageExceptions"), 0);
    assert_eq!(integer(&factory, "activeMessageConsumer"), 1);
    connection.close().await.unwrap();
}

#[tokio::test]
async fn test_closing_connection_reports_leaked_sessions() {
    let sink = Arc::new(RecordingLeakSink::new());
    let factory =
        ManagedConnectionFactory::new(InMemoryBroker::new()).with_leak_sink(sink.clone());

    let connection = factory.create_connection().await.unwrap();
    let _first = connection
        .create_session(false, AcknowledgeMode::Auto)
        .await
        .unwrap();
    let _second = connection
        .create_session(true, AcknowledgeMode::Client)
        .await
        .unwrap();

    connection.close().await.unwrap();

    let reports = sink.reports();
    assert_eq!(reports.len(), 2);
    let thread = std::thread::current().name().unwrap_or("<unnamed>").to_string();
    for report in &reports {
        assert!(report.parent.starts_with("Connection#"));
        assert!(report.child.starts_with("Session#"));
        assert_eq!(report.child_kind, Some(ResourceKind::Session));
        assert_eq!(report.context.thread_name(), thread);
    }
    assert_ne!(reports[0].child, reports[1].child);
    assert_eq!(integer(&factory, "activeConnection"), 0);
}
