//! Counters shared by every resource created through one managed factory.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::management::{AttributeInfo, AttributeValue};

/// Broker resource kinds tracked by the statistics aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Connection,
    Session,
    MessageProducer,
    MessageConsumer,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Connection,
        ResourceKind::Session,
        ResourceKind::MessageProducer,
        ResourceKind::MessageConsumer,
    ];

    /// Tag used in attribute names (`createSession`, `activeMessageConsumer`).
    pub fn tag(self) -> &'static str {
        match self {
            ResourceKind::Connection => "Connection",
            ResourceKind::Session => "Session",
            ResourceKind::MessageProducer => "MessageProducer",
            ResourceKind::MessageConsumer => "MessageConsumer",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.tag() == tag)
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Measured message operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOperation {
    Send,
    Receive,
}

impl MessageOperation {
    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Default)]
struct LifecycleCounters {
    created: AtomicU64,
    closed: AtomicU64,
    create_failed: AtomicU64,
}

#[derive(Debug, Default)]
struct OperationCounters {
    count: AtomicU64,
    failed: AtomicU64,
    duration_nanos: AtomicU64,
}

pub(crate) const ATTRIBUTES: &[AttributeInfo] = &[
    AttributeInfo::read_only("createConnection", "Connections created, including failed attempts"),
    AttributeInfo::read_only("closeConnection", "Connections closed"),
    AttributeInfo::read_only("createConnectionExceptions", "Failed connection creations"),
    AttributeInfo::read_only("activeConnection", "Connections currently open"),
    AttributeInfo::read_only("createSession", "Sessions created, including failed attempts"),
    AttributeInfo::read_only("closeSession", "Sessions closed"),
    AttributeInfo::read_only("createSessionExceptions", "Failed session creations"),
    AttributeInfo::read_only("activeSession", "Sessions currently open"),
    AttributeInfo::read_only("createMessageProducer", "Producers created, including failed attempts"),
    AttributeInfo::read_only("closeMessageProducer", "Producers closed"),
    AttributeInfo::read_only("createMessageProducerExceptions", "Failed producer creations"),
    AttributeInfo::read_only("activeMessageProducer", "Producers currently open"),
    AttributeInfo::read_only("createMessageConsumer", "Consumers created, including failed attempts"),
    AttributeInfo::read_only("closeMessageConsumer", "Consumers closed"),
    AttributeInfo::read_only("createMessageConsumerExceptions", "Failed consumer creations"),
    AttributeInfo::read_only("activeMessageConsumer", "Consumers currently open"),
    AttributeInfo::read_only("sendMessage", "Messages sent, including failed sends"),
    AttributeInfo::read_only("sendMessageExceptions", "Failed sends"),
    AttributeInfo::read_only("sendMessageDuration", "Cumulated send time in milliseconds"),
    AttributeInfo::read_only("receiveMessage", "Receive calls, including failed ones"),
    AttributeInfo::read_only("receiveMessageExceptions", "Failed receive calls"),
    AttributeInfo::read_only("receiveMessageDuration", "Cumulated receive time in milliseconds"),
];

/// Lock-free counters for one connection factory.
///
/// Counters only go up. `active` is derived as `created - closed` on read
/// and may be skewed while operations are in flight.
#[derive(Debug, Default)]
pub struct BrokerStatistics {
    lifecycle: [LifecycleCounters; 4],
    operations: [OperationCounters; 2],
}

impl BrokerStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_created(&self, kind: ResourceKind) {
        self.lifecycle[kind.index()]
            .created
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_closed(&self, kind: ResourceKind) {
        self.lifecycle[kind.index()]
            .closed
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_create_failed(&self, kind: ResourceKind) {
        self.lifecycle[kind.index()]
            .create_failed
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn created(&self, kind: ResourceKind) -> u64 {
        self.lifecycle[kind.index()].created.load(Ordering::Relaxed)
    }

    pub fn closed(&self, kind: ResourceKind) -> u64 {
        self.lifecycle[kind.index()].closed.load(Ordering::Relaxed)
    }

    pub fn create_failed(&self, kind: ResourceKind) -> u64 {
        self.lifecycle[kind.index()]
            .create_failed
            .load(Ordering::Relaxed)
    }

    /// `created - closed`.
    pub fn active(&self, kind: ResourceKind) -> i64 {
        let closed = self.closed(kind) as i64;
        self.created(kind) as i64 - closed
    }

    /// Record one send or receive and its duration.
    pub fn record(&self, operation: MessageOperation, elapsed: Duration, succeeded: bool) {
        let counters = &self.operations[operation.index()];
        counters.count.fetch_add(1, Ordering::Relaxed);
        counters.duration_nanos.fetch_add(
            u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
        if !succeeded {
            counters.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn count(&self, operation: MessageOperation) -> u64 {
        self.operations[operation.index()]
            .count
            .load(Ordering::Relaxed)
    }

    pub fn failures(&self, operation: MessageOperation) -> u64 {
        self.operations[operation.index()]
            .failed
            .load(Ordering::Relaxed)
    }

    pub fn total_duration(&self, operation: MessageOperation) -> Duration {
        Duration::from_nanos(
            self.operations[operation.index()]
                .duration_nanos
                .load(Ordering::Relaxed),
        )
    }

    /// Value of a published attribute, `None` if the name is unknown.
    pub fn attribute(&self, attribute: &str) -> Option<AttributeValue> {
        let value = match attribute {
            "sendMessage" => self.count(MessageOperation::Send) as i64,
            "sendMessageExceptions" => self.failures(MessageOperation::Send) as i64,
            "sendMessageDuration" => self.total_duration(MessageOperation::Send).as_millis() as i64,
            "receiveMessage" => self.count(MessageOperation::Receive) as i64,
            "receiveMessageExceptions" => self.failures(MessageOperation::Receive) as i64,
            "receiveMessageDuration" => {
                self.total_duration(MessageOperation::Receive).as_millis() as i64
            }
            other => return self.lifecycle_attribute(other).map(AttributeValue::Integer),
        };
        Some(AttributeValue::Integer(value))
    }

    fn lifecycle_attribute(&self, attribute: &str) -> Option<i64> {
        if let Some(rest) = attribute.strip_prefix("create") {
            return match rest.strip_suffix("Exceptions") {
                Some(tag) => ResourceKind::from_tag(tag).map(|k| self.create_failed(k) as i64),
                None => ResourceKind::from_tag(rest).map(|k| self.created(k) as i64),
            };
        }
        if let Some(tag) = attribute.strip_prefix("close") {
            return ResourceKind::from_tag(tag).map(|k| self.closed(k) as i64);
        }
        attribute
            .strip_prefix("active")
            .and_then(ResourceKind::from_tag)
            .map(|k| self.active(k))
    }
}

// ============================================================================
// Guards
// ============================================================================

/// Counts one creation attempt when dropped.
///
/// The attempt counts as failed unless `succeeded` was called, so a
/// cancelled future is recorded as a failure.
pub(crate) struct CreateAttempt {
    statistics: Arc<BrokerStatistics>,
    kind: ResourceKind,
    succeeded: bool,
}

impl CreateAttempt {
    pub(crate) fn begin(statistics: &Arc<BrokerStatistics>, kind: ResourceKind) -> Self {
        Self {
            statistics: Arc::clone(statistics),
            kind,
            succeeded: false,
        }
    }

    /// Pass a delegate result through, marking the attempt accordingly.
    pub(crate) fn finish<T, E>(mut self, result: Result<T, E>) -> Result<T, E> {
        self.succeeded = result.is_ok();
        result
    }
}

impl Drop for CreateAttempt {
    fn drop(&mut self) {
        self.statistics.increment_created(self.kind);
        if !self.succeeded {
            self.statistics.increment_create_failed(self.kind);
        }
    }
}

/// Times one send or receive and records it when dropped.
pub(crate) struct OperationTimer {
    statistics: Arc<BrokerStatistics>,
    operation: MessageOperation,
    started: Instant,
    succeeded: bool,
}

impl OperationTimer {
    pub(crate) fn start(statistics: &Arc<BrokerStatistics>, operation: MessageOperation) -> Self {
        Self {
            statistics: Arc::clone(statistics),
            operation,
            started: Instant::now(),
            succeeded: false,
        }
    }

    pub(crate) fn finish<T, E>(mut self, result: Result<T, E>) -> Result<T, E> {
        self.succeeded = result.is_ok();
        result
    }
}

impl Drop for OperationTimer {
    fn drop(&mut self) {
        self.statistics
            .record(self.operation, self.started.elapsed(), self.succeeded);
    }
}

/// Counts one close when dropped, whatever the delegate returned.
pub(crate) struct CloseGuard<'a> {
    statistics: &'a BrokerStatistics,
    kind: ResourceKind,
}

impl<'a> CloseGuard<'a> {
    pub(crate) fn new(statistics: &'a BrokerStatistics, kind: ResourceKind) -> Self {
        Self { statistics, kind }
    }
}

impl Drop for CloseGuard<'_> {
    fn drop(&mut self) {
        self.statistics.increment_closed(self.kind);
    }
}
