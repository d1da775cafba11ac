//! Messages, destinations and per-call options.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Where a message is sent to or consumed from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Destination {
    /// Point-to-point: each message is delivered to one consumer.
    Queue(String),
    /// Publish/subscribe: each message is delivered to every subscriber.
    Topic(String),
}

impl Destination {
    pub fn queue(name: impl Into<String>) -> Self {
        Destination::Queue(name.into())
    }

    pub fn topic(name: impl Into<String>) -> Self {
        Destination::Topic(name.into())
    }

    pub fn name(&self) -> &str {
        match self {
            Destination::Queue(name) | Destination::Topic(name) => name,
        }
    }

    pub fn is_topic(&self) -> bool {
        matches!(self, Destination::Topic(_))
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Queue(name) => write!(f, "queue://{name}"),
            Destination::Topic(name) => write!(f, "topic://{name}"),
        }
    }
}

/// How a session acknowledges consumed messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum AcknowledgeMode {
    #[default]
    Auto,
    Client,
    DupsOk,
}

/// Whether the broker keeps a message across restarts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    #[default]
    Persistent,
    NonPersistent,
}

/// Delivery options for one send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    pub delivery_mode: DeliveryMode,
    /// 0 (lowest) to 9 (highest).
    pub priority: u8,
    /// `None` means the message never expires.
    pub time_to_live: Option<Duration>,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            delivery_mode: DeliveryMode::Persistent,
            priority: 4,
            time_to_live: None,
        }
    }
}

/// Options for creating a consumer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerOptions {
    /// Message selector expression, forwarded verbatim to the broker.
    pub selector: Option<String>,
    /// Do not deliver messages published by the consumer's own connection.
    pub no_local: bool,
}

impl ConsumerOptions {
    pub fn with_selector(selector: impl Into<String>) -> Self {
        Self {
            selector: Some(selector.into()),
            no_local: false,
        }
    }
}

/// How long a receive may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveMode {
    /// Wait until a message arrives or the consumer is closed.
    Blocking,
    /// Wait at most the given duration.
    Timeout(Duration),
    /// Return immediately.
    NoWait,
}

/// Payload of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Empty,
    Text(String),
    Bytes(Vec<u8>),
}

/// A broker message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: Option<String>,
    pub body: MessageBody,
    pub properties: BTreeMap<String, String>,
    pub destination: Option<Destination>,
    pub timestamp: Option<DateTime<Utc>>,
    pub delivery_mode: DeliveryMode,
    pub priority: u8,
    pub expiration: Option<DateTime<Utc>>,
}

impl Message {
    fn with_body(body: MessageBody) -> Self {
        Self {
            id: None,
            body,
            properties: BTreeMap::new(),
            destination: None,
            timestamp: None,
            delivery_mode: DeliveryMode::Persistent,
            priority: 4,
            expiration: None,
        }
    }

    pub fn empty() -> Self {
        Self::with_body(MessageBody::Empty)
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::with_body(MessageBody::Text(text.into()))
    }

    pub fn bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self::with_body(MessageBody::Bytes(bytes.into()))
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn text_body(&self) -> Option<&str> {
        match &self.body {
            MessageBody::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Whether the message expired at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration.is_some_and(|at| at <= now)
    }
}
