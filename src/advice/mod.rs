//! Statistics advice for broker clients.
//!
//! This module provides wrapper types that count resource lifecycles and
//! time message operations without touching the wrapped client:
//!
//! ```ignore
//! // Plain client
//! let broker = InMemoryBroker::new();
//!
//! // Apply advice
//! let factory = ManagedConnectionFactory::new(broker)
//!     .with_name("orders")
//!     .publish(bus)?;
//!
//! // Use as normal - counters are transparent
//! let connection = factory.create_connection().await?;
//! ```
//!
//! # Available Advice
//!
//! - [`ManagedConnectionFactory`] - root decorator, owns [`BrokerStatistics`]
//!   and publishes them; optionally tracks leaks
//! - [`ManagedConnection`], [`ManagedSession`], [`ManagedMessageProducer`],
//!   [`ManagedMessageConsumer`] - returned by the layer above
//!
//! Creation counters are incremented on every attempt, so
//! `active = created - closed` holds whether or not creations fail.

mod managed;
mod statistics;

pub use managed::{
    ManagedConnection, ManagedConnectionFactory, ManagedMessageConsumer, ManagedMessageProducer,
    ManagedSession, DUMP_ALL_OPEN_RESOURCES,
};
pub use statistics::{BrokerStatistics, MessageOperation, ResourceKind};
