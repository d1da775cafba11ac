//! Open-resource leak detection for broker clients.
//!
//! `LeakDetectorConnectionFactory` wraps a factory and mirrors every open
//! connection, session, producer and consumer into a tree of
//! `ResourceNode`s, each carrying the `CreationContext` captured when the
//! resource was returned by its delegate.
//!
//! Closing a parent while children are still registered is a leak: one
//! `LeakReport` per open child goes to the `LeakSink`, then the close
//! proceeds normally. Nodes unregister only after their delegate closed
//! successfully.
//!
//! ```ignore
//! let factory = LeakDetectorConnectionFactory::new(InMemoryBroker::new());
//! let connection = factory.create_connection().await?;
//! let _session = connection.create_session(false, AcknowledgeMode::Auto).await?;
//! connection.close().await?; // warns about the open session
//! ```

mod context;
mod detector;
mod node;
mod sink;

pub use context::CreationContext;
pub use detector::{
    LeakDetectorConnection, LeakDetectorConnectionFactory, LeakDetectorMessageConsumer,
    LeakDetectorMessageProducer, LeakDetectorSession,
};
pub use node::ResourceNode;
pub use sink::{LeakReport, LeakSink, RecordingLeakSink, TracingLeakSink};
