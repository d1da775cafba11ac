//! Managed thread pools.
//!
//! `ThreadPoolExecutor` runs tasks on named OS threads and publishes its
//! sizes and counters as `<domain>:type=ThreadPoolExecutor,name=<name>`.
//! `ThreadPoolExecutorFactory` ties the pool's publication to its lifetime.

mod factory;
mod pool;

pub use factory::ThreadPoolExecutorFactory;
pub use pool::ThreadPoolExecutor;

use crate::config::ConfigError;
use crate::management::ManagementError;

/// Errors from pool construction and task submission.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Task rejected by pool '{pool}': {reason}")]
    Rejected { pool: String, reason: String },

    #[error("Pool '{pool}' is shut down")]
    Shutdown { pool: String },

    #[error("Invalid pool configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Pool publication failed: {0}")]
    Management(#[from] ManagementError),
}

pub type Result<T> = std::result::Result<T, ExecutorError>;
