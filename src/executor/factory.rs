use std::ops::Deref;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{info, warn};

use super::{Result, ThreadPoolExecutor};
use crate::config::ExecutorConfig;
use crate::management::{ManagedObject, ManagementBus, ObjectName};

/// Owns a published thread pool.
///
/// Closing or dropping the factory unregisters the pool and shuts it down;
/// queued tasks still run.
pub struct ThreadPoolExecutorFactory {
    executor: Arc<ThreadPoolExecutor>,
    bus: Arc<dyn ManagementBus>,
    registered: Mutex<Option<ObjectName>>,
}

impl ThreadPoolExecutorFactory {
    /// Build the pool described by `config` and publish it on `bus`.
    pub fn create(
        config: &ExecutorConfig,
        domain: &str,
        bus: Arc<dyn ManagementBus>,
    ) -> Result<Self> {
        let executor = Arc::new(ThreadPoolExecutor::new(config, domain)?);
        let name = bus.publish(Arc::clone(&executor) as Arc<dyn ManagedObject>)?;
        info!(name = %name, "Published thread pool");
        Ok(Self {
            executor,
            bus,
            registered: Mutex::new(Some(name)),
        })
    }

    /// Build and publish every configured pool. Pools built before a
    /// failure are closed again.
    pub fn create_all(
        configs: &[ExecutorConfig],
        domain: &str,
        bus: Arc<dyn ManagementBus>,
    ) -> Result<Vec<Self>> {
        configs
            .iter()
            .map(|config| Self::create(config, domain, Arc::clone(&bus)))
            .collect()
    }

    pub fn executor(&self) -> Arc<ThreadPoolExecutor> {
        Arc::clone(&self.executor)
    }

    /// Name the pool is published under, until closed.
    pub fn object_name(&self) -> Option<ObjectName> {
        self.registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Unregister and shut down the pool. Idempotent.
    pub fn close(&self) {
        let registered = self
            .registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(name) = registered {
            if let Err(e) = self.bus.unregister(&name) {
                warn!(name = %name, error = %e, "Failed to unregister thread pool");
            }
        }
        self.executor.shutdown();
    }
}

impl Deref for ThreadPoolExecutorFactory {
    type Target = ThreadPoolExecutor;

    fn deref(&self) -> &Self::Target {
        &self.executor
    }
}

impl Drop for ThreadPoolExecutorFactory {
    fn drop(&mut self) {
        self.close();
    }
}
