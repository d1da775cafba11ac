//! Managed relational connection pools.
//!
//! The pool itself is supplied by the caller through `PooledDataSource`;
//! `DataSourceFactory` builds it from a `DataSourceConfig`, publishes it as
//! `<domain>:type=DataSource,name=<name>` and unpublishes and closes it
//! when closed or dropped.

pub mod memory;

use std::ops::Deref;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{info, warn};

use crate::config::{ConfigError, DataSourceConfig};
use crate::management::{
    self, AttributeInfo, AttributeValue, ManagedObject, ManagementBus, ManagementError,
    ObjectName,
};

pub use memory::{InMemoryDataSource, Lease};

/// Errors from building, publishing or using a pool.
#[derive(Debug, thiserror::Error)]
pub enum DataSourceError {
    #[error("Invalid data source configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Data source publication failed: {0}")]
    Management(#[from] ManagementError),

    #[error("Pool error: {0}")]
    Pool(String),
}

pub type Result<T> = std::result::Result<T, DataSourceError>;

/// Live view and tunables of a relational connection pool.
pub trait PooledDataSource: Send + Sync {
    /// Connections currently checked out.
    fn num_active(&self) -> usize;

    /// Connections idle in the pool.
    fn num_idle(&self) -> usize;

    fn max_active(&self) -> u32;
    fn set_max_active(&self, max_active: u32);

    fn max_idle(&self) -> u32;
    fn set_max_idle(&self, max_idle: u32);

    fn min_idle(&self) -> u32 {
        0
    }

    /// How long a checkout waits for a free connection.
    fn max_wait(&self) -> Duration;
    fn set_max_wait(&self, max_wait: Duration);

    /// Close the pool and every idle connection.
    fn close(&self) -> Result<()>;
}

const ATTRIBUTES: &[AttributeInfo] = &[
    AttributeInfo::read_only("NumActive", "Connections currently checked out"),
    AttributeInfo::read_only("NumIdle", "Connections idle in the pool"),
    AttributeInfo::read_only("Url", "Connection URL"),
    AttributeInfo::read_only("Username", "Connection user"),
    AttributeInfo::read_write("MaxActive", "Maximum connections checked out at once"),
    AttributeInfo::read_write("MaxIdle", "Maximum idle connections"),
    AttributeInfo::read_write("MaxWait", "Checkout wait in milliseconds"),
    AttributeInfo::read_only("MinIdle", "Minimum idle connections"),
    AttributeInfo::read_only("DefaultAutoCommit", "Auto-commit state of new connections"),
];

/// A pool together with the configuration it was built from, as seen on
/// the management bus.
pub struct ManagedDataSource<D> {
    pool: D,
    config: DataSourceConfig,
    object_name: ObjectName,
}

impl<D: PooledDataSource> ManagedDataSource<D> {
    pub fn new(pool: D, config: DataSourceConfig, domain: &str) -> Result<Self> {
        let object_name = match config.object_name.as_deref() {
            Some(name) => ObjectName::parse(name)?,
            None => ObjectName::typed(domain, "DataSource", Some(&config.name)),
        };
        Ok(Self {
            pool,
            config,
            object_name,
        })
    }

    pub fn config(&self) -> &DataSourceConfig {
        &self.config
    }

    pub fn pool(&self) -> &D {
        &self.pool
    }
}

impl<D> Deref for ManagedDataSource<D> {
    type Target = D;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

fn non_negative(attribute: &str, value: &AttributeValue) -> management::Result<u64> {
    let raw = value.expect_i64(attribute)?;
    u64::try_from(raw).map_err(|_| ManagementError::InvalidValue {
        attribute: attribute.to_string(),
        reason: format!("must not be negative, got {raw}"),
    })
}

fn as_u32(attribute: &str, value: u64) -> management::Result<u32> {
    u32::try_from(value).map_err(|_| ManagementError::InvalidValue {
        attribute: attribute.to_string(),
        reason: format!("{value} is out of range"),
    })
}

impl<D: PooledDataSource> ManagedObject for ManagedDataSource<D> {
    fn object_name(&self) -> ObjectName {
        self.object_name.clone()
    }

    fn attributes(&self) -> Vec<AttributeInfo> {
        ATTRIBUTES.to_vec()
    }

    fn get_attribute(&self, attribute: &str) -> management::Result<AttributeValue> {
        let value: AttributeValue = match attribute {
            "NumActive" => self.pool.num_active().into(),
            "NumIdle" => self.pool.num_idle().into(),
            "Url" => self.config.url.as_str().into(),
            "Username" => self.config.username.clone().into(),
            "MaxActive" => i64::from(self.pool.max_active()).into(),
            "MaxIdle" => i64::from(self.pool.max_idle()).into(),
            "MaxWait" => (self.pool.max_wait().as_millis() as u64).into(),
            "MinIdle" => i64::from(self.pool.min_idle()).into(),
            "DefaultAutoCommit" => self.config.default_auto_commit.into(),
            other => return Err(ManagementError::unknown_attribute(other)),
        };
        Ok(value)
    }

    fn set_attribute(&self, attribute: &str, value: AttributeValue) -> management::Result<()> {
        match attribute {
            "MaxActive" => {
                let max_active = as_u32(attribute, non_negative(attribute, &value)?)?;
                self.pool.set_max_active(max_active);
            }
            "MaxIdle" => {
                let max_idle = as_u32(attribute, non_negative(attribute, &value)?)?;
                self.pool.set_max_idle(max_idle);
            }
            "MaxWait" => {
                let millis = non_negative(attribute, &value)?;
                self.pool.set_max_wait(Duration::from_millis(millis));
            }
            other if ATTRIBUTES.iter().any(|a| a.name == other) => {
                return Err(ManagementError::read_only(other))
            }
            other => return Err(ManagementError::unknown_attribute(other)),
        }
        info!(name = %self.object_name, attribute, "Data source tunable changed");
        Ok(())
    }
}

/// Owns a published pool.
pub struct DataSourceFactory<D: PooledDataSource + 'static> {
    data_source: Arc<ManagedDataSource<D>>,
    bus: Arc<dyn ManagementBus>,
    registered: Mutex<Option<ObjectName>>,
}

impl<D: PooledDataSource + 'static> DataSourceFactory<D> {
    /// Validate `config`, build the pool with `builder` and publish it.
    ///
    /// A pool that fails to publish is closed before the error is returned.
    pub fn create<F>(
        config: &DataSourceConfig,
        domain: &str,
        builder: F,
        bus: Arc<dyn ManagementBus>,
    ) -> Result<Self>
    where
        F: FnOnce(&DataSourceConfig) -> Result<D>,
    {
        config.validate()?;
        let pool = builder(config)?;
        let data_source = Arc::new(ManagedDataSource::new(pool, config.clone(), domain)?);
        let name = match bus.publish(Arc::clone(&data_source) as Arc<dyn ManagedObject>) {
            Ok(name) => name,
            Err(e) => {
                if let Err(close_error) = data_source.pool.close() {
                    warn!(error = %close_error, "Failed to close unpublished data source");
                }
                return Err(e.into());
            }
        };
        info!(name = %name, url = %config.url, "Published data source");
        Ok(Self {
            data_source,
            bus,
            registered: Mutex::new(Some(name)),
        })
    }

    pub fn data_source(&self) -> Arc<ManagedDataSource<D>> {
        Arc::clone(&self.data_source)
    }

    /// Name the pool is published under, until closed.
    pub fn object_name(&self) -> Option<ObjectName> {
        self.registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Unregister and close the pool. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let registered = self
            .registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(name) = registered else {
            return Ok(());
        };
        if let Err(e) = self.bus.unregister(&name) {
            warn!(name = %name, error = %e, "Failed to unregister data source");
        }
        self.data_source.pool.close()
    }
}

impl<D: PooledDataSource + 'static> Deref for DataSourceFactory<D> {
    type Target = ManagedDataSource<D>;

    fn deref(&self) -> &Self::Target {
        &self.data_source
    }
}

impl<D: PooledDataSource + 'static> Drop for DataSourceFactory<D> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "Failed to close data source");
        }
    }
}

#[cfg(test)]
mod tests;
