//! Bootstrap utilities for warden hosts.
//!
//! Tracing setup and assembly of every configured component on one
//! management bus.

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::advice::ManagedConnectionFactory;
use crate::broker::InMemoryBroker;
use crate::caching::CachingConnectionFactory;
use crate::config::{Config, LOG_ENV_VAR};
use crate::datasource::{DataSourceError, DataSourceFactory, InMemoryDataSource};
use crate::executor::{ExecutorError, ThreadPoolExecutorFactory};
use crate::management::{
    ApplicationInformation, InMemoryManagementBus, ManagementBus, ManagementError, Published,
    TenantScopedBus,
};
use crate::profiling::ProfileInterceptor;

/// Initialize tracing with the WARDEN_LOG environment variable.
///
/// Defaults to "info" level if WARDEN_LOG is not set. A second call is a
/// no-op.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Config file path from `--config <path>` / `-c <path>` on the command
/// line, if given.
pub fn parse_config_path() -> Option<String> {
    config_path_from(std::env::args().skip(1))
}

fn config_path_from(mut args: impl Iterator<Item = String>) -> Option<String> {
    while let Some(arg) = args.next() {
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
        if arg == "--config" || arg == "-c" {
            return args.next();
        }
    }
    None
}

/// Failure to assemble the configured components.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Management(#[from] ManagementError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    DataSource(#[from] DataSourceError),
}

/// Every component built from one `Config`, published on one bus.
pub struct Components {
    pub bus: Arc<dyn ManagementBus>,
    pub broker: InMemoryBroker,
    pub connection_factories: Vec<Arc<Published<ManagedConnectionFactory>>>,
    /// Session-caching factories, one per broker with a `caching` section.
    pub caching_factories: Vec<Published<CachingConnectionFactory>>,
    pub profiler: Arc<ProfileInterceptor>,
    pub executors: Vec<ThreadPoolExecutorFactory>,
    pub datasources: Vec<DataSourceFactory<InMemoryDataSource>>,
}

/// Build and publish the configured components on `registry`.
///
/// Names are rewritten with the configured tenancy. Brokers are backed by
/// one in-process broker and data sources by in-process pools.
pub fn assemble(
    config: &Config,
    registry: Arc<InMemoryManagementBus>,
) -> Result<Components, BootstrapError> {
    let overlay = config.management.overlay();
    let bus: Arc<dyn ManagementBus> = if overlay.is_empty() {
        registry
    } else {
        Arc::new(TenantScopedBus::new(registry, overlay))
    };
    let domain = config.management.domain.as_str();

    bus.publish(Arc::new(ApplicationInformation::of_this_crate(domain)))?;

    let broker = InMemoryBroker::new();
    let connection_factories = config
        .brokers
        .iter()
        .map(|broker_config| {
            let factory = ManagedConnectionFactory::new(broker.clone())
                .with_domain(domain)
                .with_name(broker_config.name.as_str())
                .track_leaks(broker_config.track_leaks)
                .publish(Arc::clone(&bus))?;
            Ok(Arc::new(factory))
        })
        .collect::<Result<Vec<_>, ManagementError>>()?;

    let caching_factories = config
        .brokers
        .iter()
        .zip(&connection_factories)
        .filter_map(|(broker_config, factory)| {
            let caching = broker_config.caching.as_ref()?;
            Some(
                CachingConnectionFactory::from_config(Arc::clone(factory), caching)
                    .with_domain(domain)
                    .with_name(broker_config.name.as_str())
                    .publish(Arc::clone(&bus)),
            )
        })
        .collect::<Result<Vec<_>, ManagementError>>()?;

    let mut profiler = ProfileInterceptor::new(Arc::clone(&bus))
        .with_domain(config.profiling.domain.as_str())
        .with_class_name_style(config.profiling.class_name_style);
    if let Some(name) = &config.profiling.name {
        profiler = profiler.with_name(name.as_str());
    }
    let profiler = Arc::new(profiler);
    profiler.register()?;

    let executors = ThreadPoolExecutorFactory::create_all(&config.executors, domain, Arc::clone(&bus))?;

    let datasources = config
        .datasources
        .iter()
        .map(|ds| {
            DataSourceFactory::create(ds, domain, InMemoryDataSource::from_config, Arc::clone(&bus))
        })
        .collect::<Result<Vec<_>, DataSourceError>>()?;

    info!(
        domain,
        brokers = connection_factories.len(),
        caching = caching_factories.len(),
        executors = executors.len(),
        datasources = datasources.len(),
        "Components assembled"
    );
    Ok(Components {
        bus,
        broker,
        connection_factories,
        caching_factories,
        profiler,
        executors,
        datasources,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assemble_publishes_everything_with_tenancy() {
        let config = Config::from_yaml_str(
            r#"
management:
  domain: shop
  deployment_path: checkout
profiling:
  domain: shop
brokers:
  - name: orders
    caching:
      session_cache_size: 2
executors:
  - name: mailer
    pool_size: "1-2"
datasources:
  - name: primary
    url: "mem://primary"
"#,
        )
        .unwrap();
        let registry = Arc::new(InMemoryManagementBus::new());
        let components = assemble(&config, Arc::clone(&registry)).unwrap();

        let names: Vec<String> = registry.names().iter().map(|n| n.to_string()).collect();
        assert_eq!(names.len(), 6);
        assert!(names.iter().all(|n| n.starts_with("shop:") && n.contains("path=/checkout")));
        assert!(names
            .iter()
            .any(|n| n.contains("type=ThreadPoolExecutor") && n.contains("name=mailer")));
        assert!(names
            .iter()
            .any(|n| n.contains("type=CachingConnectionFactory") && n.contains("name=orders")));
        assert_eq!(components.caching_factories[0].session_cache_size(), 2);

        drop(components);
        let left: Vec<String> = registry.names().iter().map(|n| n.to_string()).collect();
        assert!(left.iter().all(|n| !n.contains("ThreadPoolExecutor")));
        assert!(left.iter().all(|n| !n.contains("ConnectionFactory")));
    }

    #[test]
    fn test_config_path_arguments() {
        let args = |list: &[&str]| list.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(
            config_path_from(args(&["-c", "a.yaml"]).into_iter()).as_deref(),
            Some("a.yaml")
        );
        assert_eq!(
            config_path_from(args(&["--verbose", "--config=b.yaml"]).into_iter()).as_deref(),
            Some("b.yaml")
        );
        assert_eq!(config_path_from(args(&["--config"]).into_iter()), None);
    }

    #[test]
    fn test_init_tracing_twice_is_harmless() {
        init_tracing();
        init_tracing();
    }
}
