use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::management::{InMemoryManagementBus, ManagementBus};

fn config() -> DataSourceConfig {
    DataSourceConfig {
        username: Some("shop".to_string()),
        max_active: 2,
        max_idle: 1,
        max_wait_ms: 20,
        ..DataSourceConfig::new("primary", "postgres://localhost/shop")
    }
}

fn factory(bus: &Arc<InMemoryManagementBus>) -> DataSourceFactory<InMemoryDataSource> {
    DataSourceFactory::create(&config(), "warden", InMemoryDataSource::from_config, bus.clone())
        .unwrap()
}

#[test]
fn test_published_attributes_follow_pool() {
    let bus = Arc::new(InMemoryManagementBus::new());
    let factory = factory(&bus);
    let name = factory.object_name().unwrap();
    assert_eq!(name.to_string(), "warden:type=DataSource,name=primary");

    let first = factory.acquire().unwrap();
    let second = factory.acquire().unwrap();
    assert_ne!(first.id(), second.id());
    assert_eq!(bus.get_attribute(&name, "NumActive").unwrap(), 2i64.into());
    assert_eq!(bus.get_attribute(&name, "NumIdle").unwrap(), 0i64.into());

    drop(first);
    drop(second);
    assert_eq!(bus.get_attribute(&name, "NumActive").unwrap(), 0i64.into());
    // max_idle keeps only one of the two returned connections.
    assert_eq!(bus.get_attribute(&name, "NumIdle").unwrap(), 1i64.into());

    assert_eq!(
        bus.get_attribute(&name, "Url").unwrap(),
        "postgres://localhost/shop".into()
    );
    assert_eq!(bus.get_attribute(&name, "Username").unwrap(), "shop".into());
    assert_eq!(
        bus.get_attribute(&name, "DefaultAutoCommit").unwrap(),
        false.into()
    );
}

#[test]
fn test_exhausted_pool_times_out() {
    let bus = Arc::new(InMemoryManagementBus::new());
    let factory = factory(&bus);
    let _first = factory.acquire().unwrap();
    let _second = factory.acquire().unwrap();

    assert!(matches!(factory.acquire(), Err(DataSourceError::Pool(_))));
}

#[test]
fn test_tunables_writable_on_bus() {
    let bus = Arc::new(InMemoryManagementBus::new());
    let factory = factory(&bus);
    let name = factory.object_name().unwrap();

    bus.set_attribute(&name, "MaxActive", 5i64.into()).unwrap();
    bus.set_attribute(&name, "MaxWait", 1500i64.into()).unwrap();
    bus.set_attribute(&name, "MaxIdle", 0i64.into()).unwrap();
    assert_eq!(factory.max_active(), 5);
    assert_eq!(factory.max_wait(), Duration::from_millis(1500));
    assert_eq!(factory.max_idle(), 0);

    assert!(matches!(
        bus.set_attribute(&name, "MaxActive", (-1i64).into()),
        Err(ManagementError::InvalidValue { .. })
    ));
    assert!(matches!(
        bus.set_attribute(&name, "Url", "other".into()),
        Err(ManagementError::ReadOnlyAttribute { .. })
    ));
}

#[test]
fn test_close_unregisters_and_closes_pool() {
    let bus = Arc::new(InMemoryManagementBus::new());
    let factory = factory(&bus);
    let name = factory.object_name().unwrap();
    let data_source = factory.data_source();

    factory.close().unwrap();
    assert!(!bus.is_registered(&name));
    assert!(factory.object_name().is_none());
    assert!(data_source.acquire().is_err());
    factory.close().unwrap();
}

#[test]
fn test_explicit_object_name() {
    let bus = Arc::new(InMemoryManagementBus::new());
    let config = DataSourceConfig {
        object_name: Some("javax.sql:type=DataSource,name=legacy".to_string()),
        ..config()
    };
    let factory =
        DataSourceFactory::create(&config, "warden", InMemoryDataSource::from_config, bus.clone())
            .unwrap();
    assert_eq!(
        factory.object_name().unwrap().to_string(),
        "javax.sql:type=DataSource,name=legacy"
    );
}

#[test]
fn test_invalid_config_builds_nothing() {
    let bus = Arc::new(InMemoryManagementBus::new());
    let mut built = false;
    let result = DataSourceFactory::create(
        &DataSourceConfig::new("nameless-url", ""),
        "warden",
        |config| {
            built = true;
            InMemoryDataSource::from_config(config)
        },
        bus.clone(),
    );
    assert!(matches!(result, Err(DataSourceError::Config(_))));
    assert!(!built);
    assert!(bus.is_empty());
}

#[test]
fn test_duplicate_name_closes_new_pool() {
    let bus = Arc::new(InMemoryManagementBus::new());
    let _first = factory(&bus);
    let second =
        DataSourceFactory::create(&config(), "warden", InMemoryDataSource::from_config, bus.clone());
    assert!(matches!(second, Err(DataSourceError::Management(_))));
    assert_eq!(bus.len(), 1);
}
