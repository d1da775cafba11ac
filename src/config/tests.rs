use std::io::Write;

use serial_test::serial;
use tempfile::NamedTempFile;

use super::*;
use crate::profiling::ClassNameStyle;

const FULL_YAML: &str = r#"
management:
  domain: shop
  deployment_path: checkout
  host: node-1
  tenancy:
    zone: eu
brokers:
  - name: orders
    track_leaks: true
    caching:
      session_cache_size: 4
      cache_consumers: false
profiling:
  name: main
  class_name_style: SHORT_NAME
executors:
  - name: mailer
    pool_size: "2-4"
    queue_capacity: 10
    keep_alive_seconds: 30
    rejection_policy: CALLER_RUNS
datasources:
  - name: primary
    url: "postgres://localhost/shop"
    username: shop
    max_active: 8
    max_wait_ms: 250
"#;

fn yaml_file(contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".yaml")
        .tempfile()
        .unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn test_config_default() {
    let config = Config::default();
    assert_eq!(config.management.domain, "warden");
    assert_eq!(config.profiling.domain, "warden");
    assert_eq!(
        config.profiling.class_name_style,
        ClassNameStyle::CompactFullyQualified
    );
    assert!(config.brokers.is_empty());
    assert!(config.executors.is_empty());
}

#[test]
fn test_full_document() {
    let config = Config::from_yaml_str(FULL_YAML).unwrap();

    assert_eq!(config.management.domain, "shop");
    let overlay = config.management.overlay();
    assert_eq!(overlay.pairs().get("path").map(String::as_str), Some("/checkout"));
    assert_eq!(overlay.pairs().get("host").map(String::as_str), Some("node-1"));
    assert_eq!(overlay.pairs().get("zone").map(String::as_str), Some("eu"));

    assert!(config.brokers[0].track_leaks);
    let caching = config.brokers[0].caching.as_ref().unwrap();
    assert_eq!(caching.session_cache_size, 4);
    assert!(caching.cache_producers);
    assert!(!caching.cache_consumers);
    assert!(!caching.reconnect_on_exception);
    assert_eq!(config.profiling.class_name_style, ClassNameStyle::Short);

    let executor = &config.executors[0];
    assert_eq!(executor.pool_size().unwrap(), PoolSize { core: 2, max: 4 });
    assert_eq!(executor.queue_capacity, Some(10));
    assert_eq!(executor.keep_alive().as_secs(), 30);
    assert_eq!(executor.rejection_policy, RejectionPolicy::CallerRuns);

    let datasource = &config.datasources[0];
    assert_eq!(datasource.max_active, 8);
    assert_eq!(datasource.max_wait().as_millis(), 250);
    assert!(!datasource.default_auto_commit);
}

#[test]
fn test_pool_size_parsing() {
    assert_eq!("5".parse::<PoolSize>().unwrap(), PoolSize { core: 5, max: 5 });
    assert_eq!("3-5".parse::<PoolSize>().unwrap(), PoolSize { core: 3, max: 5 });
    assert!(matches!(
        "5-3".parse::<PoolSize>(),
        Err(ConfigError::MaxBelowCore { core: 5, max: 3 })
    ));
    assert!(matches!(
        "0".parse::<PoolSize>(),
        Err(ConfigError::NonPositive { .. })
    ));
    assert!(matches!(
        "1-2-3".parse::<PoolSize>(),
        Err(ConfigError::InvalidPoolSize { .. })
    ));
    assert!(matches!(
        "many".parse::<PoolSize>(),
        Err(ConfigError::InvalidPoolSize { .. })
    ));
    assert_eq!(ExecutorConfig::new("p").pool_size().unwrap(), PoolSize::default());
}

#[test]
fn test_unknown_enumerations_fail() {
    let err = Config::from_yaml_str("profiling:\n  class_name_style: LONG\n").unwrap_err();
    assert!(err.to_string().contains("LONG"));

    let err = Config::from_yaml_str("executors:\n  - name: x\n    rejection_policy: RETRY\n")
        .unwrap_err();
    assert!(err.to_string().contains("RETRY"));

    assert_eq!(
        "discard-oldest-policy".parse::<RejectionPolicy>().unwrap(),
        RejectionPolicy::DiscardOldest
    );
}

#[test]
fn test_zero_session_cache_size_fails() {
    let yaml = "brokers:\n  - name: orders\n    caching:\n      session_cache_size: 0\n";
    assert!(matches!(
        Config::from_yaml_str(yaml),
        Err(ConfigError::NonPositive { field: "session_cache_size", .. })
    ));
    let config = Config::from_yaml_str("brokers:\n  - name: orders\n").unwrap();
    assert!(config.brokers[0].caching.is_none());
}

#[test]
fn test_missing_names_fail() {
    assert!(matches!(
        Config::from_yaml_str("brokers:\n  - track_leaks: true\n"),
        Err(ConfigError::MissingField { section: "brokers", field: "name" })
    ));
    assert!(matches!(
        Config::from_yaml_str("datasources:\n  - name: db\n"),
        Err(ConfigError::MissingField { field: "url", .. })
    ));
}

#[test]
#[serial]
fn test_load_from_explicit_path() {
    let file = yaml_file(FULL_YAML);
    let config = Config::load(file.path().to_str()).unwrap();
    assert_eq!(config.management.domain, "shop");
    assert_eq!(config.executors.len(), 1);
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    let file = yaml_file("management:\n  domain: from-file\n");
    std::env::set_var("WARDEN__MANAGEMENT__DOMAIN", "from-env");
    let loaded = Config::load(file.path().to_str());
    std::env::remove_var("WARDEN__MANAGEMENT__DOMAIN");

    assert_eq!(loaded.unwrap().management.domain, "from-env");
}

#[test]
#[serial]
fn test_config_env_var_names_file() {
    let file = yaml_file("profiling:\n  name: from-env-file\n");
    std::env::set_var(CONFIG_ENV_VAR, file.path());
    let loaded = Config::load(None);
    std::env::remove_var(CONFIG_ENV_VAR);

    assert_eq!(loaded.unwrap().profiling.name.as_deref(), Some("from-env-file"));
}

#[test]
#[serial]
fn test_missing_explicit_file_fails() {
    assert!(matches!(
        Config::load(Some("/nonexistent/warden-config.yaml")),
        Err(ConfigError::Load(_))
    ));
}
