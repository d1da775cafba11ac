//! warden-console: configuration check and attribute dump
//!
//! Loads the configuration, builds every configured component on an
//! in-memory management bus and prints each published object's attributes
//! as one JSON document.
//!
//! ## Configuration
//! - `--config <path>` / `-c <path>`: YAML configuration file
//! - WARDEN_CONFIG: YAML configuration file
//! - WARDEN__<SECTION>__<KEY>: individual overrides
//! - WARDEN_LOG: tracing filter (default "info")

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{error, info};

use warden::config::Config;
use warden::management::{read_all_attributes, InMemoryManagementBus};
use warden::utils::bootstrap::{assemble, init_tracing, parse_config_path};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = parse_config_path();
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    let registry = Arc::new(InMemoryManagementBus::new());
    let components = assemble(&config, Arc::clone(&registry))?;
    info!(objects = registry.len(), "Configuration valid");

    let mut document = Map::new();
    for name in registry.names() {
        let Some(object) = registry.lookup(&name) else {
            continue;
        };
        let attributes: Map<String, Value> =
            read_all_attributes(registry.as_ref(), &name, &object.attributes())
                .into_iter()
                .map(|(attribute, value)| Ok((attribute.to_string(), serde_json::to_value(value)?)))
                .collect::<Result<_, serde_json::Error>>()?;
        document.insert(name.to_string(), Value::Object(attributes));
    }
    println!("{}", serde_json::to_string_pretty(&Value::Object(document))?);

    drop(components);
    Ok(())
}
