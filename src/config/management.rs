//! Management naming, broker and profiling configuration types.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::management::{TenancyOverlay, DEFAULT_DOMAIN};
use crate::profiling::ClassNameStyle;

fn default_domain() -> String {
    DEFAULT_DOMAIN.to_string()
}

/// Naming of published objects.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ManagementConfig {
    /// Domain of every published name.
    pub domain: String,
    /// Deployment path; contributes `path=/<deployment>`.
    pub deployment_path: Option<String>,
    /// Host name; contributes `host=<host>`.
    pub host: Option<String>,
    /// Extra key/value pairs mixed into every name.
    pub tenancy: BTreeMap<String, String>,
}

impl Default for ManagementConfig {
    fn default() -> Self {
        Self {
            domain: default_domain(),
            deployment_path: None,
            host: None,
            tenancy: BTreeMap::new(),
        }
    }
}

impl ManagementConfig {
    /// Tenancy overlay built from the deployment path, host and extra pairs.
    pub fn overlay(&self) -> TenancyOverlay {
        self.tenancy.iter().fold(
            TenancyOverlay::for_deployment(self.deployment_path.as_deref(), self.host.as_deref()),
            |overlay, (key, value)| overlay.with(key.clone(), value.clone()),
        )
    }
}

/// One managed broker connection factory.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Value of the `name` property of the published factory.
    pub name: String,
    /// Wrap the factory in leak detection.
    pub track_leaks: bool,
    /// Also publish a session-caching factory over this one.
    pub caching: Option<CachingConfig>,
}

/// Tunables of a session-caching connection factory.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CachingConfig {
    /// Idle sessions kept per transacted flag and acknowledge mode.
    pub session_cache_size: usize,
    pub cache_producers: bool,
    pub cache_consumers: bool,
    /// Discard the shared connection when a session cannot be created.
    pub reconnect_on_exception: bool,
}

impl Default for CachingConfig {
    fn default() -> Self {
        Self {
            session_cache_size: 1,
            cache_producers: true,
            cache_consumers: true,
            reconnect_on_exception: false,
        }
    }
}

/// Profiling interceptor configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProfilingConfig {
    /// Value of the `name` property of the published interceptor.
    pub name: Option<String>,
    /// Domain of the interceptor and of its service statistics.
    pub domain: String,
    /// Rendering of declaring types in automatic fingerprints.
    pub class_name_style: ClassNameStyle,
}

impl Default for ProfilingConfig {
    fn default() -> Self {
        Self {
            name: None,
            domain: default_domain(),
            class_name_style: ClassNameStyle::default(),
        }
    }
}
