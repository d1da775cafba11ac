//! Tenant-aware name rewriting.
//!
//! When several deployments share one management bus, every name passed
//! through `TenantScopedBus` is copied and overlaid with the tenancy pairs
//! (e.g. `path=/shop`, `host=localhost`) before reaching the wrapped bus.
//! Every other aspect of the call is forwarded unchanged.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::trace;

use super::{AttributeValue, ManagedObject, ManagementBus, ObjectName, Result};

/// Key/value pairs mixed into every name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TenancyOverlay {
    pairs: BTreeMap<String, String>,
}

impl TenancyOverlay {
    /// No tenancy: the rewrite is the identity.
    pub fn none() -> Self {
        Self::default()
    }

    /// Overlay from a deployment path and host name.
    ///
    /// A non-empty path is normalised to start with `/`. An empty path is
    /// the root deployment and is kept as `path=`.
    pub fn for_deployment(path: Option<&str>, host: Option<&str>) -> Self {
        let mut overlay = Self::default();
        if let Some(path) = path {
            let path = if path.is_empty() || path.starts_with('/') {
                path.to_string()
            } else {
                format!("/{path}")
            };
            overlay.pairs.insert("path".to_string(), path);
        }
        if let Some(host) = host.filter(|h| !h.is_empty()) {
            overlay.pairs.insert("host".to_string(), host.to_string());
        }
        overlay
    }

    /// Add one pair, replacing any previous value for `key`.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.pairs.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn pairs(&self) -> &BTreeMap<String, String> {
        &self.pairs
    }

    /// Copy `name` and overlay the tenancy pairs.
    pub fn apply(&self, name: &ObjectName) -> ObjectName {
        if self.pairs.is_empty() {
            return name.clone();
        }
        let rewritten = name.with_properties(self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        trace!(original = %name, rewritten = %rewritten, "Applied tenancy overlay");
        rewritten
    }
}

impl FromIterator<(String, String)> for TenancyOverlay {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            pairs: iter.into_iter().collect(),
        }
    }
}

/// Bus adapter that rewrites every structured name argument.
pub struct TenantScopedBus<B: ManagementBus> {
    inner: B,
    overlay: TenancyOverlay,
}

impl<B: ManagementBus> TenantScopedBus<B> {
    pub fn new(inner: B, overlay: TenancyOverlay) -> Self {
        Self { inner, overlay }
    }

    /// Get the underlying bus.
    pub fn inner(&self) -> &B {
        &self.inner
    }

    pub fn overlay(&self) -> &TenancyOverlay {
        &self.overlay
    }

    /// Consume wrapper and return the inner bus.
    pub fn into_inner(self) -> B {
        self.inner
    }
}

impl<B: ManagementBus> ManagementBus for TenantScopedBus<B> {
    fn register(&self, object: Arc<dyn ManagedObject>, name: ObjectName) -> Result<ObjectName> {
        self.inner.register(object, self.overlay.apply(&name))
    }

    fn unregister(&self, name: &ObjectName) -> Result<()> {
        self.inner.unregister(&self.overlay.apply(name))
    }

    fn is_registered(&self, name: &ObjectName) -> bool {
        self.inner.is_registered(&self.overlay.apply(name))
    }

    fn query_names(&self, pattern: &ObjectName) -> Vec<ObjectName> {
        self.inner.query_names(&self.overlay.apply(pattern))
    }

    fn get_attribute(&self, name: &ObjectName, attribute: &str) -> Result<AttributeValue> {
        self.inner.get_attribute(&self.overlay.apply(name), attribute)
    }

    fn set_attribute(
        &self,
        name: &ObjectName,
        attribute: &str,
        value: AttributeValue,
    ) -> Result<()> {
        self.inner
            .set_attribute(&self.overlay.apply(name), attribute, value)
    }

    fn invoke(
        &self,
        name: &ObjectName,
        operation: &str,
        args: &[AttributeValue],
    ) -> Result<AttributeValue> {
        self.inner.invoke(&self.overlay.apply(name), operation, args)
    }
}
