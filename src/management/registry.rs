//! In-memory management bus.
//!
//! Process-local registry of managed objects keyed by canonical object
//! name. Suitable for tests and for hosts that expose the registry through
//! their own tooling.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use super::{AttributeValue, ManagedObject, ManagementBus, ManagementError, ObjectName, Result};

/// Registry of published objects.
#[derive(Default)]
pub struct InMemoryManagementBus {
    objects: DashMap<ObjectName, Arc<dyn ManagedObject>>,
}

impl InMemoryManagementBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Every registered name, sorted by canonical form.
    pub fn names(&self) -> Vec<ObjectName> {
        let mut names: Vec<ObjectName> = self.objects.iter().map(|e| e.key().clone()).collect();
        names.sort_by_key(|n| n.canonical_name());
        names
    }

    /// The object registered under `name`, if any.
    pub fn lookup(&self, name: &ObjectName) -> Option<Arc<dyn ManagedObject>> {
        self.objects.get(name).map(|e| Arc::clone(e.value()))
    }

    fn resolve(&self, name: &ObjectName) -> Result<Arc<dyn ManagedObject>> {
        self.lookup(name)
            .ok_or_else(|| ManagementError::NotFound(name.clone()))
    }
}

impl ManagementBus for InMemoryManagementBus {
    fn register(&self, object: Arc<dyn ManagedObject>, name: ObjectName) -> Result<ObjectName> {
        match self.objects.entry(name.clone()) {
            Entry::Occupied(_) => Err(ManagementError::AlreadyRegistered(name)),
            Entry::Vacant(slot) => {
                slot.insert(object);
                debug!(object_name = %name, "Registered managed object");
                Ok(name)
            }
        }
    }

    fn unregister(&self, name: &ObjectName) -> Result<()> {
        match self.objects.remove(name) {
            Some(_) => {
                debug!(object_name = %name, "Unregistered managed object");
                Ok(())
            }
            None => Err(ManagementError::NotFound(name.clone())),
        }
    }

    fn is_registered(&self, name: &ObjectName) -> bool {
        self.objects.contains_key(name)
    }

    fn query_names(&self, pattern: &ObjectName) -> Vec<ObjectName> {
        let mut names: Vec<ObjectName> = self
            .objects
            .iter()
            .filter(|e| e.key().matches(pattern))
            .map(|e| e.key().clone())
            .collect();
        names.sort_by_key(|n| n.canonical_name());
        names
    }

    fn get_attribute(&self, name: &ObjectName, attribute: &str) -> Result<AttributeValue> {
        self.resolve(name)?.get_attribute(attribute)
    }

    fn set_attribute(
        &self,
        name: &ObjectName,
        attribute: &str,
        value: AttributeValue,
    ) -> Result<()> {
        self.resolve(name)?.set_attribute(attribute, value)
    }

    fn invoke(
        &self,
        name: &ObjectName,
        operation: &str,
        args: &[AttributeValue],
    ) -> Result<AttributeValue> {
        self.resolve(name)?.invoke(operation, args)
    }
}
