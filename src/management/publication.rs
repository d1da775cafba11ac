//! Publications tied to the lifetime of their owner.

use std::ops::Deref;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

use super::{ManagedObject, ManagementBus, ObjectName, Result};

/// One object registered on a bus, unregistered on `close` or drop.
pub struct Registration {
    bus: Arc<dyn ManagementBus>,
    name: Mutex<Option<ObjectName>>,
}

impl Registration {
    /// Publish `object` under its own name.
    pub fn publish(bus: Arc<dyn ManagementBus>, object: Arc<dyn ManagedObject>) -> Result<Self> {
        let name = bus.publish(object)?;
        Ok(Self {
            bus,
            name: Mutex::new(Some(name)),
        })
    }

    /// Name the object is published under, until closed.
    pub fn object_name(&self) -> Option<ObjectName> {
        self.name
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Unregister the object. Returns whether this call unregistered it.
    pub fn close(&self) -> bool {
        let taken = self
            .name
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(name) = taken else {
            return false;
        };
        match self.bus.unregister(&name) {
            Ok(()) => debug!(name = %name, "Publication closed"),
            Err(e) => warn!(name = %name, error = %e, "Failed to unregister managed object"),
        }
        true
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.close();
    }
}

/// A managed object owned together with its publication.
///
/// Dereferences to the object. Dropping the last handle unregisters it.
pub struct Published<T: ManagedObject + 'static> {
    object: Arc<T>,
    registration: Registration,
}

impl<T: ManagedObject + 'static> Published<T> {
    pub fn publish(object: T, bus: Arc<dyn ManagementBus>) -> Result<Self> {
        let object = Arc::new(object);
        let registration = Registration::publish(bus, Arc::clone(&object) as Arc<dyn ManagedObject>)?;
        Ok(Self {
            object,
            registration,
        })
    }

    /// Shared handle on the object; it stays published only while `self`
    /// lives.
    pub fn object(&self) -> Arc<T> {
        Arc::clone(&self.object)
    }

    pub fn object_name(&self) -> Option<ObjectName> {
        self.registration.object_name()
    }

    /// Unregister now. Closing twice is a no-op.
    pub fn close(&self) {
        self.registration.close();
    }
}

impl<T: ManagedObject + 'static> Deref for Published<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.object
    }
}
