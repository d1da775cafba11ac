//! Management bus for publishing counters and pool controls.
//!
//! This module contains:
//! - `ObjectName`: structured identity `<domain>:type=<tag>,name=<name>[,k=v]*`
//! - `ManagedObject` trait: attributes and operations of a published object
//! - `ManagementBus` trait: register/unregister/route by structured name
//! - Implementations: `InMemoryManagementBus`, `TenantScopedBus` (name rewriting)
//! - `Registration`, `Published`: publications unregistered when dropped

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

mod info;
mod name;
mod publication;
mod registry;
mod tenancy;

pub use info::ApplicationInformation;
pub use name::ObjectName;
pub use publication::{Published, Registration};
pub use registry::InMemoryManagementBus;
pub use tenancy::{TenancyOverlay, TenantScopedBus};

/// Default domain used when a component is not given one explicitly.
pub const DEFAULT_DOMAIN: &str = "warden";

// ============================================================================
// Errors
// ============================================================================

/// Result type for management operations.
pub type Result<T> = std::result::Result<T, ManagementError>;

/// Errors raised by the management bus and managed objects.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ManagementError {
    #[error("Malformed object name '{name}': {reason}")]
    MalformedName { name: String, reason: String },

    #[error("Object already registered under '{0}'")]
    AlreadyRegistered(ObjectName),

    #[error("No object registered under '{0}'")]
    NotFound(ObjectName),

    #[error("Unknown attribute '{attribute}'")]
    UnknownAttribute { attribute: String },

    #[error("Attribute '{attribute}' is read-only")]
    ReadOnlyAttribute { attribute: String },

    #[error("Invalid value for '{attribute}': {reason}")]
    InvalidValue { attribute: String, reason: String },

    #[error("Unknown operation '{operation}'")]
    UnknownOperation { operation: String },

    #[error("Operation '{operation}' failed: {message}")]
    OperationFailed { operation: String, message: String },
}

impl ManagementError {
    pub(crate) fn unknown_attribute(attribute: &str) -> Self {
        Self::UnknownAttribute {
            attribute: attribute.to_string(),
        }
    }

    pub(crate) fn read_only(attribute: &str) -> Self {
        Self::ReadOnlyAttribute {
            attribute: attribute.to_string(),
        }
    }

    pub(crate) fn unknown_operation(operation: &str) -> Self {
        Self::UnknownOperation {
            operation: operation.to_string(),
        }
    }
}

// ============================================================================
// Attribute values
// ============================================================================

/// Value read from or written to a managed attribute.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Null,
    Bool(bool),
    Integer(i64),
    Text(String),
    List(Vec<String>),
}

impl AttributeValue {
    /// Interpret the value as an integer, accepting numeric text.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttributeValue::Integer(v) => Some(*v),
            AttributeValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Bool(b) => Some(*b),
            AttributeValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub(crate) fn expect_bool(&self, attribute: &str) -> Result<bool> {
        self.as_bool().ok_or_else(|| ManagementError::InvalidValue {
            attribute: attribute.to_string(),
            reason: format!("expected a boolean, got {self}"),
        })
    }

    /// Extract an integer for `attribute` or fail with `InvalidValue`.
    pub(crate) fn expect_i64(&self, attribute: &str) -> Result<i64> {
        self.as_i64().ok_or_else(|| ManagementError::InvalidValue {
            attribute: attribute.to_string(),
            reason: format!("expected an integer, got {self}"),
        })
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Null => f.write_str("null"),
            AttributeValue::Bool(b) => write!(f, "{b}"),
            AttributeValue::Integer(i) => write!(f, "{i}"),
            AttributeValue::Text(s) => f.write_str(s),
            AttributeValue::List(items) => write!(f, "[{}]", items.join(", ")),
        }
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Integer(value)
    }
}

impl From<u64> for AttributeValue {
    fn from(value: u64) -> Self {
        AttributeValue::Integer(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<usize> for AttributeValue {
    fn from(value: usize) -> Self {
        AttributeValue::Integer(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::Text(value)
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::Text(value.to_string())
    }
}

impl<T: Into<AttributeValue>> From<Option<T>> for AttributeValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(AttributeValue::Null)
    }
}

/// Description of one attribute exposed by a managed object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttributeInfo {
    pub name: &'static str,
    pub description: &'static str,
    pub writable: bool,
}

impl AttributeInfo {
    pub const fn read_only(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            writable: false,
        }
    }

    pub const fn read_write(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            writable: true,
        }
    }
}

// ============================================================================
// Traits
// ============================================================================

/// An object whose attributes and operations are visible on the bus.
///
/// Implementations name themselves: `object_name` is computed on first
/// query and cached for the lifetime of the object.
pub trait ManagedObject: Send + Sync {
    /// Structured name under which the object publishes itself.
    fn object_name(&self) -> ObjectName;

    /// Attributes exposed by this object.
    fn attributes(&self) -> Vec<AttributeInfo>;

    /// Read one attribute.
    fn get_attribute(&self, attribute: &str) -> Result<AttributeValue>;

    /// Write one attribute. Read-only by default.
    fn set_attribute(&self, attribute: &str, _value: AttributeValue) -> Result<()> {
        if self.attributes().iter().any(|a| a.name == attribute) {
            Err(ManagementError::read_only(attribute))
        } else {
            Err(ManagementError::unknown_attribute(attribute))
        }
    }

    /// Invoke a control operation. No operations by default.
    fn invoke(&self, operation: &str, _args: &[AttributeValue]) -> Result<AttributeValue> {
        Err(ManagementError::unknown_operation(operation))
    }
}

/// The host facility exposing managed objects to external tooling.
///
/// Implementations:
/// - `InMemoryManagementBus`: process-local registry
/// - `TenantScopedBus`: rewrites every name with tenancy pairs, then forwards
pub trait ManagementBus: Send + Sync {
    /// Register `object` under `name`. Returns the name actually used.
    fn register(&self, object: Arc<dyn ManagedObject>, name: ObjectName) -> Result<ObjectName>;

    /// Remove the object registered under `name`.
    fn unregister(&self, name: &ObjectName) -> Result<()>;

    /// Whether an object is registered under `name`.
    fn is_registered(&self, name: &ObjectName) -> bool;

    /// Names of every registered object whose domain and properties
    /// contain those of `pattern`.
    fn query_names(&self, pattern: &ObjectName) -> Vec<ObjectName>;

    /// Read an attribute of the object registered under `name`.
    fn get_attribute(&self, name: &ObjectName, attribute: &str) -> Result<AttributeValue>;

    /// Write an attribute of the object registered under `name`.
    fn set_attribute(&self, name: &ObjectName, attribute: &str, value: AttributeValue)
        -> Result<()>;

    /// Invoke an operation of the object registered under `name`.
    fn invoke(
        &self,
        name: &ObjectName,
        operation: &str,
        args: &[AttributeValue],
    ) -> Result<AttributeValue>;

    /// Register a self-naming object under its own name.
    fn publish(&self, object: Arc<dyn ManagedObject>) -> Result<ObjectName> {
        let name = object.object_name();
        self.register(object, name)
    }
}

impl<B: ManagementBus + ?Sized> ManagementBus for Arc<B> {
    fn register(&self, object: Arc<dyn ManagedObject>, name: ObjectName) -> Result<ObjectName> {
        (**self).register(object, name)
    }

    fn unregister(&self, name: &ObjectName) -> Result<()> {
        (**self).unregister(name)
    }

    fn is_registered(&self, name: &ObjectName) -> bool {
        (**self).is_registered(name)
    }

    fn query_names(&self, pattern: &ObjectName) -> Vec<ObjectName> {
        (**self).query_names(pattern)
    }

    fn get_attribute(&self, name: &ObjectName, attribute: &str) -> Result<AttributeValue> {
        (**self).get_attribute(name, attribute)
    }

    fn set_attribute(
        &self,
        name: &ObjectName,
        attribute: &str,
        value: AttributeValue,
    ) -> Result<()> {
        (**self).set_attribute(name, attribute, value)
    }

    fn invoke(
        &self,
        name: &ObjectName,
        operation: &str,
        args: &[AttributeValue],
    ) -> Result<AttributeValue> {
        (**self).invoke(name, operation, args)
    }
}

/// Read every attribute of the object registered under `name`.
///
/// Attributes that fail to read are reported as `Null`.
pub fn read_all_attributes(
    bus: &dyn ManagementBus,
    name: &ObjectName,
    attributes: &[AttributeInfo],
) -> Vec<(&'static str, AttributeValue)> {
    attributes
        .iter()
        .map(|info| {
            let value = bus
                .get_attribute(name, info.name)
                .unwrap_or(AttributeValue::Null);
            (info.name, value)
        })
        .collect()
}
