//! Build information of the running application.

use std::sync::OnceLock;

use super::{AttributeInfo, AttributeValue, ManagedObject, ManagementError, ObjectName, Result};

const ATTRIBUTES: &[AttributeInfo] = &[
    AttributeInfo::read_only("Name", "Package name of the application"),
    AttributeInfo::read_only("Version", "Package version of the application"),
    AttributeInfo::read_only("FullyQualifiedIdentifier", "<name>:<version>"),
];

/// Publishes the name and version of an application.
///
/// `ApplicationInformation::of_this_crate` describes `warden` itself; hosts
/// pass their own `env!("CARGO_PKG_NAME")` / `env!("CARGO_PKG_VERSION")`.
#[derive(Debug)]
pub struct ApplicationInformation {
    domain: String,
    bean_name: Option<String>,
    name: String,
    version: String,
    object_name: OnceLock<ObjectName>,
}

impl ApplicationInformation {
    pub fn new(
        domain: impl Into<String>,
        bean_name: Option<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            domain: domain.into(),
            bean_name,
            name: name.into(),
            version: version.into(),
            object_name: OnceLock::new(),
        }
    }

    pub fn of_this_crate(domain: impl Into<String>) -> Self {
        Self::new(
            domain,
            None,
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
        )
    }

    pub fn fully_qualified_identifier(&self) -> String {
        format!("{}:{}", self.name, self.version)
    }
}

impl ManagedObject for ApplicationInformation {
    fn object_name(&self) -> ObjectName {
        self.object_name
            .get_or_init(|| {
                ObjectName::typed(
                    &self.domain,
                    "ApplicationInformation",
                    self.bean_name.as_deref(),
                )
            })
            .clone()
    }

    fn attributes(&self) -> Vec<AttributeInfo> {
        ATTRIBUTES.to_vec()
    }

    fn get_attribute(&self, attribute: &str) -> Result<AttributeValue> {
        match attribute {
            "Name" => Ok(self.name.as_str().into()),
            "Version" => Ok(self.version.as_str().into()),
            "FullyQualifiedIdentifier" => Ok(self.fully_qualified_identifier().into()),
            other => Err(ManagementError::unknown_attribute(other)),
        }
    }
}
