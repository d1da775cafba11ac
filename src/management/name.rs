//! Structured object names.
//!
//! Grammar: `<domain>:<key>=<value>[,<key>=<value>]*`. Values containing
//! any of `,=:"*?` or a newline are written quoted, with `\` escapes.
//! Equality and hashing use the canonical form (keys sorted), so two names
//! differing only in property order are the same name.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use super::{ManagementError, Result};

/// Identity of an object published on the management bus.
#[derive(Debug, Clone)]
pub struct ObjectName {
    domain: String,
    properties: Vec<(String, String)>,
}

impl ObjectName {
    /// Build a name from its parts, validating keys.
    pub fn new<K, V>(domain: impl Into<String>, properties: impl IntoIterator<Item = (K, V)>) -> Result<Self>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut name = Self {
            domain: domain.into(),
            properties: Vec::new(),
        };
        for (key, value) in properties {
            let key = key.into();
            if key.is_empty() || key.contains([',', '=', ':', '"', '*', '?', '\n']) {
                return Err(ManagementError::MalformedName {
                    name: name.to_string(),
                    reason: format!("invalid key '{key}'"),
                });
            }
            if name.property(&key).is_some() {
                return Err(ManagementError::MalformedName {
                    name: name.to_string(),
                    reason: format!("duplicate key '{key}'"),
                });
            }
            name.properties.push((key, value.into()));
        }
        if name.domain.contains(':') {
            return Err(ManagementError::MalformedName {
                name: name.to_string(),
                reason: "domain must not contain ':'".to_string(),
            });
        }
        if name.properties.is_empty() {
            return Err(ManagementError::MalformedName {
                name: name.domain.clone(),
                reason: "at least one key property is required".to_string(),
            });
        }
        Ok(name)
    }

    /// `<domain>:type=<type_tag>[,name=<name>]`.
    ///
    /// Infallible: the keys are fixed and values are quoted on output.
    pub fn typed(domain: &str, type_tag: &str, name: Option<&str>) -> Self {
        let mut properties = vec![("type".to_string(), type_tag.to_string())];
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            properties.push(("name".to_string(), name.to_string()));
        }
        Self {
            domain: domain.replace(':', "_"),
            properties,
        }
    }

    /// Parse the textual form.
    pub fn parse(input: &str) -> Result<Self> {
        let malformed = |reason: &str| ManagementError::MalformedName {
            name: input.to_string(),
            reason: reason.to_string(),
        };

        let (domain, rest) = input
            .split_once(':')
            .ok_or_else(|| malformed("missing ':' after domain"))?;
        if rest.is_empty() {
            return Err(malformed("at least one key property is required"));
        }

        let mut properties = Vec::new();
        let mut chars = rest.chars().peekable();
        loop {
            let mut key = String::new();
            while let Some(&c) = chars.peek() {
                if c == '=' {
                    break;
                }
                key.push(c);
                chars.next();
            }
            if chars.next() != Some('=') {
                return Err(malformed("property without '='"));
            }

            let mut value = String::new();
            if chars.peek() == Some(&'"') {
                chars.next();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => match chars.next() {
                            Some('n') => value.push('\n'),
                            Some(escaped) => value.push(escaped),
                            None => return Err(malformed("dangling escape in quoted value")),
                        },
                        '"' => {
                            closed = true;
                            break;
                        }
                        other => value.push(other),
                    }
                }
                if !closed {
                    return Err(malformed("unterminated quoted value"));
                }
            } else {
                while let Some(&c) = chars.peek() {
                    if c == ',' {
                        break;
                    }
                    if matches!(c, '=' | ':' | '"' | '\n') {
                        return Err(malformed("unquoted value contains a reserved character"));
                    }
                    value.push(c);
                    chars.next();
                }
            }
            properties.push((key, value));

            match chars.next() {
                None => break,
                Some(',') => continue,
                Some(_) => return Err(malformed("expected ',' between properties")),
            }
        }

        Self::new(domain, properties)
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Value of one key property.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Key properties in insertion order.
    pub fn properties(&self) -> &[(String, String)] {
        &self.properties
    }

    /// Copy this name, overlaying `extra` pairs: existing keys are replaced
    /// in place, new keys are appended in the given order.
    pub fn with_properties<'a>(&self, extra: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut result = self.clone();
        for (key, value) in extra {
            match result.properties.iter_mut().find(|(k, _)| k == key) {
                Some(slot) => slot.1 = value.to_string(),
                None => result.properties.push((key.to_string(), value.to_string())),
            }
        }
        result
    }

    /// Copy with one property set.
    pub fn with_property(&self, key: &str, value: &str) -> Self {
        self.with_properties([(key, value)])
    }

    /// Whether every property of `pattern` is present here with the same
    /// value and the domains match. An empty pattern domain matches any.
    pub fn matches(&self, pattern: &ObjectName) -> bool {
        (pattern.domain.is_empty() || pattern.domain == self.domain)
            && pattern
                .properties
                .iter()
                .all(|(k, v)| self.property(k) == Some(v.as_str()))
    }

    /// Canonical form with keys sorted lexicographically.
    pub fn canonical_name(&self) -> String {
        let mut sorted: Vec<&(String, String)> = self.properties.iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        let body: Vec<String> = sorted
            .iter()
            .map(|(k, v)| format!("{}={}", k, quote_if_needed(v)))
            .collect();
        format!("{}:{}", self.domain, body.join(","))
    }
}

/// Quote a property value when it contains reserved characters.
pub fn quote_if_needed(value: &str) -> String {
    if !value.contains([',', '=', ':', '"', '*', '?', '\n', '\\']) {
        return value.to_string();
    }
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        match c {
            '"' | '*' | '?' | '\\' => {
                quoted.push('\\');
                quoted.push(c);
            }
            '\n' => quoted.push_str("\\n"),
            other => quoted.push(other),
        }
    }
    quoted.push('"');
    quoted
}

impl fmt::Display for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.domain)?;
        for (i, (key, value)) in self.properties.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}={}", key, quote_if_needed(value))?;
        }
        Ok(())
    }
}

impl FromStr for ObjectName {
    type Err = ManagementError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl PartialEq for ObjectName {
    fn eq(&self, other: &Self) -> bool {
        self.canonical_name() == other.canonical_name()
    }
}

impl Eq for ObjectName {}

impl Hash for ObjectName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical_name().hash(state);
    }
}
