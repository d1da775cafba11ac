//! Rendering of declaring-type names in automatic fingerprints.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::config::ConfigError;

/// How the declaring type appears in an automatic fingerprint.
///
/// With `java.lang.String` (or `std::string::String`):
/// - `FullyQualified`: `java.lang.String`
/// - `CompactFullyQualified`: `j.l.String`
/// - `Short`: `String`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum ClassNameStyle {
    FullyQualified,
    #[default]
    CompactFullyQualified,
    Short,
}

impl ClassNameStyle {
    /// Render `fully_qualified` in this style.
    ///
    /// Segments are split on `::` when present, on `.` otherwise.
    pub fn render(self, fully_qualified: &str) -> String {
        let separator = if fully_qualified.contains("::") {
            "::"
        } else {
            "."
        };
        match self {
            ClassNameStyle::FullyQualified => fully_qualified.to_string(),
            ClassNameStyle::Short => fully_qualified
                .rsplit(separator)
                .next()
                .unwrap_or(fully_qualified)
                .to_string(),
            ClassNameStyle::CompactFullyQualified => {
                let segments: Vec<&str> = fully_qualified.split(separator).collect();
                let Some((last, packages)) = segments.split_last() else {
                    return fully_qualified.to_string();
                };
                let mut compact = String::with_capacity(fully_qualified.len());
                for package in packages {
                    if let Some(initial) = package.chars().next() {
                        compact.push(initial);
                    }
                    compact.push_str(separator);
                }
                compact.push_str(last);
                compact
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ClassNameStyle::FullyQualified => "FULLY_QUALIFIED",
            ClassNameStyle::CompactFullyQualified => "COMPACT_FULLY_QUALIFIED",
            ClassNameStyle::Short => "SHORT",
        }
    }
}

impl fmt::Display for ClassNameStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClassNameStyle {
    type Err = ConfigError;

    /// Accepts the short and `_NAME`-suffixed spellings, case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        match normalized.trim_end_matches("_NAME") {
            "FULLY_QUALIFIED" => Ok(ClassNameStyle::FullyQualified),
            "COMPACT_FULLY_QUALIFIED" => Ok(ClassNameStyle::CompactFullyQualified),
            "SHORT" => Ok(ClassNameStyle::Short),
            _ => Err(ConfigError::UnknownClassNameStyle {
                value: s.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for ClassNameStyle {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}
