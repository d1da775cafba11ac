//! Thread pool and relational pool configuration types.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use super::ConfigError;

/// Core and maximum thread counts, written `"n"` or `"min-max"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSize {
    pub core: usize,
    pub max: usize,
}

impl PoolSize {
    /// Validated pool size.
    pub fn new(core: usize, max: usize) -> Result<Self, ConfigError> {
        if core == 0 {
            return Err(ConfigError::NonPositive {
                field: "core_pool_size",
                value: 0,
            });
        }
        if max < core {
            return Err(ConfigError::MaxBelowCore { core, max });
        }
        Ok(Self { core, max })
    }

    /// Same core and maximum size.
    pub fn fixed(size: usize) -> Result<Self, ConfigError> {
        Self::new(size, size)
    }
}

impl Default for PoolSize {
    fn default() -> Self {
        Self {
            core: 1,
            max: usize::MAX,
        }
    }
}

impl FromStr for PoolSize {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::InvalidPoolSize {
            value: s.to_string(),
            reason: reason.to_string(),
        };
        let parse = |part: &str| {
            part.trim()
                .parse::<usize>()
                .map_err(|_| invalid("expected a non-negative integer"))
        };

        let parts: Vec<&str> = s.split('-').collect();
        match parts.as_slice() {
            [size] => Self::fixed(parse(size)?),
            [core, max] => Self::new(parse(core)?, parse(max)?),
            _ => Err(invalid(
                "only a single size (e.g. \"5\") or a min-max range (e.g. \"3-5\") is supported",
            )),
        }
    }
}

impl fmt::Display for PoolSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.core == self.max {
            write!(f, "{}", self.core)
        } else {
            write!(f, "{}-{}", self.core, self.max)
        }
    }
}

/// What happens to a task the pool cannot accept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum RejectionPolicy {
    /// Fail the submission.
    #[default]
    Abort,
    /// Run the task on the submitting thread.
    CallerRuns,
    /// Drop the task silently.
    Discard,
    /// Drop the oldest queued task and retry the submission.
    DiscardOldest,
}

impl RejectionPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectionPolicy::Abort => "ABORT",
            RejectionPolicy::CallerRuns => "CALLER_RUNS",
            RejectionPolicy::Discard => "DISCARD",
            RejectionPolicy::DiscardOldest => "DISCARD_OLDEST",
        }
    }
}

impl fmt::Display for RejectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RejectionPolicy {
    type Err = ConfigError;

    /// Accepts the names with or without a `_POLICY` suffix, case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        match normalized.trim_end_matches("_POLICY") {
            "ABORT" => Ok(RejectionPolicy::Abort),
            "CALLER_RUNS" => Ok(RejectionPolicy::CallerRuns),
            "DISCARD" => Ok(RejectionPolicy::Discard),
            "DISCARD_OLDEST" => Ok(RejectionPolicy::DiscardOldest),
            _ => Err(ConfigError::UnknownRejectionPolicy {
                value: s.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for RejectionPolicy {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// One managed thread pool.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Pool name; threads are named `<name>-<n>`.
    pub name: String,
    /// `"n"` or `"min-max"`. Absent means core 1, unbounded maximum.
    pub pool_size: Option<String>,
    /// Absent means unbounded, 0 means synchronous handoff.
    pub queue_capacity: Option<usize>,
    /// Idle time after which threads above core exit.
    pub keep_alive_seconds: u64,
    pub rejection_policy: RejectionPolicy,
}

impl ExecutorConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_pool_size(mut self, pool_size: impl Into<String>) -> Self {
        self.pool_size = Some(pool_size.into());
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    pub fn with_keep_alive_seconds(mut self, seconds: u64) -> Self {
        self.keep_alive_seconds = seconds;
        self
    }

    pub fn with_rejection_policy(mut self, policy: RejectionPolicy) -> Self {
        self.rejection_policy = policy;
        self
    }

    /// Parsed and validated pool size.
    pub fn pool_size(&self) -> Result<PoolSize, ConfigError> {
        match self.pool_size.as_deref().map(str::trim) {
            None | Some("") => Ok(PoolSize::default()),
            Some(size) => size.parse(),
        }
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_seconds)
    }
}

/// One managed relational connection pool.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DataSourceConfig {
    pub name: String,
    /// Overrides the default `<domain>:type=DataSource,name=<name>`.
    pub object_name: Option<String>,
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub driver_class_name: Option<String>,
    /// Connections checked out at once; 0 means no limit.
    pub max_active: u32,
    pub max_idle: u32,
    pub min_idle: u32,
    /// Checkout wait; 0 fails at once when the pool is exhausted.
    pub max_wait_ms: u64,
    pub default_auto_commit: bool,
}

impl Default for DataSourceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            object_name: None,
            url: String::new(),
            username: None,
            password: None,
            driver_class_name: None,
            max_active: 8,
            max_idle: 8,
            min_idle: 0,
            max_wait_ms: 30_000,
            default_auto_commit: false,
        }
    }
}

impl DataSourceConfig {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::MissingField {
                section: "datasources",
                field: "name",
            });
        }
        if self.url.is_empty() {
            return Err(ConfigError::MissingField {
                section: "datasources",
                field: "url",
            });
        }
        if self.max_idle < self.min_idle {
            return Err(ConfigError::MaxBelowCore {
                core: self.min_idle as usize,
                max: self.max_idle as usize,
            });
        }
        Ok(())
    }
}
