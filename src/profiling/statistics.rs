//! Per-fingerprint invocation counters.

use std::error::Error;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use super::{classify, CallSite, ErrorClass, ErrorType};
use crate::management::{
    AttributeInfo, AttributeValue, ManagedObject, ManagementError, ObjectName, Result,
};

const ATTRIBUTES: &[AttributeInfo] = &[
    AttributeInfo::read_only("Name", "Fingerprint of the profiled service"),
    AttributeInfo::read_only("InvocationCount", "Completed invocations"),
    AttributeInfo::read_only("TotalDurationInNanos", "Total duration of the invocations in nanoseconds"),
    AttributeInfo::read_only("TotalDurationInMillis", "Total duration of the invocations in milliseconds"),
    AttributeInfo::read_only("CurrentActive", "Invocations in progress"),
    AttributeInfo::read_only("SlowInvocationCount", "Invocations at or above the slow threshold"),
    AttributeInfo::read_only("VerySlowInvocationCount", "Invocations at or above the very slow threshold"),
    AttributeInfo::read_only("BusinessExceptionCount", "Failures classified as business errors"),
    AttributeInfo::read_only("CommunicationExceptionCount", "Failures classified as communication errors"),
    AttributeInfo::read_only("OtherExceptionCount", "Failures matching no configured type"),
    AttributeInfo::read_write("SlowInvocationThresholdInMillis", "Slow invocation threshold"),
    AttributeInfo::read_write("VerySlowInvocationThresholdInMillis", "Very slow invocation threshold"),
    AttributeInfo::read_only("MaxActive", "Declared concurrency limit, -1 for unbounded (not enforced)"),
    AttributeInfo::read_only("MaxActiveExpression", "Declared concurrency limit expression (not enforced)"),
    AttributeInfo::read_only("MaxActiveWaitInMillis", "Declared wait for a concurrency permit (not enforced)"),
];

fn nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// Counters for every invocation sharing one fingerprint.
#[derive(Debug)]
pub struct ServiceStatistics {
    name: String,
    object_name: ObjectName,
    invocations: AtomicU64,
    total_duration_nanos: AtomicU64,
    current_active: AtomicI64,
    slow_invocations: AtomicU64,
    very_slow_invocations: AtomicU64,
    business_errors: AtomicU64,
    communication_errors: AtomicU64,
    other_errors: AtomicU64,
    slow_threshold_nanos: AtomicU64,
    very_slow_threshold_nanos: AtomicU64,
    business_types: Vec<ErrorType>,
    communication_types: Vec<ErrorType>,
    max_active: i32,
    max_active_expression: Option<String>,
    max_active_wait: Duration,
}

impl ServiceStatistics {
    /// Statistics configured from the call site that first produced `name`.
    pub fn new(name: impl Into<String>, object_name: ObjectName, site: &CallSite) -> Self {
        Self {
            name: name.into(),
            object_name,
            invocations: AtomicU64::new(0),
            total_duration_nanos: AtomicU64::new(0),
            current_active: AtomicI64::new(0),
            slow_invocations: AtomicU64::new(0),
            very_slow_invocations: AtomicU64::new(0),
            business_errors: AtomicU64::new(0),
            communication_errors: AtomicU64::new(0),
            other_errors: AtomicU64::new(0),
            slow_threshold_nanos: AtomicU64::new(nanos(site.slow_threshold())),
            very_slow_threshold_nanos: AtomicU64::new(nanos(site.very_slow_threshold())),
            business_types: site.business_errors().to_vec(),
            communication_types: site.communication_errors().to_vec(),
            max_active: site.max_active(),
            max_active_expression: site.max_active_expression().map(str::to_string),
            max_active_wait: site.max_active_wait(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn increment_current_active(&self) {
        self.current_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement_current_active(&self) {
        self.current_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Count one completed invocation and bucket its duration.
    ///
    /// Very slow takes precedence over slow; both thresholds are inclusive.
    pub fn record_invocation(&self, elapsed: Duration) {
        let elapsed = nanos(elapsed);
        self.invocations.fetch_add(1, Ordering::Relaxed);
        self.total_duration_nanos
            .fetch_add(elapsed, Ordering::Relaxed);
        if elapsed >= self.very_slow_threshold_nanos.load(Ordering::Relaxed) {
            self.very_slow_invocations.fetch_add(1, Ordering::Relaxed);
        } else if elapsed >= self.slow_threshold_nanos.load(Ordering::Relaxed) {
            self.slow_invocations.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Classify `error` and increment the matching counter.
    pub fn record_error(&self, error: &(dyn Error + 'static)) -> ErrorClass {
        let class = classify(error, &self.communication_types, &self.business_types);
        let counter = match class {
            ErrorClass::Communication => &self.communication_errors,
            ErrorClass::Business => &self.business_errors,
            ErrorClass::Other => &self.other_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        class
    }

    pub fn invocation_count(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    pub fn total_duration(&self) -> Duration {
        Duration::from_nanos(self.total_duration_nanos.load(Ordering::Relaxed))
    }

    pub fn current_active(&self) -> i64 {
        self.current_active.load(Ordering::Relaxed)
    }

    pub fn slow_invocation_count(&self) -> u64 {
        self.slow_invocations.load(Ordering::Relaxed)
    }

    pub fn very_slow_invocation_count(&self) -> u64 {
        self.very_slow_invocations.load(Ordering::Relaxed)
    }

    pub fn error_count(&self, class: ErrorClass) -> u64 {
        match class {
            ErrorClass::Communication => self.communication_errors.load(Ordering::Relaxed),
            ErrorClass::Business => self.business_errors.load(Ordering::Relaxed),
            ErrorClass::Other => self.other_errors.load(Ordering::Relaxed),
        }
    }

    pub fn slow_threshold(&self) -> Duration {
        Duration::from_nanos(self.slow_threshold_nanos.load(Ordering::Relaxed))
    }

    pub fn set_slow_threshold(&self, threshold: Duration) {
        self.slow_threshold_nanos
            .store(nanos(threshold), Ordering::Relaxed);
    }

    pub fn very_slow_threshold(&self) -> Duration {
        Duration::from_nanos(self.very_slow_threshold_nanos.load(Ordering::Relaxed))
    }

    pub fn set_very_slow_threshold(&self, threshold: Duration) {
        self.very_slow_threshold_nanos
            .store(nanos(threshold), Ordering::Relaxed);
    }

    pub fn max_active(&self) -> i32 {
        self.max_active
    }
}

fn threshold_millis(attribute: &str, value: &AttributeValue) -> Result<Duration> {
    let millis = value.expect_i64(attribute)?;
    u64::try_from(millis)
        .map(Duration::from_millis)
        .map_err(|_| ManagementError::InvalidValue {
            attribute: attribute.to_string(),
            reason: format!("threshold must not be negative, got {millis}"),
        })
}

impl ManagedObject for ServiceStatistics {
    fn object_name(&self) -> ObjectName {
        self.object_name.clone()
    }

    fn attributes(&self) -> Vec<AttributeInfo> {
        ATTRIBUTES.to_vec()
    }

    fn get_attribute(&self, attribute: &str) -> Result<AttributeValue> {
        let value: AttributeValue = match attribute {
            "Name" => self.name.as_str().into(),
            "InvocationCount" => self.invocation_count().into(),
            "TotalDurationInNanos" => nanos(self.total_duration()).into(),
            "TotalDurationInMillis" => (self.total_duration().as_millis() as u64).into(),
            "CurrentActive" => self.current_active().into(),
            "SlowInvocationCount" => self.slow_invocation_count().into(),
            "VerySlowInvocationCount" => self.very_slow_invocation_count().into(),
            "BusinessExceptionCount" => self.error_count(ErrorClass::Business).into(),
            "CommunicationExceptionCount" => self.error_count(ErrorClass::Communication).into(),
            "OtherExceptionCount" => self.error_count(ErrorClass::Other).into(),
            "SlowInvocationThresholdInMillis" => (self.slow_threshold().as_millis() as u64).into(),
            "VerySlowInvocationThresholdInMillis" => {
                (self.very_slow_threshold().as_millis() as u64).into()
            }
            "MaxActive" => i64::from(self.max_active).into(),
            "MaxActiveExpression" => self.max_active_expression.clone().into(),
            "MaxActiveWaitInMillis" => (self.max_active_wait.as_millis() as u64).into(),
            other => return Err(ManagementError::unknown_attribute(other)),
        };
        Ok(value)
    }

    fn set_attribute(&self, attribute: &str, value: AttributeValue) -> Result<()> {
        match attribute {
            "SlowInvocationThresholdInMillis" => {
                self.set_slow_threshold(threshold_millis(attribute, &value)?);
                Ok(())
            }
            "VerySlowInvocationThresholdInMillis" => {
                self.set_very_slow_threshold(threshold_millis(attribute, &value)?);
                Ok(())
            }
            other if ATTRIBUTES.iter().any(|a| a.name == other) => {
                Err(ManagementError::read_only(other))
            }
            other => Err(ManagementError::unknown_attribute(other)),
        }
    }
}
