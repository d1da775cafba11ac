//! Description of a profiled method and of one call to it.

use std::any::type_name;
use std::error::Error;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::ErrorType;

pub const DEFAULT_SLOW_THRESHOLD: Duration = Duration::from_millis(500);
pub const DEFAULT_VERY_SLOW_THRESHOLD: Duration = Duration::from_millis(1000);
pub const DEFAULT_MAX_ACTIVE_WAIT: Duration = Duration::from_millis(100);

/// Static profiling settings of one method.
///
/// Without a name template the fingerprint is `<declaring type>.<method>`.
/// `max_active`, `max_active_expression` and `max_active_wait` are carried
/// and published but not enforced.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSite {
    declaring_type: String,
    method: String,
    name: Option<String>,
    slow_threshold: Duration,
    very_slow_threshold: Duration,
    business_errors: Vec<ErrorType>,
    communication_errors: Vec<ErrorType>,
    max_active: i32,
    max_active_expression: Option<String>,
    max_active_wait: Duration,
}

impl CallSite {
    pub fn new(declaring_type: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            declaring_type: declaring_type.into(),
            method: method.into(),
            name: None,
            slow_threshold: DEFAULT_SLOW_THRESHOLD,
            very_slow_threshold: DEFAULT_VERY_SLOW_THRESHOLD,
            business_errors: Vec::new(),
            communication_errors: vec![ErrorType::of::<std::io::Error>()],
            max_active: -1,
            max_active_expression: None,
            max_active_wait: DEFAULT_MAX_ACTIVE_WAIT,
        }
    }

    /// Call site of `method` declared on `T`.
    pub fn of<T: ?Sized>(method: impl Into<String>) -> Self {
        Self::new(type_name::<T>(), method)
    }

    /// Name template, see [`Template`](super::Template). Empty means none.
    pub fn with_name(mut self, template: impl Into<String>) -> Self {
        let template = template.into();
        self.name = (!template.is_empty()).then_some(template);
        self
    }

    pub fn with_slow_threshold(mut self, threshold: Duration) -> Self {
        self.slow_threshold = threshold;
        self
    }

    pub fn with_very_slow_threshold(mut self, threshold: Duration) -> Self {
        self.very_slow_threshold = threshold;
        self
    }

    pub fn with_business_error<E: Error + 'static>(mut self) -> Self {
        self.business_errors.push(ErrorType::of::<E>());
        self
    }

    pub fn with_business_errors(mut self, types: Vec<ErrorType>) -> Self {
        self.business_errors = types;
        self
    }

    /// Replace the communication error list (default: `std::io::Error`).
    pub fn with_communication_errors(mut self, types: Vec<ErrorType>) -> Self {
        self.communication_errors = types;
        self
    }

    pub fn with_max_active(mut self, max_active: i32) -> Self {
        self.max_active = max_active;
        self
    }

    pub fn with_max_active_expression(mut self, expression: impl Into<String>) -> Self {
        self.max_active_expression = Some(expression.into());
        self
    }

    pub fn with_max_active_wait(mut self, wait: Duration) -> Self {
        self.max_active_wait = wait;
        self
    }

    pub fn declaring_type(&self) -> &str {
        &self.declaring_type
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn slow_threshold(&self) -> Duration {
        self.slow_threshold
    }

    pub fn very_slow_threshold(&self) -> Duration {
        self.very_slow_threshold
    }

    pub fn business_errors(&self) -> &[ErrorType] {
        &self.business_errors
    }

    pub fn communication_errors(&self) -> &[ErrorType] {
        &self.communication_errors
    }

    pub fn max_active(&self) -> i32 {
        self.max_active
    }

    pub fn max_active_expression(&self) -> Option<&str> {
        self.max_active_expression.as_deref()
    }

    pub fn max_active_wait(&self) -> Duration {
        self.max_active_wait
    }
}

/// Arguments and receiver of one call, as seen by name templates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Invocation {
    args: Vec<Value>,
    invoked_object: Value,
}

fn to_value<T: Serialize + ?Sized>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|e| {
        debug!(error = %e, "Value not representable in a name template");
        Value::Null
    })
}

impl Invocation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one argument.
    pub fn arg<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
        self.args.push(to_value(value));
        self
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn invoked_object<T: Serialize + ?Sized>(mut self, receiver: &T) -> Self {
        self.invoked_object = to_value(receiver);
        self
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn receiver(&self) -> &Value {
        &self.invoked_object
    }
}
