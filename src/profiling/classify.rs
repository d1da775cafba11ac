//! Error classification by walking the source chain.

use std::any::type_name;
use std::collections::HashSet;
use std::error::Error;
use std::fmt;

/// Upper bound on the number of causes inspected for one error.
const MAX_CAUSE_DEPTH: usize = 64;

/// Outcome bucket of a failed invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Communication,
    Business,
    Other,
}

fn is_type<T: Error + 'static>(error: &(dyn Error + 'static)) -> bool {
    error.is::<T>()
}

/// A concrete error type to look for in a source chain.
#[derive(Clone, Copy)]
pub struct ErrorType {
    name: &'static str,
    matcher: fn(&(dyn Error + 'static)) -> bool,
}

impl ErrorType {
    pub fn of<T: Error + 'static>() -> Self {
        Self {
            name: type_name::<T>(),
            matcher: is_type::<T>,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn matches(&self, error: &(dyn Error + 'static)) -> bool {
        (self.matcher)(error)
    }
}

impl fmt::Debug for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ErrorType").field(&self.name).finish()
    }
}

impl PartialEq for ErrorType {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

/// Whether `error` or any of its sources is one of `types`.
///
/// Stops at the end of the chain, on a cause already visited, or after
/// `MAX_CAUSE_DEPTH` causes. Causes are told apart by address and vtable,
/// so a newtype sharing its inner error's address is still walked into.
pub fn contains_error_of_type(error: &(dyn Error + 'static), types: &[ErrorType]) -> bool {
    if types.is_empty() {
        return false;
    }
    let mut visited: HashSet<*const (dyn Error + 'static)> = HashSet::new();
    let mut current = Some(error);
    while let Some(cause) = current {
        let seen = !visited.insert(cause as *const (dyn Error + 'static));
        if seen || visited.len() > MAX_CAUSE_DEPTH {
            return false;
        }
        if types.iter().any(|t| t.matches(cause)) {
            return true;
        }
        current = cause.source();
    }
    false
}

/// Communication types are checked first, then business types.
pub fn classify(
    error: &(dyn Error + 'static),
    communication: &[ErrorType],
    business: &[ErrorType],
) -> ErrorClass {
    if contains_error_of_type(error, communication) {
        ErrorClass::Communication
    } else if contains_error_of_type(error, business) {
        ErrorClass::Business
    } else {
        ErrorClass::Other
    }
}
