//! Profiling interceptor.
//!
//! This module contains:
//! - `CallSite`: per-method settings (name template, thresholds, error lists)
//! - `Invocation`: arguments and receiver of one call, for templates
//! - `ProfileInterceptor`: fingerprint registry; times and classifies calls
//! - `ServiceStatistics`: counters for one fingerprint, published on the bus
//! - `Template`, `ClassNameStyle`: fingerprint derivation
//! - `classify`: error classification over the source chain
//!
//! Every fingerprint maps to exactly one `ServiceStatistics` for the life of
//! the interceptor; it is published on the management bus when first seen.

mod call_site;
mod classify;
mod interceptor;
mod naming;
mod statistics;
mod template;

pub use call_site::{
    CallSite, Invocation, DEFAULT_MAX_ACTIVE_WAIT, DEFAULT_SLOW_THRESHOLD,
    DEFAULT_VERY_SLOW_THRESHOLD,
};
pub use classify::{classify, contains_error_of_type, ErrorClass, ErrorType};
pub use interceptor::{Fingerprint, ProfileInterceptor};
pub use naming::ClassNameStyle;
pub use statistics::ServiceStatistics;
pub use template::{Template, TemplateError};

#[cfg(test)]
mod tests;
