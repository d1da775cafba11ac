//! Destinations for leak reports.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use tracing::warn;

use super::CreationContext;
use crate::advice::ResourceKind;

/// A child resource still open when its parent was closed.
#[derive(Debug, Clone)]
pub struct LeakReport {
    /// Label of the parent being closed.
    pub parent: String,
    /// Label of the leaked child.
    pub child: String,
    pub child_kind: Option<ResourceKind>,
    /// How many children the parent still had open.
    pub open_children: usize,
    pub context: CreationContext,
}

impl fmt::Display for LeakReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} closed before {}: {}",
            self.parent,
            self.child,
            self.context.dump("   ")
        )
    }
}

/// Receives leak reports. Never fails the close that produced them.
pub trait LeakSink: Send + Sync {
    fn leak_detected(&self, report: &LeakReport);
}

/// Emits each report as a `warn!` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLeakSink;

impl LeakSink for TracingLeakSink {
    fn leak_detected(&self, report: &LeakReport) {
        warn!(
            parent = %report.parent,
            child = %report.child,
            open_children = report.open_children,
            thread = %report.context.thread_name(),
            created_at = %report.context.created_at(),
            stacktrace = %report.context.stack_trace(),
            "Resource closed before its children"
        );
    }
}

/// Keeps every report in memory.
#[derive(Debug, Default)]
pub struct RecordingLeakSink {
    reports: Mutex<Vec<LeakReport>>,
}

impl RecordingLeakSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<LeakReport> {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LeakSink for RecordingLeakSink {
    fn leak_detected(&self, report: &LeakReport) {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(report.clone());
    }
}
