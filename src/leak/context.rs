use std::backtrace::Backtrace;
use std::fmt::Write as _;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};

/// Where and when a tracked resource was created.
#[derive(Debug, Clone)]
pub struct CreationContext {
    created_at: DateTime<Utc>,
    thread_name: String,
    stack_trace: Arc<Backtrace>,
}

impl CreationContext {
    /// Capture the current time, thread and call stack.
    pub fn capture() -> Self {
        let thread = std::thread::current();
        Self {
            created_at: Utc::now(),
            thread_name: thread.name().unwrap_or("<unnamed>").to_string(),
            stack_trace: Arc::new(Backtrace::force_capture()),
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    pub fn stack_trace(&self) -> String {
        self.stack_trace.to_string()
    }

    /// Render the context, indenting every stack frame with `indent`.
    pub fn dump(&self, indent: &str) -> String {
        let mut out = format!(
            "Creation context - Thread: '{}', date: '{}', stacktrace:",
            self.thread_name,
            self.created_at.to_rfc3339_opts(SecondsFormat::Millis, true)
        );
        for line in self.stack_trace().lines() {
            let _ = write!(out, "\n{indent}\t{line}");
        }
        out
    }
}
