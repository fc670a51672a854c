// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Span helpers for consistent instrumentation.

use std::time::Instant;
use tracing::{debug_span, Span};

/// RAII guard for timing any control-plane operation.
///
/// Records the operation name and duration to metrics when dropped, so early
/// returns through `?` are still measured.
pub struct TimedOperation {
    name: &'static str,
    start: Instant,
    span: Span,
}

impl TimedOperation {
    /// Start a new timed operation.
    pub fn start(name: &'static str) -> Self {
        let span = debug_span!(
            "operation",
            op = %name,
            duration_us = tracing::field::Empty,
        );

        Self {
            name,
            start: Instant::now(),
            span,
        }
    }

    /// Get elapsed time so far.
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }

    /// Get the underlying span.
    pub fn span(&self) -> &Span {
        &self.span
    }
}

impl Drop for TimedOperation {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        self.span.record("duration_us", duration.as_micros() as u64);
        #[cfg(feature = "telemetry")]
        super::metrics::GLOBAL_METRICS.record_operation(self.name, duration);
    }
}

/// Macro for timing an operation until the end of the enclosing scope.
///
/// # Example
///
/// ```rust,ignore
/// use gatehouse::timed;
///
/// fn expensive_work() {
///     let _timer = timed!("expensive_work");
///     // ... work happens ...
/// } // Timer automatically records on drop
/// ```
#[macro_export]
macro_rules! timed {
    ($name:expr) => {
        $crate::telemetry::TimedOperation::start($name)
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::metrics::GLOBAL_METRICS;

    #[test]
    fn test_timed_operation_records_on_drop() {
        {
            let op = TimedOperation::start("test.timed_drop");
            std::thread::sleep(std::time::Duration::from_millis(1));
            assert!(op.elapsed().as_micros() > 0);
        }
        #[cfg(feature = "telemetry")]
        assert!(GLOBAL_METRICS.operation_metrics("test.timed_drop").is_some());
    }

    #[test]
    fn test_timed_macro() {
        let timer = crate::timed!("test.macro");
        assert_eq!(timer.name, "test.macro");
    }
}
