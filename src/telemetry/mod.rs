// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Telemetry, tracing, and metrics infrastructure.
//!
//! - **Tracing**: structured logging to stderr via `tracing-subscriber`
//! - **Metrics**: verdict counters and operation latency histograms
//!
//! Initialize telemetry at application startup:
//!
//! ```rust,ignore
//! use gatehouse::telemetry::{init_telemetry, TelemetryConfig};
//!
//! let _guard = init_telemetry(&TelemetryConfig::default())?;
//! ```

mod init;
pub mod metrics;
pub mod spans;

pub use init::{init_telemetry, TelemetryConfig, TelemetryGuard};
pub use metrics::{Histogram, Metrics, MetricsSnapshot, OperationMetrics, VerdictKind, GLOBAL_METRICS};
pub use spans::TimedOperation;
