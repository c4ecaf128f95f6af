//! Bulk pipeline metrics and logging setup.
//!
//! Metrics are recorded through the `metrics` facade; installing an exporter
//! (Prometheus or otherwise) is up to the embedding process.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{EnvFilter, fmt, prelude::*, reload};

/// Metric names as constants for consistency.
pub mod names {
    pub const RECORDS_PROCESSED_TOTAL: &str = "bulk_records_processed_total";
    pub const RECORDS_FAILED_TOTAL: &str = "bulk_records_failed_total";
    pub const PARTS_UPLOADED_TOTAL: &str = "bulk_parts_uploaded_total";
    pub const PART_BYTES: &str = "bulk_part_bytes";
    pub const CHECKPOINTS_TOTAL: &str = "bulk_checkpoints_total";
    pub const STORAGE_REQUESTS_TOTAL: &str = "bulk_storage_requests_total";
    pub const STORAGE_REQUEST_DURATION_SECONDS: &str = "bulk_storage_request_duration_seconds";
}

/// Transfer direction of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Export,
    Import,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Export => "export",
            Self::Import => "import",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of per-record failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Serialize,
    Parse,
    Persist,
    Skipped,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Serialize => "serialize",
            Self::Parse => "parse",
            Self::Persist => "persist",
            Self::Skipped => "skipped",
        }
    }
}

pub fn record_processed(direction: Direction, resource_type: &str, count: u64) {
    counter!(
        names::RECORDS_PROCESSED_TOTAL,
        "direction" => direction.as_str(),
        "resource_type" => resource_type.to_string()
    )
    .increment(count);
}

pub fn record_failure(direction: Direction, kind: FailureKind) {
    counter!(
        names::RECORDS_FAILED_TOTAL,
        "direction" => direction.as_str(),
        "kind" => kind.as_str()
    )
    .increment(1);
}

pub fn record_part_uploaded(bytes: usize) {
    counter!(names::PARTS_UPLOADED_TOTAL).increment(1);
    histogram!(names::PART_BYTES).record(bytes as f64);
}

pub fn record_checkpoint(direction: Direction) {
    counter!(names::CHECKPOINTS_TOTAL, "direction" => direction.as_str()).increment(1);
}

pub fn record_storage_request(operation: &'static str, success: bool, duration: Duration) {
    let status = if success { "success" } else { "error" };
    counter!(
        names::STORAGE_REQUESTS_TOTAL,
        "operation" => operation,
        "status" => status
    )
    .increment(1);
    histogram!(names::STORAGE_REQUEST_DURATION_SECONDS, "operation" => operation)
        .record(duration.as_secs_f64());
}

static LOG_RELOAD_HANDLE: OnceLock<reload::Handle<EnvFilter, tracing_subscriber::Registry>> =
    OnceLock::new();

pub fn init_tracing() {
    init_tracing_with_level("info");
}

pub fn init_tracing_with_level(level: &str) {
    // Prefer RUST_LOG from env, otherwise use provided level string.
    let base_filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|_| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(level));

    let (reload_layer, handle) = reload::Layer::new(base_filter);
    let _ = LOG_RELOAD_HANDLE.set(handle);

    let _ = tracing_subscriber::registry()
        .with(reload_layer)
        .with(fmt::layer())
        .try_init();
}

/// Apply a new logging level at runtime if reload handle is configured.
pub fn apply_logging_level(level: &str) {
    if let Some(handle) = LOG_RELOAD_HANDLE.get() {
        let _ = handle.modify(|f| {
            *f = EnvFilter::new(level);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels() {
        assert_eq!(Direction::Export.as_str(), "export");
        assert_eq!(FailureKind::Parse.as_str(), "parse");
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        record_processed(Direction::Import, "Patient", 3);
        record_failure(Direction::Export, FailureKind::Serialize);
        record_part_uploaded(1024);
        record_checkpoint(Direction::Export);
        record_storage_request("put", true, Duration::from_millis(3));
    }

    #[test]
    fn test_init_tracing_is_idempotent() {
        init_tracing_with_level("debug");
        init_tracing_with_level("info");
        apply_logging_level("warn");
    }
}
