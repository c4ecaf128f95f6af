//! Resumable partition state.
//!
//! A [`CheckpointState`] carries exactly what a partition needs to resume:
//! the source cursor, the upload session(s) and the accumulated metrics.
//! The worker mutates one live instance; at every policy-approved boundary
//! it freezes an immutable [`CheckpointSnapshot`] for the orchestration
//! runtime, so serialization never observes a half-applied batch.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::BulkResult;
use crate::upload::ObjectLayout;

/// Per-partition record counters. Reset only when a partition starts from
/// scratch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    pub processed: u64,
    pub imported: u64,
    pub failed: u64,
    pub skipped: u64,
    pub parse_failures: u64,
}

impl Counts {
    /// Fold `other` into `self`.
    pub fn merge(&mut self, other: &Counts) {
        self.processed += other.processed;
        self.imported += other.imported;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.parse_failures += other.parse_failures;
    }

    /// `imported + failed + skipped <= processed`.
    pub fn is_consistent(&self) -> bool {
        self.imported + self.failed + self.skipped <= self.processed
    }
}

/// Accumulated wall-clock time spent per phase, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timings {
    pub read_ms: u64,
    pub write_ms: u64,
    pub validation_ms: u64,
    /// Total time the partition has been running, summed across restarts.
    pub elapsed_ms: u64,
}

impl Timings {
    pub fn merge(&mut self, other: &Timings) {
        self.read_ms += other.read_ms;
        self.write_ms += other.write_ms;
        self.validation_ms += other.validation_ms;
        self.elapsed_ms += other.elapsed_ms;
    }
}

/// Multipart session lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    NotStarted,
    Active,
    Completed,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::Active => write!(f, "active"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

/// One successfully uploaded part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    pub part_number: u32,
    /// Tag (ETag / content id) returned by the object store.
    pub tag: String,
    /// Object the part belongs to.
    pub key: String,
    /// Name the part was written under, e.g. the resource type.
    pub stem: String,
    pub records: u64,
    pub bytes: u64,
}

/// Buffered outcome lines that were too small to upload as a non-final part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarryOver {
    pub text: String,
    pub records: u64,
}

/// Persisted fields of one multipart upload session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSessionState {
    /// Lower-cased bucket name.
    pub bucket: String,
    pub layout: ObjectLayout,
    pub status: SessionStatus,
    /// Upload id allocated by the object store (shared-object layout only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<String>,
    /// Completed parts in upload order.
    #[serde(default)]
    pub parts: Vec<CompletedPart>,
    /// Next part number to allocate. Starts at 1, never reused.
    pub part_number: u32,
    /// Bytes held in the live buffer when this state was captured.
    #[serde(default)]
    pub buffered_bytes: u64,
    #[serde(default)]
    pub bytes_uploaded: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carry_over: Option<CarryOver>,
}

impl UploadSessionState {
    pub fn new(bucket: impl Into<String>, layout: ObjectLayout) -> Self {
        Self {
            bucket: bucket.into().to_ascii_lowercase(),
            layout,
            status: SessionStatus::NotStarted,
            upload_id: None,
            parts: Vec::new(),
            part_number: 1,
            buffered_bytes: 0,
            bytes_uploaded: 0,
            carry_over: None,
        }
    }

    /// Ordered list of completed part tags.
    pub fn part_tags(&self) -> Vec<String> {
        self.parts.iter().map(|p| p.tag.clone()).collect()
    }

    /// Records uploaded through this session.
    pub fn records_uploaded(&self) -> u64 {
        self.parts.iter().map(|p| p.records).sum()
    }

    /// Human-readable location of the session, used in logs and errors.
    pub fn location(&self) -> String {
        format!("{}/{}", self.bucket, self.layout.base_key())
    }
}

/// The two independent outcome-log sessions of an import partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportOutcomeSessions {
    pub success: UploadSessionState,
    pub failure: UploadSessionState,
}

/// Per-part record counts of one resource type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeSegment {
    pub resource_type: String,
    pub part_counts: Vec<u64>,
}

/// Running tally rendered as `Type[n,n,...]:Type2[...]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceTypeSummary {
    segments: Vec<TypeSegment>,
}

impl ResourceTypeSummary {
    /// Open a segment for `resource_type` unless it is already the current
    /// one. Idempotent so a resumed partition does not duplicate segments.
    pub fn begin_type(&mut self, resource_type: &str) {
        if self.current_type() != Some(resource_type) {
            self.segments.push(TypeSegment {
                resource_type: resource_type.to_string(),
                part_counts: Vec::new(),
            });
        }
    }

    /// Record the record count of a part just uploaded for the current type.
    pub fn record_part(&mut self, records: u64) {
        if let Some(segment) = self.segments.last_mut() {
            segment.part_counts.push(records);
        }
    }

    pub fn current_type(&self) -> Option<&str> {
        self.segments.last().map(|s| s.resource_type.as_str())
    }

    pub fn segments(&self) -> &[TypeSegment] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

impl fmt::Display for ResourceTypeSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, segment) in self.segments.iter().enumerate() {
            if idx > 0 {
                write!(f, ":")?;
            }
            write!(f, "{}[", segment.resource_type)?;
            if segment.part_counts.is_empty() {
                write!(f, "0")?;
            }
            for (n, count) in segment.part_counts.iter().enumerate() {
                if n > 0 {
                    write!(f, ",")?;
                }
                write!(f, "{count}")?;
            }
            write!(f, "]")?;
        }
        Ok(())
    }
}

/// Live, resumable state of one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointState {
    /// Partition name, e.g. `{job_id}-0`.
    pub partition: String,
    /// Next page number (export, 1-based) or byte offset of the next unread
    /// line (import).
    pub cursor: u64,
    /// Lines consumed so far (import only).
    #[serde(default)]
    pub line_number: u64,
    /// Index into the partition's resource-type list.
    pub resource_type_index: usize,
    /// Resource type the cursor applies to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    /// The source has signalled end-of-data and the terminal flush ran.
    #[serde(default)]
    pub exhausted: bool,
    pub counts: Counts,
    pub timings: Timings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_session: Option<UploadSessionState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import_outcomes: Option<ImportOutcomeSessions>,
    #[serde(default)]
    pub resource_type_summary: ResourceTypeSummary,
}

impl CheckpointState {
    /// Empty state for a partition starting with no prior checkpoint.
    pub fn new(partition: impl Into<String>, initial_cursor: u64) -> Self {
        Self {
            partition: partition.into(),
            cursor: initial_cursor,
            line_number: 0,
            resource_type_index: 0,
            resource_type: None,
            exhausted: false,
            counts: Counts::default(),
            timings: Timings::default(),
            upload_session: None,
            import_outcomes: None,
            resource_type_summary: ResourceTypeSummary::default(),
        }
    }

    pub fn to_bytes(&self) -> BulkResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn from_bytes(bytes: &[u8]) -> BulkResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Freeze the current state into an immutable snapshot.
    pub fn snapshot(&self) -> BulkResult<CheckpointSnapshot> {
        Ok(CheckpointSnapshot {
            partition: self.partition.clone(),
            bytes: self.to_bytes()?,
        })
    }

    /// Every upload session owned by this partition.
    pub fn sessions(&self) -> Vec<&UploadSessionState> {
        let mut sessions = Vec::new();
        sessions.extend(self.upload_session.iter());
        if let Some(outcomes) = &self.import_outcomes {
            sessions.push(&outcomes.success);
            sessions.push(&outcomes.failure);
        }
        sessions
    }
}

/// Serialized, immutable checkpoint handed to the orchestration runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointSnapshot {
    partition: String,
    bytes: Bytes,
}

impl CheckpointSnapshot {
    pub fn from_bytes(partition: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            partition: partition.into(),
            bytes: bytes.into(),
        }
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }

    pub fn state(&self) -> BulkResult<CheckpointState> {
        CheckpointState::from_bytes(&self.bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> CheckpointState {
        let mut state = CheckpointState::new("job-0", 4);
        state.resource_type = Some("Patient".into());
        state.counts = Counts {
            processed: 10,
            imported: 6,
            failed: 2,
            skipped: 1,
            parse_failures: 1,
        };
        state.timings.read_ms = 12;
        let mut session = UploadSessionState::new(
            "Fhir-Bulk",
            ObjectLayout::SharedObject {
                key: "export/job/patients.ndjson".into(),
            },
        );
        session.status = SessionStatus::Active;
        session.upload_id = Some("upload-1".into());
        session.parts.push(CompletedPart {
            part_number: 1,
            tag: "etag-1".into(),
            key: "export/job/patients.ndjson".into(),
            stem: "Patient".into(),
            records: 10,
            bytes: 512,
        });
        session.part_number = 2;
        state.upload_session = Some(session);
        state.resource_type_summary.begin_type("Patient");
        state.resource_type_summary.record_part(10);
        state
    }

    #[test]
    fn test_round_trip_is_lossless() {
        let state = sample_state();
        let bytes = state.to_bytes().unwrap();
        let restored = CheckpointState::from_bytes(&bytes).unwrap();
        assert_eq!(restored, state);
        // A second store/reload cycle yields identical bytes.
        assert_eq!(restored.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn test_bucket_is_lower_cased() {
        let state = sample_state();
        assert_eq!(state.upload_session.unwrap().bucket, "fhir-bulk");
    }

    #[test]
    fn test_summary_rendering() {
        let mut summary = ResourceTypeSummary::default();
        summary.begin_type("Patient");
        summary.record_part(1000);
        summary.record_part(250);
        summary.begin_type("Observation");
        summary.begin_type("Observation");
        summary.record_part(3);
        summary.begin_type("Condition");
        assert_eq!(
            summary.to_string(),
            "Patient[1000,250]:Observation[3]:Condition[0]"
        );
    }

    #[test]
    fn test_counts_merge_and_consistency() {
        let mut total = Counts::default();
        total.merge(&Counts {
            processed: 5,
            imported: 4,
            failed: 1,
            ..Counts::default()
        });
        total.merge(&Counts {
            processed: 3,
            skipped: 1,
            parse_failures: 2,
            ..Counts::default()
        });
        assert_eq!(total.processed, 8);
        assert_eq!(total.parse_failures, 2);
        assert!(total.is_consistent());

        let broken = Counts {
            processed: 1,
            imported: 2,
            ..Counts::default()
        };
        assert!(!broken.is_consistent());
    }

    #[test]
    fn test_snapshot_is_detached_from_live_state() {
        let mut state = sample_state();
        let snapshot = state.snapshot().unwrap();
        state.counts.processed += 100;
        assert_eq!(snapshot.state().unwrap().counts.processed, 10);
        assert_eq!(snapshot.partition(), "job-0");
    }
}
