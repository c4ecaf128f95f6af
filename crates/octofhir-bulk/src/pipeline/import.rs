//! Import direction: NDJSON object in, persisted resources and two outcome
//! logs out.

use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Value, json};

use super::{Fetch, Sink, Source};
use crate::buffer::{AppendError, ChunkBuffer};
use crate::checkpoint::{CarryOver, CheckpointState, ImportOutcomeSessions, UploadSessionState};
use crate::error::{BulkError, BulkResult};
use crate::object_storage::DynObjectStorage;
use crate::persistence::{DynPersistence, PersistedResource, WriteError};
use crate::policy::CheckpointPolicy;
use crate::telemetry::{self, Direction, FailureKind};
use crate::upload::{MultipartUploadSession, ObjectLayout};

/// One non-blank input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportLine {
    /// 1-based physical line number in the source object.
    pub line_number: u64,
    /// Line content without surrounding whitespace or the separator.
    pub bytes: Bytes,
}

#[derive(Debug, Clone, Default)]
pub struct ImportBatch {
    pub lines: Vec<ImportLine>,
}

/// Reads complete lines from an NDJSON object with ranged reads.
///
/// The cursor is the byte offset of the next unread line, so a resumed
/// partition never re-reads or splits a line.
pub struct ImportSource {
    storage: DynObjectStorage,
    bucket: String,
    key: String,
    batch_size: usize,
    read_chunk_bytes: usize,
    object_size: Option<u64>,
}

impl ImportSource {
    pub fn new(
        storage: DynObjectStorage,
        bucket: impl Into<String>,
        key: impl Into<String>,
        batch_size: usize,
        read_chunk_bytes: usize,
    ) -> Self {
        Self {
            storage,
            bucket: bucket.into(),
            key: key.into(),
            batch_size,
            read_chunk_bytes,
            object_size: None,
        }
    }

    async fn size(&mut self) -> BulkResult<u64> {
        if let Some(size) = self.object_size {
            return Ok(size);
        }
        let size = self.storage.object_size(&self.bucket, &self.key).await?;
        self.object_size = Some(size);
        Ok(size)
    }
}

#[async_trait]
impl Source for ImportSource {
    type Batch = ImportBatch;

    async fn open(&mut self, _state: &mut CheckpointState) -> BulkResult<()> {
        if self.batch_size == 0 || self.read_chunk_bytes == 0 {
            return Err(BulkError::configuration(
                "import batch size and read chunk size must be positive",
            ));
        }
        Ok(())
    }

    async fn fetch(&mut self, state: &mut CheckpointState) -> BulkResult<Fetch<ImportBatch>> {
        let size = self.size().await?;
        if state.cursor >= size {
            return Ok(Fetch::EndOfData);
        }

        let mut lines = Vec::new();
        let mut offset = state.cursor;
        let mut line_number = state.line_number;
        let mut window = self.read_chunk_bytes as u64;

        while lines.len() < self.batch_size && offset < size {
            let end = (offset + window).min(size);
            let data = self
                .storage
                .get_range(&self.bucket, &self.key, offset..end)
                .await?;

            let mut consumed = 0usize;
            while lines.len() < self.batch_size {
                let rest = &data[consumed..];
                let line_len = match rest.iter().position(|b| *b == b'\n') {
                    Some(pos) => pos + 1,
                    // Final line without a separator.
                    None if end == size && !rest.is_empty() => rest.len(),
                    None => break,
                };
                let raw = data.slice(consumed..consumed + line_len);
                consumed += line_len;
                line_number += 1;

                let trimmed = raw.trim_ascii();
                if !trimmed.is_empty() {
                    lines.push(ImportLine {
                        line_number,
                        bytes: raw.slice_ref(trimmed),
                    });
                }
            }

            if consumed == 0 {
                // A single line is longer than the window.
                window = window.saturating_mul(2);
                continue;
            }
            offset += consumed as u64;
            window = self.read_chunk_bytes as u64;
        }

        tracing::debug!(
            partition = %state.partition,
            key = %self.key,
            from = state.cursor,
            to = offset,
            lines = lines.len(),
            "Read import batch"
        );
        state.cursor = offset;
        state.line_number = line_number;
        Ok(Fetch::Batch(ImportBatch { lines }))
    }
}

/// Where one outcome log is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutcomeTarget {
    pub layout: ObjectLayout,
    /// Object name stem, unique per partition.
    pub stem: String,
}

/// Success and failure outcome logs of one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutcomeTargets {
    pub bucket: String,
    pub success: OutcomeTarget,
    pub failure: OutcomeTarget,
}

enum LineError {
    Parse(String),
    TypeMismatch(String),
}

fn parse_line(bytes: &[u8], expected_type: &str) -> Result<Value, LineError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| LineError::Parse(e.to_string()))?;
    if !value.is_object() {
        return Err(LineError::Parse("line is not a JSON object".to_string()));
    }
    match value.get("resourceType").and_then(Value::as_str) {
        Some(actual) if actual == expected_type => Ok(value),
        actual => Err(LineError::TypeMismatch(actual.unwrap_or("null").to_string())),
    }
}

/// Outcome record of a persisted resource.
pub fn success_outcome(persisted: &PersistedResource, line_number: u64, source: &str) -> Value {
    json!({
        "resourceType": "OperationOutcome",
        "issue": [{
            "severity": "information",
            "code": "informational",
            "details": { "text": source },
            "diagnostics": format!(
                "{}/{} imported from line {line_number}",
                persisted.resource_type, persisted.id
            ),
        }],
    })
}

/// Outcome record of a resource the persistence layer rejected.
pub fn failure_outcome(message: &str, line_number: u64, source: &str) -> Value {
    json!({
        "resourceType": "OperationOutcome",
        "issue": [{
            "severity": "error",
            "code": "processing",
            "details": { "text": source },
            "diagnostics": format!("Line {line_number}: {message}"),
        }],
    })
}

fn append_outcome(buffer: &mut ChunkBuffer, outcome: &Value) -> BulkResult<()> {
    match buffer.append_record(outcome) {
        Ok(_) => Ok(()),
        Err(AppendError::Io(e)) => Err(BulkError::Buffer(e)),
        Err(AppendError::Serialize(e)) => {
            tracing::warn!(error = %e, "Failed to serialize outcome record");
            Ok(())
        }
    }
}

/// Parses, validates and persists lines; records one outcome per write.
pub struct ImportSink {
    persistence: DynPersistence,
    session: MultipartUploadSession,
    resource_type: String,
    source_url: String,
    targets: OutcomeTargets,
    policy: CheckpointPolicy,
    success: ChunkBuffer,
    failure: ChunkBuffer,
}

impl ImportSink {
    pub fn new(
        persistence: DynPersistence,
        storage: DynObjectStorage,
        resource_type: impl Into<String>,
        source_url: impl Into<String>,
        targets: OutcomeTargets,
        policy: CheckpointPolicy,
    ) -> Self {
        Self {
            persistence,
            session: MultipartUploadSession::new(storage),
            resource_type: resource_type.into(),
            source_url: source_url.into(),
            targets,
            policy,
            success: ChunkBuffer::new(),
            failure: ChunkBuffer::new(),
        }
    }

    fn outcomes(state: &mut CheckpointState) -> BulkResult<&mut ImportOutcomeSessions> {
        state
            .import_outcomes
            .as_mut()
            .ok_or_else(|| BulkError::configuration("import partition has no outcome sessions"))
    }
}

/// Upload an outcome buffer if the boundary allows it, otherwise carry its
/// bytes in the checkpoint.
async fn flush_outcome(
    session: &MultipartUploadSession,
    policy: &CheckpointPolicy,
    buffer: &mut ChunkBuffer,
    state: &mut UploadSessionState,
    stem: &str,
    end_of_data: bool,
) -> BulkResult<()> {
    if buffer.is_empty() {
        state.carry_over = None;
        state.buffered_bytes = 0;
        return Ok(());
    }
    if end_of_data || !state.layout.is_shared() || policy.is_full_part(buffer.size()) {
        state.carry_over = None;
        session.upload_part(state, stem, buffer.drain()).await?;
    } else {
        state.buffered_bytes = buffer.size() as u64;
        state.carry_over = Some(CarryOver {
            text: buffer.as_carry_over(),
            records: buffer.records(),
        });
    }
    Ok(())
}

#[async_trait]
impl Sink for ImportSink {
    type Batch = ImportBatch;

    async fn open(&mut self, state: &mut CheckpointState) -> BulkResult<()> {
        state.resource_type = Some(self.resource_type.clone());
        let outcomes = state
            .import_outcomes
            .get_or_insert_with(|| ImportOutcomeSessions {
                success: UploadSessionState::new(
                    &self.targets.bucket,
                    self.targets.success.layout.clone(),
                ),
                failure: UploadSessionState::new(
                    &self.targets.bucket,
                    self.targets.failure.layout.clone(),
                ),
            });
        if let Some(carried) = outcomes.success.carry_over.take() {
            self.success = ChunkBuffer::from_carry_over(&carried.text, carried.records);
        }
        if let Some(carried) = outcomes.failure.carry_over.take() {
            self.failure = ChunkBuffer::from_carry_over(&carried.text, carried.records);
        }
        Ok(())
    }

    async fn consume(&mut self, batch: ImportBatch, state: &mut CheckpointState) -> BulkResult<()> {
        if batch.lines.is_empty() {
            return Ok(());
        }

        let mut tx = self.persistence.begin().await?;
        for line in &batch.lines {
            state.counts.processed += 1;

            let validation_started = Instant::now();
            let parsed = parse_line(&line.bytes, &self.resource_type);
            state.timings.validation_ms += validation_started.elapsed().as_millis() as u64;

            let resource = match parsed {
                Ok(resource) => resource,
                Err(LineError::Parse(error)) => {
                    state.counts.parse_failures += 1;
                    tracing::warn!(
                        partition = %state.partition,
                        line = line.line_number,
                        error = %error,
                        "Invalid JSON line, skipping"
                    );
                    telemetry::record_failure(Direction::Import, FailureKind::Parse);
                    continue;
                }
                Err(LineError::TypeMismatch(actual)) => {
                    state.counts.skipped += 1;
                    tracing::warn!(
                        partition = %state.partition,
                        line = line.line_number,
                        expected = %self.resource_type,
                        actual = %actual,
                        "Unexpected resourceType, skipping"
                    );
                    telemetry::record_failure(Direction::Import, FailureKind::Skipped);
                    continue;
                }
            };

            let write_started = Instant::now();
            let written = tx.upsert(&resource).await;
            state.timings.write_ms += write_started.elapsed().as_millis() as u64;

            match written {
                Ok(persisted) => {
                    state.counts.imported += 1;
                    let outcome = success_outcome(&persisted, line.line_number, &self.source_url);
                    append_outcome(&mut self.success, &outcome)?;
                }
                Err(WriteError::Rejected(message)) => {
                    state.counts.failed += 1;
                    tracing::warn!(
                        partition = %state.partition,
                        line = line.line_number,
                        error = %message,
                        "Failed to persist resource"
                    );
                    telemetry::record_failure(Direction::Import, FailureKind::Persist);
                    let outcome = failure_outcome(&message, line.line_number, &self.source_url);
                    append_outcome(&mut self.failure, &outcome)?;
                }
                Err(WriteError::Fatal(e)) => {
                    if let Err(rollback) = tx.rollback().await {
                        tracing::warn!(error = %rollback, "Rollback after failed write failed");
                    }
                    return Err(e);
                }
            }
        }
        tx.commit().await?;

        telemetry::record_processed(
            Direction::Import,
            &self.resource_type,
            batch.lines.len() as u64,
        );
        let outcomes = Self::outcomes(state)?;
        outcomes.success.buffered_bytes = self.success.size() as u64;
        outcomes.failure.buffered_bytes = self.failure.size() as u64;
        tracing::debug!(
            partition = %state.partition,
            lines = batch.lines.len(),
            imported = state.counts.imported,
            failed = state.counts.failed,
            "Persisted import batch"
        );
        Ok(())
    }

    fn buffered_bytes(&self) -> usize {
        self.success.size().max(self.failure.size())
    }

    async fn flush(&mut self, state: &mut CheckpointState, end_of_data: bool) -> BulkResult<()> {
        let started = Instant::now();
        let outcomes = Self::outcomes(state)?;
        flush_outcome(
            &self.session,
            &self.policy,
            &mut self.success,
            &mut outcomes.success,
            &self.targets.success.stem,
            end_of_data,
        )
        .await?;
        flush_outcome(
            &self.session,
            &self.policy,
            &mut self.failure,
            &mut outcomes.failure,
            &self.targets.failure.stem,
            end_of_data,
        )
        .await?;
        state.timings.write_ms += started.elapsed().as_millis() as u64;
        Ok(())
    }

    async fn finish(&mut self, state: &mut CheckpointState) -> BulkResult<()> {
        let imported = state.counts.imported;
        state.resource_type_summary.begin_type(&self.resource_type);
        state.resource_type_summary.record_part(imported);

        let outcomes = Self::outcomes(state)?;
        self.session.complete(&mut outcomes.success).await?;
        self.session.complete(&mut outcomes.failure).await
    }
}
