//! Export direction: paginated search in, NDJSON parts out.

use std::time::Instant;

use async_trait::async_trait;

use super::{Fetch, Sink, Source};
use crate::buffer::{AppendError, ChunkBuffer};
use crate::checkpoint::{CheckpointState, UploadSessionState};
use crate::error::{BulkError, BulkResult};
use crate::object_storage::DynObjectStorage;
use crate::persistence::{DynPersistence, PageRequest, SortSpec, StoredResource};
use crate::telemetry::{self, Direction, FailureKind};
use crate::upload::{MultipartUploadSession, ObjectLayout};

/// One search page of one resource type.
#[derive(Debug, Clone)]
pub struct ExportBatch {
    pub resource_type: String,
    pub page_number: u64,
    pub last_page_number: u64,
    pub resources: Vec<StoredResource>,
}

/// Pages through the partition's resource types in order.
///
/// The cursor is the 1-based page number of the current type. When a type's
/// last page has been read, the cursor moves to page 1 of the next type.
pub struct ExportSource {
    persistence: DynPersistence,
    resource_types: Vec<String>,
    page_size: u32,
    sort: SortSpec,
}

impl ExportSource {
    pub fn new(persistence: DynPersistence, resource_types: Vec<String>, page_size: u32) -> Self {
        Self {
            persistence,
            resource_types,
            page_size,
            sort: SortSpec::by_id(),
        }
    }

    pub fn with_sort(mut self, sort: SortSpec) -> Self {
        self.sort = sort;
        self
    }
}

#[async_trait]
impl Source for ExportSource {
    type Batch = ExportBatch;

    async fn open(&mut self, state: &mut CheckpointState) -> BulkResult<()> {
        if self.page_size == 0 {
            return Err(BulkError::configuration("export page size must be positive"));
        }
        if state.resource_type.is_none() {
            state.resource_type = self.resource_types.get(state.resource_type_index).cloned();
        }
        state.cursor = state.cursor.max(1);
        Ok(())
    }

    async fn fetch(&mut self, state: &mut CheckpointState) -> BulkResult<Fetch<ExportBatch>> {
        let index = state.resource_type_index;
        let Some(resource_type) = self.resource_types.get(index).cloned() else {
            return Ok(Fetch::EndOfData);
        };
        let page_number = state.cursor.max(1);
        let request = PageRequest {
            page_number,
            page_size: self.page_size,
            sort: self.sort.clone(),
        };

        let mut tx = self.persistence.begin().await?;
        let page = match tx.search(&resource_type, &request).await {
            Ok(page) => page,
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(error = %rollback, "Rollback after failed search failed");
                }
                return Err(e);
            }
        };
        tx.commit().await?;

        if page_number >= page.last_page_number {
            state.resource_type_index = index + 1;
            state.resource_type = self.resource_types.get(index + 1).cloned();
            state.cursor = 1;
        } else {
            state.cursor = page_number + 1;
        }

        tracing::debug!(
            partition = %state.partition,
            resource_type = %resource_type,
            page_number,
            last_page_number = page.last_page_number,
            resources = page.resources.len(),
            "Fetched export page"
        );

        Ok(Fetch::Batch(ExportBatch {
            resource_type,
            page_number,
            last_page_number: page.last_page_number,
            resources: page.resources,
        }))
    }
}

/// Serializes pages into NDJSON and uploads them as parts.
pub struct ExportSink {
    session: MultipartUploadSession,
    bucket: String,
    layout: ObjectLayout,
    buffer: ChunkBuffer,
}

impl ExportSink {
    pub fn new(storage: DynObjectStorage, bucket: impl Into<String>, layout: ObjectLayout) -> Self {
        Self {
            session: MultipartUploadSession::new(storage),
            bucket: bucket.into(),
            layout,
            buffer: ChunkBuffer::new(),
        }
    }

    /// Upload everything buffered as one part of the current type.
    async fn upload_buffer(&mut self, state: &mut CheckpointState) -> BulkResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let session = session_state(&mut state.upload_session)?;
        let stem = state
            .resource_type_summary
            .current_type()
            .unwrap_or("export")
            .to_string();
        let chunk = self.buffer.drain();
        let records = chunk.records;

        let started = Instant::now();
        self.session.upload_part(session, &stem, chunk).await?;
        state.timings.write_ms += started.elapsed().as_millis() as u64;
        state.resource_type_summary.record_part(records);
        Ok(())
    }
}

fn session_state(session: &mut Option<UploadSessionState>) -> BulkResult<&mut UploadSessionState> {
    session
        .as_mut()
        .ok_or_else(|| BulkError::configuration("export partition has no upload session"))
}

#[async_trait]
impl Sink for ExportSink {
    type Batch = ExportBatch;

    async fn open(&mut self, state: &mut CheckpointState) -> BulkResult<()> {
        if state.upload_session.is_none() {
            state.upload_session = Some(UploadSessionState::new(&self.bucket, self.layout.clone()));
        }
        Ok(())
    }

    async fn consume(&mut self, batch: ExportBatch, state: &mut CheckpointState) -> BulkResult<()> {
        let current = state.resource_type_summary.current_type();
        if current != Some(batch.resource_type.as_str()) {
            if let Some(previous) = current {
                if session_state(&mut state.upload_session)?.layout.is_shared() {
                    return Err(BulkError::configuration(format!(
                        "shared object layout holds a single resource type, got {previous} and {}",
                        batch.resource_type
                    )));
                }
            }
            // Per-part layout: the previous type's bytes become its own part.
            self.upload_buffer(state).await?;
            state.resource_type_summary.begin_type(&batch.resource_type);
        }

        let mut appended = 0u64;
        for resource in &batch.resources {
            let result = resource
                .to_json()
                .map_err(AppendError::Serialize)
                .and_then(|value| self.buffer.append_record(&value));
            match result {
                Ok(_) => appended += 1,
                Err(AppendError::Serialize(e)) => {
                    tracing::warn!(
                        partition = %state.partition,
                        resource_type = %resource.resource_type,
                        id = %resource.id,
                        error = %e,
                        "Failed to serialize resource, skipping"
                    );
                    telemetry::record_failure(Direction::Export, FailureKind::Serialize);
                }
                Err(AppendError::Io(e)) => return Err(BulkError::Buffer(e)),
            }
        }

        state.counts.processed += appended;
        session_state(&mut state.upload_session)?.buffered_bytes = self.buffer.size() as u64;
        telemetry::record_processed(Direction::Export, &batch.resource_type, appended);
        tracing::debug!(
            partition = %state.partition,
            resource_type = %batch.resource_type,
            page_number = batch.page_number,
            appended,
            buffered = self.buffer.size(),
            "Buffered export page"
        );
        Ok(())
    }

    fn buffered_bytes(&self) -> usize {
        self.buffer.size()
    }

    async fn flush(&mut self, state: &mut CheckpointState, _end_of_data: bool) -> BulkResult<()> {
        self.upload_buffer(state).await
    }

    async fn finish(&mut self, state: &mut CheckpointState) -> BulkResult<()> {
        let session = session_state(&mut state.upload_session)?;
        self.session.complete(session).await
    }
}
