//! Multipart upload session state machine.
//!
//! `NotStarted -> Active -> Completed`. The first flush starts the session,
//! every further flush uploads one part under the next part number, and the
//! session is completed once when the partition's source is exhausted.
//!
//! The session keeps no state of its own: everything lives in an
//! [`UploadSessionState`] inside the partition checkpoint, so a resumed
//! partition continues with the same upload id and part numbering.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::buffer::Chunk;
use crate::checkpoint::{CompletedPart, SessionStatus, UploadSessionState};
use crate::error::{BulkError, BulkResult};
use crate::object_storage::DynObjectStorage;
use crate::telemetry;

/// Object-key derivation rule of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObjectLayout {
    /// Each part is a standalone object `{prefix}/{stem}_{partNumber}.ndjson`.
    PerPart { prefix: String },
    /// All parts assemble one object at `key`.
    SharedObject { key: String },
}

impl ObjectLayout {
    pub fn is_shared(&self) -> bool {
        matches!(self, Self::SharedObject { .. })
    }

    /// Prefix or shared key.
    pub fn base_key(&self) -> &str {
        match self {
            Self::PerPart { prefix } => prefix,
            Self::SharedObject { key } => key,
        }
    }

    /// Key the given part is written to.
    pub fn part_key(&self, stem: &str, part_number: u32) -> String {
        match self {
            Self::PerPart { prefix } if prefix.is_empty() => {
                format!("{stem}_{part_number}.ndjson")
            }
            Self::PerPart { prefix } => format!("{prefix}/{stem}_{part_number}.ndjson"),
            Self::SharedObject { key } => key.clone(),
        }
    }
}

/// Drives the upload protocol for one [`UploadSessionState`].
#[derive(Clone)]
pub struct MultipartUploadSession {
    storage: DynObjectStorage,
}

impl MultipartUploadSession {
    pub fn new(storage: DynObjectStorage) -> Self {
        Self { storage }
    }

    /// `NotStarted -> Active`.
    pub async fn start(&self, state: &mut UploadSessionState) -> BulkResult<()> {
        if state.status != SessionStatus::NotStarted {
            return Err(BulkError::invalid_session_state(
                state.location(),
                state.status,
                "start",
            ));
        }
        state.bucket = self.storage.ensure_bucket(&state.bucket).await?;
        if let ObjectLayout::SharedObject { key } = &state.layout {
            let upload_id = self
                .storage
                .start_multipart_upload(&state.bucket, key)
                .await?;
            tracing::debug!(bucket = %state.bucket, key = %key, upload_id = %upload_id, "Multipart upload started");
            state.upload_id = Some(upload_id);
        }
        state.status = SessionStatus::Active;
        Ok(())
    }

    /// Upload `chunk` as the next part, starting the session on first use.
    /// Returns the part number used.
    pub async fn upload_part(
        &self,
        state: &mut UploadSessionState,
        stem: &str,
        chunk: Chunk,
    ) -> BulkResult<u32> {
        match state.status {
            SessionStatus::NotStarted => self.start(state).await?,
            SessionStatus::Active => {}
            SessionStatus::Completed => {
                return Err(BulkError::invalid_session_state(
                    state.location(),
                    state.status,
                    "upload part",
                ));
            }
        }

        let part_number = state.part_number;
        let key = state.layout.part_key(stem, part_number);
        let len = chunk.len();
        let started = Instant::now();
        let tag = match (&state.layout, &state.upload_id) {
            (ObjectLayout::SharedObject { .. }, Some(upload_id)) => {
                self.storage
                    .upload_part(&state.bucket, &key, upload_id, part_number, chunk.bytes)
                    .await?
            }
            (ObjectLayout::SharedObject { .. }, None) => {
                return Err(BulkError::invalid_session_state(
                    state.location(),
                    "active without upload id",
                    "upload part",
                ));
            }
            (ObjectLayout::PerPart { .. }, _) => {
                self.storage
                    .put_object(&state.bucket, &key, chunk.bytes)
                    .await?
            }
        };

        tracing::debug!(
            bucket = %state.bucket,
            key = %key,
            part_number,
            bytes = len,
            records = chunk.records,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Part uploaded"
        );
        telemetry::record_part_uploaded(len);

        state.parts.push(CompletedPart {
            part_number,
            tag,
            key,
            stem: stem.to_string(),
            records: chunk.records,
            bytes: len as u64,
        });
        state.part_number += 1;
        state.bytes_uploaded += len as u64;
        state.buffered_bytes = 0;
        Ok(part_number)
    }

    /// `Active -> Completed`. A session that never started completes without
    /// touching the object store. Completing twice is an error.
    pub async fn complete(&self, state: &mut UploadSessionState) -> BulkResult<()> {
        match state.status {
            SessionStatus::Completed => {
                return Err(BulkError::invalid_session_state(
                    state.location(),
                    state.status,
                    "complete",
                ));
            }
            SessionStatus::NotStarted => {
                tracing::debug!(location = %state.location(), "Completing empty upload session");
            }
            SessionStatus::Active => {
                if let (ObjectLayout::SharedObject { key }, Some(upload_id)) =
                    (&state.layout, &state.upload_id)
                {
                    self.storage
                        .complete_multipart_upload(
                            &state.bucket,
                            key,
                            upload_id,
                            &state.part_tags(),
                        )
                        .await?;
                    tracing::info!(
                        bucket = %state.bucket,
                        key = %key,
                        parts = state.parts.len(),
                        bytes = state.bytes_uploaded,
                        "Multipart upload completed"
                    );
                }
            }
        }
        state.status = SessionStatus::Completed;
        Ok(())
    }
}
