//! Object-storage collaborator.
//!
//! The pipeline only depends on the [`ObjectStorage`] contract: the
//! three-phase multipart protocol, single-shot puts for small objects and
//! ranged reads for import sources. [`ObjectStoreClient`] implements it over
//! the `object_store` crate, which covers S3, GCS, Azure, the local
//! filesystem and an in-memory store used in tests.

use std::collections::HashSet;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use object_store::memory::InMemory;
use object_store::multipart::{MultipartStore, PartId};
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use parking_lot::Mutex;

use crate::error::{BulkError, BulkResult};
use crate::telemetry;

/// Contract of the object store as seen by the pipeline.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Normalize `bucket` (lower-cased) and create it if absent.
    async fn ensure_bucket(&self, bucket: &str) -> BulkResult<String>;

    /// Allocate an upload id for `key`.
    async fn start_multipart_upload(&self, bucket: &str, key: &str) -> BulkResult<String>;

    /// Upload one part and return its tag. `part_number` is 1-based.
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        bytes: Bytes,
    ) -> BulkResult<String>;

    /// Assemble the object from the ordered part tags.
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_tags: &[String],
    ) -> BulkResult<()>;

    /// Single-shot write; returns the object's tag.
    async fn put_object(&self, bucket: &str, key: &str, bytes: Bytes) -> BulkResult<String>;

    /// Size of an existing object in bytes.
    async fn object_size(&self, bucket: &str, key: &str) -> BulkResult<u64>;

    /// Read `range` of an existing object.
    async fn get_range(&self, bucket: &str, key: &str, range: Range<u64>) -> BulkResult<Bytes>;
}

/// Shared handle to an object-storage collaborator.
pub type DynObjectStorage = Arc<dyn ObjectStorage>;

/// Read a whole object through the [`ObjectStorage`] contract.
pub async fn read_object(storage: &dyn ObjectStorage, bucket: &str, key: &str) -> BulkResult<Bytes> {
    let size = storage.object_size(bucket, key).await?;
    if size == 0 {
        return Ok(Bytes::new());
    }
    storage.get_range(bucket, key, 0..size).await
}

/// [`ObjectStorage`] over an `object_store` backend.
///
/// Buckets map to the first path segment. Backends without
/// [`MultipartStore`] support can still serve per-part layouts, which only
/// use single-shot puts.
pub struct ObjectStoreClient {
    store: Arc<dyn ObjectStore>,
    multipart: Option<Arc<dyn MultipartStore>>,
    buckets: Mutex<HashSet<String>>,
}

impl std::fmt::Debug for ObjectStoreClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ObjectStoreClient<{}, multipart={}>",
            self.store,
            self.multipart.is_some()
        )
    }
}

impl ObjectStoreClient {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            multipart: None,
            buckets: Mutex::new(HashSet::new()),
        }
    }

    /// Enable the shared-object layout with an explicit multipart backend.
    pub fn with_multipart(mut self, multipart: Arc<dyn MultipartStore>) -> Self {
        self.multipart = Some(multipart);
        self
    }

    /// Fully featured in-memory store.
    pub fn in_memory() -> Self {
        let store = Arc::new(InMemory::new());
        Self::new(store.clone()).with_multipart(store)
    }

    fn path(bucket: &str, key: &str) -> Path {
        Path::from(format!("{}/{}", bucket.to_ascii_lowercase(), key))
    }

    fn multipart(&self, operation: &'static str) -> BulkResult<&Arc<dyn MultipartStore>> {
        self.multipart.as_ref().ok_or_else(|| {
            BulkError::configuration(format!(
                "object store backend does not support multipart uploads ({operation})"
            ))
        })
    }
}

fn storage_err(operation: &'static str) -> impl FnOnce(object_store::Error) -> BulkError {
    move |e| BulkError::object_storage(operation, e.to_string())
}

#[async_trait]
impl ObjectStorage for ObjectStoreClient {
    async fn ensure_bucket(&self, bucket: &str) -> BulkResult<String> {
        let normalized = bucket.trim().to_ascii_lowercase();
        if normalized.is_empty() || normalized.contains('/') {
            return Err(BulkError::configuration(format!(
                "invalid bucket name '{bucket}'"
            )));
        }
        // Buckets are path prefixes here and come into existence with the
        // first object written under them.
        if self.buckets.lock().insert(normalized.clone()) {
            tracing::info!(bucket = %normalized, "Bucket registered");
        }
        Ok(normalized)
    }

    async fn start_multipart_upload(&self, bucket: &str, key: &str) -> BulkResult<String> {
        let multipart = self.multipart("start_multipart_upload")?;
        let start = Instant::now();
        let result = multipart.create_multipart(&Self::path(bucket, key)).await;
        telemetry::record_storage_request("create_multipart", result.is_ok(), start.elapsed());
        result.map_err(storage_err("start_multipart_upload"))
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        bytes: Bytes,
    ) -> BulkResult<String> {
        let multipart = self.multipart("upload_part")?;
        if part_number == 0 {
            return Err(BulkError::object_storage(
                "upload_part",
                "part numbers start at 1",
            ));
        }
        let start = Instant::now();
        let upload_id = upload_id.to_string();
        let result = multipart
            .put_part(
                &Self::path(bucket, key),
                &upload_id,
                (part_number - 1) as usize,
                PutPayload::from(bytes),
            )
            .await;
        telemetry::record_storage_request("put_part", result.is_ok(), start.elapsed());
        Ok(result.map_err(storage_err("upload_part"))?.content_id)
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_tags: &[String],
    ) -> BulkResult<()> {
        let multipart = self.multipart("complete_multipart_upload")?;
        let parts = part_tags
            .iter()
            .map(|tag| PartId {
                content_id: tag.clone(),
            })
            .collect();
        let start = Instant::now();
        let result = multipart
            .complete_multipart(&Self::path(bucket, key), &upload_id.to_string(), parts)
            .await;
        telemetry::record_storage_request("complete_multipart", result.is_ok(), start.elapsed());
        result.map_err(storage_err("complete_multipart_upload"))?;
        Ok(())
    }

    async fn put_object(&self, bucket: &str, key: &str, bytes: Bytes) -> BulkResult<String> {
        let start = Instant::now();
        let result = self
            .store
            .put(&Self::path(bucket, key), PutPayload::from(bytes))
            .await;
        telemetry::record_storage_request("put", result.is_ok(), start.elapsed());
        let put = result.map_err(storage_err("put_object"))?;
        Ok(put.e_tag.unwrap_or_default())
    }

    async fn object_size(&self, bucket: &str, key: &str) -> BulkResult<u64> {
        let meta = self
            .store
            .head(&Self::path(bucket, key))
            .await
            .map_err(storage_err("head"))?;
        Ok(meta.size as u64)
    }

    async fn get_range(&self, bucket: &str, key: &str, range: Range<u64>) -> BulkResult<Bytes> {
        let start = Instant::now();
        let result = self
            .store
            .get_range(
                &Self::path(bucket, key),
                range.start as usize..range.end as usize,
            )
            .await;
        telemetry::record_storage_request("get_range", result.is_ok(), start.elapsed());
        result.map_err(storage_err("get_range"))
    }
}
