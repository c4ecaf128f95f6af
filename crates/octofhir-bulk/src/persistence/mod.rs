//! Persistence collaborator contract.
//!
//! Every export page and every import batch runs inside exactly one
//! transaction obtained from [`BulkPersistence::begin`].

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BulkError, BulkResult};

/// Sort order of a paginated search.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Sort specification. Pagination is only stable under a total order, so
/// backends break ties by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: String,
    pub order: SortOrder,
}

impl SortSpec {
    pub fn by_id() -> Self {
        Self {
            field: "_id".to_string(),
            order: SortOrder::Ascending,
        }
    }
}

impl Default for SortSpec {
    fn default() -> Self {
        Self::by_id()
    }
}

/// One page of a search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    /// 1-based page number.
    pub page_number: u64,
    pub page_size: u32,
    pub sort: SortSpec,
}

/// A resource as held by the persistence layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResource {
    pub id: String,
    pub resource_type: String,
    /// Stored JSON document text.
    pub raw: String,
}

impl StoredResource {
    pub fn new(
        resource_type: impl Into<String>,
        id: impl Into<String>,
        raw: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            resource_type: resource_type.into(),
            raw: raw.into(),
        }
    }

    /// Decode the stored document. Fails for corrupt stored text.
    pub fn to_json(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_str(&self.raw)
    }
}

/// Result of one paginated search.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchPage {
    pub resources: Vec<StoredResource>,
    /// Number of the last page for this type and page size; `0` when the
    /// type holds no resources.
    pub last_page_number: u64,
}

/// Identity assigned to a persisted resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedResource {
    pub resource_type: String,
    pub id: String,
    pub version_id: String,
    /// `true` when the write created the resource rather than replacing it.
    pub created: bool,
}

/// Why a single write did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    /// The backend rejected this one resource; the batch continues.
    #[error("{0}")]
    Rejected(String),
    /// The transaction itself failed.
    #[error(transparent)]
    Fatal(#[from] BulkError),
}

/// Source of transactions against the clinical store.
#[async_trait]
pub trait BulkPersistence: Send + Sync {
    async fn begin(&self) -> BulkResult<Box<dyn PersistenceTransaction>>;
}

/// One explicit begin/commit transaction.
#[async_trait]
pub trait PersistenceTransaction: Send {
    /// Read one page of `resource_type`.
    async fn search(&mut self, resource_type: &str, page: &PageRequest) -> BulkResult<SearchPage>;

    /// Create or update `resource`, keyed by its `resourceType` and `id`.
    /// A missing id is assigned by the backend.
    async fn upsert(&mut self, resource: &Value) -> Result<PersistedResource, WriteError>;

    async fn commit(self: Box<Self>) -> BulkResult<()>;

    async fn rollback(self: Box<Self>) -> BulkResult<()>;
}

/// Shared handle to a persistence collaborator.
pub type DynPersistence = Arc<dyn BulkPersistence>;
