//! In-process persistence backend.
//!
//! Resources are kept per type in id order. Writes are staged inside the
//! transaction and applied on commit. Used by the CLI for dry runs and by
//! tests, which can also inject per-record rejections and commit failures.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use super::{
    BulkPersistence, PageRequest, PersistedResource, PersistenceTransaction, SearchPage,
    SortOrder, StoredResource, WriteError,
};
use crate::error::{BulkError, BulkResult};

#[derive(Debug, Clone)]
struct Entry {
    raw: String,
    version: u64,
}

#[derive(Debug, Default)]
struct Store {
    resources: BTreeMap<String, BTreeMap<String, Entry>>,
    version: u64,
    commits: u64,
    rejected_ids: HashSet<String>,
    fail_commits: bool,
}

impl Store {
    fn contains(&self, resource_type: &str, id: &str) -> bool {
        self.resources
            .get(resource_type)
            .is_some_and(|by_id| by_id.contains_key(id))
    }

    fn put(&mut self, resource_type: String, id: String, raw: String) {
        self.version += 1;
        let version = self.version;
        self.resources
            .entry(resource_type)
            .or_default()
            .insert(id, Entry { raw, version });
    }
}

/// In-memory [`BulkPersistence`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryPersistence {
    store: Arc<RwLock<Store>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store resources directly, bypassing transactions.
    pub fn seed<I>(&self, resources: I) -> BulkResult<usize>
    where
        I: IntoIterator<Item = Value>,
    {
        let mut store = self.store.write();
        let mut seeded = 0;
        for resource in resources {
            let (resource_type, id, raw) =
                prepare(resource).map_err(BulkError::persistence)?;
            store.put(resource_type, id, raw);
            seeded += 1;
        }
        Ok(seeded)
    }

    /// Seed from NDJSON text. Blank lines are ignored.
    pub fn load_ndjson(&self, text: &str) -> BulkResult<usize> {
        let mut resources = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let value: Value = serde_json::from_str(line).map_err(|e| {
                BulkError::persistence(format!("line {}: {e}", idx + 1))
            })?;
            resources.push(value);
        }
        self.seed(resources)
    }

    /// Store raw document text as-is, even if it is not valid JSON.
    pub fn insert_raw(
        &self,
        resource_type: impl Into<String>,
        id: impl Into<String>,
        raw: impl Into<String>,
    ) {
        self.store
            .write()
            .put(resource_type.into(), id.into(), raw.into());
    }

    /// Make every future write of a resource with this id fail.
    pub fn reject_id(&self, id: impl Into<String>) {
        self.store.write().rejected_ids.insert(id.into());
    }

    /// Make every future commit fail.
    pub fn fail_commits(&self, fail: bool) {
        self.store.write().fail_commits = fail;
    }

    pub fn count(&self, resource_type: &str) -> usize {
        self.store
            .read()
            .resources
            .get(resource_type)
            .map_or(0, BTreeMap::len)
    }

    pub fn get(&self, resource_type: &str, id: &str) -> Option<Value> {
        let store = self.store.read();
        let entry = store.resources.get(resource_type)?.get(id)?;
        serde_json::from_str(&entry.raw).ok()
    }

    /// Types holding at least one resource.
    pub fn resource_types(&self) -> Vec<String> {
        self.store
            .read()
            .resources
            .iter()
            .filter(|(_, by_id)| !by_id.is_empty())
            .map(|(resource_type, _)| resource_type.clone())
            .collect()
    }

    /// Number of successful commits.
    pub fn commits(&self) -> u64 {
        self.store.read().commits
    }

    /// Every stored document as NDJSON, ordered by type then id.
    pub fn to_ndjson(&self) -> String {
        let store = self.store.read();
        let mut out = String::new();
        for entry in store.resources.values().flat_map(BTreeMap::values) {
            out.push_str(&entry.raw);
            out.push('\n');
        }
        out
    }
}

/// Validate a resource and return `(type, id, compact text)`. Assigns an id
/// when the resource has none.
fn prepare(mut resource: Value) -> Result<(String, String, String), String> {
    let Some(object) = resource.as_object_mut() else {
        return Err("resource is not a JSON object".to_string());
    };
    let resource_type = match object.get("resourceType").and_then(Value::as_str) {
        Some(rt) if !rt.is_empty() => rt.to_string(),
        _ => return Err("missing resourceType".to_string()),
    };
    let id = match object.get("id").and_then(Value::as_str) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => {
            let id = uuid::Uuid::new_v4().to_string();
            object.insert("id".to_string(), Value::String(id.clone()));
            id
        }
    };
    let raw = serde_json::to_string(&resource).map_err(|e| e.to_string())?;
    Ok((resource_type, id, raw))
}

#[async_trait]
impl BulkPersistence for InMemoryPersistence {
    async fn begin(&self) -> BulkResult<Box<dyn PersistenceTransaction>> {
        Ok(Box::new(InMemoryTransaction {
            store: self.store.clone(),
            staged: Vec::new(),
        }))
    }
}

struct InMemoryTransaction {
    store: Arc<RwLock<Store>>,
    staged: Vec<(String, String, String)>,
}

#[async_trait]
impl PersistenceTransaction for InMemoryTransaction {
    async fn search(&mut self, resource_type: &str, page: &PageRequest) -> BulkResult<SearchPage> {
        if page.page_size == 0 || page.page_number == 0 {
            return Err(BulkError::configuration(format!(
                "invalid page request: page {} of size {}",
                page.page_number, page.page_size
            )));
        }
        let store = self.store.read();
        let Some(by_id) = store.resources.get(resource_type) else {
            return Ok(SearchPage::default());
        };

        let mut entries: Vec<(&String, &Entry)> = by_id.iter().collect();
        if page.sort.field == "_lastUpdated" {
            entries.sort_by_key(|(id, entry)| (entry.version, *id));
        }
        if page.sort.order == SortOrder::Descending {
            entries.reverse();
        }

        let size = page.page_size as u64;
        let total = entries.len() as u64;
        let resources = entries
            .into_iter()
            .skip(((page.page_number - 1) * size) as usize)
            .take(size as usize)
            .map(|(id, entry)| StoredResource::new(resource_type, id.clone(), entry.raw.clone()))
            .collect();

        Ok(SearchPage {
            resources,
            last_page_number: total.div_ceil(size),
        })
    }

    async fn upsert(&mut self, resource: &Value) -> Result<PersistedResource, WriteError> {
        let (resource_type, id, raw) = prepare(resource.clone()).map_err(WriteError::Rejected)?;
        let (created, version) = {
            let store = self.store.read();
            if store.rejected_ids.contains(&id) {
                return Err(WriteError::Rejected(format!(
                    "{resource_type}/{id} rejected by storage"
                )));
            }
            let staged = self
                .staged
                .iter()
                .any(|(rt, staged_id, _)| *rt == resource_type && *staged_id == id);
            (
                !staged && !store.contains(&resource_type, &id),
                store.version + self.staged.len() as u64 + 1,
            )
        };
        self.staged.push((resource_type.clone(), id.clone(), raw));
        Ok(PersistedResource {
            resource_type,
            id,
            version_id: version.to_string(),
            created,
        })
    }

    async fn commit(self: Box<Self>) -> BulkResult<()> {
        let mut store = self.store.write();
        if store.fail_commits {
            return Err(BulkError::persistence("could not serialize access"));
        }
        for (resource_type, id, raw) in self.staged {
            store.put(resource_type, id, raw);
        }
        store.commits += 1;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> BulkResult<()> {
        Ok(())
    }
}
