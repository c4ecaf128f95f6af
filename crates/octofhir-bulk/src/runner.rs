//! Reference orchestration runtime.
//!
//! Runs a [`JobPlan`]'s partitions as tokio tasks bounded by the plan's
//! worker count, persists every checkpoint through a [`CheckpointStore`],
//! and aggregates the partitions that completed into a [`JobSummary`].
//! Running the same plan again resumes every partition from its last
//! checkpoint.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::checkpoint::{CheckpointSnapshot, CheckpointState};
use crate::config::BulkConfig;
use crate::error::{BulkError, BulkResult};
use crate::object_storage::DynObjectStorage;
use crate::persistence::DynPersistence;
use crate::pipeline::export::{ExportSink, ExportSource};
use crate::pipeline::import::{ImportSink, ImportSource, OutcomeTarget, OutcomeTargets};
use crate::pipeline::{
    CheckpointHook, PartitionExit, PartitionWorker, Sink, Source, StopSignal,
};
use crate::planner::{JobPlan, PartitionScope, PartitionSpec};
use crate::policy::CheckpointPolicy;
use crate::summary::{JobSummary, MetricsAnalyzer, MetricsCollector};
use crate::telemetry::Direction;

/// Durable storage for named checkpoint blobs.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, name: &str, bytes: Bytes) -> BulkResult<()>;

    async fn load(&self, name: &str) -> BulkResult<Option<Bytes>>;
}

#[async_trait]
impl<T: CheckpointStore + ?Sized> CheckpointHook for T {
    async fn checkpoint(&self, snapshot: &CheckpointSnapshot) -> BulkResult<()> {
        self.save(snapshot.partition(), snapshot.clone().into_bytes())
            .await
    }
}

/// Process-local [`CheckpointStore`].
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    blobs: Mutex<HashMap<String, Bytes>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remove(&self, name: &str) -> Option<Bytes> {
        self.blobs.lock().remove(name)
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.lock().is_empty()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, name: &str, bytes: Bytes) -> BulkResult<()> {
        self.blobs.lock().insert(name.to_string(), bytes);
        Ok(())
    }

    async fn load(&self, name: &str) -> BulkResult<Option<Bytes>> {
        Ok(self.blobs.lock().get(name).cloned())
    }
}

/// One JSON file per checkpoint under a directory. Writes go to a temporary
/// file first and are renamed into place.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub async fn open(dir: impl AsRef<Path>) -> BulkResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| BulkError::checkpoint_store(dir.display().to_string(), e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> PathBuf {
        let file: String = name
            .chars()
            .map(|c| match c {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
                _ => '_',
            })
            .collect();
        self.dir.join(format!("{file}.json"))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, name: &str, bytes: Bytes) -> BulkResult<()> {
        let path = self.path(name);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| BulkError::checkpoint_store(name, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| BulkError::checkpoint_store(name, e))
    }

    async fn load(&self, name: &str) -> BulkResult<Option<Bytes>> {
        match tokio::fs::read(self.path(name)).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BulkError::checkpoint_store(name, e)),
        }
    }
}

/// Wall-clock time of a job, accumulated across runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobClock {
    pub elapsed_ms: u64,
    pub runs: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_finished_at: Option<DateTime<Utc>>,
}

fn clock_name(job_id: &str) -> String {
    format!("{job_id}.clock")
}

fn plan_name(job_id: &str) -> String {
    format!("{job_id}.plan")
}

async fn load_json<T>(store: &dyn CheckpointStore, name: &str) -> BulkResult<Option<T>>
where
    T: for<'de> Deserialize<'de>,
{
    match store.load(name).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

async fn save_json<T: Serialize + Sync>(
    store: &dyn CheckpointStore,
    name: &str,
    value: &T,
) -> BulkResult<()> {
    store
        .save(name, Bytes::from(serde_json::to_vec(value)?))
        .await
}

/// Plan stored by a previous run of `job_id`.
pub async fn load_plan(store: &dyn CheckpointStore, job_id: &str) -> BulkResult<Option<JobPlan>> {
    load_json(store, &plan_name(job_id)).await
}

/// Progress of one partition as recorded by its last checkpoint.
#[derive(Debug, Clone, Serialize)]
pub struct PartitionProgress {
    pub spec: PartitionSpec,
    pub checkpoint: Option<CheckpointState>,
}

/// Durable progress of a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobProgress {
    pub plan: JobPlan,
    pub clock: JobClock,
    pub partitions: Vec<PartitionProgress>,
}

impl JobProgress {
    pub fn completed(&self) -> usize {
        self.partitions
            .iter()
            .filter(|p| p.checkpoint.as_ref().is_some_and(|c| c.exhausted))
            .count()
    }
}

/// Read the stored plan, clock and checkpoints of `job_id`.
pub async fn job_progress(store: &dyn CheckpointStore, job_id: &str) -> BulkResult<Option<JobProgress>> {
    let Some(plan) = load_plan(store, job_id).await? else {
        return Ok(None);
    };
    let clock = load_json(store, &clock_name(job_id))
        .await?
        .unwrap_or_default();
    let mut partitions = Vec::with_capacity(plan.partitions.len());
    for spec in &plan.partitions {
        let checkpoint = match store.load(&spec.name).await? {
            Some(bytes) => Some(CheckpointState::from_bytes(&bytes)?),
            None => None,
        };
        partitions.push(PartitionProgress {
            spec: spec.clone(),
            checkpoint,
        });
    }
    Ok(Some(JobProgress {
        plan,
        clock,
        partitions,
    }))
}

/// How a job run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Every partition completed.
    Completed,
    /// A stop was requested before every partition completed.
    Stopped,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Result of one [`JobRunner::run`].
#[derive(Debug, Clone, Serialize)]
pub struct JobRun {
    pub status: JobStatus,
    pub summary: JobSummary,
}

struct RunContext {
    config: BulkConfig,
    persistence: DynPersistence,
    storage: DynObjectStorage,
    checkpoints: Arc<dyn CheckpointStore>,
    stop: StopSignal,
    collector: MetricsCollector,
}

/// Runs job plans against the configured collaborators.
pub struct JobRunner {
    config: BulkConfig,
    persistence: DynPersistence,
    storage: DynObjectStorage,
    checkpoints: Arc<dyn CheckpointStore>,
    stop: StopSignal,
}

impl JobRunner {
    pub fn new(
        config: BulkConfig,
        persistence: DynPersistence,
        storage: DynObjectStorage,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            config,
            persistence,
            storage,
            checkpoints,
            stop: StopSignal::new(),
        }
    }

    /// Handle that stops every partition of the current run between batches.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub async fn run(&self, plan: &JobPlan) -> BulkResult<JobRun> {
        if plan.direction == Direction::Export
            && self.config.export_layout(&plan.job_id).is_shared()
        {
            let single_type = plan.partitions.len() == 1
                && plan.partitions[0].resource_types().len() == 1;
            if !single_type {
                return Err(BulkError::configuration(
                    "shared object export requires exactly one resource type",
                ));
            }
        }

        let store = self.checkpoints.as_ref();
        save_json(store, &plan_name(&plan.job_id), plan).await?;
        let mut clock: JobClock = load_json(store, &clock_name(&plan.job_id))
            .await?
            .unwrap_or_default();
        clock.runs += 1;
        clock.first_started_at.get_or_insert_with(Utc::now);

        tracing::info!(
            job_id = %plan.job_id,
            direction = plan.direction.as_str(),
            partitions = plan.partitions.len(),
            worker_threads = plan.worker_threads,
            run = clock.runs,
            "Starting bulk job"
        );

        let started = Instant::now();
        let ctx = Arc::new(RunContext {
            config: self.config.clone(),
            persistence: self.persistence.clone(),
            storage: self.storage.clone(),
            checkpoints: self.checkpoints.clone(),
            stop: self.stop.clone(),
            collector: MetricsCollector::new(),
        });
        let permits = Arc::new(Semaphore::new(plan.worker_threads.max(1)));
        let mut tasks = JoinSet::new();
        let mut names = HashMap::new();
        for spec in &plan.partitions {
            let ctx = ctx.clone();
            let permits = permits.clone();
            let spec = spec.clone();
            let job_id = plan.job_id.clone();
            let name = spec.name.clone();
            let handle = tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.map_err(|e| {
                    BulkError::PartitionAborted {
                        partition: spec.name.clone(),
                        message: e.to_string(),
                    }
                })?;
                run_partition(&ctx, &job_id, &spec).await
            });
            names.insert(handle.id(), name);
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next_with_id().await {
            let error = match joined {
                Ok((_, Ok(()))) => continue,
                Ok((id, Err(e))) => {
                    let partition = names.get(&id).cloned().unwrap_or_default();
                    tracing::error!(
                        job_id = %plan.job_id,
                        partition = %partition,
                        category = %e.category(),
                        error = %e,
                        "Partition failed"
                    );
                    e
                }
                Err(join) => BulkError::PartitionAborted {
                    partition: names.get(&join.id()).cloned().unwrap_or_default(),
                    message: join.to_string(),
                },
            };
            first_error.get_or_insert(error);
        }

        clock.elapsed_ms += started.elapsed().as_millis() as u64;
        clock.last_finished_at = Some(Utc::now());
        save_json(store, &clock_name(&plan.job_id), &clock).await?;

        if let Some(error) = first_error {
            return Err(error);
        }

        let collected = ctx.collector.collected();
        let status = if collected.len() == plan.partitions.len() {
            JobStatus::Completed
        } else {
            JobStatus::Stopped
        };
        let summary = MetricsAnalyzer::aggregate(
            &plan.job_id,
            &collected,
            Duration::from_millis(clock.elapsed_ms),
        )?;

        tracing::info!(
            job_id = %plan.job_id,
            status = %status,
            total_records = summary.total_records,
            failed = summary.counts.failed,
            parse_failures = summary.counts.parse_failures,
            elapsed_ms = summary.elapsed_ms,
            throughput = summary.throughput,
            summary = %summary.resource_type_summary(),
            "Bulk job finished"
        );
        Ok(JobRun { status, summary })
    }
}

async fn run_partition(ctx: &RunContext, job_id: &str, spec: &PartitionSpec) -> BulkResult<()> {
    let checkpoint = ctx
        .checkpoints
        .load(&spec.name)
        .await?
        .map(|bytes| CheckpointSnapshot::from_bytes(spec.name.clone(), bytes));
    let policy = CheckpointPolicy::new(ctx.config.upload.part_size_threshold_bytes);

    let exit = match &spec.scope {
        PartitionScope::Export { resource_types } => {
            let source = ExportSource::new(
                ctx.persistence.clone(),
                resource_types.clone(),
                ctx.config.export.page_size,
            );
            let sink = ExportSink::new(
                ctx.storage.clone(),
                &ctx.config.export.bucket,
                ctx.config.export_layout(job_id),
            );
            let worker = PartitionWorker::new(&spec.name, source, sink, policy, Direction::Export);
            drive(worker, checkpoint, ctx).await?
        }
        PartitionScope::Import { input } => {
            let target = |kind: &str| {
                let stem = format!("{}-{}-{kind}", input.resource_type, spec.index);
                OutcomeTarget {
                    layout: ctx.config.outcome_layout(job_id, &stem),
                    stem,
                }
            };
            let targets = OutcomeTargets {
                bucket: ctx.config.import.outcome_bucket.clone(),
                success: target("success"),
                failure: target("failure"),
            };
            let source = ImportSource::new(
                ctx.storage.clone(),
                &input.bucket,
                &input.key,
                ctx.config.import.batch_size,
                ctx.config.import.read_chunk_bytes,
            );
            let sink = ImportSink::new(
                ctx.persistence.clone(),
                ctx.storage.clone(),
                &input.resource_type,
                input.url(),
                targets,
                policy,
            );
            let worker = PartitionWorker::new(&spec.name, source, sink, policy, Direction::Import);
            drive(worker, checkpoint, ctx).await?
        }
    };

    if let PartitionExit::Completed(snapshot) = exit {
        ctx.collector.collect(spec.index, snapshot);
    }
    Ok(())
}

async fn drive<S, K>(
    mut worker: PartitionWorker<S, K>,
    checkpoint: Option<CheckpointSnapshot>,
    ctx: &RunContext,
) -> BulkResult<PartitionExit>
where
    S: Source,
    K: Sink<Batch = S::Batch>,
{
    worker.open(checkpoint.as_ref()).await?;
    worker.run(&ctx.stop, ctx.checkpoints.as_ref()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::open(dir.path().join("checkpoints"))
            .await
            .unwrap();
        assert!(store.load("job-0").await.unwrap().is_none());

        let state = CheckpointState::new("job-0", 3);
        let snapshot = state.snapshot().unwrap();
        store.checkpoint(&snapshot).await.unwrap();

        let loaded = store.load("job-0").await.unwrap().unwrap();
        assert_eq!(&loaded[..], snapshot.as_bytes());
        assert_eq!(CheckpointState::from_bytes(&loaded).unwrap(), state);
    }

    #[tokio::test]
    async fn test_file_store_sanitizes_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::open(dir.path()).await.unwrap();
        store
            .save("../escape/attempt", Bytes::from_static(b"{}"))
            .await
            .unwrap();
        assert!(dir.path().join(".._escape_attempt.json").exists());
        assert!(store.load("../escape/attempt").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_in_memory_store_overwrites() {
        let store = InMemoryCheckpointStore::new();
        store.save("a", Bytes::from_static(b"1")).await.unwrap();
        store.save("a", Bytes::from_static(b"2")).await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(&store.load("a").await.unwrap().unwrap()[..], b"2");
        assert!(store.remove("a").is_some());
        assert!(store.is_empty());
    }
}
