pub mod export;
pub mod import;
pub mod plan;
pub mod status;

use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use object_store::local::LocalFileSystem;
use octofhir_bulk::runner::load_plan;
use octofhir_bulk::{
    BulkConfig, DynObjectStorage, FileCheckpointStore, JobPlan, JobRun, JobRunner, JobStatus,
    ObjectStoreClient, PartitionPlanner, StaticResourceTypes,
};

use crate::cli::OutputFormat;
use crate::output::{print_run, print_warning};

/// Collaborators shared by every command.
pub struct Context {
    pub config: BulkConfig,
    pub storage: DynObjectStorage,
    pub checkpoints: Arc<FileCheckpointStore>,
    pub format: OutputFormat,
}

impl Context {
    pub async fn new(
        config: BulkConfig,
        root: &str,
        checkpoint_dir: &str,
        format: OutputFormat,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(root)
            .await
            .with_context(|| format!("cannot create object store root {root}"))?;
        let local = LocalFileSystem::new_with_prefix(root)
            .with_context(|| format!("cannot open object store root {root}"))?;
        let storage: DynObjectStorage = Arc::new(ObjectStoreClient::new(Arc::new(local)));
        let checkpoints = Arc::new(FileCheckpointStore::open(checkpoint_dir).await?);
        Ok(Self {
            config,
            storage,
            checkpoints,
            format,
        })
    }

    pub fn planner(&self) -> PartitionPlanner {
        PartitionPlanner::new(
            Arc::new(StaticResourceTypes::fhir_r4()),
            self.config.workers.max_threads,
        )
    }

    /// Stored plan of `job_id`, for resuming.
    pub async fn stored_plan(&self, job_id: &str) -> Result<JobPlan> {
        match load_plan(self.checkpoints.as_ref(), job_id).await? {
            Some(plan) => Ok(plan),
            None => bail!("no stored plan for job {job_id}"),
        }
    }
}

/// Run `plan`, turning Ctrl+C into a cooperative stop, and print the result.
pub async fn run_job(runner: JobRunner, plan: &JobPlan, format: OutputFormat) -> Result<JobRun> {
    let stop = runner.stop_signal();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Stop requested, finishing in-flight batches");
            stop.request_stop();
        }
    });
    let result = runner.run(plan).await;
    watcher.abort();
    let run = result?;

    print_run(&run, format)?;
    if run.status == JobStatus::Stopped {
        print_warning(&format!(
            "Job {} stopped; resume it with --job-id {}",
            plan.job_id, plan.job_id
        ));
    }
    Ok(run)
}
