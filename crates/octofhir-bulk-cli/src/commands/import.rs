use std::sync::Arc;

use anyhow::{Context as _, Result};
use chrono::Utc;
use octofhir_bulk::{InMemoryPersistence, JobRunner};

use super::plan::import_inputs;
use super::{Context, run_job};
use crate::cli::ImportArgs;
use crate::output::{print_json, print_success};

pub async fn run(ctx: &Context, args: &ImportArgs) -> Result<()> {
    let plan = match &args.job_id {
        Some(job_id) => ctx.stored_plan(job_id).await?,
        None => ctx.planner().plan_import(import_inputs(&args.scope).await?)?,
    };

    let db = InMemoryPersistence::new();
    let runner = JobRunner::new(
        ctx.config.clone(),
        Arc::new(db.clone()),
        ctx.storage.clone(),
        ctx.checkpoints.clone(),
    );
    let run = run_job(runner, &plan, ctx.format).await?;

    if let Some(path) = &args.dump {
        tokio::fs::write(path, db.to_ndjson())
            .await
            .with_context(|| format!("cannot write {path}"))?;
    }
    if args.manifest {
        print_json(&run.summary.manifest(Utc::now()));
    } else {
        let counts = &run.summary.counts;
        print_success(&format!(
            "Imported {} of {} records ({} failed, {} skipped, {} unparsable)",
            counts.imported, counts.processed, counts.failed, counts.skipped, counts.parse_failures
        ));
    }
    Ok(())
}
