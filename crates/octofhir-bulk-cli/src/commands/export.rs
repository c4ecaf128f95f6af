use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use chrono::Utc;
use octofhir_bulk::{InMemoryPersistence, JobRunner};

use super::{Context, run_job};
use crate::cli::ExportArgs;
use crate::output::{print_json, print_success};

pub async fn run(ctx: &Context, args: &ExportArgs) -> Result<()> {
    let db = InMemoryPersistence::new();
    for path in &args.data {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("cannot read {path}"))?;
        let loaded = db
            .load_ndjson(&text)
            .with_context(|| format!("cannot load {path}"))?;
        tracing::info!(path = %path, resources = loaded, "Loaded resources");
    }

    let plan = match &args.job_id {
        Some(job_id) => ctx.stored_plan(job_id).await?,
        None if args.scope.types.is_empty() => {
            bail!("at least one resource type is required (--types)")
        }
        None => ctx.planner().plan_export(&args.scope.types)?,
    };

    let runner = JobRunner::new(
        ctx.config.clone(),
        Arc::new(db),
        ctx.storage.clone(),
        ctx.checkpoints.clone(),
    );
    let run = run_job(runner, &plan, ctx.format).await?;
    if args.manifest {
        print_json(&run.summary.manifest(Utc::now()));
    } else {
        print_success(&format!(
            "Exported {} records: {}",
            run.summary.total_records,
            run.summary.resource_type_summary()
        ));
    }
    Ok(())
}
