use anyhow::{Result, bail};
use octofhir_bulk::runner::job_progress;

use super::Context;
use crate::output::print_progress;

pub async fn show(ctx: &Context, job_id: &str) -> Result<()> {
    let Some(progress) = job_progress(ctx.checkpoints.as_ref(), job_id).await? else {
        bail!("no stored plan for job {job_id}");
    };
    print_progress(&progress, ctx.format)
}
