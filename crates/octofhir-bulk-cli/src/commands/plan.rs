use anyhow::{Context as _, Result, bail};
use octofhir_bulk::{ImportInput, parse_import_inputs};

use super::Context;
use crate::cli::{ExportScope, ImportScope};
use crate::output::print_plan;

pub fn export(ctx: &Context, scope: &ExportScope) -> Result<()> {
    if scope.types.is_empty() {
        bail!("at least one resource type is required (--types)");
    }
    let plan = ctx.planner().plan_export(&scope.types)?;
    print_plan(&plan, ctx.format)
}

pub async fn import(ctx: &Context, scope: &ImportScope) -> Result<()> {
    let inputs = import_inputs(scope).await?;
    let plan = ctx.planner().plan_import(inputs)?;
    print_plan(&plan, ctx.format)
}

/// Inputs from `--input TYPE=bucket/key` flags and an optional `--params` body.
pub async fn import_inputs(scope: &ImportScope) -> Result<Vec<ImportInput>> {
    let mut inputs = Vec::new();
    for raw in &scope.inputs {
        let Some((resource_type, url)) = raw.split_once('=') else {
            bail!("invalid --input '{raw}', expected TYPE=bucket/key");
        };
        inputs.push(ImportInput::from_url(resource_type.trim(), url.trim())?);
    }
    if let Some(path) = &scope.params {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("cannot read {path}"))?;
        let body: serde_json::Value =
            serde_json::from_str(&text).with_context(|| format!("{path} is not JSON"))?;
        inputs.extend(parse_import_inputs(&body)?);
    }
    if inputs.is_empty() {
        bail!("at least one input is required (--input or --params)");
    }
    Ok(inputs)
}
