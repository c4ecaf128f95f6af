use colored::Colorize;
use octofhir_bulk::runner::JobProgress;
use octofhir_bulk::{JobPlan, JobRun};
use serde_json::Value;
use tabled::builder::Builder;
use tabled::settings::Style;

use crate::cli::OutputFormat;

pub fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => print_error(&format!("cannot render output: {e}")),
    }
}

pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

pub fn print_warning(msg: &str) {
    eprintln!("{} {}", "!".yellow(), msg);
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

pub fn print_plan(plan: &JobPlan, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => print_json(&serde_json::to_value(plan)?),
        OutputFormat::Table => {
            println!("{}: {}", "Job".cyan(), plan.job_id);
            println!("{}: {}", "Direction".cyan(), plan.direction);
            println!("{}: {}", "Workers".cyan(), plan.worker_threads);
            let mut builder = Builder::default();
            builder.push_record(["#", "Partition", "Resource types"]);
            for partition in &plan.partitions {
                builder.push_record([
                    partition.index.to_string(),
                    partition.name.clone(),
                    partition.resource_types().join(", "),
                ]);
            }
            println!("{}", builder.build().with(Style::rounded()));
        }
    }
    Ok(())
}

pub fn print_run(run: &JobRun, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => print_json(&serde_json::to_value(run)?),
        OutputFormat::Table => {
            let summary = &run.summary;
            println!("{}: {}", "Job".cyan(), summary.job_id);
            println!("{}: {}", "Status".cyan(), run.status);
            println!("{}: {}", "Summary".cyan(), summary.resource_type_summary());
            println!(
                "{}: {} records in {} ms ({:.1}/s)",
                "Total".cyan(),
                summary.total_records,
                summary.elapsed_ms,
                summary.throughput
            );
            let mut builder = Builder::default();
            builder.push_record([
                "Partition",
                "Types",
                "Processed",
                "Imported",
                "Failed",
                "Skipped",
                "Parse failures",
            ]);
            for partition in &summary.partitions {
                let c = &partition.counts;
                builder.push_record([
                    partition.partition.clone(),
                    partition.resource_type_summary.clone(),
                    c.processed.to_string(),
                    c.imported.to_string(),
                    c.failed.to_string(),
                    c.skipped.to_string(),
                    c.parse_failures.to_string(),
                ]);
            }
            println!("{}", builder.build().with(Style::rounded()));
        }
    }
    Ok(())
}

pub fn print_progress(progress: &JobProgress, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => print_json(&serde_json::to_value(progress)?),
        OutputFormat::Table => {
            let plan = &progress.plan;
            println!("{}: {} ({})", "Job".cyan(), plan.job_id, plan.direction);
            println!(
                "{}: {}/{} partitions completed",
                "Progress".cyan(),
                progress.completed(),
                plan.partitions.len()
            );
            println!(
                "{}: {} run(s), {} ms",
                "Clock".cyan(),
                progress.clock.runs,
                progress.clock.elapsed_ms
            );
            let mut builder = Builder::default();
            builder.push_record(["Partition", "State", "Cursor", "Processed", "Summary"]);
            for partition in &progress.partitions {
                let row = match &partition.checkpoint {
                    None => [
                        partition.spec.name.clone(),
                        "pending".to_string(),
                        "-".to_string(),
                        "0".to_string(),
                        String::new(),
                    ],
                    Some(state) => [
                        partition.spec.name.clone(),
                        if state.exhausted { "completed" } else { "in progress" }.to_string(),
                        state.cursor.to_string(),
                        state.counts.processed.to_string(),
                        state.resource_type_summary.to_string(),
                    ],
                };
                builder.push_record(row);
            }
            println!("{}", builder.build().with(Style::rounded()));
        }
    }
    Ok(())
}
