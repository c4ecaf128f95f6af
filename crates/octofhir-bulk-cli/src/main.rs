mod cli;
mod commands;
mod output;

use anyhow::{Result, anyhow};
use clap::Parser;

use cli::{Cli, Commands, PlanCommands};
use commands::Context;
use octofhir_bulk::config::loader::load_config;
use octofhir_bulk::telemetry;
use output::print_error;

#[tokio::main]
async fn main() {
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound) {
            eprintln!("Warning: Failed to load .env file: {e}");
        }
    }
    telemetry::init_tracing_with_level("warn");

    if let Err(e) = run().await {
        print_error(&format!("{e:#}"));
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let format = cli.format.unwrap_or_default();

    let config = load_config(Some(&cli.config)).map_err(|e| anyhow!("configuration error: {e}"))?;
    telemetry::apply_logging_level(&config.logging.level);
    tracing::debug!(path = %cli.config, "Configuration loaded");

    let ctx = Context::new(config, &cli.root, &cli.checkpoint_dir, format).await?;

    match &cli.command {
        Commands::Plan(args) => match &args.command {
            PlanCommands::Export(scope) => commands::plan::export(&ctx, scope)?,
            PlanCommands::Import(scope) => commands::plan::import(&ctx, scope).await?,
        },
        Commands::Export(args) => commands::export::run(&ctx, args).await?,
        Commands::Import(args) => commands::import::run(&ctx, args).await?,
        Commands::Status(args) => commands::status::show(&ctx, &args.job_id).await?,
    }

    Ok(())
}
