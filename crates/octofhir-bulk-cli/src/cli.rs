use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "octofhir-bulk")]
#[command(about = "OctoFHIR bulk runner: partitioned, resumable FHIR export and import")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (overrides OCTOFHIR_BULK_CONFIG env var)
    #[arg(
        short,
        long,
        global = true,
        env = "OCTOFHIR_BULK_CONFIG",
        default_value = "octofhir-bulk.toml"
    )]
    pub config: String,

    /// Directory backing the object store; buckets are its subdirectories
    #[arg(long, global = true, env = "OCTOFHIR_BULK_ROOT", default_value = "./bulk-data")]
    pub root: String,

    /// Directory holding job plans and partition checkpoints
    #[arg(
        long,
        global = true,
        env = "OCTOFHIR_BULK_CHECKPOINTS",
        default_value = "./bulk-checkpoints"
    )]
    pub checkpoint_dir: String,

    /// Output format
    #[arg(short, long, global = true)]
    pub format: Option<OutputFormat>,
}

#[derive(Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Json,
    Table,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show how a job would be partitioned without running it
    Plan(PlanArgs),
    /// Export resources to NDJSON objects
    Export(ExportArgs),
    /// Import NDJSON objects into the resource store
    Import(ImportArgs),
    /// Show the stored progress of a job
    Status(StatusArgs),
}

#[derive(clap::Args)]
pub struct PlanArgs {
    #[command(subcommand)]
    pub command: PlanCommands,
}

#[derive(Subcommand)]
pub enum PlanCommands {
    /// Plan an export
    Export(ExportScope),
    /// Plan an import
    Import(ImportScope),
}

#[derive(clap::Args)]
pub struct ExportScope {
    /// Resource types to export (comma-separated or repeated)
    #[arg(short = 't', long = "types", value_delimiter = ',')]
    pub types: Vec<String>,
}

#[derive(clap::Args)]
pub struct ImportScope {
    /// Input as TYPE=bucket/key (repeatable)
    #[arg(short, long = "input")]
    pub inputs: Vec<String>,
    /// JSON request body (FHIR Parameters or {"input": [...]})
    #[arg(long)]
    pub params: Option<String>,
}

#[derive(clap::Args)]
pub struct ExportArgs {
    #[command(flatten)]
    pub scope: ExportScope,
    /// NDJSON files loaded into the resource store before the export
    #[arg(short, long = "data")]
    pub data: Vec<String>,
    /// Resume a stopped job instead of planning a new one
    #[arg(long)]
    pub job_id: Option<String>,
    /// Print the bulk status manifest instead of the summary
    #[arg(long)]
    pub manifest: bool,
}

#[derive(clap::Args)]
pub struct ImportArgs {
    #[command(flatten)]
    pub scope: ImportScope,
    /// Resume a stopped job instead of planning a new one
    #[arg(long)]
    pub job_id: Option<String>,
    /// Write the imported resources to this NDJSON file afterwards
    #[arg(long)]
    pub dump: Option<String>,
    /// Print the bulk status manifest instead of the summary
    #[arg(long)]
    pub manifest: bool,
}

#[derive(clap::Args)]
pub struct StatusArgs {
    /// Job id printed by export or import
    pub job_id: String,
}
