use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use folio_infra::PipelineConfig;

#[derive(Parser, Debug)]
#[command(name = "folio-worker")]
#[command(version)]
#[command(about = "Sandboxed render jobs: one-shot rendering, sandbox child, retention sweeper")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Sandbox child: read one request on stdin, write one result line on stdout
    Sandbox,

    /// Render one job to completion and print the final job record as JSON
    Render(RenderArgs),

    /// Run the retention sweeper
    Sweep(SweepArgs),
}

/// Knobs shared by the orchestrating commands. Unset flags fall back to
/// `FOLIO_*` environment variables, then to built-in defaults.
#[derive(Args, Debug, Default)]
pub struct PipelineArgs {
    /// Root directory for job and project storage
    #[arg(long, env = "FOLIO_STORAGE_ROOT")]
    pub storage_root: Option<PathBuf>,

    /// Postgres URL; without it jobs live in memory for this process only
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Wall-clock budget per job, in seconds
    #[arg(long, env = "FOLIO_RENDER_TIMEOUT_SECS")]
    pub timeout_secs: Option<u64>,

    #[arg(long, env = "FOLIO_MAX_PAGES")]
    pub max_pages: Option<u32>,

    #[arg(long, env = "FOLIO_MAX_BYTES")]
    pub max_bytes: Option<u64>,

    /// Program speaking the sandbox protocol (defaults to this binary)
    #[arg(long, env = "FOLIO_SANDBOX_PROGRAM")]
    pub sandbox_program: Option<PathBuf>,
}

impl PipelineArgs {
    /// Overlay explicit flags on the environment-derived configuration.
    pub fn apply(&self, mut config: PipelineConfig) -> anyhow::Result<PipelineConfig> {
        if let Some(root) = &self.storage_root {
            config.storage_root = root.clone();
        }
        if let Some(url) = &self.database_url {
            config.database_url = Some(url.clone());
        }
        if let Some(secs) = self.timeout_secs {
            anyhow::ensure!(secs > 0, "--timeout-secs must be greater than zero");
            config.limits.timeout = std::time::Duration::from_secs(secs);
        }
        if let Some(max_pages) = self.max_pages {
            anyhow::ensure!(max_pages > 0, "--max-pages must be greater than zero");
            config.limits.max_pages = max_pages;
        }
        if let Some(max_bytes) = self.max_bytes {
            anyhow::ensure!(max_bytes > 0, "--max-bytes must be greater than zero");
            config.limits.max_bytes = max_bytes;
        }
        if let Some(program) = &self.sandbox_program {
            config.sandbox.program = program.clone();
            config.sandbox.args.clear();
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Args, Debug)]
pub struct RenderArgs {
    #[command(flatten)]
    pub pipeline: PipelineArgs,

    /// Render a document file: `.json` document descriptions are used as-is,
    /// anything else is plain text with form feeds between pages
    #[arg(long, conflicts_with = "project", required_unless_present = "project")]
    pub inline: Option<PathBuf>,

    /// Render a stored project (requires --owner)
    #[arg(long, requires = "owner")]
    pub project: Option<String>,

    /// Owner id; a fresh one is generated for inline renders when omitted
    #[arg(long)]
    pub owner: Option<String>,

    /// Device profile (a4, letter, screen)
    #[arg(long, default_value = "a4")]
    pub profile: String,

    #[arg(long)]
    pub deterministic: bool,

    /// Fail on rendering warnings
    #[arg(long)]
    pub strict: bool,

    /// Copy the finished artifact here
    #[arg(long, short = 'o')]
    pub output: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct SweepArgs {
    #[command(flatten)]
    pub pipeline: PipelineArgs,

    /// Retention window in hours
    #[arg(long, env = "FOLIO_RETENTION_HOURS")]
    pub retention_hours: Option<u64>,

    /// Run a single pass, print its report and exit
    #[arg(long)]
    pub once: bool,
}
