mod cli;
mod pipeline;

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use folio_core::{OwnerId, ProjectId};
use folio_engine::{Document, PdfRenderer, PlainTextCompiler, RenderOptions};
use folio_infra::jobs::{JobSource, JobStatus, RetentionSweeper};
use folio_infra::sandbox::run_child;
use folio_infra::config::hours_to_duration;
use folio_infra::PipelineConfig;
use folio_observability::{LogFormat, LogTarget};

use cli::{Cli, Command, RenderArgs, SweepArgs};
use pipeline::Pipeline;

fn main() -> ExitCode {
    let cli = Cli::parse();

    // The sandbox child never starts an async runtime.
    if let Command::Sandbox = cli.command {
        folio_observability::init_sandbox();
        return run_child(&PlainTextCompiler, &PdfRenderer);
    }

    match cli.command {
        // stdout carries the job record.
        Command::Render(_) => folio_observability::tracing::init(LogFormat::from_env(), LogTarget::Stderr),
        _ => folio_observability::init(),
    }
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to start async runtime");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(async {
        match cli.command {
            Command::Sandbox => Ok(ExitCode::SUCCESS),
            Command::Render(args) => render(args).await,
            Command::Sweep(args) => sweep(args).await,
        }
    });

    match result {
        Ok(code) => code,
        Err(e) => {
            error!(error = ?e, "folio-worker failed");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn render(args: RenderArgs) -> anyhow::Result<ExitCode> {
    let config = args
        .pipeline
        .apply(PipelineConfig::from_env().context("loading configuration")?)?;
    let pipeline = Pipeline::connect(&config).await?;

    let (owner_id, source) = match (&args.project, &args.inline) {
        (Some(project), _) => {
            let owner = args.owner.as_deref().context("--project requires --owner")?;
            let owner_id: OwnerId = owner.parse().context("parsing --owner")?;
            let project_id: ProjectId = project.parse().context("parsing --project")?;
            (owner_id, JobSource::Project(project_id))
        }
        (None, Some(path)) => {
            let owner_id = match &args.owner {
                Some(owner) => owner.parse().context("parsing --owner")?,
                None => OwnerId::new(),
            };
            (owner_id, JobSource::Inline(read_document(path)?))
        }
        (None, None) => anyhow::bail!("either --inline or --project is required"),
    };
    let options = RenderOptions {
        profile: args.profile.clone(),
        deterministic: args.deterministic,
        strict: args.strict,
    };

    let job = pipeline.service.create_job(owner_id, source, options).await?;
    let job = pipeline
        .orchestrator
        .process(job.id)
        .await
        .with_context(|| format!("processing job {}", job.id))?;

    if let (JobStatus::Completed, Some(output)) = (job.status, &args.output) {
        let bytes = pipeline.service.download(job.id, owner_id).await?;
        std::fs::write(output, bytes).with_context(|| format!("writing {}", output.display()))?;
        info!(job_id = %job.id, path = %output.display(), "artifact written");
    }

    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(if job.status == JobStatus::Completed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// `.json` files are document descriptions; anything else is plain text.
fn read_document(path: &std::path::Path) -> anyhow::Result<Document> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    if path.extension().is_some_and(|ext| ext == "json") {
        let value = serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        return Ok(Document::new(value));
    }

    let title = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    let pages = raw.split('\u{000C}').map(str::to_string).collect();
    Ok(Document::from_pages(title, pages))
}

async fn sweep(args: SweepArgs) -> anyhow::Result<ExitCode> {
    let mut config = args
        .pipeline
        .apply(PipelineConfig::from_env().context("loading configuration")?)?;
    if let Some(hours) = args.retention_hours {
        anyhow::ensure!(hours > 0, "--retention-hours must be greater than zero");
        config.retention.window =
            hours_to_duration(hours).context("--retention-hours is too large")?;
    }
    if config.database_url.is_none() {
        warn!("no DATABASE_URL; sweeping an empty in-memory store");
    }

    let pipeline = Pipeline::connect(&config).await?;
    let sweeper = RetentionSweeper::new(
        pipeline.store.clone(),
        pipeline.storage.clone(),
        config.retention,
    );

    if args.once {
        let report = sweeper.run_once().await.context("sweep pass")?;
        println!("{}", serde_json::to_string(&report)?);
        return Ok(ExitCode::SUCCESS);
    }

    let handle = sweeper.spawn();
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown requested");
    handle.shutdown().await;
    Ok(ExitCode::SUCCESS)
}
