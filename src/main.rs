mod cli;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cli::{Cli, Command};
use meshjobs::anthropic::AnthropicClient;
use meshjobs::{
    ArtifactStore, AuditLog, JobSpec, JobStore, MeshCommands, MeshConfig, MeshStore, Scheduler,
    TickOutcome, ui,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => MeshConfig::load_from(path)?,
        None => MeshConfig::load()?,
    };

    let level = if cli.verbose { "debug" } else { config.log_level.as_str() };
    init_logging(level, cli.verbose)?;
    debug!(state_dir = %config.state_dir.display(), "Configuration loaded");

    let store = JobStore::open(config.jobs_path())?;

    match cli.command {
        Command::Submit {
            command,
            request,
            file,
        } => {
            let spec = match (command, file) {
                (_, Some(path)) => load_job_spec(&path)?,
                (Some(command), None) => {
                    let request = match request {
                        Some(raw) => serde_json::from_str::<Value>(&raw)
                            .context("--request must be valid JSON")?,
                        None => Value::Object(Default::default()),
                    };
                    JobSpec::command(command, request)
                }
                (None, None) => bail!("either a command or --file is required"),
            };
            let job = store.add_job(spec)?;
            println!("{}", job.id);
        }
        Command::Run { once } => run(&config, store, once).await?,
        Command::Status { id } => match id {
            Some(id) => {
                let job = store
                    .get(&id)
                    .with_context(|| format!("job {id} not found"))?;
                ui::print_job(&job);
            }
            None => ui::print_queue(&store.jobs(), store.is_paused()),
        },
        Command::Pause => {
            store.pause()?;
            println!("Queue paused");
        }
        Command::Resume => {
            store.resume()?;
            println!("Queue resumed");
        }
        Command::Reorder { ids } => {
            store.reorder_queue(&ids)?;
            ui::print_queue(&store.jobs(), store.is_paused());
        }
        Command::Remove { id } => {
            if !store.remove_job(&id)? {
                bail!("job {id} not found");
            }
            println!("Removed {id}");
        }
        Command::Clear => {
            let removed = store.clear_jobs()?;
            println!("Removed {removed} job(s)");
        }
        Command::Artifacts { job } => {
            let artifacts = ArtifactStore::open(config.artifacts_path())?;
            let list = match job {
                Some(job_id) => artifacts.for_job(&job_id)?,
                None => artifacts.list()?,
            };
            ui::print_artifacts(&list);
        }
        Command::Audit { limit } => {
            let audit = AuditLog::open(config.audit_path())?;
            ui::print_audit(&audit.recent(limit)?);
        }
    }

    Ok(())
}

fn init_logging(level: &str, verbose: bool) -> Result<()> {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::try_new(level)
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
    }
    .context("Failed to create log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    Ok(())
}

/// Reads a job spec from a `.toml` file, or JSON for anything else.
fn load_job_spec(path: &Path) -> Result<JobSpec> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let spec = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&contents)
            .with_context(|| format!("parsing {} as TOML", path.display()))?,
        _ => serde_json::from_str(&contents)
            .with_context(|| format!("parsing {} as JSON", path.display()))?,
    };
    Ok(spec)
}

async fn run(config: &MeshConfig, store: JobStore, once: bool) -> Result<()> {
    let _runner = store
        .claim_runner()
        .context("claiming the scheduler for this state directory")?;
    let artifacts = Arc::new(ArtifactStore::open(config.artifacts_path())?);
    let audit = Arc::new(AuditLog::open(config.audit_path())?);
    let mesh = Arc::new(MeshStore::open(config.mesh_path())?);
    let llm = Arc::new(AnthropicClient::new(config.api_key.clone())?);
    if config.api_key.is_empty() {
        warn!("No API key configured, ask_model commands will fail");
    }
    let commands = Arc::new(MeshCommands::new(mesh, llm, config.model.clone()));

    let scheduler = Scheduler::new(store.clone(), commands, artifacts, audit)
        .with_tick_interval(config.tick_interval())
        .with_step_timeout(config.step_timeout())
        .with_context_vars(config.context.clone());

    if once {
        if store.is_paused() {
            println!("Queue is paused, nothing to run");
            return Ok(());
        }
        let progress = ui::JobProgress::start("Running queued jobs");
        let mut processed = 0;
        loop {
            match scheduler.tick().await {
                TickOutcome::Processed { job_id, .. } => {
                    processed += 1;
                    if let Some(job) = store.get(&job_id) {
                        progress.job_finished(&job);
                    }
                    progress.set_message(format!("Running queued jobs ({processed} done)"));
                }
                TickOutcome::Unrecorded {
                    job_id,
                    status,
                    error,
                } => {
                    progress.finish(processed);
                    bail!("job {job_id} finished as {status} but could not be saved: {error}");
                }
                _ => break,
            }
        }
        progress.finish(processed);
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Ctrl-C received, finishing the current job"),
                Err(e) => warn!(error = %e, "Could not listen for Ctrl-C, stopping"),
            }
            shutdown.cancel();
        }
    });

    scheduler.run(shutdown).await;
    Ok(())
}
