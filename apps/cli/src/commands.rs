//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use clearkg_core::OutputLayout;
use clearkg_core::artifacts;
use clearkg_core::pipeline::Pipeline;
use clearkg_shared::{
    AppConfig, PipelineRequest, TaskRecord, TaskStatus, init_config, load_config, load_config_from,
};
use clearkg_storage::{LibSqlTaskStore, TaskStore};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// clearkg: build the CLEAR maritime knowledge graph from SDKG outputs.
#[derive(Parser)]
#[command(
    name = "clearkg",
    version,
    about = "Build and inspect the CLEAR trajectory knowledge graph.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.clearkg/clearkg.toml).
    #[arg(long, global = true, env = "CLEARKG_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the content update pipeline and wait for it to finish.
    Run {
        /// Dataset name (defaults to `[defaults].dataset`).
        #[arg(short, long)]
        dataset: Option<String>,

        /// Trajectory length used to pick input files.
        #[arg(long)]
        trajectory_len: Option<u32>,

        /// Number of trajectories used to pick input files.
        #[arg(long)]
        trajectory_num: Option<u32>,

        /// Ignore the subgraph checkpoint and regenerate everything.
        #[arg(long)]
        fresh: bool,
    },

    /// Show one task.
    Status {
        task_id: String,
    },

    /// List recent tasks, newest first.
    List {
        /// Only tasks in this state (pending, running, done, error, cancelled).
        #[arg(long)]
        status: Option<TaskStatus>,

        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Mark a pending or running task cancelled.
    Cancel {
        task_id: String,
    },

    /// Read generated artifacts.
    Inspect {
        /// Dataset whose output directory is read.
        #[arg(short, long)]
        dataset: Option<String>,

        #[command(subcommand)]
        target: InspectTarget,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Artifact kinds readable by `inspect`.
#[derive(Subcommand)]
pub(crate) enum InspectTarget {
    /// Graph index summary.
    Index,
    /// One node record.
    Node { id: String },
    /// One precomputed subgraph, with node titles and summaries.
    Subgraph { id: String },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "clearkg=info",
        1 => "clearkg=debug",
        _ => "clearkg=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Run {
            dataset,
            trajectory_len,
            trajectory_num,
            fresh,
        } => {
            let request = PipelineRequest {
                dataset,
                trajectory_len,
                trajectory_num,
                fresh,
                ..Default::default()
            };
            cmd_run(config_path, request).await
        }
        Command::Status { task_id } => cmd_status(config_path, &task_id).await,
        Command::List { status, limit } => cmd_list(config_path, status, limit).await,
        Command::Cancel { task_id } => cmd_cancel(config_path, &task_id).await,
        Command::Inspect { dataset, target } => {
            cmd_inspect(config_path, dataset.as_deref(), target)
        }
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(config_path),
        },
    }
}

fn resolve_config(path: Option<&Path>) -> Result<AppConfig> {
    Ok(match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    })
}

/// Relative paths in `[defaults]` are taken from `project_root`.
fn under_root(config: &AppConfig, path: &str) -> PathBuf {
    let path = PathBuf::from(path);
    if path.is_absolute() {
        path
    } else {
        PathBuf::from(&config.defaults.project_root).join(path)
    }
}

async fn open_pipeline(path: Option<&Path>) -> Result<Pipeline> {
    let config = resolve_config(path)?;
    let db_path = under_root(&config, &config.defaults.task_db);
    let store: Arc<dyn TaskStore> = Arc::new(LibSqlTaskStore::open(&db_path).await?);
    Ok(Pipeline::new(config, store))
}

// ---------------------------------------------------------------------------
// Task commands
// ---------------------------------------------------------------------------

async fn cmd_run(config_path: Option<&Path>, request: PipelineRequest) -> Result<()> {
    let pipeline = open_pipeline(config_path).await?;
    let dataset = request
        .dataset
        .clone()
        .unwrap_or_else(|| pipeline.config().defaults.dataset.clone());

    let (record, mut handle) = pipeline.submit(request).await?;
    info!(task_id = %record.task_id, %dataset, "content update submitted");

    let spinner = spinner();
    let mut poll = tokio::time::interval(Duration::from_millis(250));
    loop {
        tokio::select! {
            joined = &mut handle => {
                if let Err(e) = joined {
                    warn!(error = %e, "pipeline job did not finish cleanly");
                }
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                spinner.set_message("cancelling...");
                pipeline.cancel(&record.task_id).await?;
            }
            _ = poll.tick() => {
                let current = pipeline.status(&record.task_id).await?;
                spinner.set_message(format!(
                    "[{:>5.1}%] {}",
                    current.progress,
                    current.message.as_deref().unwrap_or("")
                ));
            }
        }
    }
    spinner.finish_and_clear();

    let finished = pipeline.status(&record.task_id).await?;
    print_task(&finished, true)?;
    match finished.status {
        TaskStatus::Done => Ok(()),
        status => Err(eyre!(
            "task {} ended {status}: {}",
            finished.task_id,
            finished.message.as_deref().unwrap_or("")
        )),
    }
}

async fn cmd_status(config_path: Option<&Path>, task_id: &str) -> Result<()> {
    let pipeline = open_pipeline(config_path).await?;
    let record = pipeline.status(task_id).await?;
    print_task(&record, true)
}

async fn cmd_list(config_path: Option<&Path>, status: Option<TaskStatus>, limit: usize) -> Result<()> {
    let pipeline = open_pipeline(config_path).await?;
    let records = pipeline.list(status, limit).await?;
    if records.is_empty() {
        println!("No tasks found.");
        return Ok(());
    }
    for record in &records {
        print_task(record, false)?;
    }
    Ok(())
}

async fn cmd_cancel(config_path: Option<&Path>, task_id: &str) -> Result<()> {
    let pipeline = open_pipeline(config_path).await?;
    let record = pipeline.cancel(task_id).await?;
    if record.status == TaskStatus::Cancelled {
        println!("Task {task_id} cancelled.");
    } else {
        println!("Task {task_id} already {}, nothing to cancel.", record.status);
    }
    Ok(())
}

fn print_task(record: &TaskRecord, detailed: bool) -> Result<()> {
    if !detailed {
        println!(
            "{}  {:<9}  {:>5.1}%  {}  {}",
            record.task_id,
            record.status,
            record.progress,
            record.updated_at.format("%Y-%m-%d %H:%M:%S"),
            record.message.as_deref().unwrap_or("")
        );
        return Ok(());
    }

    println!();
    println!("  Task:     {}", record.task_id);
    println!("  Status:   {}", record.status);
    println!("  Progress: {:.1}%", record.progress);
    if let Some(message) = &record.message {
        println!("  Message:  {message}");
    }
    println!("  Created:  {}", record.created_at.to_rfc3339());
    println!("  Updated:  {}", record.updated_at.to_rfc3339());
    if let Some(result) = &record.result {
        println!("  Result:");
        println!("{}", serde_json::to_string_pretty(result)?);
    }
    println!();
    Ok(())
}

fn spinner() -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
        spinner.set_style(
            style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
    }
    spinner.enable_steady_tick(Duration::from_millis(80));
    spinner
}

// ---------------------------------------------------------------------------
// Artifact inspection
// ---------------------------------------------------------------------------

fn cmd_inspect(config_path: Option<&Path>, dataset: Option<&str>, target: InspectTarget) -> Result<()> {
    let config = resolve_config(config_path)?;
    let name = dataset.unwrap_or(&config.defaults.dataset);
    let inputs = config.resolve_inputs(name, None, None)?;
    let layout = OutputLayout::new(&inputs.output_dir);

    match target {
        InspectTarget::Index => {
            let index = artifacts::load_index(&layout)?;
            println!("  Index:  {}", layout.index_file().display());
            println!("  Nodes:  {}", index.nodes.len());
            println!("  Links:  {}", index.links.len());
            if let Ok(catalog) = artifacts::load_catalog(&layout) {
                println!(
                    "  Subgraphs: {} (generated {})",
                    catalog.total_nodes, catalog.generated_at
                );
            }
        }
        InspectTarget::Node { id } => {
            let node = artifacts::load_node(&layout, &id)?;
            println!("{}", serde_json::to_string_pretty(&node)?);
        }
        InspectTarget::Subgraph { id } => {
            let subgraph = artifacts::load_subgraph(&layout, &id)?;
            println!("{}", serde_json::to_string_pretty(&subgraph)?);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Config commands
// ---------------------------------------------------------------------------

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(config_path: Option<&Path>) -> Result<()> {
    let config = resolve_config(config_path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
