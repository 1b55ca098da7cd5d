//! Command line front end for recurrent policy-gradient training

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rnnpg_agent::prelude::*;
use rnnpg_env::{CuedChoiceTask, RdmTask, TaskKind};

/// Exit code after an interrupt, as a shell reports SIGINT
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "rnnpgctl")]
#[command(about = "Train recurrent networks on cognitive tasks with policy gradients", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a policy and baseline on a task
    Train {
        /// Task name (see `rnnpgctl tasks`)
        #[arg(short, long)]
        task: TaskKind,

        /// JSON file with configuration overrides
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Checkpoint file
        #[arg(short, long)]
        savefile: PathBuf,

        /// Random seed for trial generation and noise
        #[arg(long, default_value = "1")]
        seed: u64,

        /// Override the configured time step
        #[arg(long)]
        dt: Option<f64>,

        /// Resume from the checkpoint in the save file
        #[arg(long)]
        recover: bool,
    },

    /// Show a saved model
    Info {
        /// Task name
        #[arg(short, long)]
        task: TaskKind,

        /// Checkpoint file
        #[arg(short, long)]
        savefile: PathBuf,

        /// Parameter set to load: best or current
        #[arg(long, default_value = "best")]
        load: LoadMode,

        /// Number of recent validations to list
        #[arg(short = 'n', long, default_value = "10")]
        history: usize,
    },

    /// List available tasks
    Tasks,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train {
            task,
            config,
            savefile,
            seed,
            dt,
            recover,
        } => {
            let overrides = config.as_deref().map(read_overrides).transpose()?;
            let config = task
                .config(overrides)
                .with_context(|| format!("Invalid configuration for task {task}"))?;
            let outcome = match task {
                TaskKind::Rdm => {
                    train(RdmTask::default(), config, &savefile, seed, dt, recover).await?
                }
                TaskKind::CuedChoice => {
                    train(CuedChoiceTask::default(), config, &savefile, seed, dt, recover).await?
                }
            };
            if matches!(outcome, TrainingOutcome::Interrupted { .. }) {
                return Ok(ExitCode::from(EXIT_INTERRUPTED));
            }
        }

        Commands::Info {
            task,
            savefile,
            load,
            history,
        } => match task {
            TaskKind::Rdm => show_model(RdmTask::default(), &savefile, load, history).await?,
            TaskKind::CuedChoice => {
                show_model(CuedChoiceTask::default(), &savefile, load, history).await?;
            }
        },

        Commands::Tasks => {
            for kind in TaskKind::ALL {
                println!("{:<12} {}", kind.name(), kind.description());
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn read_overrides(path: &Path) -> Result<Value> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
}

async fn train<T: Task>(
    task: T,
    config: Config,
    savefile: &Path,
    seed: u64,
    dt: Option<f64>,
    recover: bool,
) -> Result<TrainingOutcome> {
    let store = FileCheckpointStore::new(savefile);
    let mut model = PolicyGradient::new(task, config, seed, dt)?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping before the next iteration");
            on_signal.cancel();
        }
    });

    let summary = model
        .train(&store, recover, &cancel)
        .await
        .context("Training failed")?;
    info!(
        "Finished after {} iterations: {:?}",
        summary.iterations, summary.outcome
    );
    Ok(summary.outcome)
}

async fn show_model<T: Task>(
    task: T,
    savefile: &Path,
    load: LoadMode,
    history: usize,
) -> Result<()> {
    let store = FileCheckpointStore::new(savefile);
    let checkpoint = CheckpointStore::<T::Performance>::load(&store)
        .await?
        .with_context(|| format!("No checkpoint at {}", savefile.display()))?;
    let records = checkpoint.training_history.clone();

    let model = PolicyGradient::from_checkpoint(task, checkpoint, 0, None, load)?;
    println!("Network type: {}", model.config().network_type);
    println!("Hidden units: {}", model.config().n_hidden);
    println!("dt:           {}", model.dt());
    if let Some(items) = model.summary() {
        for (name, value) in items {
            println!("{name}: {value}");
        }
    }

    if !records.is_empty() {
        println!("\nRecent validations:");
        let skip = records.len().saturating_sub(history);
        for record in records.iter().skip(skip) {
            let marker = if record.new_best { " *" } else { "" };
            println!(
                "  iter {:>6}  reward {:>8.4}  trials {:>8}  {}{}",
                record.iter,
                record.mean_reward,
                record.n_trials,
                record.timestamp.format("%Y-%m-%d %H:%M:%S"),
                marker
            );
        }
    }

    Ok(())
}
