//! EcoScan CLI: drive the offline layer from a terminal.
//!
//! | Command | Description |
//! |---------|-------------|
//! | `run` | Start the layer and log agent events until Ctrl-C |
//! | `detect` | Classify waste in an image file |
//! | `health` | Probe the inference backend once |
//! | `cache` | Inspect, install or clear the offline cache |
//! | `sync` | Inspect or flush the offline sync queue |
//! | `feedback` | Report a detection correction |
//! | `metrics` | Probe the backend and print the resulting counters |
//! | `config` | Show the effective config or its JSON schema |

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ecoscan::cache::PartitionId;
use ecoscan::control::{AgentEvent, Command, CommandHandler};
use ecoscan::detect::{DetectionOutcome, FeedbackRequest, NullEngine};
use ecoscan::observability::init_tracing;
use ecoscan::{Config, OfflineLayer};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

/// EcoScan - offline-first waste detection
#[derive(Parser)]
#[command(name = "ecoscan")]
#[command(about = "EcoScan offline layer: cached resources, hybrid detection, deferred sync", long_about = None)]
struct Cli {
    /// Path to the TOML config file (defaults to the platform config dir)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the layer and log agent events until Ctrl-C
    Run,
    /// Classify waste in an image file
    Detect {
        /// Image file (JPEG or PNG)
        #[arg(value_name = "IMAGE")]
        image: PathBuf,

        /// Minimum confidence to report (overrides config)
        #[arg(short, long)]
        threshold: Option<f32>,
    },
    /// Probe the inference backend once and print its health
    Health,
    /// Inspect, install or clear the offline cache
    Cache {
        #[command(subcommand)]
        command: CacheCommand,
    },
    /// Inspect or flush the offline sync queue
    Sync {
        #[command(subcommand)]
        command: SyncCommand,
    },
    /// Report a correction for a detection (queued when offline)
    Feedback {
        #[arg(long)]
        detection_id: String,

        /// Correct label for the detected item
        #[arg(long)]
        correction: String,

        /// How sure you are of the correction, 0.0 - 1.0
        #[arg(long, default_value_t = 1.0)]
        rating: f32,

        /// Mark the original detection as helpful
        #[arg(long)]
        helpful: bool,
    },
    /// Probe the backend once and print the Prometheus counters it produced
    Metrics,
    /// Show the effective config or its JSON schema
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand)]
enum CacheCommand {
    /// Active generation, partitions and stored generations
    Info,
    /// Install (or resume) the configured generation from the precache manifest
    Install,
    /// Clear one partition of the active generation, or all of them
    Clear {
        /// static, models, images or api
        #[arg(value_name = "PARTITION")]
        partition: Option<String>,
    },
}

#[derive(Subcommand)]
enum SyncCommand {
    /// Pending and dropped task counts
    Status,
    /// Deliver pending tasks now
    Flush {
        /// Ignore per-task backoff
        #[arg(long)]
        force: bool,
    },
    /// Tasks dropped after reaching the retry cap
    Dropped,
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Print the effective config as TOML
    Show,
    /// Print the config JSON schema
    Schema,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = Config::load(&path)?;
    init_tracing(&config.logging.level);

    match cli.command {
        Commands::Config { command } => match command {
            ConfigCommand::Show => {
                print!("{}", toml::to_string_pretty(&config).context("Failed to render config")?);
                Ok(())
            }
            ConfigCommand::Schema => {
                println!("{}", Config::json_schema()?);
                Ok(())
            }
        },
        command => {
            let layer = OfflineLayer::open(config, Arc::new(NullEngine))?;
            let result = run_command(&layer, command).await;
            layer.shutdown().await;
            result
        }
    }
}

fn default_config_path() -> PathBuf {
    directories::ProjectDirs::from("org", "ecoscan", "ecoscan")
        .map(|dirs| dirs.config_dir().join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("ecoscan.toml"))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_command(layer: &OfflineLayer, command: Commands) -> Result<()> {
    match command {
        Commands::Run => run(layer).await,
        Commands::Detect { image, threshold } => {
            let bytes = tokio::fs::read(&image)
                .await
                .with_context(|| format!("Failed to read image: {}", image.display()))?;
            layer.health().probe().await;
            if let Err(e) = layer.load_local_model().await {
                tracing::warn!(error = %e, "Local model unavailable");
            }
            let mut request = layer.request_for(bytes);
            if let Some(threshold) = threshold {
                request.confidence_threshold = threshold.clamp(0.0, 1.0);
            }
            let outcome = layer.detect(&request).await;
            print_json(&outcome_json(&outcome))
        }
        Commands::Health => {
            layer.health().probe().await;
            print_json(&layer.health().snapshot())
        }
        Commands::Cache { command } => {
            let reply = match command {
                CacheCommand::Info => layer.lifecycle().handle(Command::GetCacheInfo).await,
                CacheCommand::Install => {
                    return match layer.ensure_installed().await? {
                        Some(report) => print_json(&report),
                        None => print_json(&layer.lifecycle().snapshot()),
                    };
                }
                CacheCommand::Clear { partition } => {
                    let partition = match partition {
                        Some(name) => Some(
                            PartitionId::parse(&name)
                                .with_context(|| format!("Unknown partition: {name}"))?,
                        ),
                        None => None,
                    };
                    layer
                        .lifecycle()
                        .handle(Command::ClearCache { partition })
                        .await
                }
            };
            print_json(&reply)
        }
        Commands::Sync { command } => match command {
            SyncCommand::Status => print_json(&layer.sync_queue().status()?),
            SyncCommand::Dropped => print_json(&layer.sync_queue().drop_records()?),
            SyncCommand::Flush { force } => {
                if !layer.health().probe().await {
                    anyhow::bail!("Backend unreachable; tasks stay queued");
                }
                print_json(&layer.flush_sync(force).await?)
            }
        },
        Commands::Feedback {
            detection_id,
            correction,
            rating,
            helpful,
        } => {
            layer.health().probe().await;
            let feedback = FeedbackRequest {
                detection_id,
                user_correction: correction,
                confidence_rating: rating.clamp(0.0, 1.0),
                was_helpful: helpful,
            };
            print_json(&layer.submit_feedback(&feedback).await?)
        }
        Commands::Metrics => {
            let available = layer.health().probe().await;
            let pending = layer.sync_queue().len()?;
            tracing::info!(available, pending, "Backend probed");
            print!("{}", layer.metrics().render()?);
            Ok(())
        }
        Commands::Config { .. } => Ok(()),
    }
}

fn outcome_json(outcome: &DetectionOutcome) -> serde_json::Value {
    let downgrade = match outcome {
        DetectionOutcome::Remote(_) => None,
        DetectionOutcome::Local { downgrade, .. } | DetectionOutcome::Unavailable { downgrade } => {
            downgrade.as_ref().map(ToString::to_string)
        }
    };
    json!({
        "backend": outcome.backend().map(|b| b.as_str()),
        "result": outcome.result(),
        "downgrade": downgrade,
        "notice": outcome.notice(),
    })
}

async fn run(layer: &OfflineLayer) -> Result<()> {
    let mut events = layer.events().subscribe();
    layer.start();
    if let Some(report) = layer.ensure_installed().await? {
        tracing::info!(
            version = %report.version,
            stored = report.stored.len(),
            skipped = report.skipped.len(),
            "Generation installed"
        );
    }
    if let Err(e) = layer.load_local_model().await {
        tracing::warn!(error = %e, "Local model unavailable, remote detection only");
    }

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                break;
            }
            event = events.recv() => match event {
                Ok(AgentEvent::Notice(notice)) => tracing::warn!(?notice, "Notice"),
                Ok(event) => tracing::info!(?event, "Agent event"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Event subscriber lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    Ok(())
}
