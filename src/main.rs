//! Dropflow Pipeline CLI
//!
//! Moves user-submitted datasets from drop folders into an ETL inbox.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::sync::watch;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use dropflow::{build_runtime, run_pipeline, Config};

#[derive(Parser)]
#[command(name = "dropflow")]
#[command(about = "Move user-submitted datasets into an ETL inbox", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline (default if no command specified)
    Run,

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        None | Some(Commands::Run) => {
            run_command(cli.config)?;
        }

        Some(Commands::Validate) => {
            validate_command(cli.config)?;
        }

        Some(Commands::GenerateConfig { output }) => {
            generate_config_command(output)?;
        }
    }

    Ok(())
}

fn run_command(config_path: PathBuf) -> Result<()> {
    let config = Config::from_file(&config_path)?;
    config.validate()?;

    let runtime = build_runtime(None)?;
    runtime.block_on(async {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown signal received");
                let _ = shutdown_tx.send(true);
            }
        });

        run_pipeline(config, shutdown_rx).await
    })?;

    Ok(())
}

fn validate_command(config_path: PathBuf) -> Result<()> {
    let config = Config::from_file(&config_path)?;
    config.validate()?;
    println!("Configuration is valid");
    Ok(())
}

fn generate_config_command(output: PathBuf) -> Result<()> {
    // Generate a commented YAML config
    let yaml = r#"# Dropflow Pipeline Configuration

# === USERS: Per-user directory layout ===
users:
  # Basename of the per-user drop folder. Must pre-exist; the pipeline
  # never creates it, to prevent accidental overwrites.
  registration_directory_name: "registration"

  # Basename of the per-user error folder, created on demand.
  error_directory_name: "error"

# === SCANNER: Drop folder discovery ===
scanner:
  # Root directory containing one subdirectory per user
  directory: "/data/users"

  # Poll interval in milliseconds (must be > 0)
  interval_ms: 1000

  # Capacity of the bounded registration queue
  queue_capacity: 64

# === REGISTRATION: First stage ===
registration:
  # Number of registration workers
  threads: 2

  # Directory where task directories are assembled
  working_dir: "/data/stages/registration"

  # Working directory of the processing stage (commit destination)
  target_dir: "/data/stages/processing"

  # Suffix identifying the metadata side-file inside a dataset directory
  metadata_file_suffix: "metadata.tsv"

# === PROCESSING: Payload normalisation ===
processing:
  threads: 2
  working_dir: "/data/stages/processing"
  target_dir: "/data/stages/evaluation"

# === EVALUATION: Final gate before ETL handoff ===
evaluation:
  threads: 2
  working_dir: "/data/stages/evaluation"

  # Downstream inbox directories, used round-robin. Externally owned.
  target_dirs:
    - "/data/etl/inbox-1"
    - "/data/etl/inbox-2"

  # Regex a measurement identifier must match to pass evaluation
  measurement_id_pattern: "^(MS|NGS)Q[A-Z0-9]{4}[0-9]{3}[A-Z][A-Z0-9]$"

# === METRICS: Periodic counter reporting ===
metrics:
  enabled: true
  interval_secs: 60

  # Optional path to save a metrics JSON snapshot on shutdown
  # output_path: "/var/log/dropflow-metrics.json"
"#;

    std::fs::write(&output, yaml)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}
