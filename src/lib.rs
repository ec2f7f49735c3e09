//! Dropflow Dataset Pipeline
//!
//! Filesystem-driven pipeline that moves user-submitted datasets from
//! per-user drop folders through staged working directories into a
//! downstream ETL inbox.
//!
//! # Architecture
//!
//! The pipeline consists of:
//!
//! - **Scanner**: periodic poller over user drop folders
//! - **Registration**: wraps datasets into UUID task directories with a
//!   provenance record
//! - **Processing**: normalises payload layout so every task carries one
//!   payload directory
//! - **Evaluation**: validates the measurement identifier and hands the
//!   task off to a downstream inbox with a completion marker
//!
//! The scanner feeds the registration workers through one bounded queue;
//! every other stage boundary is the filesystem itself, committed with a
//! single atomic directory rename.
//!
//! # Usage
//!
//! ```no_run
//! use dropflow::{run_pipeline, Config};
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file(&"config.yaml".into())?;
//!     let (_shutdown_tx, shutdown_rx) = watch::channel(false);
//!     run_pipeline(config, shutdown_rx).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod fsops;
pub mod pipeline;
pub mod provenance;

pub use config::Config;
pub use pipeline::{Metrics, MetricsSnapshot};
pub use provenance::{Provenance, PROVENANCE_FILE_NAME};

use anyhow::Result;
use pipeline::{
    ActiveTasks, EvaluationWorker, MetricsReporter, ProcessingWorker, RegistrationQueue,
    RegistrationWorker, RoundRobin, Scanner,
};
use std::sync::Arc;
use tokio::sync::watch;

/// Run the full pipeline until the shutdown signal flips.
///
/// Shutdown is two-phase: the signal stops the scanner, which closes the
/// registration queue; polling workers finish their in-flight task and
/// exit. The final metrics snapshot is returned once every worker has
/// joined.
pub async fn run_pipeline(
    config: Config,
    shutdown: watch::Receiver<bool>,
) -> Result<MetricsSnapshot> {
    config.validate()?;

    tracing::info!("Starting dataset pipeline");

    let metrics = Metrics::new();
    let queue = RegistrationQueue::bounded(config.scanner.queue_capacity);
    let active = ActiveTasks::new();
    let inboxes = Arc::new(RoundRobin::new(config.evaluation.target_dirs.clone())?);

    let scanner = Scanner::new(&config.scanner, &config.users, queue.clone(), metrics.clone())?;

    let mut handles = Vec::new();
    handles.push(tokio::spawn(scanner.run(shutdown.clone())));

    for _ in 0..config.registration.threads {
        let worker = RegistrationWorker::new(
            &config.registration,
            &config.users,
            queue.clone(),
            metrics.clone(),
        )?;
        handles.push(tokio::spawn(worker.run()));
    }

    for _ in 0..config.processing.threads {
        let worker = ProcessingWorker::new(&config.processing, active.clone(), metrics.clone())?;
        handles.push(tokio::spawn(worker.run(shutdown.clone())));
    }

    for _ in 0..config.evaluation.threads {
        let worker = EvaluationWorker::new(
            &config.evaluation,
            &config.users,
            inboxes.clone(),
            active.clone(),
            metrics.clone(),
        )?;
        handles.push(tokio::spawn(worker.run(shutdown.clone())));
    }

    if config.metrics.enabled {
        let reporter = MetricsReporter::new(metrics.clone(), config.metrics.interval_secs);
        handles.push(tokio::spawn(reporter.run(shutdown.clone())));
    }

    tracing::info!(
        "Pipeline running: 1 scanner, {} registration, {} processing, {} evaluation workers",
        config.registration.threads,
        config.processing.threads,
        config.evaluation.threads
    );

    for handle in handles {
        let _ = handle.await;
    }

    let snapshot = metrics.snapshot();
    tracing::info!("Pipeline stopped: {}", snapshot);

    if let Some(path) = &config.metrics.output_path {
        if let Err(e) = snapshot.save_to_file(path) {
            tracing::warn!("Failed to save metrics to {}: {}", path, e);
        }
    }

    Ok(snapshot)
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}
