//! Evaluation stage: the final gate before downstream handoff.
//!
//! Workers confirm the presence of a valid measurement identifier, copy the
//! task into the next downstream inbox and write the completion marker the
//! ETL contract requires; tasks without a valid identifier go back to the
//! submitting user's error directory.

use crate::config::{EvaluationConfig, UsersConfig};
use crate::fsops;
use crate::pipeline::{tasks, ActiveTasks, Metrics};
use crate::provenance::Provenance;
use anyhow::{Context, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Prefix of the completion marker file, the published ETL contract.
pub const MARKER_FILE_PREFIX: &str = ".MARKER_is_finished_";

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Thread-safe round-robin draw over an ordered list.
///
/// Draws are atomic so every task picks exactly one item; strict ordering
/// across concurrent draws is best-effort.
#[derive(Debug)]
pub struct RoundRobin<T> {
    items: Vec<T>,
    next: AtomicUsize,
}

impl<T> RoundRobin<T> {
    /// Create a draw over a non-empty list.
    pub fn new(items: Vec<T>) -> Result<Self> {
        if items.is_empty() {
            anyhow::bail!("Round-robin draw needs at least one item");
        }
        Ok(Self {
            items,
            next: AtomicUsize::new(0),
        })
    }

    /// Return the next item, wrapping around.
    pub fn draw(&self) -> &T {
        let index = self.next.fetch_add(1, Ordering::Relaxed);
        &self.items[index % self.items.len()]
    }
}

/// Worker of the evaluation stage. Clone one per pool slot.
#[derive(Debug, Clone)]
pub struct EvaluationWorker {
    working_dir: PathBuf,
    intervention_dir: PathBuf,
    inboxes: Arc<RoundRobin<PathBuf>>,
    measurement_id_pattern: Regex,
    error_directory_name: String,
    active: Arc<ActiveTasks>,
    metrics: Arc<Metrics>,
}

impl EvaluationWorker {
    /// Create a worker, ensuring the stage directories exist.
    pub fn new(
        config: &EvaluationConfig,
        users: &UsersConfig,
        inboxes: Arc<RoundRobin<PathBuf>>,
        active: Arc<ActiveTasks>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.working_dir).with_context(|| {
            format!("Cannot create working directory '{}'", config.working_dir.display())
        })?;
        let intervention_dir = tasks::ensure_intervention_directory(&config.working_dir)?;
        let measurement_id_pattern = Regex::new(&config.measurement_id_pattern)
            .with_context(|| {
                format!("Invalid measurement id pattern '{}'", config.measurement_id_pattern)
            })?;
        Ok(Self {
            working_dir: config.working_dir.clone(),
            intervention_dir,
            inboxes,
            measurement_id_pattern,
            error_directory_name: users.error_directory_name.clone(),
            active,
            metrics,
        })
    }

    /// Poll for tasks until the shutdown signal flips. A claimed task is
    /// always finished before exiting.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            self.evaluation_pass().await;
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("Evaluation worker stopped");
    }

    /// One pass over the working directory.
    async fn evaluation_pass(&self) {
        let task_dirs = match tasks::list_task_directories(&self.working_dir) {
            Ok(dirs) => dirs,
            Err(e) => {
                tracing::warn!(
                    "Cannot list working directory '{}': {:#}",
                    self.working_dir.display(),
                    e
                );
                return;
            }
        };
        for task_dir in task_dirs {
            if !self.active.claim(&task_dir) {
                continue;
            }
            // The task may have been moved on by another worker between
            // listing and claiming
            if task_dir.exists() {
                self.evaluate(&task_dir).await;
            }
            self.active.release(&task_dir);
        }
    }

    /// Per-task transactional unit: the task ends delivered, parked to the
    /// user, or parked to intervention. Errors never escape.
    async fn evaluate(&self, task_dir: &Path) {
        let provenance_path = match Provenance::find(task_dir) {
            Some(path) => path,
            None => {
                tracing::error!("No provenance file found: '{}'", task_dir.display());
                self.park_to_intervention(task_dir, "Provenance file was not found");
                return;
            }
        };
        let mut provenance = match Provenance::load(&provenance_path) {
            Ok(provenance) => provenance,
            Err(e) => {
                tracing::error!("Could not parse provenance file: '{}': {}", task_dir.display(), e);
                self.park_to_intervention(task_dir, &e.to_string());
                return;
            }
        };

        if !self.has_valid_measurement_id(&provenance) {
            tracing::error!(
                "Missing measurement identifier: no valid measurement id was found for task '{}'",
                task_dir.display()
            );
            self.return_to_user(task_dir, &provenance);
            return;
        }

        provenance.add_to_history(self.working_dir.display().to_string());
        if let Err(e) = provenance.store(&provenance_path) {
            tracing::error!("Could not update provenance file: '{}': {}", task_dir.display(), e);
            self.park_to_intervention(task_dir, &e.to_string());
            return;
        }

        let inbox = self.inboxes.draw().clone();
        if let Err(e) = self.deliver(task_dir, &inbox).await {
            tracing::error!(
                "Could not deliver task '{}' to '{}': {:#}",
                task_dir.display(),
                inbox.display(),
                e
            );
            self.park_to_intervention(task_dir, &format!("{:#}", e));
            return;
        }
        self.metrics.add_task_delivered();
    }

    fn has_valid_measurement_id(&self, provenance: &Provenance) -> bool {
        provenance
            .measurement_id
            .as_deref()
            .map(|id| !id.trim().is_empty() && self.measurement_id_pattern.is_match(id.trim()))
            .unwrap_or(false)
    }

    /// Copy the task into the inbox, write the marker strictly after the
    /// copy so the ETL never sees a partial dataset, then drop the source.
    async fn deliver(&self, task_dir: &Path, inbox: &Path) -> Result<()> {
        let task_name = task_dir
            .file_name()
            .with_context(|| format!("Task directory has no name: '{}'", task_dir.display()))?
            .to_string_lossy()
            .into_owned();

        tracing::info!(
            "Copying '{}' to target directory '{}'",
            task_dir.display(),
            inbox.display()
        );
        let source = task_dir.to_path_buf();
        let destination = inbox.join(&task_name);
        tokio::task::spawn_blocking(move || fsops::copy_dir_recursive(&source, &destination))
            .await
            .map_err(|e| anyhow::anyhow!("Copy task panicked: {}", e))??;

        let marker = inbox.join(format!("{}{}", MARKER_FILE_PREFIX, task_name));
        std::fs::write(&marker, "")
            .with_context(|| format!("Could not create marker file '{}'", marker.display()))?;

        tracing::info!("Deleting task directory: '{}'", task_dir.display());
        std::fs::remove_dir_all(task_dir)
            .with_context(|| format!("Could not clean up '{}'", task_dir.display()))?;
        Ok(())
    }

    /// Return a task the user can fix, falling back to intervention when
    /// even that move fails.
    fn return_to_user(&self, task_dir: &Path, provenance: &Provenance) {
        let summary = error_summary(task_dir, provenance);
        let user_path = PathBuf::from(&provenance.user);
        tracing::info!(
            "Moving back to original user directory: '{}'",
            user_path.join(&self.error_directory_name).display()
        );
        match tasks::park_to_user(task_dir, &user_path, &self.error_directory_name, &summary) {
            Ok(()) => self.metrics.add_task_parked_user(),
            Err(e) => {
                tracing::error!(
                    "Cannot move task to user error directory '{}': {:#}",
                    user_path.join(&self.error_directory_name).display(),
                    e
                );
                self.park_to_intervention(task_dir, &format!("{:#}", e));
            }
        }
    }

    fn park_to_intervention(&self, task_dir: &Path, reason: &str) {
        self.metrics.add_failure();
        match tasks::park_to_intervention(task_dir, &self.intervention_dir, reason) {
            Ok(()) => self.metrics.add_task_parked_intervention(),
            Err(e) => tracing::error!(
                "Cannot move task to intervention: '{}': {:#}",
                task_dir.display(),
                e
            ),
        }
    }
}

/// User-facing report for a rejected task.
fn error_summary(task_dir: &Path, provenance: &Provenance) -> String {
    let task_name = task_dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!(
        "Task: {}\nDataset files: {}\nReason: Missing QBiC measurement ID\n\
         For a successful registration please provide the pre-registered QBiC measurement ID.\n",
        task_name,
        provenance.dataset_files.join(", ")
    )
}
