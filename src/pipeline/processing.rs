//! Processing stage: payload layout normalisation.
//!
//! Workers poll the stage working directory, wrap plain-file payloads into
//! a `<name>_dataset/` directory so every task carries exactly one payload
//! directory, record the stop in the provenance history, and commit the
//! task to the evaluation stage.

use crate::config::ProcessingConfig;
use crate::fsops;
use crate::pipeline::{tasks, ActiveTasks, Metrics};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Suffix of the directory a plain-file payload is wrapped into.
pub const DATASET_DIRECTORY_SUFFIX: &str = "_dataset";

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Worker of the processing stage. Clone one per pool slot.
#[derive(Debug, Clone)]
pub struct ProcessingWorker {
    working_dir: PathBuf,
    target_dir: PathBuf,
    intervention_dir: PathBuf,
    active: Arc<ActiveTasks>,
    metrics: Arc<Metrics>,
}

impl ProcessingWorker {
    /// Create a worker, ensuring the stage directories exist.
    pub fn new(
        config: &ProcessingConfig,
        active: Arc<ActiveTasks>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.working_dir).with_context(|| {
            format!("Cannot create working directory '{}'", config.working_dir.display())
        })?;
        std::fs::create_dir_all(&config.target_dir).with_context(|| {
            format!("Cannot create target directory '{}'", config.target_dir.display())
        })?;
        let intervention_dir = tasks::ensure_intervention_directory(&config.working_dir)?;
        Ok(Self {
            working_dir: config.working_dir.clone(),
            target_dir: config.target_dir.clone(),
            intervention_dir,
            active,
            metrics,
        })
    }

    /// Poll for tasks until the shutdown signal flips. A claimed task is
    /// always finished, including its final atomic move, before exiting.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            self.process_pass();
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
        tracing::debug!("Processing worker stopped");
    }

    /// One pass over the working directory.
    fn process_pass(&self) {
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
                self.handle_task(&task_dir);
            }
            self.active.release(&task_dir);
        }
    }

    /// Per-task transactional unit: the task ends advanced or parked to
    /// intervention. Errors never escape.
    fn handle_task(&self, task_dir: &Path) {
        match self.normalise(task_dir) {
            Ok(()) => self.metrics.add_task_normalised(),
            Err(e) => {
                tracing::error!("Cannot process task '{}': {:#}", task_dir.display(), e);
                self.metrics.add_failure();
                match tasks::park_to_intervention(
                    task_dir,
                    &self.intervention_dir,
                    &format!("{:#}", e),
                ) {
                    Ok(()) => self.metrics.add_task_parked_intervention(),
                    Err(park) => tracing::error!(
                        "Cannot move task to intervention: '{}': {:#}",
                        task_dir.display(),
                        park
                    ),
                }
            }
        }
    }

    fn normalise(&self, task_dir: &Path) -> Result<()> {
        let provenance_path = crate::provenance::Provenance::find(task_dir)
            .with_context(|| format!("Provenance file was not found in '{}'", task_dir.display()))?;
        let mut provenance = crate::provenance::Provenance::load(&provenance_path)?;

        let payload = find_payload(task_dir)?;
        if payload.is_file() {
            wrap_file_payload(&payload)?;
        }

        provenance.add_to_history(self.working_dir.display().to_string());
        provenance.store(&provenance_path)?;

        let file_name = task_dir
            .file_name()
            .with_context(|| format!("Task directory has no name: '{}'", task_dir.display()))?;
        fsops::move_entry(task_dir, &self.target_dir.join(file_name))?;
        Ok(())
    }
}

/// Locate the single payload entry of a task directory.
fn find_payload(task_dir: &Path) -> Result<PathBuf> {
    let mut payloads = Vec::new();
    for entry in std::fs::read_dir(task_dir)
        .with_context(|| format!("Cannot list task directory '{}'", task_dir.display()))?
    {
        let entry = entry?;
        let name = entry.file_name();
        if name != crate::provenance::PROVENANCE_FILE_NAME && name != fsops::ERROR_FILE_NAME {
            payloads.push(entry.path());
        }
    }
    match payloads.as_slice() {
        [payload] => Ok(payload.clone()),
        [] => anyhow::bail!("Task '{}' has no payload entry", task_dir.display()),
        _ => anyhow::bail!(
            "Task '{}' has {} payload entries, expected exactly one",
            task_dir.display(),
            payloads.len()
        ),
    }
}

/// Wrap a plain-file payload into `<name>_dataset/<name>`.
fn wrap_file_payload(payload: &Path) -> Result<PathBuf> {
    let file_name = payload
        .file_name()
        .with_context(|| format!("Payload has no name: '{}'", payload.display()))?
        .to_string_lossy()
        .into_owned();
    let parent = payload
        .parent()
        .with_context(|| format!("Payload has no parent: '{}'", payload.display()))?;
    let dataset_dir = parent.join(format!("{}{}", file_name, DATASET_DIRECTORY_SUFFIX));
    std::fs::create_dir(&dataset_dir)
        .with_context(|| format!("Cannot create '{}'", dataset_dir.display()))?;
    fsops::move_entry(payload, &dataset_dir.join(&file_name))?;
    Ok(dataset_dir)
}
