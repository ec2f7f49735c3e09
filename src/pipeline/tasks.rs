//! Task directory primitives shared by the polling stages.

use crate::fsops;
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

/// Basename of the stage-local quarantine directory.
pub const INTERVENTION_DIRECTORY: &str = "interventions";

/// Process-wide set of task directories currently held by a worker.
///
/// Directory listings can show the same task to several workers within one
/// polling tick; a worker only operates on a task after inserting its
/// absolute path here. One shared instance covers all polling stages.
#[derive(Debug, Default)]
pub struct ActiveTasks {
    inner: Mutex<HashSet<PathBuf>>,
}

impl ActiveTasks {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::default())
    }

    /// Claim a task directory. Returns false if another worker holds it.
    pub fn claim(&self, task_dir: &Path) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task_dir.to_path_buf())
    }

    /// Release a previously claimed task directory.
    pub fn release(&self, task_dir: &Path) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(task_dir);
    }
}

/// Create a fresh UUID-named task directory under a stage working directory.
pub fn create_task_directory(working_dir: &Path) -> Result<PathBuf> {
    let task_dir = working_dir.join(Uuid::new_v4().to_string());
    std::fs::create_dir_all(&task_dir)
        .with_context(|| format!("Cannot create task directory '{}'", task_dir.display()))?;
    Ok(task_dir)
}

/// Ensure a stage's intervention directory exists and return its path.
pub fn ensure_intervention_directory(working_dir: &Path) -> Result<PathBuf> {
    let dir = working_dir.join(INTERVENTION_DIRECTORY);
    std::fs::create_dir_all(&dir).with_context(|| {
        format!("Could not create intervention directory at '{}'", working_dir.display())
    })?;
    Ok(dir)
}

/// Park a task in the stage's intervention directory with an error report.
///
/// Used for faults the submitting user cannot fix.
pub fn park_to_intervention(task_dir: &Path, intervention_dir: &Path, reason: &str) -> Result<()> {
    fsops::write_error_file(task_dir, reason)?;
    let file_name = task_dir
        .file_name()
        .with_context(|| format!("Task directory has no name: '{}'", task_dir.display()))?;
    fsops::move_entry(task_dir, &intervention_dir.join(file_name))
}

/// Park a task in the submitting user's error directory with an error report.
///
/// The error directory is created on demand.
pub fn park_to_user(
    task_dir: &Path,
    user_path: &Path,
    error_directory_name: &str,
    reason: &str,
) -> Result<()> {
    fsops::write_error_file(task_dir, reason)?;
    let error_dir = user_path.join(error_directory_name);
    std::fs::create_dir_all(&error_dir)
        .with_context(|| format!("Cannot create user error directory '{}'", error_dir.display()))?;
    let file_name = task_dir
        .file_name()
        .with_context(|| format!("Task directory has no name: '{}'", task_dir.display()))?;
    fsops::move_entry(task_dir, &error_dir.join(file_name))
}

/// List the task directories of a stage working directory, skipping the
/// stage's intervention directory.
pub fn list_task_directories(working_dir: &Path) -> Result<Vec<PathBuf>> {
    Ok(fsops::list_dirs(working_dir)?
        .into_iter()
        .filter(|dir| {
            dir.file_name()
                .map(|name| name != INTERVENTION_DIRECTORY)
                .unwrap_or(false)
        })
        .collect())
}
