//! Filesystem primitives shared by the pipeline stages.
//!
//! Inter-stage commits are single `rename` calls; stages and their
//! destinations must live on the same filesystem for the move to be atomic.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Name of the plaintext error report written into a parked task directory.
pub const ERROR_FILE_NAME: &str = "error.txt";

/// Move a file or directory via a single rename.
pub fn move_entry(source: &Path, destination: &Path) -> Result<()> {
    std::fs::rename(source, destination).with_context(|| {
        format!(
            "Cannot move '{}' to '{}'",
            source.display(),
            destination.display()
        )
    })
}

/// Recursively copy a directory tree. The destination directory is created.
pub fn copy_dir_recursive(source: &Path, destination: &Path) -> Result<()> {
    std::fs::create_dir_all(destination)
        .with_context(|| format!("Cannot create '{}'", destination.display()))?;
    for entry in std::fs::read_dir(source)
        .with_context(|| format!("Cannot list '{}'", source.display()))?
    {
        let entry = entry?;
        let target = destination.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target).with_context(|| {
                format!("Cannot copy '{}'", entry.path().display())
            })?;
        }
    }
    Ok(())
}

/// Write the error report into a task directory, replacing any previous one.
pub fn write_error_file(task_dir: &Path, reason: &str) -> Result<()> {
    let path = task_dir.join(ERROR_FILE_NAME);
    std::fs::write(&path, reason)
        .with_context(|| format!("Cannot write '{}'", path.display()))
}

/// List the direct subdirectories of a directory.
pub fn list_dirs(path: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(path)
        .with_context(|| format!("Cannot list '{}'", path.display()))?
    {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

/// List the direct non-hidden entries of a directory.
pub fn list_visible_entries(path: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(path)
        .with_context(|| format!("Cannot list '{}'", path.display()))?
    {
        let entry = entry?;
        if !is_hidden(&entry.file_name().to_string_lossy()) {
            entries.push(entry.path());
        }
    }
    Ok(entries)
}

/// Hidden entries (dotfiles) are never picked up by the scanner.
pub fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}
