//! Provenance records traveling with each task directory.
//!
//! The `provenance.json` schema is the public compatibility surface with
//! downstream consumers: unknown fields are ignored on read, and `history`
//! is append-only, ordered oldest to newest.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name of the provenance record inside a task directory.
pub const PROVENANCE_FILE_NAME: &str = "provenance.json";

/// Error raised when a provenance record cannot be located, read or parsed.
#[derive(Debug, Error)]
pub enum ProvenanceError {
    #[error("Provenance file does not exist: {0}")]
    NotFound(PathBuf),

    #[error("Cannot read provenance file {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot write provenance file {path}: {source}")]
    Unwritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot parse provenance file {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Provenance metadata of a dataset moving through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provenance {
    /// Drop-folder path the dataset was detected in.
    pub origin: String,

    /// The submitting user's home-like directory path.
    pub user: String,

    /// Measurement identifier; supplied externally before evaluation.
    #[serde(default)]
    pub measurement_id: Option<String>,

    /// UUID of the owning task directory.
    pub task_id: String,

    /// Payload file names contained in the task.
    #[serde(default)]
    pub dataset_files: Vec<String>,

    /// Ordered list of stage stops the task has traversed, oldest first.
    #[serde(default)]
    pub history: Vec<String>,
}

impl Provenance {
    /// Locate the provenance file among the direct entries of a task directory.
    pub fn find(task_dir: &Path) -> Option<PathBuf> {
        let candidate = task_dir.join(PROVENANCE_FILE_NAME);
        candidate.is_file().then_some(candidate)
    }

    /// Parse a provenance record from a JSON file. Unknown fields are ignored.
    pub fn load(path: &Path) -> Result<Self, ProvenanceError> {
        if !path.exists() {
            return Err(ProvenanceError::NotFound(path.to_path_buf()));
        }
        let contents = std::fs::read_to_string(path).map_err(|source| {
            ProvenanceError::Unreadable {
                path: path.to_path_buf(),
                source,
            }
        })?;
        serde_json::from_str(&contents).map_err(|source| ProvenanceError::Malformed {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Write the record as pretty-printed JSON, replacing any previous file.
    pub fn store(&self, path: &Path) -> Result<(), ProvenanceError> {
        let json = serde_json::to_string_pretty(self).map_err(|source| {
            ProvenanceError::Malformed {
                path: path.to_path_buf(),
                source,
            }
        })?;
        std::fs::write(path, json).map_err(|source| ProvenanceError::Unwritable {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Append a stop to the traversal history.
    pub fn add_to_history(&mut self, stop: impl Into<String>) {
        self.history.push(stop.into());
    }
}
