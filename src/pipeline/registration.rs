//! Registration stage: the first stop of every incoming dataset.
//!
//! Workers consume the queue shared with the scanner, wrap each dataset
//! into a UUID-named task directory with a provenance record, and commit
//! the task to the processing stage's working directory.

use crate::config::{RegistrationConfig, UsersConfig};
use crate::fsops;
use crate::pipeline::queue::RegistrationQueue;
use crate::pipeline::scanner::RegistrationRequest;
use crate::pipeline::{tasks, Metrics};
use crate::provenance::{Provenance, PROVENANCE_FILE_NAME};
use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// A dataset fault the submitting user is expected to fix.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Metadata file does not exist")]
    MetadataFileNotFound,

    #[error("Cannot read metadata file: {0}")]
    MetadataUnreadable(String),

    #[error("Incomplete metadata entry: '{line}'")]
    IncompleteMetadata { line: String },

    #[error("Unknown file reference in metadata: {reference}")]
    UnknownFileReference { reference: String },
}

/// One record of the tab-separated metadata side-file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRow {
    pub file_ref: String,
    pub label: String,
}

enum RegistrationFailure {
    Validation(ValidationError),
    /// `task_dir` is set once the dataset has left the drop folder.
    Io {
        task_dir: Option<PathBuf>,
        source: anyhow::Error,
    },
}

/// Worker of the registration stage. Clone one per pool slot.
#[derive(Debug, Clone)]
pub struct RegistrationWorker {
    queue: RegistrationQueue,
    working_dir: PathBuf,
    target_dir: PathBuf,
    intervention_dir: PathBuf,
    metadata_file_suffix: String,
    error_directory_name: String,
    metrics: Arc<Metrics>,
}

impl RegistrationWorker {
    /// Create a worker, ensuring the stage directories exist.
    pub fn new(
        config: &RegistrationConfig,
        users: &UsersConfig,
        queue: RegistrationQueue,
        metrics: Arc<Metrics>,
    ) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.working_dir).with_context(|| {
            format!("Cannot create working directory '{}'", config.working_dir.display())
        })?;
        std::fs::create_dir_all(&config.target_dir).with_context(|| {
            format!("Cannot create target directory '{}'", config.target_dir.display())
        })?;
        let intervention_dir = tasks::ensure_intervention_directory(&config.working_dir)?;
        Ok(Self {
            queue,
            working_dir: config.working_dir.clone(),
            target_dir: config.target_dir.clone(),
            intervention_dir,
            metadata_file_suffix: config.metadata_file_suffix.clone(),
            error_directory_name: users.error_directory_name.clone(),
            metrics,
        })
    }

    /// Consume requests until the queue is closed and drained. The in-flight
    /// request always completes before the worker returns.
    pub async fn run(self) {
        while let Some(request) = self.queue.dequeue().await {
            tracing::info!("Processing request: {}", request);
            self.handle_request(&request);
            tracing::info!("Processing completed: {}", request);
        }
        tracing::debug!("Registration worker stopped");
    }

    /// Per-request transactional unit: the request ends advanced, parked to
    /// the user, or parked to intervention. Errors never escape.
    fn handle_request(&self, request: &RegistrationRequest) {
        match self.register(request) {
            Ok(()) => self.metrics.add_task_registered(),
            Err(RegistrationFailure::Validation(error)) => {
                tracing::error!("Rejecting request {}: {}", request, error);
                self.reject_to_user(request, &error.to_string());
            }
            Err(RegistrationFailure::Io { task_dir, source }) => {
                tracing::error!(
                    "Error while processing registration request {}: {:#}",
                    request,
                    source
                );
                self.metrics.add_failure();
                if let Some(task_dir) = task_dir {
                    match tasks::park_to_intervention(
                        &task_dir,
                        &self.intervention_dir,
                        &format!("{:#}", source),
                    ) {
                        Ok(()) => self.metrics.add_task_parked_intervention(),
                        Err(e) => tracing::error!(
                            "Cannot move task to intervention: '{}': {:#}",
                            task_dir.display(),
                            e
                        ),
                    }
                }
            }
        }
    }

    fn register(&self, request: &RegistrationRequest) -> Result<(), RegistrationFailure> {
        let dataset_files = self
            .collect_dataset_files(&request.target_path)
            .map_err(RegistrationFailure::Validation)?;

        let payload_name = request
            .target_path
            .file_name()
            .map(|name| name.to_os_string())
            .ok_or_else(|| RegistrationFailure::Io {
                task_dir: None,
                source: anyhow::anyhow!(
                    "Dataset entry has no name: '{}'",
                    request.target_path.display()
                ),
            })?;

        let task_dir = tasks::create_task_directory(&self.working_dir)
            .map_err(|source| RegistrationFailure::Io { task_dir: None, source })?;
        let task_id = match dir_name(&task_dir) {
            Ok(task_id) => task_id,
            Err(source) => {
                let _ = std::fs::remove_dir(&task_dir);
                return Err(RegistrationFailure::Io { task_dir: None, source });
            }
        };

        // The move out of the drop folder. Until it succeeds the dataset is
        // still owned by the user and the empty task directory is discarded.
        let payload_location = task_dir.join(&payload_name);
        if let Err(source) = fsops::move_entry(&request.target_path, &payload_location) {
            let _ = std::fs::remove_dir(&task_dir);
            return Err(RegistrationFailure::Io { task_dir: None, source });
        }

        let provenance = Provenance {
            origin: request.origin_path.display().to_string(),
            user: request.user_path.display().to_string(),
            measurement_id: None,
            task_id: task_id.clone(),
            dataset_files,
            history: vec![payload_location.display().to_string()],
        };
        provenance
            .store(&task_dir.join(PROVENANCE_FILE_NAME))
            .map_err(|source| RegistrationFailure::Io {
                task_dir: Some(task_dir.clone()),
                source: source.into(),
            })?;

        let committed = self.target_dir.join(&task_id);
        fsops::move_entry(&task_dir, &committed).map_err(|source| RegistrationFailure::Io {
            task_dir: Some(task_dir.clone()),
            source,
        })?;
        Ok(())
    }

    /// Resolve the payload file names. Directory payloads must carry a
    /// metadata side-file whose references all resolve; plain files carry
    /// no side-file and name themselves.
    fn collect_dataset_files(&self, target: &Path) -> Result<Vec<String>, ValidationError> {
        if !target.is_dir() {
            let name = target
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            return Ok(vec![name]);
        }

        let metadata_file = self.find_metadata_file(target)?;
        let contents = std::fs::read_to_string(&metadata_file)
            .map_err(|e| ValidationError::MetadataUnreadable(e.to_string()))?;
        let rows = parse_metadata(&contents)?;

        for row in &rows {
            if !target.join(&row.file_ref).exists() {
                return Err(ValidationError::UnknownFileReference {
                    reference: row.file_ref.clone(),
                });
            }
        }
        Ok(rows.into_iter().map(|row| row.file_ref).collect())
    }

    fn find_metadata_file(&self, dataset_dir: &Path) -> Result<PathBuf, ValidationError> {
        let entries = std::fs::read_dir(dataset_dir)
            .map_err(|e| ValidationError::MetadataUnreadable(e.to_string()))?;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.path().is_file() && name.ends_with(&self.metadata_file_suffix) {
                return Ok(entry.path());
            }
        }
        Err(ValidationError::MetadataFileNotFound)
    }

    /// Wrap the rejected dataset into a task directory with an error report
    /// and move it into the user's error directory.
    fn reject_to_user(&self, request: &RegistrationRequest, reason: &str) {
        tracing::info!(
            "Moving back to original user directory: '{}'",
            request.target_path.display()
        );
        match self.wrap_rejected(request, reason) {
            Ok(()) => self.metrics.add_task_parked_user(),
            Err(e) => {
                tracing::error!(
                    "Cannot move task to user error directory '{}': {:#}",
                    request.user_path.join(&self.error_directory_name).display(),
                    e
                );
                self.metrics.add_failure();
            }
        }
    }

    fn wrap_rejected(&self, request: &RegistrationRequest, reason: &str) -> anyhow::Result<()> {
        let task_dir = tasks::create_task_directory(&self.working_dir)?;
        let payload_name = request
            .target_path
            .file_name()
            .with_context(|| {
                format!("Dataset entry has no name: '{}'", request.target_path.display())
            })?
            .to_os_string();
        fsops::move_entry(&request.target_path, &task_dir.join(payload_name))?;
        tasks::park_to_user(
            &task_dir,
            &request.user_path,
            &self.error_directory_name,
            reason,
        )
    }
}

/// Parse the tab-separated side-file: one `<fileRef>\t<label>` per line.
/// Whitespace-only lines are skipped; any other malformed line is fatal.
pub fn parse_metadata(contents: &str) -> Result<Vec<MetadataRow>, ValidationError> {
    let mut rows = Vec::new();
    for line in contents.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let (file_ref, label) = line.split_once('\t').ok_or_else(|| {
            ValidationError::IncompleteMetadata {
                line: line.to_string(),
            }
        })?;
        if file_ref.is_empty() || label.is_empty() {
            return Err(ValidationError::IncompleteMetadata {
                line: line.to_string(),
            });
        }
        rows.push(MetadataRow {
            file_ref: file_ref.to_string(),
            label: label.to_string(),
        });
    }
    Ok(rows)
}

fn dir_name(path: &Path) -> anyhow::Result<String> {
    Ok(path
        .file_name()
        .with_context(|| format!("Directory has no name: '{}'", path.display()))?
        .to_string_lossy()
        .into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_metadata_rows() {
        let rows = parse_metadata("reads.fastq\tsha256:abc\nindex.bai\traw\n").unwrap();
        assert_eq!(
            rows,
            vec![
                MetadataRow {
                    file_ref: "reads.fastq".to_string(),
                    label: "sha256:abc".to_string(),
                },
                MetadataRow {
                    file_ref: "index.bai".to_string(),
                    label: "raw".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_parse_metadata_skips_blank_lines() {
        let rows = parse_metadata("reads.fastq\traw\n\n").unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_parse_metadata_line_without_tab_is_fatal() {
        let result = parse_metadata("reads.fastq raw");
        assert!(matches!(
            result,
            Err(ValidationError::IncompleteMetadata { .. })
        ));
    }

    #[test]
    fn test_parse_metadata_missing_label_is_fatal() {
        let result = parse_metadata("reads.fastq\t");
        assert!(matches!(
            result,
            Err(ValidationError::IncompleteMetadata { .. })
        ));
    }

    #[test]
    fn test_validation_error_messages() {
        assert!(ValidationError::MetadataFileNotFound
            .to_string()
            .contains("Metadata file does not exist"));
        let incomplete = ValidationError::IncompleteMetadata {
            line: "broken".to_string(),
        };
        assert!(incomplete.to_string().contains("Incomplete metadata"));
        let unknown = ValidationError::UnknownFileReference {
            reference: "ghost.bin".to_string(),
        };
        assert!(unknown.to_string().contains("ghost.bin"));
    }
}
