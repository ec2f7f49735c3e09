//! Configuration for the dropflow pipeline.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration for the dataset pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Per-user directory layout
    #[serde(default)]
    pub users: UsersConfig,

    /// Scanner configuration
    pub scanner: ScannerConfig,

    /// Registration stage configuration
    pub registration: RegistrationConfig,

    /// Processing stage configuration
    pub processing: ProcessingConfig,

    /// Evaluation stage configuration
    pub evaluation: EvaluationConfig,

    /// Metrics reporting configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Names of the well-known directories inside each user's home-like directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsersConfig {
    /// Basename of the per-user drop folder. Must pre-exist; the pipeline
    /// never creates it.
    #[serde(default = "default_registration_directory_name")]
    pub registration_directory_name: String,

    /// Basename of the per-user error folder, created on demand.
    #[serde(default = "default_error_directory_name")]
    pub error_directory_name: String,
}

impl Default for UsersConfig {
    fn default() -> Self {
        Self {
            registration_directory_name: default_registration_directory_name(),
            error_directory_name: default_error_directory_name(),
        }
    }
}

/// Scanner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Root directory containing one subdirectory per user.
    pub directory: PathBuf,

    /// Poll interval in milliseconds, must be > 0.
    #[serde(default = "default_scan_interval_ms")]
    pub interval_ms: u64,

    /// Capacity of the bounded registration queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

/// Registration stage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationConfig {
    /// Number of registration workers.
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Directory where task directories are assembled.
    pub working_dir: PathBuf,

    /// Working directory of the processing stage; the commit destination.
    pub target_dir: PathBuf,

    /// Suffix identifying the metadata side-file inside a dataset directory.
    #[serde(default = "default_metadata_file_suffix")]
    pub metadata_file_suffix: String,
}

/// Processing stage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Number of processing workers.
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Directory polled for task directories to normalise.
    pub working_dir: PathBuf,

    /// Working directory of the evaluation stage; the commit destination.
    pub target_dir: PathBuf,
}

/// Evaluation stage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    /// Number of evaluation workers.
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Directory polled for task directories to evaluate.
    pub working_dir: PathBuf,

    /// Downstream inbox directories, used round-robin. Externally owned;
    /// the pipeline never creates them.
    pub target_dirs: Vec<PathBuf>,

    /// Regex a measurement identifier must match to pass evaluation.
    #[serde(default = "default_measurement_id_pattern")]
    pub measurement_id_pattern: String,
}

/// Metrics reporting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable periodic metrics reporting.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Reporting interval in seconds.
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,

    /// Optional path to save a metrics JSON snapshot on shutdown.
    #[serde(default)]
    pub output_path: Option<String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_metrics_interval(),
            output_path: None,
        }
    }
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "yaml" | "yml" => serde_yaml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => {
                // YAML is a superset of JSON
                serde_yaml::from_str(&contents)?
            }
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.scanner.interval_ms == 0 {
            anyhow::bail!("Scanner interval must be > 0 ms");
        }
        if self.scanner.queue_capacity == 0 {
            anyhow::bail!("Registration queue capacity must be > 0");
        }
        if self.users.registration_directory_name.trim().is_empty() {
            anyhow::bail!("User registration directory name must not be blank");
        }
        if self.users.error_directory_name.trim().is_empty() {
            anyhow::bail!("User error directory name must not be blank");
        }
        if self.registration.threads == 0
            || self.processing.threads == 0
            || self.evaluation.threads == 0
        {
            anyhow::bail!("Every stage needs at least one worker");
        }
        if self.registration.metadata_file_suffix.trim().is_empty() {
            anyhow::bail!("Metadata file suffix must not be blank");
        }
        if self.evaluation.target_dirs.is_empty() {
            anyhow::bail!("Evaluation needs at least one target inbox directory");
        }
        if let Err(e) = regex::Regex::new(&self.evaluation.measurement_id_pattern) {
            anyhow::bail!("Invalid measurement id pattern: {}", e);
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_registration_directory_name() -> String {
    "registration".to_string()
}
fn default_error_directory_name() -> String {
    "error".to_string()
}
fn default_scan_interval_ms() -> u64 {
    1000
}
fn default_queue_capacity() -> usize {
    64
}
fn default_threads() -> usize {
    2
}
fn default_metadata_file_suffix() -> String {
    "metadata.tsv".to_string()
}
fn default_measurement_id_pattern() -> String {
    r"^(MS|NGS)Q[A-Z0-9]{4}[0-9]{3}[A-Z][A-Z0-9]$".to_string()
}
fn default_true() -> bool {
    true
}
fn default_metrics_interval() -> u64 {
    60
}
