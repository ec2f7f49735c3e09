//! Periodic discovery of newly dropped datasets.

use crate::config::{ScannerConfig, UsersConfig};
use crate::fsops;
use crate::pipeline::queue::RegistrationQueue;
use crate::pipeline::Metrics;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;

/// A dataset entry discovered in a user's drop folder.
#[derive(Debug, Clone)]
pub struct RegistrationRequest {
    /// Wall clock of detection.
    pub detected_at: DateTime<Utc>,

    /// Modification time of the filesystem entry.
    pub last_modified: SystemTime,

    /// The user's home-like directory.
    pub user_path: PathBuf,

    /// The user's drop folder the entry was found in.
    pub origin_path: PathBuf,

    /// The dataset entry itself.
    pub target_path: PathBuf,
}

/// Two requests are the same submission iff target path and modification
/// time agree. This pair is the scanner's deduplication key.
impl PartialEq for RegistrationRequest {
    fn eq(&self, other: &Self) -> bool {
        self.target_path == other.target_path && self.last_modified == other.last_modified
    }
}

impl Eq for RegistrationRequest {}

impl Hash for RegistrationRequest {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.target_path.hash(state);
        self.last_modified.hash(state);
    }
}

impl std::fmt::Display for RegistrationRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "'{}'", self.target_path.display())
    }
}

/// Single periodic poller over the user directories.
///
/// Deduplication lives in memory for the process lifetime: after a restart
/// any entry still present in a drop folder is re-enqueued, which is the
/// intended recovery behaviour (registration workers own the move out of
/// the drop folder).
pub struct Scanner {
    root: PathBuf,
    interval: Duration,
    registration_directory_name: String,
    queue: RegistrationQueue,
    metrics: Arc<Metrics>,
    drop_folders: HashSet<PathBuf>,
    submitted: HashSet<RegistrationRequest>,
}

impl Scanner {
    /// Create a scanner. Fails fast when the root directory is missing.
    pub fn new(
        scanner_config: &ScannerConfig,
        users_config: &UsersConfig,
        queue: RegistrationQueue,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        if !scanner_config.directory.is_dir() {
            anyhow::bail!(
                "Could not find scanner directory: '{}'",
                scanner_config.directory.display()
            );
        }
        Ok(Self {
            root: scanner_config.directory.clone(),
            interval: Duration::from_millis(scanner_config.interval_ms),
            registration_directory_name: users_config.registration_directory_name.clone(),
            queue,
            metrics,
            drop_folders: HashSet::new(),
            submitted: HashSet::new(),
        })
    }

    /// Poll until the shutdown signal flips, then close the queue so the
    /// registration workers drain and stop.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("Started scanning '{}'", self.root.display());
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.scan_once().await {
                tracing::warn!("Scan iteration skipped: {:#}", e);
            }
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = shutdown.changed() => {
                    // A dropped sender means there is nobody left to signal
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        self.queue.close();
        tracing::info!("Stopped scanning '{}'", self.root.display());
    }

    /// One scan pass: discover drop folders, enqueue fresh requests, prune
    /// folders that vanished.
    async fn scan_once(&mut self) -> Result<()> {
        for user_dir in fsops::list_dirs(&self.root)? {
            let drop_folder = user_dir.join(&self.registration_directory_name);
            if drop_folder.is_dir() && self.drop_folders.insert(drop_folder.clone()) {
                tracing::info!("New user drop folder found: '{}'", drop_folder.display());
            }
        }

        for request in self.detect_requests() {
            if self.submitted.contains(&request) {
                tracing::debug!("Skipping registration request {}", request);
                continue;
            }
            self.queue
                .enqueue(request.clone())
                .await
                .context("Registration queue closed while enqueuing")?;
            self.metrics.add_request_enqueued();
            tracing::info!("New registration requested: {}", request);
            self.submitted.insert(request);
        }

        self.prune_vanished_folders();
        Ok(())
    }

    fn detect_requests(&self) -> Vec<RegistrationRequest> {
        let mut requests = Vec::new();
        for drop_folder in &self.drop_folders {
            let entries = match fsops::list_visible_entries(drop_folder) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(
                        "Cannot list drop folder '{}': {:#}",
                        drop_folder.display(),
                        e
                    );
                    continue;
                }
            };
            for entry in entries {
                match build_request(drop_folder, &entry) {
                    Ok(request) => requests.push(request),
                    Err(e) => {
                        tracing::warn!("Skipping entry '{}': {:#}", entry.display(), e)
                    }
                }
            }
        }
        requests
    }

    fn prune_vanished_folders(&mut self) {
        let zombies: Vec<PathBuf> = self
            .drop_folders
            .iter()
            .filter(|folder| !folder.is_dir())
            .cloned()
            .collect();
        for zombie in zombies {
            self.drop_folders.remove(&zombie);
            tracing::warn!("Removing orphaned drop folder: '{}'", zombie.display());
        }
    }
}

fn build_request(drop_folder: &Path, entry: &Path) -> Result<RegistrationRequest> {
    let metadata = std::fs::metadata(entry)
        .with_context(|| format!("Cannot stat '{}'", entry.display()))?;
    let last_modified = metadata
        .modified()
        .with_context(|| format!("No modification time for '{}'", entry.display()))?;
    let user_path = drop_folder
        .parent()
        .with_context(|| format!("Drop folder has no parent: '{}'", drop_folder.display()))?
        .to_path_buf();
    Ok(RegistrationRequest {
        detected_at: Utc::now(),
        last_modified,
        user_path,
        origin_path: drop_folder.to_path_buf(),
        target_path: entry.to_path_buf(),
    })
}
