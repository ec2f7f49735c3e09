//! End-to-end tests for the pipeline engine over a temporary directory tree.
//!
//! Scenarios cover:
//! 1. File payloads wrapped into `_dataset` directories and delivered
//! 2. Directory payloads delivered with their tree preserved
//! 3. Missing measurement ids routed back to the submitting user
//! 4. Unparseable metadata rejected to the submitting user
//! 5. Scanner deduplication across many poll ticks
//! 6. Round-robin fan-out across downstream inboxes

use crate::config::{
    Config, EvaluationConfig, MetricsConfig, ProcessingConfig, RegistrationConfig, ScannerConfig,
    UsersConfig,
};
use crate::fsops;
use crate::pipeline::{
    EvaluationWorker, Metrics, ProcessingWorker, RegistrationQueue, RegistrationRequest,
    RegistrationWorker, RoundRobin, Scanner, ActiveTasks, INTERVENTION_DIRECTORY,
    MARKER_FILE_PREFIX,
};
use crate::provenance::{Provenance, PROVENANCE_FILE_NAME};
use crate::run_pipeline;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;

const VALID_MEASUREMENT_ID: &str = "NGSQABCD001AA";

fn pipeline_config(root: &Path) -> Config {
    let config = Config {
        users: UsersConfig::default(),
        scanner: ScannerConfig {
            directory: root.join("users"),
            interval_ms: 25,
            queue_capacity: 16,
        },
        registration: RegistrationConfig {
            threads: 2,
            working_dir: root.join("stages/registration"),
            target_dir: root.join("stages/processing"),
            metadata_file_suffix: "metadata.tsv".to_string(),
        },
        processing: ProcessingConfig {
            threads: 2,
            working_dir: root.join("stages/processing"),
            target_dir: root.join("stages/evaluation"),
        },
        evaluation: EvaluationConfig {
            threads: 2,
            working_dir: root.join("stages/evaluation"),
            target_dirs: vec![root.join("etl/inbox-a"), root.join("etl/inbox-b")],
            measurement_id_pattern: r"^(MS|NGS)Q[A-Z0-9]{4}[0-9]{3}[A-Z][A-Z0-9]$".to_string(),
        },
        metrics: MetricsConfig {
            enabled: false,
            interval_secs: 60,
            output_path: None,
        },
    };
    std::fs::create_dir_all(root.join("users/u1/registration")).unwrap();
    for inbox in &config.evaluation.target_dirs {
        std::fs::create_dir_all(inbox).unwrap();
    }
    config
}

fn drop_folder(config: &Config) -> PathBuf {
    config.scanner.directory.join("u1/registration")
}

fn user_error_dir(config: &Config) -> PathBuf {
    config
        .scanner
        .directory
        .join("u1")
        .join(&config.users.error_directory_name)
}

fn request_for(config: &Config, entry: &Path) -> RegistrationRequest {
    let modified = std::fs::metadata(entry).unwrap().modified().unwrap();
    RegistrationRequest {
        detected_at: Utc::now(),
        last_modified: modified,
        user_path: config.scanner.directory.join("u1"),
        origin_path: drop_folder(config),
        target_path: entry.to_path_buf(),
    }
}

/// List the task directories of a stage, ignoring `interventions/`.
fn stage_tasks(working_dir: &Path) -> Vec<PathBuf> {
    let mut tasks: Vec<PathBuf> = std::fs::read_dir(working_dir)
        .unwrap()
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_dir()
                && path
                    .file_name()
                    .map(|name| name != INTERVENTION_DIRECTORY)
                    .unwrap_or(false)
        })
        .collect();
    tasks.sort();
    tasks
}

async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..250 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("Timed out waiting for: {}", what);
}

/// Drive a registration worker over the given entries, then return the
/// tasks committed to the processing stage.
async fn register(config: &Config, entries: &[PathBuf]) -> Vec<PathBuf> {
    let queue = RegistrationQueue::bounded(16);
    for entry in entries {
        queue.enqueue(request_for(config, entry)).await.unwrap();
    }
    queue.close();

    let worker = RegistrationWorker::new(
        &config.registration,
        &config.users,
        queue,
        Metrics::new(),
    )
    .unwrap();
    worker.run().await;

    stage_tasks(&config.processing.working_dir)
}

/// Set the measurement id on a registered task, emulating the upstream
/// curation step that supplies it before evaluation.
fn supply_measurement_id(task_dir: &Path, id: &str) {
    let path = task_dir.join(PROVENANCE_FILE_NAME);
    let mut provenance = Provenance::load(&path).unwrap();
    provenance.measurement_id = Some(id.to_string());
    provenance.store(&path).unwrap();
}

/// Run the processing and evaluation stages until `done` holds.
async fn run_polling_stages<F: Fn() -> bool>(config: &Config, done: F) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let active = ActiveTasks::new();
    let metrics = Metrics::new();
    let inboxes = Arc::new(RoundRobin::new(config.evaluation.target_dirs.clone()).unwrap());

    let mut handles = Vec::new();
    for _ in 0..config.processing.threads {
        let worker = ProcessingWorker::new(&config.processing, active.clone(), metrics.clone())
            .unwrap();
        handles.push(tokio::spawn(worker.run(shutdown_rx.clone())));
    }
    for _ in 0..config.evaluation.threads {
        let worker = EvaluationWorker::new(
            &config.evaluation,
            &config.users,
            inboxes.clone(),
            active.clone(),
            metrics.clone(),
        )
        .unwrap();
        handles.push(tokio::spawn(worker.run(shutdown_rx.clone())));
    }

    wait_until("polling stages to finish", done).await;

    shutdown_tx.send(true).unwrap();
    for handle in handles {
        handle.await.unwrap();
    }
}

fn delivered_tasks(inbox: &Path) -> Vec<PathBuf> {
    let mut tasks: Vec<PathBuf> = std::fs::read_dir(inbox)
        .unwrap()
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    tasks.sort();
    tasks
}

#[tokio::test(flavor = "multi_thread")]
async fn test_file_payload_delivered_end_to_end() {
    let temp = TempDir::new().unwrap();
    let config = pipeline_config(temp.path());
    let dataset = drop_folder(&config).join("reads.fastq");
    std::fs::write(&dataset, "ACGT").unwrap();

    let registered = register(&config, &[dataset.clone()]).await;
    assert_eq!(registered.len(), 1);
    assert!(!dataset.exists());
    supply_measurement_id(&registered[0], VALID_MEASUREMENT_ID);

    let inboxes = config.evaluation.target_dirs.clone();
    run_polling_stages(&config, || {
        inboxes.iter().any(|inbox| !delivered_tasks(inbox).is_empty())
    })
    .await;

    let (inbox, delivered) = inboxes
        .iter()
        .find_map(|inbox| delivered_tasks(inbox).pop().map(|task| (inbox.clone(), task)))
        .unwrap();
    let task_name = delivered.file_name().unwrap().to_string_lossy().into_owned();

    // Payload wrapped into a dataset directory
    assert_eq!(
        std::fs::read_to_string(delivered.join("reads.fastq_dataset/reads.fastq")).unwrap(),
        "ACGT"
    );

    // Provenance records origin, owner and all three stage stops
    let provenance = Provenance::load(&delivered.join(PROVENANCE_FILE_NAME)).unwrap();
    assert_eq!(provenance.origin, drop_folder(&config).display().to_string());
    assert_eq!(
        provenance.user,
        config.scanner.directory.join("u1").display().to_string()
    );
    assert_eq!(provenance.task_id, task_name);
    assert_eq!(provenance.history.len(), 3);
    assert_eq!(
        provenance.history[1],
        config.processing.working_dir.display().to_string()
    );
    assert_eq!(
        provenance.history[2],
        config.evaluation.working_dir.display().to_string()
    );

    // Marker sits next to the copied task, and the source is gone
    assert!(inbox
        .join(format!("{}{}", MARKER_FILE_PREFIX, task_name))
        .is_file());
    assert!(stage_tasks(&config.evaluation.working_dir).is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_directory_payload_preserves_tree() {
    let temp = TempDir::new().unwrap();
    let config = pipeline_config(temp.path());
    let dataset = drop_folder(&config).join("run42");
    std::fs::create_dir_all(dataset.join("lane1")).unwrap();
    std::fs::write(dataset.join("lane1/reads.fastq"), "ACGT").unwrap();
    std::fs::write(
        dataset.join("run42.metadata.tsv"),
        "lane1/reads.fastq\tsha256:abc\n",
    )
    .unwrap();

    let registered = register(&config, &[dataset.clone()]).await;
    assert_eq!(registered.len(), 1);
    supply_measurement_id(&registered[0], VALID_MEASUREMENT_ID);

    let inboxes = config.evaluation.target_dirs.clone();
    run_polling_stages(&config, || {
        inboxes.iter().any(|inbox| !delivered_tasks(inbox).is_empty())
    })
    .await;

    let delivered = inboxes
        .iter()
        .find_map(|inbox| delivered_tasks(inbox).pop())
        .unwrap();

    // The payload keeps its name and tree, with no `_dataset` wrapping
    assert_eq!(
        std::fs::read_to_string(delivered.join("run42/lane1/reads.fastq")).unwrap(),
        "ACGT"
    );
    assert!(delivered.join("run42/run42.metadata.tsv").is_file());
    assert!(!delivered.join("run42_dataset").exists());

    let provenance = Provenance::load(&delivered.join(PROVENANCE_FILE_NAME)).unwrap();
    assert_eq!(provenance.dataset_files, vec!["lane1/reads.fastq".to_string()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_measurement_id_routed_to_user() {
    let temp = TempDir::new().unwrap();
    let config = pipeline_config(temp.path());
    std::fs::write(drop_folder(&config).join("reads.fastq"), "ACGT").unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(run_pipeline(config.clone(), shutdown_rx));

    let error_dir = user_error_dir(&config);
    wait_until("task to arrive in the user error directory", || {
        error_dir.is_dir() && std::fs::read_dir(&error_dir).unwrap().next().is_some()
    })
    .await;

    shutdown_tx.send(true).unwrap();
    let snapshot = handle.await.unwrap().unwrap();

    let parked = stage_tasks(&error_dir).pop().unwrap();
    let report = std::fs::read_to_string(parked.join(fsops::ERROR_FILE_NAME)).unwrap();
    assert!(report.contains("Missing QBiC measurement ID"));
    assert!(parked.join("reads.fastq_dataset/reads.fastq").is_file());

    // Nothing reached an inbox
    for inbox in &config.evaluation.target_dirs {
        assert!(delivered_tasks(inbox).is_empty());
    }
    assert_eq!(snapshot.requests_enqueued, 1);
    assert_eq!(snapshot.tasks_registered, 1);
    assert_eq!(snapshot.tasks_parked_user, 1);
    assert_eq!(snapshot.tasks_delivered, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unparseable_metadata_rejected_to_user() {
    let temp = TempDir::new().unwrap();
    let config = pipeline_config(temp.path());
    let dataset = drop_folder(&config).join("run42");
    std::fs::create_dir_all(&dataset).unwrap();
    std::fs::write(dataset.join("reads.fastq"), "ACGT").unwrap();
    // A record without a tab separator
    std::fs::write(dataset.join("run42.metadata.tsv"), "reads.fastq raw\n").unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(run_pipeline(config.clone(), shutdown_rx));

    let error_dir = user_error_dir(&config);
    wait_until("rejected dataset to arrive in the user error directory", || {
        error_dir.is_dir() && std::fs::read_dir(&error_dir).unwrap().next().is_some()
    })
    .await;

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    let parked = stage_tasks(&error_dir).pop().unwrap();
    let report = std::fs::read_to_string(parked.join(fsops::ERROR_FILE_NAME)).unwrap();
    assert!(report.contains("Incomplete metadata"));
    // The dataset travelled with the rejection
    assert!(parked.join("run42/reads.fastq").is_file());
    assert!(stage_tasks(&config.processing.working_dir).is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_scanner_enqueues_once_across_many_ticks() {
    let temp = TempDir::new().unwrap();
    let config = pipeline_config(temp.path());
    std::fs::write(drop_folder(&config).join("reads.fastq"), "ACGT").unwrap();

    let queue = RegistrationQueue::bounded(16);
    let metrics = Metrics::new();
    let scanner = Scanner::new(
        &config.scanner,
        &config.users,
        queue.clone(),
        metrics.clone(),
    )
    .unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(scanner.run(shutdown_rx));

    // Let well over ten scan intervals elapse with an unchanged entry
    tokio::time::sleep(Duration::from_millis(400)).await;
    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();

    assert_eq!(metrics.snapshot().requests_enqueued, 1);
    assert_eq!(queue.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_round_robin_fan_out_end_to_end() {
    let temp = TempDir::new().unwrap();
    let config = pipeline_config(temp.path());
    let datasets: Vec<PathBuf> = (0..4)
        .map(|i| {
            let dataset = drop_folder(&config).join(format!("sample-{}.fastq", i));
            std::fs::write(&dataset, "ACGT").unwrap();
            dataset
        })
        .collect();

    let registered = register(&config, &datasets).await;
    assert_eq!(registered.len(), 4);
    for task_dir in &registered {
        supply_measurement_id(task_dir, VALID_MEASUREMENT_ID);
    }

    let inboxes = config.evaluation.target_dirs.clone();
    run_polling_stages(&config, || {
        inboxes
            .iter()
            .map(|inbox| delivered_tasks(inbox).len())
            .sum::<usize>()
            == 4
    })
    .await;

    assert_eq!(delivered_tasks(&inboxes[0]).len(), 2);
    assert_eq!(delivered_tasks(&inboxes[1]).len(), 2);

    // Every delivery carries its marker
    for inbox in &inboxes {
        for task in delivered_tasks(inbox) {
            let name = task.file_name().unwrap().to_string_lossy().into_owned();
            assert!(inbox.join(format!("{}{}", MARKER_FILE_PREFIX, name)).is_file());
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pipeline_shuts_down_cleanly_when_idle() {
    let temp = TempDir::new().unwrap();
    let config = pipeline_config(temp.path());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(run_pipeline(config, shutdown_rx));

    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown_tx.send(true).unwrap();
    let snapshot = handle.await.unwrap().unwrap();

    assert_eq!(snapshot.requests_enqueued, 0);
    assert_eq!(snapshot.failures, 0);
}
