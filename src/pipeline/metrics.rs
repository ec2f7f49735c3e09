//! Pipeline counters and periodic reporting.

use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::interval;

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Counters for the pipeline.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Registration requests enqueued by the scanner
    pub requests_enqueued: AtomicU64,

    /// Tasks committed to the processing stage
    pub tasks_registered: AtomicU64,

    /// Tasks normalised and committed to the evaluation stage
    pub tasks_normalised: AtomicU64,

    /// Tasks copied to a downstream inbox
    pub tasks_delivered: AtomicU64,

    /// Tasks parked in a user error directory
    pub tasks_parked_user: AtomicU64,

    /// Tasks parked in a stage intervention directory
    pub tasks_parked_intervention: AtomicU64,

    /// Failed operations
    pub failures: AtomicU64,

    /// Start time
    start_time: Option<Instant>,
}

impl Metrics {
    /// Create new metrics.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    /// Record an enqueued registration request.
    pub fn add_request_enqueued(&self) {
        self.requests_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a registered task.
    pub fn add_task_registered(&self) {
        self.tasks_registered.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a normalised task.
    pub fn add_task_normalised(&self) {
        self.tasks_normalised.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a delivered task.
    pub fn add_task_delivered(&self) {
        self.tasks_delivered.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a task parked in a user error directory.
    pub fn add_task_parked_user(&self) {
        self.tasks_parked_user.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a task parked in a stage intervention directory.
    pub fn add_task_parked_intervention(&self) {
        self.tasks_parked_intervention.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failure.
    pub fn add_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Get delivered tasks per second.
    pub fn tasks_per_second(&self) -> f64 {
        let tasks = self.tasks_delivered.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            tasks as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_enqueued: self.requests_enqueued.load(Ordering::Relaxed),
            tasks_registered: self.tasks_registered.load(Ordering::Relaxed),
            tasks_normalised: self.tasks_normalised.load(Ordering::Relaxed),
            tasks_delivered: self.tasks_delivered.load(Ordering::Relaxed),
            tasks_parked_user: self.tasks_parked_user.load(Ordering::Relaxed),
            tasks_parked_intervention: self.tasks_parked_intervention.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            tasks_per_second: self.tasks_per_second(),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub requests_enqueued: u64,
    pub tasks_registered: u64,
    pub tasks_normalised: u64,
    pub tasks_delivered: u64,
    pub tasks_parked_user: u64,
    pub tasks_parked_intervention: u64,
    pub failures: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub tasks_per_second: f64,
}

impl MetricsSnapshot {
    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path);
        Ok(())
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Enqueued: {} | Registered: {} | Normalised: {} | Delivered: {} | \
             Parked: {} user, {} intervention | Failures: {} | \
             Rate: {:.2} tasks/s | Elapsed: {:.1}s",
            self.requests_enqueued,
            self.tasks_registered,
            self.tasks_normalised,
            self.tasks_delivered,
            self.tasks_parked_user,
            self.tasks_parked_intervention,
            self.failures,
            self.tasks_per_second,
            self.elapsed.as_secs_f64(),
        )
    }
}

/// Periodic metrics reporter.
pub struct MetricsReporter {
    metrics: Arc<Metrics>,
    interval_secs: u64,
}

impl MetricsReporter {
    /// Create a new metrics reporter.
    pub fn new(metrics: Arc<Metrics>, interval_secs: u64) -> Self {
        Self {
            metrics,
            interval_secs,
        }
    }

    /// Report until the shutdown signal flips, then emit a final snapshot.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    tracing::info!("{}", self.metrics.snapshot());
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("Final: {}", self.metrics.snapshot());
                        break;
                    }
                }
            }
        }
    }
}
