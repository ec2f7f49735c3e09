//! Pipeline stages and the shared coordination structures.

mod evaluation;
mod metrics;
mod processing;
mod queue;
mod registration;
mod scanner;
mod tasks;

#[cfg(test)]
mod engine_integration_tests;

pub use evaluation::{EvaluationWorker, RoundRobin, MARKER_FILE_PREFIX};
pub use metrics::{Metrics, MetricsReporter, MetricsSnapshot};
pub use processing::{ProcessingWorker, DATASET_DIRECTORY_SUFFIX};
pub use queue::RegistrationQueue;
pub use registration::{parse_metadata, MetadataRow, RegistrationWorker, ValidationError};
pub use scanner::{RegistrationRequest, Scanner};
pub use tasks::{ActiveTasks, INTERVENTION_DIRECTORY};
