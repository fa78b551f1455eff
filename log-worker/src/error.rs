use std::time;

use log_common::{queue::QueueError, redact::UnknownRuleError, store::StoreError};
use metrics_exporter_prometheus::BuildError;
use thiserror::Error;
use tokio::sync::AcquireError;

/// Enumeration of reasons a single message could not be processed.
/// Every variant resolves the delivery negatively; none of them stop the worker.
#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("message body is not a valid record: {0}")]
    Deserialize(#[from] serde_json::Error),
    #[error("message record has an empty {0}")]
    EmptyKey(&'static str),
    #[error("injected fault while processing record {record_id}")]
    InjectedFault { record_id: String },
    #[error("processing was cancelled by shutdown")]
    Cancelled,
    #[error("processing did not finish within {0:?}")]
    DeadlineExceeded(time::Duration),
    #[error("failed to persist entry: {0}")]
    Store(#[from] StoreError),
}

impl ProcessingError {
    /// Whether redelivering the message can never succeed.
    pub fn is_poison(&self) -> bool {
        matches!(
            self,
            ProcessingError::Deserialize(_) | ProcessingError::EmptyKey(_)
        )
    }
}

/// Enumeration of errors related to initialization and running of the worker loop.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("a queue error occurred: {0}")]
    Queue(#[from] QueueError),
    #[error("a store error occurred: {0}")]
    Store(#[from] StoreError),
    #[error("invalid redaction configuration: {0}")]
    Redaction(#[from] UnknownRuleError),
    #[error("failed to install metrics recorder: {0}")]
    Metrics(#[from] BuildError),
    #[error("the job concurrency limiter was closed")]
    LimiterClosed(#[from] AcquireError),
}
