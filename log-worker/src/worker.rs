use std::sync::Arc;
use std::time;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use log_common::health::HealthHandle;
use log_common::queue::{Delivery, Queue};
use log_common::record::{CanonicalRecord, PersistedLogEntry};
use log_common::redact::Redactor;
use log_common::store::{InsertOutcome, LogStore};

use crate::error::{ProcessingError, WorkerError};
use crate::fault::FaultInjector;

/// How a delivery was resolved against the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Written to the store and acknowledged.
    Persisted,
    /// Already in the store, acknowledged without writing.
    Duplicate,
    /// Handed back to the queue for redelivery, or dead-lettered by the queue if out of attempts.
    Failed,
    /// Moved straight to the dead-letter destination.
    DeadLettered,
}

/// Turns a queued message into a persisted, redacted log entry.
pub struct MessageProcessor {
    store: Arc<dyn LogStore>,
    redactor: Redactor,
    faults: FaultInjector,
    /// Simulated work per character of raw text.
    delay_per_char: time::Duration,
    /// Deadline for processing one message.
    processing_timeout: time::Duration,
    /// Dead-letter undecodable bodies right away instead of retrying them.
    dead_letter_malformed: bool,
    shutdown: CancellationToken,
}

impl MessageProcessor {
    pub fn new(store: Arc<dyn LogStore>, redactor: Redactor, shutdown: CancellationToken) -> Self {
        Self {
            store,
            redactor,
            faults: FaultInjector::disabled(),
            delay_per_char: time::Duration::ZERO,
            processing_timeout: time::Duration::from_secs(25),
            dead_letter_malformed: false,
            shutdown,
        }
    }

    pub fn with_faults(mut self, faults: FaultInjector) -> Self {
        self.faults = faults;
        self
    }

    pub fn with_delay_per_char(mut self, delay: time::Duration) -> Self {
        self.delay_per_char = delay;
        self
    }

    pub fn with_processing_timeout(mut self, timeout: time::Duration) -> Self {
        self.processing_timeout = timeout;
        self
    }

    pub fn with_dead_letter_malformed(mut self, enabled: bool) -> Self {
        self.dead_letter_malformed = enabled;
        self
    }

    /// Process one message body, writing its entry to the store unless it is already there.
    pub async fn process(&self, body: &str) -> Result<InsertOutcome, ProcessingError> {
        let record: CanonicalRecord = serde_json::from_str(body)?;
        if record.tenant_id.is_empty() {
            return Err(ProcessingError::EmptyKey("tenant_id"));
        }
        if record.record_id.is_empty() {
            return Err(ProcessingError::EmptyKey("record_id"));
        }

        match tokio::time::timeout(self.processing_timeout, self.process_record(record)).await {
            Ok(result) => result,
            Err(_) => Err(ProcessingError::DeadlineExceeded(self.processing_timeout)),
        }
    }

    async fn process_record(
        &self,
        record: CanonicalRecord,
    ) -> Result<InsertOutcome, ProcessingError> {
        if self.faults.should_fail() {
            return Err(ProcessingError::InjectedFault {
                record_id: record.record_id,
            });
        }

        self.simulate_work(&record.raw_text).await?;

        let sanitized_text = self.redactor.redact(&record.raw_text);
        let entry = PersistedLogEntry::new(record, sanitized_text, Utc::now());

        let outcome = self.store.insert_if_absent(&entry).await?;
        match outcome {
            InsertOutcome::Inserted => debug!(
                tenant_id = %entry.tenant_id,
                record_id = %entry.record_id,
                "persisted entry"
            ),
            InsertOutcome::AlreadyExists => warn!(
                tenant_id = %entry.tenant_id,
                record_id = %entry.record_id,
                "entry already persisted, skipping duplicate delivery"
            ),
        }

        Ok(outcome)
    }

    /// Wait in proportion to the length of `text`, giving up as soon as shutdown starts.
    async fn simulate_work(&self, text: &str) -> Result<(), ProcessingError> {
        let chars = u32::try_from(text.chars().count()).unwrap_or(u32::MAX);
        let delay = self.delay_per_char.saturating_mul(chars);
        if delay.is_zero() {
            return Ok(());
        }

        tokio::select! {
            _ = self.shutdown.cancelled() => Err(ProcessingError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Process a delivery and resolve it against `queue`.
    /// Errors never escape: a failed resolution is logged and left to the visibility timeout.
    pub async fn handle_delivery(
        &self,
        queue: &dyn Queue,
        delivery: Delivery,
    ) -> DeliveryOutcome {
        metrics::counter!("log_worker_messages_total").increment(1);

        let now = tokio::time::Instant::now();
        let result = self.process(&delivery.body).await;
        metrics::histogram!("log_worker_processing_seconds").record(now.elapsed().as_secs_f64());

        let handle = delivery.handle;
        let (outcome, resolution) = match result {
            Ok(InsertOutcome::Inserted) => {
                metrics::counter!("log_worker_messages_persisted").increment(1);
                (DeliveryOutcome::Persisted, queue.ack(&handle).await)
            }
            Ok(InsertOutcome::AlreadyExists) => {
                metrics::counter!("log_worker_messages_duplicate").increment(1);
                (DeliveryOutcome::Duplicate, queue.ack(&handle).await)
            }
            Err(error) if error.is_poison() && self.dead_letter_malformed => {
                error!("dead-lettering message {}: {}", handle, error);
                metrics::counter!("log_worker_messages_dead_lettered").increment(1);
                (DeliveryOutcome::DeadLettered, queue.dead_letter(&handle).await)
            }
            Err(error) => {
                warn!(
                    "failed to process message {} on attempt {}: {}",
                    handle, handle.attempt, error
                );
                metrics::counter!("log_worker_messages_failed").increment(1);
                (DeliveryOutcome::Failed, queue.fail(&handle).await)
            }
        };

        if let Err(error) = resolution {
            error!("failed to resolve message {} as {:?}: {}", handle, outcome, error);
            metrics::counter!("log_worker_resolution_errors").increment(1);
        }

        outcome
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// The interval for polling the queue.
    pub poll_interval: time::Duration,
    /// Maximum number of messages received per poll.
    pub batch_size: usize,
    /// Maximum number of messages being processed at once.
    pub max_concurrent_jobs: usize,
}

impl WorkerSettings {
    /// How long the poll loop may go without reporting before it counts as stalled.
    /// Never shorter than a minute, and always several poll intervals.
    pub fn liveness_deadline(&self) -> time::Duration {
        std::cmp::max(
            time::Duration::from_secs(60),
            self.poll_interval.saturating_mul(4),
        )
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_interval: time::Duration::from_millis(100),
            batch_size: 10,
            max_concurrent_jobs: 64,
        }
    }
}

/// A worker to poll a `Queue` and spawn tasks to process messages as they become available.
pub struct LogWorker {
    /// An identifier for this worker, used in logs.
    name: String,
    queue: Arc<dyn Queue>,
    processor: Arc<MessageProcessor>,
    settings: WorkerSettings,
    /// The liveness check handle, to call on a schedule to report healthy
    liveness: HealthHandle,
    /// Stops polling once cancelled. Shared with the processor so in-flight work stops too.
    shutdown: CancellationToken,
}

impl LogWorker {
    pub fn new(
        name: &str,
        queue: Arc<dyn Queue>,
        processor: MessageProcessor,
        settings: WorkerSettings,
        liveness: HealthHandle,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            name: name.to_owned(),
            queue,
            processor: Arc::new(processor),
            settings,
            liveness,
            shutdown,
        }
    }

    /// Run this worker until the shutdown token is cancelled, then wait for in-flight messages.
    pub async fn run(&self) -> Result<(), WorkerError> {
        let max_concurrent_jobs = self.settings.max_concurrent_jobs.max(1);
        let semaphore = Arc::new(Semaphore::new(max_concurrent_jobs));
        let report_semaphore_utilization = || {
            metrics::gauge!("log_worker_saturation_percent")
                .set(1f64 - semaphore.available_permits() as f64 / max_concurrent_jobs as f64);
        };

        let mut interval = tokio::time::interval(self.settings.poll_interval);
        info!("worker {} started polling", self.name);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            self.liveness.report_healthy();
            report_semaphore_utilization();

            // Only take what can start right away, the rest stays visible to other workers.
            let capacity = self.settings.batch_size.min(semaphore.available_permits());
            if capacity == 0 {
                continue;
            }

            let deliveries = match self.queue.receive(capacity).await {
                Ok(deliveries) => deliveries,
                Err(error) => {
                    error!("failed to receive messages: {}", error);
                    metrics::counter!("log_worker_receive_errors").increment(1);
                    continue;
                }
            };

            for delivery in deliveries {
                let permit = semaphore.clone().acquire_owned().await?;
                let queue = self.queue.clone();
                let processor = self.processor.clone();

                tokio::spawn(async move {
                    processor.handle_delivery(queue.as_ref(), delivery).await;
                    drop(permit);
                });
            }
        }

        info!("worker {} stopped polling, draining in-flight messages", self.name);
        let permits = u32::try_from(max_concurrent_jobs).unwrap_or(u32::MAX);
        let _drained = semaphore.acquire_many(permits).await?;
        info!("worker {} drained", self.name);

        Ok(())
    }
}
