//! # Queue
//!
//! The contract between the ingestion API and the worker: a durable, at-least-once queue with
//! visibility timeouts and a dead-letter destination.
//!
//! Every call to `receive` counts as one delivery attempt and hides the message for the
//! visibility timeout. The consumer resolves a delivery with `ack` (done, delete it), `fail`
//! (deliver it again later) or `dead_letter` (give up now). A delivery that is never resolved
//! becomes visible again once its timeout elapses. Once a message has used `max_attempts`
//! deliveries, a failure moves it to the dead-letter destination instead.
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

use crate::record::CanonicalRecord;
use crate::retry::RetryPolicy;

/// Enumeration of errors for queue operations.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("failed to serialize record: {0}")]
    SerializeError(#[from] serde_json::Error),
    #[error("delivery {0} is no longer in flight")]
    StaleHandle(DeliveryHandle),
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("queue is unavailable: {0}")]
    Unavailable(String),
}

pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// Identifies one delivery of one message.
/// Every delivery of a message gets a fresh receipt, so a handle from an earlier delivery can no
/// longer resolve the message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryHandle {
    pub message_id: i64,
    pub receipt: Uuid,
    pub attempt: u32,
}

impl fmt::Display for DeliveryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} (attempt {})",
            self.message_id, self.receipt, self.attempt
        )
    }
}

/// A message handed to a consumer. The body is opaque to the queue.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub handle: DeliveryHandle,
    pub body: String,
}

impl Delivery {
    pub fn attempt(&self) -> u32 {
        self.handle.attempt
    }
}

/// A message that reached the dead-letter destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub message_id: i64,
    pub attempts: u32,
    pub body: String,
}

/// Redelivery settings shared by all queue backends.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Deliveries a message may use before a failure dead-letters it.
    pub max_attempts: u32,
    /// How long a received message stays hidden waiting for a resolution.
    pub visibility_timeout: time::Duration,
    /// How long a failed message stays hidden before its next delivery.
    pub retry_policy: RetryPolicy,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            visibility_timeout: time::Duration::from_secs(30),
            retry_policy: RetryPolicy::default(),
        }
    }
}

#[async_trait]
pub trait Queue: Send + Sync {
    /// Enqueue a raw message body.
    async fn enqueue(&self, body: String) -> QueueResult<()>;

    /// Serialize a record and enqueue it.
    async fn publish(&self, record: &CanonicalRecord) -> QueueResult<()> {
        let body = serde_json::to_string(record)?;
        self.enqueue(body).await
    }

    /// Receive up to `max` visible messages, starting a new delivery attempt for each.
    async fn receive(&self, max: usize) -> QueueResult<Vec<Delivery>>;

    /// Resolve a delivery as successful, removing the message for good.
    async fn ack(&self, handle: &DeliveryHandle) -> QueueResult<()>;

    /// Resolve a delivery as failed, scheduling a redelivery or dead-lettering the message.
    async fn fail(&self, handle: &DeliveryHandle) -> QueueResult<()>;

    /// Move a message straight to the dead-letter destination, regardless of attempts left.
    async fn dead_letter(&self, handle: &DeliveryHandle) -> QueueResult<()>;

    /// List the messages currently in the dead-letter destination.
    async fn dead_letters(&self) -> QueueResult<Vec<DeadLetter>>;
}

struct StoredMessage {
    id: i64,
    attempt: u32,
    body: String,
}

struct InFlight {
    receipt: Uuid,
    visible_at: Instant,
    message: StoredMessage,
}

struct Pending {
    visible_at: Instant,
    message: StoredMessage,
}

#[derive(Default)]
struct MemoryQueueState {
    next_id: i64,
    pending: Vec<Pending>,
    in_flight: HashMap<i64, InFlight>,
    dead: Vec<DeadLetter>,
}

/// A `Queue` kept in process memory.
///
/// Nothing survives a restart, so this is meant for tests and local runs. Timeouts use tokio's
/// clock and follow it when it is paused.
pub struct MemoryQueue {
    settings: QueueSettings,
    state: Mutex<MemoryQueueState>,
}

impl MemoryQueue {
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(MemoryQueueState::default()),
        }
    }

    /// Number of messages waiting for delivery or currently in flight.
    pub fn len(&self) -> usize {
        let state = self.lock();
        state.pending.len() + state.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryQueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return messages whose visibility timeout elapsed to the pending list, or to the dead
    /// letters when they have no attempts left.
    fn reclaim_expired(&self, state: &mut MemoryQueueState, now: Instant) {
        let expired: Vec<i64> = state
            .in_flight
            .iter()
            .filter(|(_, in_flight)| in_flight.visible_at <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            if let Some(in_flight) = state.in_flight.remove(&id) {
                self.requeue_or_bury(state, in_flight.message, now);
            }
        }
    }

    fn requeue_or_bury(
        &self,
        state: &mut MemoryQueueState,
        message: StoredMessage,
        visible_at: Instant,
    ) {
        if message.attempt >= self.settings.max_attempts {
            state.dead.push(DeadLetter {
                message_id: message.id,
                attempts: message.attempt,
                body: message.body,
            });
        } else {
            state.pending.push(Pending { visible_at, message });
        }
    }

    fn take_in_flight(
        state: &mut MemoryQueueState,
        handle: &DeliveryHandle,
    ) -> QueueResult<InFlight> {
        let current = state
            .in_flight
            .get(&handle.message_id)
            .is_some_and(|in_flight| in_flight.receipt == handle.receipt);
        if !current {
            return Err(QueueError::StaleHandle(handle.clone()));
        }

        state
            .in_flight
            .remove(&handle.message_id)
            .ok_or_else(|| QueueError::StaleHandle(handle.clone()))
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(QueueSettings::default())
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn enqueue(&self, body: String) -> QueueResult<()> {
        let mut state = self.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.pending.push(Pending {
            visible_at: Instant::now(),
            message: StoredMessage {
                id,
                attempt: 0,
                body,
            },
        });

        Ok(())
    }

    async fn receive(&self, max: usize) -> QueueResult<Vec<Delivery>> {
        let now = Instant::now();
        let mut state = self.lock();
        self.reclaim_expired(&mut state, now);

        let mut deliveries = Vec::new();
        let mut index = 0;
        while index < state.pending.len() && deliveries.len() < max {
            if state.pending[index].visible_at > now {
                index += 1;
                continue;
            }

            let Pending { mut message, .. } = state.pending.remove(index);
            message.attempt += 1;
            let handle = DeliveryHandle {
                message_id: message.id,
                receipt: Uuid::new_v4(),
                attempt: message.attempt,
            };
            deliveries.push(Delivery {
                handle: handle.clone(),
                body: message.body.clone(),
            });
            state.in_flight.insert(
                message.id,
                InFlight {
                    receipt: handle.receipt,
                    visible_at: later(now, self.settings.visibility_timeout),
                    message,
                },
            );
        }

        Ok(deliveries)
    }

    async fn ack(&self, handle: &DeliveryHandle) -> QueueResult<()> {
        let mut state = self.lock();
        Self::take_in_flight(&mut state, handle)?;

        Ok(())
    }

    async fn fail(&self, handle: &DeliveryHandle) -> QueueResult<()> {
        let now = Instant::now();
        let mut state = self.lock();
        let in_flight = Self::take_in_flight(&mut state, handle)?;
        let retry_interval = self
            .settings
            .retry_policy
            .retry_interval(in_flight.message.attempt);
        self.requeue_or_bury(&mut state, in_flight.message, later(now, retry_interval));

        Ok(())
    }

    async fn dead_letter(&self, handle: &DeliveryHandle) -> QueueResult<()> {
        let mut state = self.lock();
        let InFlight { message, .. } = Self::take_in_flight(&mut state, handle)?;
        state.dead.push(DeadLetter {
            message_id: message.id,
            attempts: message.attempt,
            body: message.body,
        });

        Ok(())
    }

    async fn dead_letters(&self) -> QueueResult<Vec<DeadLetter>> {
        Ok(self.lock().dead.clone())
    }
}

/// `now + delay`, saturating at a point far enough away to mean "never".
fn later(now: Instant, delay: time::Duration) -> Instant {
    now.checked_add(delay)
        .unwrap_or_else(|| now + time::Duration::from_secs(60 * 60 * 24 * 365))
}
