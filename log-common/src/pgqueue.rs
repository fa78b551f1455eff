//! # PgQueue
//!
//! A `Queue` implemented on top of a PostgreSQL table.
//!
//! Messages move through the `log_message_status` states: `available` messages wait for a
//! consumer, `running` messages are in flight until `visible_at`, `completed` messages were
//! acknowledged, and `failed` messages sit in the dead-letter destination.
use std::time;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use uuid::Uuid;

use crate::queue::{
    DeadLetter, Delivery, DeliveryHandle, Queue, QueueError, QueueResult, QueueSettings,
};

/// A queue implemented on top of a PostgreSQL table.
#[derive(Clone)]
pub struct PgQueue {
    /// A name to identify this PgQueue. Several queues may share one table.
    name: String,
    /// A connection pool used to connect to the PostgreSQL database.
    pool: PgPool,
    settings: QueueSettings,
}

impl PgQueue {
    /// Initialize a new PgQueue backed by table in PostgreSQL by intializing a connection pool to the database in `url`.
    ///
    /// # Arguments
    ///
    /// * `queue_name`: A name for the queue we are going to initialize.
    /// * `url`: A URL pointing to where the PostgreSQL database is hosted.
    /// * `max_connections`: The maximum size of the connection pool.
    /// * `settings`: Redelivery settings for messages in this queue.
    pub async fn new(
        queue_name: &str,
        url: &str,
        max_connections: u32,
        settings: QueueSettings,
    ) -> QueueResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|error| QueueError::ConnectionError { error })?;

        Ok(Self::new_from_pool(queue_name, pool, settings))
    }

    /// Initialize a new PgQueue backed by table in PostgreSQL from a provided connection pool.
    pub fn new_from_pool(queue_name: &str, pool: PgPool, settings: QueueSettings) -> Self {
        Self {
            name: queue_name.to_owned(),
            pool,
            settings,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Dead-letter messages whose visibility timeout elapsed on their last allowed attempt.
    async fn bury_expired(&self) -> QueueResult<()> {
        let query = r#"
UPDATE
    log_queue
SET
    status = 'failed'::log_message_status,
    finished_at = NOW(),
    receipt = NULL
WHERE
    queue = $1
    AND status = 'running'::log_message_status
    AND visible_at <= NOW()
    AND attempt >= max_attempts
        "#;

        sqlx::query(query)
            .bind(&self.name)
            .execute(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(())
    }

    /// Resolve a delivery, returning a `StaleHandle` error if it is no longer in flight.
    /// `retry_interval` is bound as `$3` when the query schedules a redelivery.
    async fn resolve(
        &self,
        handle: &DeliveryHandle,
        query: &str,
        retry_interval: Option<time::Duration>,
    ) -> QueueResult<()> {
        let mut query = sqlx::query(query)
            .bind(handle.message_id)
            .bind(handle.receipt);
        if let Some(interval) = retry_interval {
            query = query.bind(secs(interval));
        }

        let result = query
            .execute(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        if result.rows_affected() == 0 {
            return Err(QueueError::StaleHandle(handle.clone()));
        }

        Ok(())
    }
}

#[async_trait]
impl Queue for PgQueue {
    async fn enqueue(&self, body: String) -> QueueResult<()> {
        let query = r#"
INSERT INTO log_queue
    (queue, status, attempt, max_attempts, body, created_at, scheduled_at)
VALUES
    ($1, 'available'::log_message_status, 0, $2, $3, NOW(), NOW())
        "#;

        sqlx::query(query)
            .bind(&self.name)
            .bind(i32::try_from(self.settings.max_attempts).unwrap_or(i32::MAX))
            .bind(body)
            .execute(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        Ok(())
    }

    async fn receive(&self, max: usize) -> QueueResult<Vec<Delivery>> {
        self.bury_expired().await?;

        // The order of columns in RETURNING matches the tuple we decode into.
        let query = r#"
WITH deliverable AS (
    SELECT
        id
    FROM
        log_queue
    WHERE
        queue = $1
        AND (
            (status = 'available'::log_message_status AND scheduled_at <= NOW())
            OR (status = 'running'::log_message_status AND visible_at <= NOW() AND attempt < max_attempts)
        )
    ORDER BY
        id
    LIMIT $2
    FOR UPDATE SKIP LOCKED
)
UPDATE
    log_queue
SET
    status = 'running'::log_message_status,
    attempt = log_queue.attempt + 1,
    receipt = gen_random_uuid(),
    visible_at = NOW() + make_interval(secs => $3)
FROM
    deliverable
WHERE
    log_queue.id = deliverable.id
RETURNING
    log_queue.id,
    log_queue.attempt,
    log_queue.receipt,
    log_queue.body
        "#;

        let rows: Vec<(i64, i32, Uuid, String)> = sqlx::query_as(query)
            .bind(&self.name)
            .bind(i64::try_from(max).unwrap_or(i64::MAX))
            .bind(secs(self.settings.visibility_timeout))
            .fetch_all(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(rows
            .into_iter()
            .map(|(message_id, attempt, receipt, body)| Delivery {
                handle: DeliveryHandle {
                    message_id,
                    receipt,
                    attempt: u32::try_from(attempt).unwrap_or_default(),
                },
                body,
            })
            .collect())
    }

    async fn ack(&self, handle: &DeliveryHandle) -> QueueResult<()> {
        let query = r#"
UPDATE
    log_queue
SET
    status = 'completed'::log_message_status,
    finished_at = NOW(),
    receipt = NULL
WHERE
    id = $1
    AND receipt = $2
    AND status = 'running'::log_message_status
        "#;

        self.resolve(handle, query, None).await
    }

    async fn fail(&self, handle: &DeliveryHandle) -> QueueResult<()> {
        let query = r#"
UPDATE
    log_queue
SET
    status = CASE
        WHEN attempt >= max_attempts THEN 'failed'::log_message_status
        ELSE 'available'::log_message_status
    END,
    finished_at = CASE WHEN attempt >= max_attempts THEN NOW() ELSE NULL END,
    scheduled_at = NOW() + make_interval(secs => $3),
    visible_at = NULL,
    receipt = NULL
WHERE
    id = $1
    AND receipt = $2
    AND status = 'running'::log_message_status
        "#;

        let retry_interval = self.settings.retry_policy.retry_interval(handle.attempt);
        self.resolve(handle, query, Some(retry_interval)).await
    }

    async fn dead_letter(&self, handle: &DeliveryHandle) -> QueueResult<()> {
        let query = r#"
UPDATE
    log_queue
SET
    status = 'failed'::log_message_status,
    finished_at = NOW(),
    receipt = NULL
WHERE
    id = $1
    AND receipt = $2
    AND status = 'running'::log_message_status
        "#;

        self.resolve(handle, query, None).await
    }

    async fn dead_letters(&self) -> QueueResult<Vec<DeadLetter>> {
        let query = r#"
SELECT
    id,
    attempt,
    body
FROM
    log_queue
WHERE
    queue = $1
    AND status = 'failed'::log_message_status
ORDER BY
    id
        "#;

        let rows: Vec<(i64, i32, String)> = sqlx::query_as(query)
            .bind(&self.name)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;

        Ok(rows
            .into_iter()
            .map(|(message_id, attempts, body)| DeadLetter {
                message_id,
                attempts: u32::try_from(attempts).unwrap_or_default(),
                body,
            })
            .collect())
    }
}

fn secs(duration: time::Duration) -> f64 {
    duration.as_secs_f64()
}
