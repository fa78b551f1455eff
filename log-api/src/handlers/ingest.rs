use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, State},
    http::{header, HeaderMap, StatusCode},
    Json,
};
use serde_derive::{Deserialize, Serialize};
use tracing::{debug, error, info};

use log_common::normalize::ContentKind;

use super::AppState;

/// Header carrying the tenant of a raw text submission.
pub const TENANT_HEADER: &str = "x-tenant-id";

/// Returned to clients when the queue is unavailable. Details only go to the logs.
const ENQUEUE_FAILED: &str = "failed to enqueue record";

#[derive(Serialize, Deserialize, Debug)]
pub struct IngestAccepted {
    status: String,
    tenant_id: String,
    record_id: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct IngestRejected {
    error: String,
}

type IngestResponse =
    Result<(StatusCode, Json<IngestAccepted>), (StatusCode, Json<IngestRejected>)>;

pub async fn post_ingest(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> IngestResponse {
    let body = body.map_err(|rejection| {
        metrics::counter!("log_ingest_requests_total", &[("result", "rejected")]).increment(1);
        debug!("rejected request body: {}", rejection.body_text());
        (
            rejection.status(),
            Json(IngestRejected {
                error: rejection.body_text(),
            }),
        )
    })?;

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());
    let tenant_hint = headers
        .get(TENANT_HEADER)
        .and_then(|value| value.to_str().ok());

    let kind = ContentKind::from_content_type(content_type);
    debug!("received {} byte payload of kind {:?}", body.len(), kind);

    let record = state
        .normalizer
        .normalize(&kind, &body, tenant_hint)
        .map_err(|err| {
            metrics::counter!("log_ingest_requests_total", &[("result", "rejected")]).increment(1);
            bad_request(err)
        })?;

    let start_time = Instant::now();

    state.queue.publish(&record).await.map_err(|err| {
        metrics::counter!("log_ingest_requests_total", &[("result", "error")]).increment(1);
        internal_error(err)
    })?;

    let elapsed_time = start_time.elapsed().as_secs_f64();
    metrics::histogram!("log_ingest_enqueue_seconds").record(elapsed_time);
    metrics::counter!("log_ingest_requests_total", &[("result", "enqueued")]).increment(1);

    info!(
        tenant_id = %record.tenant_id,
        record_id = %record.record_id,
        origin = %record.origin,
        "enqueued record"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(IngestAccepted {
            status: "enqueued".to_owned(),
            tenant_id: record.tenant_id,
            record_id: record.record_id,
        }),
    ))
}

fn bad_request<E>(err: E) -> (StatusCode, Json<IngestRejected>)
where
    E: std::error::Error,
{
    debug!("rejected submission: {}", err);
    (
        StatusCode::BAD_REQUEST,
        Json(IngestRejected {
            error: err.to_string(),
        }),
    )
}

fn internal_error<E>(err: E) -> (StatusCode, Json<IngestRejected>)
where
    E: std::error::Error,
{
    error!("failed to enqueue record: {}", err);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(IngestRejected {
            error: ENQUEUE_FAILED.to_owned(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::{
        body::Body,
        http::{self, Request},
        Router,
    };
    use http_body_util::BodyExt; // for `collect`
    use log_common::normalize::Normalizer;
    use log_common::queue::{
        DeadLetter, Delivery, DeliveryHandle, MemoryQueue, Queue, QueueError, QueueResult,
    };
    use log_common::record::{CanonicalRecord, Origin};
    use rand::{rngs::StdRng, SeedableRng};
    use tower::ServiceExt; // for `call`, `oneshot`, and `ready`

    use crate::handlers::app::add_routes;

    const MAX_BODY_SIZE: usize = 1_000;

    /// Counts enqueue calls and fails each one, standing in for an unreachable queue.
    #[derive(Default)]
    struct RecordingQueue {
        enqueued: AtomicUsize,
    }

    #[async_trait]
    impl Queue for RecordingQueue {
        async fn enqueue(&self, _body: String) -> QueueResult<()> {
            self.enqueued.fetch_add(1, Ordering::SeqCst);
            Err(QueueError::Unavailable("connection refused".to_owned()))
        }

        async fn receive(&self, _max: usize) -> QueueResult<Vec<Delivery>> {
            Ok(Vec::new())
        }

        async fn ack(&self, handle: &DeliveryHandle) -> QueueResult<()> {
            Err(QueueError::StaleHandle(handle.clone()))
        }

        async fn fail(&self, handle: &DeliveryHandle) -> QueueResult<()> {
            Err(QueueError::StaleHandle(handle.clone()))
        }

        async fn dead_letter(&self, handle: &DeliveryHandle) -> QueueResult<()> {
            Err(QueueError::StaleHandle(handle.clone()))
        }

        async fn dead_letters(&self) -> QueueResult<Vec<DeadLetter>> {
            Ok(Vec::new())
        }
    }

    fn app(queue: Arc<dyn Queue>) -> Router {
        let state = AppState {
            queue,
            normalizer: Arc::new(Normalizer::new(StdRng::seed_from_u64(7))),
        };
        add_routes(Router::new(), state, MAX_BODY_SIZE, 10)
    }

    fn ingest_request(content_type: &str, tenant: Option<&str>, body: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .method(http::Method::POST)
            .uri("/ingest")
            .header(http::header::CONTENT_TYPE, content_type);
        if let Some(tenant) = tenant {
            builder = builder.header(TENANT_HEADER, tenant);
        }
        builder.body(Body::from(body.to_owned())).unwrap()
    }

    async fn received_records(queue: &MemoryQueue) -> Vec<CanonicalRecord> {
        queue
            .receive(usize::MAX)
            .await
            .unwrap()
            .into_iter()
            .map(|delivery| serde_json::from_str(&delivery.body).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn ingest_json_submission() {
        let queue = Arc::new(MemoryQueue::default());

        let response = app(queue.clone())
            .oneshot(ingest_request(
                "application/json",
                None,
                r#"{"tenant_id": "acme", "text": "User 555-0199 accessed system"}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let accepted: IngestAccepted = serde_json::from_slice(&body).unwrap();
        assert_eq!(accepted.status, "enqueued");
        assert_eq!(accepted.tenant_id, "acme");
        assert!(!accepted.record_id.is_empty());

        let records = received_records(&queue).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].tenant_id, "acme");
        assert_eq!(records[0].record_id, accepted.record_id);
        assert_eq!(records[0].origin, Origin::JsonSubmission);
        // Redaction happens in the worker, the queued record keeps the submitted text.
        assert_eq!(records[0].raw_text, "User 555-0199 accessed system");
    }

    #[tokio::test]
    async fn ingest_json_submission_keeps_record_id() {
        let queue = Arc::new(MemoryQueue::default());

        let response = app(queue.clone())
            .oneshot(ingest_request(
                "application/json; charset=utf-8",
                None,
                r#"{"tenant_id": "acme", "text": "hello", "log_id": "abc-1"}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let records = received_records(&queue).await;
        assert_eq!(records[0].record_id, "abc-1");
    }

    #[tokio::test]
    async fn ingest_text_submission() {
        let queue = Arc::new(MemoryQueue::default());

        let response = app(queue.clone())
            .oneshot(ingest_request(
                "text/plain",
                Some("beta"),
                "Server restarted at 555-1234",
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let records = received_records(&queue).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].tenant_id, "beta");
        assert_eq!(records[0].origin, Origin::TextSubmission);
        assert_eq!(records[0].raw_text, "Server restarted at 555-1234");
    }

    #[tokio::test]
    async fn ingest_rejections_never_reach_the_queue() {
        let queue = Arc::new(RecordingQueue::default());
        let app = app(queue.clone());

        let rejected = [
            ingest_request("application/json", None, r#"{"text": "no tenant"}"#),
            ingest_request("application/json", None, r#"{"tenant_id": "acme"}"#),
            ingest_request("application/json", None, r#"{"tenant_id": "", "text": "x"}"#),
            ingest_request("application/json", None, "not json"),
            ingest_request("application/json", None, r#"{"tenant_id": 1, "text": "x"}"#),
            ingest_request("text/plain", None, "no tenant header"),
            ingest_request("text/plain", Some(""), "empty tenant header"),
            ingest_request("application/xml", Some("acme"), "<log/>"),
        ];

        for request in rejected {
            let response = app.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);

            let body = response.into_body().collect().await.unwrap().to_bytes();
            let rejected: IngestRejected = serde_json::from_slice(&body).unwrap();
            assert!(!rejected.error.is_empty());
        }

        assert_eq!(queue.enqueued.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn ingest_missing_field_names_the_field() {
        let response = app(Arc::new(MemoryQueue::default()))
            .oneshot(ingest_request(
                "application/json",
                None,
                r#"{"tenant_id": "acme"}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let rejected: IngestRejected = serde_json::from_slice(&body).unwrap();
        assert!(rejected.error.contains("text"));
    }

    #[tokio::test]
    async fn ingest_queue_failure_is_internal_error() {
        let queue = Arc::new(RecordingQueue::default());

        let response = app(queue.clone())
            .oneshot(ingest_request(
                "application/json",
                None,
                r#"{"tenant_id": "acme", "text": "hello"}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let rejected: IngestRejected = serde_json::from_slice(&body).unwrap();
        assert_eq!(rejected.error, ENQUEUE_FAILED);
        assert!(!rejected.error.contains("connection refused"));
        // A single publish attempt, no internal retry.
        assert_eq!(queue.enqueued.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ingest_body_too_large() {
        let queue = Arc::new(MemoryQueue::default());
        let text = "a".repeat(MAX_BODY_SIZE + 1);

        let response = app(queue.clone())
            .oneshot(ingest_request("text/plain", Some("acme"), &text))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(
            response.headers()[http::header::CONTENT_TYPE],
            "application/json"
        );
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let rejected: IngestRejected = serde_json::from_slice(&body).unwrap();
        assert!(rejected.error.contains("length limit exceeded"));
        assert!(queue.is_empty());
    }
}
