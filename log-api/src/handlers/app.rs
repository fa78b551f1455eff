use std::convert::Infallible;
use std::sync::Arc;

use axum::{extract::DefaultBodyLimit, routing, Router};
use tower::limit::ConcurrencyLimitLayer;

use log_common::normalize::Normalizer;
use log_common::queue::Queue;

use super::ingest;

/// Shared, read-only state handed to every ingest request.
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<dyn Queue>,
    pub normalizer: Arc<Normalizer>,
}

pub fn add_routes(
    router: Router,
    state: AppState,
    max_body_size: usize,
    concurrency_limit: usize,
) -> Router {
    router
        .route("/", routing::get(index))
        .route("/_readiness", routing::get(index))
        .route("/_liveness", routing::get(index)) // No async loop in the api, just check axum health
        .route(
            "/ingest",
            routing::post(ingest::post_ingest)
                .with_state(state)
                .layer::<_, Infallible>(ConcurrencyLimitLayer::new(concurrency_limit))
                .layer(DefaultBodyLimit::max(max_body_size)),
        )
}

pub async fn index() -> &'static str {
    "log ingestion api"
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt; // for `collect`
    use log_common::queue::MemoryQueue;
    use tower::ServiceExt; // for `call`, `oneshot`, and `ready`

    #[tokio::test]
    async fn index() {
        let state = AppState {
            queue: Arc::new(MemoryQueue::default()),
            normalizer: Arc::new(Normalizer::from_entropy()),
        };

        let app = add_routes(Router::new(), state, 1_000_000, 10);

        for uri in ["/", "/_readiness", "/_liveness"] {
            let response = app
                .clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::OK);

            let body = response.into_body().collect().await.unwrap().to_bytes();
            assert_eq!(&body[..], b"log ingestion api");
        }
    }
}
