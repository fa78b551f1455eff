use std::sync::Arc;

use axum::Router;
use config::Config;
use envconfig::Envconfig;
use eyre::Result;

use log_common::metrics::setup_metrics_routes;
use log_common::normalize::Normalizer;
use log_common::pgqueue::PgQueue;
use log_common::queue::QueueSettings;

mod config;
mod handlers;

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app).await?;

    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    // The API only enqueues, so only the attempt cap stamped on new messages matters here.
    let settings = QueueSettings {
        max_attempts: config.max_attempts.get(),
        ..QueueSettings::default()
    };
    let queue = PgQueue::new(
        config.queue_name.as_str(),
        &config.database_url,
        config.max_pg_connections,
        settings,
    )
    .await
    .expect("failed to initialize queue");

    let state = handlers::AppState {
        queue: Arc::new(queue),
        normalizer: Arc::new(Normalizer::from_entropy()),
    };

    let app = handlers::add_routes(
        Router::new(),
        state,
        config.max_body_size,
        config.concurrency_limit,
    );
    let app = setup_metrics_routes(app).expect("failed to install metrics recorder");

    match listen(app, config.bind()).await {
        Ok(_) => {}
        Err(e) => tracing::error!("failed to start log-api http server, {}", e),
    }
}
