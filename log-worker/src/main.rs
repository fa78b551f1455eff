//! Consume queued log records, redact them and persist them exactly once per key.
use std::future::ready;
use std::sync::Arc;

use axum::{routing::get, Router};
use envconfig::Envconfig;
use rand::{rngs::StdRng, SeedableRng};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use log_common::{
    health::HealthRegistry,
    metrics::{serve, setup_metrics_routes},
    pgqueue::PgQueue,
    pgstore::PgStore,
    queue::{QueueError, QueueSettings},
    redact::Redactor,
    retry::RetryPolicy,
};
use log_worker::config::Config;
use log_worker::error::WorkerError;
use log_worker::fault::FaultInjector;
use log_worker::worker::{LogWorker, MessageProcessor, WorkerSettings};

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let retry_policy = RetryPolicy::build(
        config.retry_policy.backoff_coefficient,
        config.retry_policy.initial_interval.0,
    )
    .maximum_interval(config.retry_policy.maximum_interval.0)
    .provide();
    let settings = QueueSettings {
        visibility_timeout: config.visibility_timeout.0,
        retry_policy,
        ..QueueSettings::default()
    };

    let pool = PgPoolOptions::new()
        .max_connections(config.max_pg_connections)
        .connect(&config.database_url)
        .await
        .map_err(|error| QueueError::ConnectionError { error })?;
    let queue = PgQueue::new_from_pool(config.queue_name.as_str(), pool.clone(), settings);
    let store = PgStore::new_from_pool(config.store_table.as_str(), pool)?;

    let redactor = Redactor::from_names(&config.redaction_rules.0)?;
    let fault_rng = match config.fault_injection_seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let faults = FaultInjector::new(config.fault_injection_probability.0, fault_rng);
    info!(
        rules = ?redactor.rule_names(),
        fault_probability = faults.probability(),
        "configured message processing"
    );

    let shutdown = CancellationToken::new();
    let processor = MessageProcessor::new(Arc::new(store), redactor, shutdown.clone())
        .with_faults(faults)
        .with_delay_per_char(config.simulated_delay_per_char.0)
        .with_processing_timeout(config.processing_timeout.0)
        .with_dead_letter_malformed(config.dead_letter_malformed);

    let settings = WorkerSettings {
        poll_interval: config.poll_interval.0,
        batch_size: config.batch_size,
        max_concurrent_jobs: config.max_concurrent_jobs,
    };
    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness.register("worker", settings.liveness_deadline());

    let worker = LogWorker::new(
        &config.worker_name,
        Arc::new(queue),
        processor,
        settings,
        worker_liveness,
        shutdown.clone(),
    );

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let router = setup_metrics_routes(router)?;
    let bind = config.bind();
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    tokio::task::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received shutdown signal");
                shutdown.cancel();
            }
            Err(error) => error!("failed to listen for shutdown signal: {}", error),
        }
    });

    worker.run().await?;

    Ok(())
}

pub async fn index() -> &'static str {
    "log worker"
}
