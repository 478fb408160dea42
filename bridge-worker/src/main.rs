//! Deliver queued load job tasks to the bridge API.
use axum::{routing::get, Router};
use envconfig::Envconfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use bridge_common::gcp::build_http_client;
use bridge_common::metrics::setup_metrics_routes;
use bridge_common::pgqueue::PgQueue;
use bridge_common::retry::RetryPolicy;
use bridge_common::server::{graceful_shutdown, serve};
use bridge_worker::config::Config;
use bridge_worker::error::WorkerError;
use bridge_worker::worker::DeliveryWorker;

fn setup_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_layer = tracing_subscriber::fmt::layer().with_filter(filter);
    tracing_subscriber::registry().with(log_layer).init();
}

pub async fn index() -> &'static str {
    "datastore export bridge worker"
}

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    setup_tracing();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let mut retry_policy_builder = RetryPolicy::build(
        config.retry_policy.backoff_coefficient,
        config.retry_policy.initial_interval.0,
    )
    .maximum_interval(config.retry_policy.maximum_interval.0);

    retry_policy_builder = if let Some(retry_queue_name) = &config.retry_policy.retry_queue_name {
        retry_policy_builder.queue(retry_queue_name.as_str())
    } else {
        retry_policy_builder
    };

    let queue = PgQueue::new(
        config.queue_name.as_str(),
        &config.database_url,
        config.max_pg_connections,
        "bridge-worker",
    )?;

    let client = build_http_client(config.request_timeout.0)?;

    let worker = DeliveryWorker::new(
        &config.worker_name,
        &queue,
        config.dequeue_batch_size,
        config.poll_interval.0,
        client,
        config.target_base_url.as_str(),
        config.max_concurrent_jobs,
        retry_policy_builder.provide(),
    )?;

    let router = Router::new()
        .route("/", get(index))
        .route("/_liveness", get(index))
        .route("/_readiness", get(index));
    let router = setup_metrics_routes(router);
    let bind = config.bind();
    tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            tracing::error!("failed to start bridge-worker http server: {}", e);
        }
    });

    tokio::select! {
        _ = worker.run() => {}
        _ = graceful_shutdown() => {}
    }

    Ok(())
}
