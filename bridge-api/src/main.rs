use std::sync::Arc;

use axum::Router;
use config::Config;
use envconfig::Envconfig;
use eyre::{Result, WrapErr};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use bridge_common::config::ServiceConfig;
use bridge_common::context::Context;
use bridge_common::dispatch::DispatchService;
use bridge_common::gcp::{
    build_http_client, BigQueryClient, DatastoreCatalog, MetadataServerToken, StaticToken,
    TokenProvider,
};
use bridge_common::metrics::setup_metrics_routes;
use bridge_common::pgqueue::PgQueue;
use bridge_common::server::serve;

mod config;
mod handlers;

fn setup_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_layer = tracing_subscriber::fmt::layer().with_filter(filter);
    tracing_subscriber::registry().with(log_layer).init();
}

fn service_config(config: &Config) -> Result<ServiceConfig> {
    let mut builder = ServiceConfig::build()
        .queue_name(&config.queue_name)
        .backup_bucket_name(&config.backup_bucket_name)
        .dataset_id(&config.dataset_id)
        .urls(
            config.ocn_receive_url.as_deref().unwrap_or_default(),
            config.load_job_url.as_deref().unwrap_or_default(),
        );

    builder = if config.import_all_kinds {
        builder.all_kinds()
    } else {
        builder.target_kind_names(&config.target_kind_names.0)
    };

    builder
        .provide()
        .wrap_err("invalid dispatch service configuration")
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();

    let config = Config::init_from_env().wrap_err("failed to load configuration from env")?;

    let queue = PgQueue::new(
        &config.queue_name,
        &config.database_url,
        config.max_pg_connections,
        "bridge-api",
    )
    .wrap_err("failed to initialize queue")?
    .with_max_attempts(config.max_attempts);

    let http_client = build_http_client(config.request_timeout.0)
        .wrap_err("failed to construct http client")?;

    let tokens: Arc<dyn TokenProvider + Send + Sync> = match &config.gcp_access_token {
        Some(token) => Arc::new(StaticToken::new(token)),
        None => Arc::new(MetadataServerToken::new(
            http_client.clone(),
            &config.metadata_endpoint,
        )),
    };

    let engine = BigQueryClient::new(
        http_client.clone(),
        &config.bigquery_endpoint,
        &config.project_id,
        tokens.clone(),
    );
    let catalog = DatastoreCatalog::new(
        http_client,
        &config.datastore_endpoint,
        &config.project_id,
        tokens,
    );

    let service = DispatchService::new(service_config(&config)?, Arc::new(queue), Arc::new(engine));
    let state = handlers::AppState {
        service: Arc::new(service),
        context: Context::new(&config.project_id, Arc::new(catalog)),
    };

    let app = handlers::add_routes(
        Router::new(),
        state,
        config.max_body_size,
        config.concurrency_limit,
    )
    .layer(TraceLayer::new_for_http());

    let app = if config.export_prometheus {
        setup_metrics_routes(app)
    } else {
        app
    };

    tracing::info!("listening on {}", config.bind());
    serve(app, &config.bind())
        .await
        .wrap_err("failed to start bridge-api http server")?;

    Ok(())
}
