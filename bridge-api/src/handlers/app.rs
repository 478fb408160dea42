use std::convert::Infallible;
use std::sync::Arc;

use axum::{extract::DefaultBodyLimit, extract::State, http::StatusCode, routing, Router};
use tower::limit::ConcurrencyLimitLayer;

use bridge_common::context::Context;
use bridge_common::dispatch::DispatchService;

use super::{load_job, notification};

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<DispatchService>,
    pub context: Context,
}

pub fn add_routes(
    router: Router,
    state: AppState,
    max_body_size: usize,
    concurrency_limit: usize,
) -> Router {
    let ocn_receive_url = state.service.config().ocn_receive_url.clone();
    let load_job_url = state.service.config().load_job_url.clone();

    router
        .route("/", routing::get(index))
        .route("/_liveness", routing::get(index))
        .route(
            "/_readiness",
            routing::get(readiness).with_state(state.clone()),
        )
        .route(
            &ocn_receive_url,
            routing::post(notification::post_change_notification)
                .with_state(state.clone())
                .layer::<_, Infallible>(ConcurrencyLimitLayer::new(concurrency_limit))
                .layer(DefaultBodyLimit::max(max_body_size)),
        )
        .route(
            &load_job_url,
            routing::post(load_job::post_load_job)
                .with_state(state)
                .layer::<_, Infallible>(ConcurrencyLimitLayer::new(concurrency_limit))
                .layer(DefaultBodyLimit::max(max_body_size)),
        )
}

pub async fn index() -> &'static str {
    "datastore export bridge"
}

/// Not ready once deferred option resolution failed, since the instance can never recover.
pub async fn readiness(State(state): State<AppState>) -> StatusCode {
    if state.service.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}
