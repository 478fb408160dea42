use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub const NOTIFICATIONS_TOTAL: &str = "bridge_notifications_total";
pub const LOAD_JOBS_TOTAL: &str = "bridge_load_jobs_total";

/// Add the prometheus endpoint and middleware to a router, should be called last.
pub fn setup_metrics_routes(router: Router) -> Router {
    let recorder_handle = setup_metrics_recorder();

    router
        .route(
            "/metrics",
            get(move || std::future::ready(recorder_handle.render())),
        )
        .layer(axum::middleware::from_fn(track_metrics))
}

pub fn setup_metrics_recorder() -> PrometheusHandle {
    const BUCKETS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(BUCKETS)
        .expect("failed to set histogram buckets")
        .install_recorder()
        .expect("failed to install metrics recorder")
}

/// Middleware to record request counts and latencies by route and status.
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };

    let method = req.method().clone();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", status),
    ];

    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels).record(latency);

    response
}

/// Count a change notification by how stage one handled it.
pub fn record_notification(outcome: &str) {
    let labels = [("outcome", outcome.to_owned())];
    metrics::counter!(NOTIFICATIONS_TOTAL, &labels).increment(1);
}

/// Count a load job request by how stage two handled it.
pub fn record_load_job(outcome: &str) {
    let labels = [("outcome", outcome.to_owned())];
    metrics::counter!(LOAD_JOBS_TOTAL, &labels).increment(1);
}
