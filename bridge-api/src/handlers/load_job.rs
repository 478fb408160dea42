use axum::{body::Bytes, extract::State, http::StatusCode};
use tracing::error;

use bridge_common::metrics::record_load_job;
use bridge_common::notification::LoadJobRequest;

use super::app::AppState;

/// Receives load job requests redelivered by the task queue worker.
///
/// A non-2xx response makes the worker retry, so only failures that a retry could fix, a
/// failed configuration or catalog lookup, are reported as errors.
pub async fn post_load_job(State(state): State<AppState>, body: Bytes) -> StatusCode {
    let request = match LoadJobRequest::decode(&body) {
        Ok(request) => request,
        Err(e) => {
            error!("failed to decode load job request: {}", e);
            record_load_job("decode_error");
            return StatusCode::OK;
        }
    };

    match state
        .service
        .handle_load_job(&state.context, &request)
        .await
    {
        Ok(_) => StatusCode::OK,
        Err(e) if e.is_fatal() => {
            error!("failed to handle load job request: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
        Err(e) => {
            error!("dropping load job request: {}", e);
            StatusCode::OK
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::app::tests::{app_with, order_config};
    use axum::{body::Body, http::Request, http::StatusCode};
    use bridge_common::import::WriteDisposition;
    use bridge_common::test_utils::{MemoryEngine, MemoryQueue};
    use tower::ServiceExt; // for `oneshot`

    fn load_job_request(body: &'static str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/tq/gcs-to-bq")
            .header("Content-Type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn load_job_is_submitted() {
        let engine = MemoryEngine::default();
        let (app, _) = app_with(order_config(), MemoryQueue::default(), engine.clone());

        let response = app
            .oneshot(load_job_request(
                r#"{"bucket":"backup","filePath":"handle.Order.backup_info","kindName":"Order","timeCreated":"2017-11-14T06:47:47Z"}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let jobs = engine.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].source_uris, vec!["gs://backup/handle.Order.backup_info"]);
        assert_eq!(jobs[0].destination_table.project_id, "my-project");
        assert_eq!(jobs[0].destination_table.dataset_id, "datastore");
        assert_eq!(jobs[0].destination_table.table_id, "Order");
        assert_eq!(jobs[0].write_disposition, WriteDisposition::WriteTruncate);
    }

    #[tokio::test]
    async fn invalid_load_job_is_acknowledged() {
        let engine = MemoryEngine::default();
        let (app, _) = app_with(order_config(), MemoryQueue::default(), engine.clone());

        let response = app
            .oneshot(load_job_request(r#"{"bucket":"b","filePath":"","kindName":"k"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(engine.is_empty());
    }

    #[tokio::test]
    async fn malformed_load_job_is_acknowledged() {
        let engine = MemoryEngine::default();
        let (app, _) = app_with(order_config(), MemoryQueue::default(), engine.clone());

        let response = app.oneshot(load_job_request("[]")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(engine.is_empty());
    }
}
