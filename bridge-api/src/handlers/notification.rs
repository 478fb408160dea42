use axum::{body::Bytes, extract::State, http::HeaderMap, http::StatusCode};
use tracing::{debug, error, warn};

use bridge_common::metrics::record_notification;
use bridge_common::notification::{ChangeNotification, ResourceState, RESOURCE_STATE_HEADER};

use super::app::AppState;

/// Receives object change notifications from a Cloud Storage watch channel.
///
/// Everything but a fatal configuration or catalog failure is acknowledged with a 200, so the
/// channel does not redeliver notifications we could never handle.
pub async fn post_change_notification(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    if let Some(resource_state) = resource_state(&headers) {
        if !resource_state.may_import() {
            debug!(state = %resource_state, "skipping change notification");
            record_notification(&resource_state.to_string());
            return StatusCode::OK;
        }
    }

    let notification = match ChangeNotification::decode(&body) {
        Ok(notification) => notification,
        Err(e) => {
            error!("failed to decode change notification: {}", e);
            record_notification("decode_error");
            return StatusCode::OK;
        }
    };

    match state
        .service
        .handle_change(&state.context, &notification)
        .await
    {
        Ok(_) => StatusCode::OK,
        Err(e) if e.is_fatal() => {
            error!("failed to handle change notification: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
        Err(e) => {
            warn!(
                bucket = notification.bucket.as_str(),
                name = notification.name.as_str(),
                "dropping change notification: {}",
                e
            );
            StatusCode::OK
        }
    }
}

fn resource_state(headers: &HeaderMap) -> Option<ResourceState> {
    let value = headers.get(RESOURCE_STATE_HEADER)?.to_str().ok()?;

    match value.parse() {
        Ok(state) => Some(state),
        Err(e) => {
            warn!("ignoring resource state header: {}", e);
            None
        }
    }
}
