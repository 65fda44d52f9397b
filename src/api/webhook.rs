//! Webhook handler for push notifications

use axum::{
    Json,
    body::Bytes,
    extract::Query,
    extract::State as AxumState,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::collections::HashMap;
use tracing::{debug, error};

use crate::SharedState;
use crate::dispatch::DispatchRequest;
use crate::error::DispatchError;
use crate::signature::{SIGNATURE_256_HEADER, SIGNATURE_HEADER};
use crate::webhook::EVENT_HEADER;

pub const DRY_RUN_HEADER: &str = "x-dry-run";

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Status code for a request the dispatcher refused.
pub fn status_for(err: &DispatchError) -> StatusCode {
    match err {
        DispatchError::AuthenticationFailure(_) => StatusCode::UNAUTHORIZED,
        DispatchError::MalformedPayload(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Handles the push webhook POST request.
///
/// Accepted notifications always answer 200 with the dispatch summary, even
/// when some pipelines failed to start, so the sender does not retry.
pub async fn handle_webhook(
    AxumState(state): AxumState<SharedState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    // Check for dry run mode
    let dry_run = params.get("dry_run").map(|v| v == "true").unwrap_or(false)
        || headers.get(DRY_RUN_HEADER).is_some();

    let signature = header_str(&headers, SIGNATURE_256_HEADER)
        .or_else(|| header_str(&headers, SIGNATURE_HEADER));
    let event = header_str(&headers, EVENT_HEADER);
    debug!("Webhook delivery: event={:?} dry_run={}", event, dry_run);

    let request = DispatchRequest {
        signature,
        event,
        body: &body,
        dry_run,
    };

    match state.dispatcher.handle(request).await {
        Ok(summary) => (StatusCode::OK, Json(summary)).into_response(),
        Err(e) => {
            let status = status_for(&e);
            error!("Webhook rejected with {}: {}", status, e);
            (
                status,
                Json(json!({
                    "status": "error",
                    "message": e.to_string()
                })),
            )
                .into_response()
        }
    }
}
