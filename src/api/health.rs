//! Health check endpoint

use axum::{
    Json,
    extract::Query,
    extract::State as AxumState,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::collections::HashMap;

use crate::SharedState;

/// Root health check endpoint
/// Supports ?format=json for detailed JSON response
pub async fn root(
    AxumState(state): AxumState<SharedState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if params.get("format").map(String::as_str) != Some("json") {
        return "change_dispatch - healthy".into_response();
    }

    let config = state.dispatcher.config();
    Json(json!({
        "name": "change_dispatch",
        "version": env!("CARGO_PKG_VERSION"),
        "started_at": state.started_at,
        "uptime_seconds": state.start_time.elapsed().as_secs(),
        "trigger_branch": config.trigger_branch,
        "projects": config.catalog.includes,
        "shared": config.catalog.common,
        "status": "healthy"
    }))
    .into_response()
}
