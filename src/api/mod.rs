//! API module for all HTTP handlers

pub mod health;
pub mod webhook;

use axum::{Router, routing};

use crate::SharedState;

// Re-export handlers
pub use health::root;
pub use webhook::handle_webhook;

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/", routing::get(root))
        .route("/webhook", routing::post(handle_webhook))
        .with_state(state)
}
