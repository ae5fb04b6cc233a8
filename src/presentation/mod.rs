// Presentation layer - HTTP surface over the session
pub mod app_state;
pub mod handlers;

use crate::presentation::app_state::AppState;
use crate::presentation::handlers::*;
use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/session", get(get_session))
        .route("/session/stream", get(stream_session))
        .route("/session/catalog/refresh", post(refresh_catalog))
        .route("/session/device", post(select_device))
        .route("/session/machine-type", post(select_machine_type))
        .route("/session/serial", post(set_serial_number))
        .route("/session/status-check", post(check_status))
        .route("/session/auto-stop", post(set_auto_stop))
        .route("/session/start", post(start_task))
        .route("/session/stop", post(stop_task))
        .route("/session/reset", post(reset))
        .route("/session/submit", post(submit_result))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
