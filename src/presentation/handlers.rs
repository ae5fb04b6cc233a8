// HTTP request handlers
use crate::application::session_controller::SessionError;
use crate::domain::device::{DeviceId, MachineType};
use crate::domain::session::SessionView;
use crate::infrastructure::view_stream::stream_from_watch;
use crate::presentation::app_state::AppState;
use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct DeviceRequest {
    pub device_id: DeviceId,
}

#[derive(Debug, Deserialize)]
pub struct MachineTypeRequest {
    pub machine_type: MachineType,
}

#[derive(Debug, Deserialize)]
pub struct SerialRequest {
    pub serial_number: String,
}

#[derive(Debug, Deserialize)]
pub struct AutoStopRequest {
    #[serde(default)]
    pub minutes: Option<u32>,
}

/// Rejected action, reported as JSON
#[derive(Debug)]
pub struct ApiError(SessionError);

impl From<SessionError> for ApiError {
    fn from(error: SessionError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SessionError::RuntimeClosed => StatusCode::SERVICE_UNAVAILABLE,
            SessionError::UnknownDevice(_) | SessionError::UnknownMachineType(_) => {
                StatusCode::NOT_FOUND
            }
            _ => StatusCode::CONFLICT,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ViewResult = Result<Json<SessionView>, ApiError>;

fn current(state: &AppState) -> ViewResult {
    Ok(Json(state.session.view()))
}

/// Health check endpoint
pub async fn health_check() -> &'static str {
    "ok"
}

pub async fn get_session(State(state): State<Arc<AppState>>) -> Json<SessionView> {
    Json(state.session.view())
}

/// Chunked stream of views (progressive updates)
pub async fn stream_session(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    stream_from_watch(state.session.watch())
}

pub async fn refresh_catalog(State(state): State<Arc<AppState>>) -> ViewResult {
    state.session.refresh_catalog().await?;
    current(&state)
}

pub async fn select_device(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DeviceRequest>,
) -> ViewResult {
    state.session.select_device(request.device_id).await?;
    current(&state)
}

pub async fn select_machine_type(
    State(state): State<Arc<AppState>>,
    Json(request): Json<MachineTypeRequest>,
) -> ViewResult {
    state.session.select_machine_type(request.machine_type).await?;
    current(&state)
}

pub async fn set_serial_number(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SerialRequest>,
) -> ViewResult {
    state.session.set_serial_number(request.serial_number).await?;
    current(&state)
}

pub async fn check_status(State(state): State<Arc<AppState>>) -> ViewResult {
    state.session.check_status().await?;
    current(&state)
}

pub async fn set_auto_stop(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AutoStopRequest>,
) -> ViewResult {
    state.session.set_auto_stop(request.minutes).await?;
    current(&state)
}

pub async fn start_task(State(state): State<Arc<AppState>>) -> ViewResult {
    state.session.start_task().await?;
    current(&state)
}

pub async fn stop_task(State(state): State<Arc<AppState>>) -> ViewResult {
    state.session.stop_task().await?;
    current(&state)
}

pub async fn reset(State(state): State<Arc<AppState>>) -> ViewResult {
    state.session.reset().await?;
    current(&state)
}

pub async fn submit_result(State(state): State<Arc<AppState>>) -> ViewResult {
    state.session.submit_result().await?;
    current(&state)
}
