// Application state for HTTP handlers
use crate::application::session_runtime::SessionHandle;

#[derive(Clone)]
pub struct AppState {
    pub session: SessionHandle,
}
