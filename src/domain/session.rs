// Session domain model - Lifecycle phases and the read-only view of a session
use super::border::{BorderSet, Borders};
use super::device::{Device, DeviceId, MachineType, ProductStatus};
use super::metric::Snapshot;
use super::range::OutOfRangeState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    #[default]
    Idle,
    DeviceSelected,
    /// Machine type chosen, borders possibly still loading
    Configuring,
    /// Start requested, waiting for the initial snapshot
    Armed,
    Running,
    Stopped,
}

impl SessionPhase {
    /// Armed counts as running for every guard: a start call is in flight
    pub fn is_running(self) -> bool {
        matches!(self, SessionPhase::Armed | SessionPhase::Running)
    }

    pub fn is_stopped(self) -> bool {
        self == SessionPhase::Stopped
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionPhase::Idle => "idle",
            SessionPhase::DeviceSelected => "device selected",
            SessionPhase::Configuring => "configuring",
            SessionPhase::Armed => "armed",
            SessionPhase::Running => "running",
            SessionPhase::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Why the live data channel closed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum CloseReason {
    Normal,
    Abnormal(String),
    Error(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Normal => f.write_str("closed normally"),
            CloseReason::Abnormal(detail) => write!(f, "closed abnormally ({})", detail),
            CloseReason::Error(detail) => write!(f, "transport error ({})", detail),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum StreamStatus {
    #[default]
    Disconnected,
    Connecting,
    Open,
    Closed(CloseReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// Operator-facing notification
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Which actions the operator may trigger right now
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ControlFlags {
    pub can_select_device: bool,
    pub can_select_machine_type: bool,
    pub can_edit_serial: bool,
    pub can_check_status: bool,
    pub can_start: bool,
    pub can_stop: bool,
    pub can_reset: bool,
    pub can_submit: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClockView {
    pub start_instant: Option<DateTime<Utc>>,
    pub end_instant: Option<DateTime<Utc>>,
    pub elapsed_seconds: u64,
    pub elapsed_display: String,
    pub running: bool,
}

/// Consistent snapshot of every session entity, published after each event
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionView {
    pub phase: SessionPhase,
    pub running: bool,
    pub stopped: bool,
    pub devices: Vec<Device>,
    pub machine_types: Vec<MachineType>,
    pub selected_device: Option<DeviceId>,
    pub selected_machine_type: Option<MachineType>,
    pub serial_number: String,
    pub product_status: Option<ProductStatus>,
    pub product_check_passed: bool,
    pub auto_stop_minutes: Option<u32>,
    pub borders: BorderSet,
    pub active_borders: Borders,
    pub first: Snapshot,
    pub current: Snapshot,
    pub last: Snapshot,
    pub difference: Snapshot,
    pub out_of_range: OutOfRangeState,
    pub clock: ClockView,
    pub stream: StreamStatus,
    pub controls: ControlFlags,
    pub notices: Vec<Notice>,
}

/// Format elapsed seconds as `HH:MM:SS`; hours keep growing past 99
pub fn format_elapsed(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    format!("{:02}:{:02}:{:02}", hours, minutes, secs)
}
