// Session controller - State machine for one measurement session on the bench
use crate::application::gateway::{
    DeviceGateway, GatewayError, GatewayResult, MeasurementGateway, RetryPolicy,
    StartedMeasurement, StoppedMeasurement, SubmitReceipt,
};
use crate::application::live_stream::{LiveStream, StreamEvent, Subscription};
use crate::application::session_clock::{SessionClock, TimeSource};
use crate::domain::border::{BorderSet, Borders};
use crate::domain::device::{Device, DeviceId, MachineType, ProductStatus};
use crate::domain::message::{ControlMessage, ErrorMessage, InboundMessage, LifecycleMessage, MetricUpdate};
use crate::domain::metric::{MetricCatalog, Snapshot};
use crate::domain::range::{DEFAULT_WARMUP_SECONDS, OutOfRangePolicy, OutOfRangeState, RangeEvaluator};
use crate::domain::session::{
    CloseReason, ControlFlags, Notice, NoticeLevel, SessionPhase, SessionView, StreamStatus,
};
use futures::StreamExt;
use serde_json::json;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("cannot {action} while {phase}")]
    InvalidState {
        action: &'static str,
        phase: SessionPhase,
    },

    #[error("no test station selected")]
    NoDeviceSelected,

    #[error("unknown test station {0}")]
    UnknownDevice(DeviceId),

    #[error("unknown machine type {0}")]
    UnknownMachineType(MachineType),

    #[error("serial number is missing")]
    MissingSerialNumber,

    #[error("product status check has not passed")]
    ProductCheckRequired,

    #[error("live data stream is not open")]
    StreamNotOpen,

    #[error("{0} is already in progress")]
    InFlight(&'static str),

    #[error("session runtime is not running")]
    RuntimeClosed,
}

/// Operator actions
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    RefreshCatalog,
    SelectDevice(DeviceId),
    SelectMachineType(MachineType),
    SetSerialNumber(String),
    CheckStatus,
    SetAutoStop(Option<u32>),
    StartTask,
    StopTask,
    Reset,
    SubmitResult,
}

/// Asynchronous inputs, all delivered through the controller's single queue.
///
/// Results of device-scoped calls carry the generation they were issued under;
/// anything from an older generation is discarded.
#[derive(Debug)]
pub enum SessionEvent {
    DevicesLoaded(GatewayResult<Vec<Device>>),
    MachineTypesLoaded(GatewayResult<Vec<MachineType>>),
    DefaultBordersLoaded {
        generation: u64,
        device_id: DeviceId,
        result: GatewayResult<Borders>,
    },
    MachineBordersLoaded {
        generation: u64,
        machine_type: MachineType,
        result: GatewayResult<Borders>,
    },
    ProductStatusLoaded {
        generation: u64,
        serial_number: String,
        result: GatewayResult<ProductStatus>,
    },
    StartCompleted {
        generation: u64,
        result: GatewayResult<StartedMeasurement>,
    },
    StopCompleted {
        generation: u64,
        result: GatewayResult<StoppedMeasurement>,
    },
    SubmitCompleted {
        generation: u64,
        result: GatewayResult<SubmitReceipt>,
    },
    Stream {
        generation: u64,
        event: StreamEvent,
    },
    Tick,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub tick_interval: Duration,
    pub warmup_seconds: u64,
    pub required_product_status: ProductStatus,
    pub out_of_range_policy: OutOfRangePolicy,
    pub auto_stop_minutes: Option<u32>,
    pub notice_capacity: usize,
    pub catalog_retry: RetryPolicy,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            warmup_seconds: DEFAULT_WARMUP_SECONDS,
            required_product_status: 20,
            out_of_range_policy: OutOfRangePolicy::Sticky,
            auto_stop_minutes: None,
            notice_capacity: 50,
            catalog_retry: RetryPolicy::default(),
        }
    }
}

/// External collaborators of the controller
#[derive(Clone)]
pub struct SessionDependencies {
    pub devices: Arc<dyn DeviceGateway>,
    pub measurements: Arc<dyn MeasurementGateway>,
    pub live_stream: Arc<dyn LiveStream>,
    pub time: Arc<dyn TimeSource>,
    pub catalog: Arc<MetricCatalog>,
}

#[derive(Debug, Clone, Copy, Default)]
struct InFlight {
    devices: bool,
    machine_types: bool,
    status_check: bool,
    start: bool,
    stop: bool,
    submit: bool,
}

#[derive(Debug, Default)]
struct SessionState {
    devices: Vec<Device>,
    machine_types: Vec<MachineType>,
    selected_device: Option<DeviceId>,
    selected_machine_type: Option<MachineType>,
    serial_number: String,
    product_status: Option<ProductStatus>,
    product_check_passed: bool,
    auto_stop_minutes: Option<u32>,
    phase: SessionPhase,
    phase_before_start: SessionPhase,
    borders: BorderSet,
    first: Snapshot,
    current: Snapshot,
    last: Snapshot,
    difference: Snapshot,
    out_of_range: OutOfRangeState,
    stream: StreamStatus,
    in_flight: InFlight,
    /// The stream closed while a start call was pending
    stop_after_start: bool,
    /// Efficiency metrics were re-evaluated once the warm-up elapsed
    warmed_up: bool,
    notices: VecDeque<Notice>,
}

pub struct SessionController {
    deps: SessionDependencies,
    settings: SessionSettings,
    events: mpsc::UnboundedSender<SessionEvent>,
    evaluator: RangeEvaluator,
    clock: SessionClock,
    state: SessionState,
    subscription: Option<Subscription>,
    generation: u64,
}

impl SessionController {
    pub fn new(
        deps: SessionDependencies,
        settings: SessionSettings,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let evaluator = RangeEvaluator::new(
            deps.catalog.clone(),
            settings.warmup_seconds,
            settings.out_of_range_policy,
        );
        tracing::debug!(
            "Out-of-range policy {:?}, efficiency warm-up {} s",
            evaluator.policy(),
            settings.warmup_seconds
        );
        let tick_events = events.clone();
        let clock = SessionClock::new(
            deps.time.clone(),
            settings.tick_interval,
            Arc::new(move || {
                let _ = tick_events.send(SessionEvent::Tick);
            }),
        );
        let state = SessionState {
            auto_stop_minutes: settings.auto_stop_minutes,
            ..SessionState::default()
        };

        Self {
            deps,
            settings,
            events,
            evaluator,
            clock,
            state,
            subscription: None,
            generation: 0,
        }
    }

    /// Apply one operator action. Rejected actions leave the state untouched.
    pub fn dispatch(&mut self, action: SessionAction) -> Result<(), SessionError> {
        let result = match action {
            SessionAction::RefreshCatalog => self.refresh_catalog(),
            SessionAction::SelectDevice(device_id) => self.select_device(device_id),
            SessionAction::SelectMachineType(machine_type) => {
                self.select_machine_type(machine_type)
            }
            SessionAction::SetSerialNumber(serial) => self.set_serial_number(serial),
            SessionAction::CheckStatus => self.check_status(),
            SessionAction::SetAutoStop(minutes) => self.set_auto_stop(minutes),
            SessionAction::StartTask => self.start_task(),
            SessionAction::StopTask => self.stop_task(),
            SessionAction::Reset => self.reset(),
            SessionAction::SubmitResult => self.submit_result(),
        };
        if let Err(e) = &result {
            tracing::warn!("Rejected action: {}", e);
        }
        result
    }

    pub fn handle(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::DevicesLoaded(result) => self.on_devices_loaded(result),
            SessionEvent::MachineTypesLoaded(result) => self.on_machine_types_loaded(result),
            SessionEvent::DefaultBordersLoaded {
                generation,
                device_id,
                result,
            } => self.on_default_borders(generation, device_id, result),
            SessionEvent::MachineBordersLoaded {
                generation,
                machine_type,
                result,
            } => self.on_machine_borders(generation, machine_type, result),
            SessionEvent::ProductStatusLoaded {
                generation,
                serial_number,
                result,
            } => self.on_product_status(generation, serial_number, result),
            SessionEvent::StartCompleted { generation, result } => {
                self.on_start_completed(generation, result)
            }
            SessionEvent::StopCompleted { generation, result } => {
                self.on_stop_completed(generation, result)
            }
            SessionEvent::SubmitCompleted { generation, result } => {
                self.on_submit_completed(generation, result)
            }
            SessionEvent::Stream { generation, event } => self.on_stream(generation, event),
            SessionEvent::Tick => self.on_tick(),
        }
    }

    /// Close the subscription and stop the ticker
    pub fn shutdown(&mut self) {
        self.close_subscription();
        self.clock.reset();
    }

    pub fn view(&self) -> SessionView {
        let state = &self.state;
        SessionView {
            phase: state.phase,
            running: state.phase == SessionPhase::Running,
            stopped: state.phase.is_stopped(),
            devices: state.devices.clone(),
            machine_types: state.machine_types.clone(),
            selected_device: state.selected_device,
            selected_machine_type: state.selected_machine_type.clone(),
            serial_number: state.serial_number.clone(),
            product_status: state.product_status,
            product_check_passed: state.product_check_passed,
            auto_stop_minutes: state.auto_stop_minutes,
            borders: state.borders.clone(),
            active_borders: state.borders.resolve(state.selected_machine_type.is_some()),
            first: state.first.clone(),
            current: state.current.clone(),
            last: state.last.clone(),
            difference: state.difference.clone(),
            out_of_range: state.out_of_range.clone(),
            clock: self.clock.view(),
            stream: state.stream.clone(),
            controls: self.controls(),
            notices: state.notices.iter().cloned().collect(),
        }
    }

    fn controls(&self) -> ControlFlags {
        let state = &self.state;
        let phase = state.phase;
        let configurable = matches!(
            phase,
            SessionPhase::DeviceSelected | SessionPhase::Configuring
        );
        ControlFlags {
            can_select_device: !phase.is_running() && !state.devices.is_empty(),
            can_select_machine_type: configurable && !state.machine_types.is_empty(),
            can_edit_serial: !phase.is_running(),
            can_check_status: !phase.is_running()
                && !state.serial_number.is_empty()
                && !state.product_check_passed
                && !state.in_flight.status_check,
            can_start: configurable
                && state.product_check_passed
                && state.stream == StreamStatus::Open
                && !state.in_flight.start,
            can_stop: phase == SessionPhase::Running && !state.in_flight.stop,
            can_reset: !phase.is_running(),
            can_submit: phase.is_stopped() && !state.in_flight.submit,
        }
    }

    // ---- actions -------------------------------------------------------

    fn refresh_catalog(&mut self) -> Result<(), SessionError> {
        if self.state.in_flight.devices || self.state.in_flight.machine_types {
            return Err(SessionError::InFlight("catalog refresh"));
        }
        self.state.in_flight.devices = true;
        self.state.in_flight.machine_types = true;

        let retry = self.settings.catalog_retry;
        let gateway = self.deps.devices.clone();
        self.spawn_call(async move {
            let result = retry.run("list devices", || gateway.list_devices()).await;
            SessionEvent::DevicesLoaded(result)
        });

        let gateway = self.deps.devices.clone();
        self.spawn_call(async move {
            let result = retry
                .run("list machine types", || gateway.list_machine_types())
                .await;
            SessionEvent::MachineTypesLoaded(result)
        });
        Ok(())
    }

    fn select_device(&mut self, device_id: DeviceId) -> Result<(), SessionError> {
        let phase = self.state.phase;
        if phase.is_running() {
            return Err(SessionError::InvalidState {
                action: "change test station",
                phase,
            });
        }
        if !self.state.devices.iter().any(|d| d.id == device_id) {
            return Err(SessionError::UnknownDevice(device_id));
        }
        if self.state.selected_device == Some(device_id)
            && matches!(phase, SessionPhase::DeviceSelected | SessionPhase::Configuring)
            && self.subscription.is_some()
        {
            tracing::debug!("Test station {} already selected", device_id);
            return Ok(());
        }

        self.close_subscription();
        self.bump_generation();
        self.clock.reset();
        self.clear_measurements();
        self.state.borders.clear();
        self.state.selected_machine_type = None;
        self.state.selected_device = Some(device_id);

        self.open_subscription(device_id);
        self.fetch_default_borders(device_id);
        self.set_phase(SessionPhase::DeviceSelected);
        Ok(())
    }

    fn select_machine_type(&mut self, machine_type: MachineType) -> Result<(), SessionError> {
        let phase = self.state.phase;
        if phase.is_running() || phase.is_stopped() {
            return Err(SessionError::InvalidState {
                action: "change machine type",
                phase,
            });
        }
        if self.state.selected_device.is_none() {
            return Err(SessionError::NoDeviceSelected);
        }
        if !self.state.machine_types.contains(&machine_type) {
            return Err(SessionError::UnknownMachineType(machine_type));
        }

        self.clear_measurements();
        self.state.borders.machine_type.clear();
        self.state.selected_machine_type = Some(machine_type.clone());

        let generation = self.generation;
        let gateway = self.deps.devices.clone();
        self.spawn_call(async move {
            let result = gateway.machine_type_borders(&machine_type).await;
            SessionEvent::MachineBordersLoaded {
                generation,
                machine_type,
                result,
            }
        });
        self.set_phase(SessionPhase::Configuring);
        Ok(())
    }

    fn set_serial_number(&mut self, serial: String) -> Result<(), SessionError> {
        let phase = self.state.phase;
        if phase.is_running() {
            return Err(SessionError::InvalidState {
                action: "change serial number",
                phase,
            });
        }
        let serial = serial.trim().to_string();
        if serial != self.state.serial_number {
            self.state.serial_number = serial;
            self.state.product_status = None;
            self.state.product_check_passed = false;
        }
        Ok(())
    }

    fn check_status(&mut self) -> Result<(), SessionError> {
        let phase = self.state.phase;
        if phase.is_running() {
            return Err(SessionError::InvalidState {
                action: "check product status",
                phase,
            });
        }
        if self.state.serial_number.is_empty() {
            return Err(SessionError::MissingSerialNumber);
        }
        if self.state.in_flight.status_check {
            return Err(SessionError::InFlight("product status check"));
        }
        self.state.in_flight.status_check = true;

        let generation = self.generation;
        let serial_number = self.state.serial_number.clone();
        let gateway = self.deps.devices.clone();
        self.spawn_call(async move {
            let result = gateway.product_status(&serial_number).await;
            SessionEvent::ProductStatusLoaded {
                generation,
                serial_number,
                result,
            }
        });
        Ok(())
    }

    fn set_auto_stop(&mut self, minutes: Option<u32>) -> Result<(), SessionError> {
        let phase = self.state.phase;
        if phase.is_running() {
            return Err(SessionError::InvalidState {
                action: "change auto-stop",
                phase,
            });
        }
        self.state.auto_stop_minutes = minutes.filter(|m| *m > 0);
        Ok(())
    }

    fn start_task(&mut self) -> Result<(), SessionError> {
        let phase = self.state.phase;
        if self.state.in_flight.start {
            return Err(SessionError::InFlight("start"));
        }
        let device_id = self
            .state
            .selected_device
            .ok_or(SessionError::NoDeviceSelected)?;
        if !matches!(phase, SessionPhase::DeviceSelected | SessionPhase::Configuring) {
            return Err(SessionError::InvalidState {
                action: "start measurement",
                phase,
            });
        }
        if !self.state.product_check_passed {
            return Err(SessionError::ProductCheckRequired);
        }
        if self.state.stream != StreamStatus::Open {
            return Err(SessionError::StreamNotOpen);
        }

        self.state.in_flight.start = true;
        self.state.phase_before_start = phase;
        self.state.stop_after_start = false;
        self.set_phase(SessionPhase::Armed);

        let generation = self.generation;
        let serial_number = self.state.serial_number.clone();
        let gateway = self.deps.measurements.clone();
        self.spawn_call(async move {
            let result = gateway.start_measurement(device_id, &serial_number).await;
            SessionEvent::StartCompleted { generation, result }
        });
        Ok(())
    }

    fn stop_task(&mut self) -> Result<(), SessionError> {
        let phase = self.state.phase;
        if phase != SessionPhase::Running {
            return Err(SessionError::InvalidState {
                action: "stop measurement",
                phase,
            });
        }
        if self.state.in_flight.stop {
            return Err(SessionError::InFlight("stop"));
        }
        self.begin_stop("operator request");
        Ok(())
    }

    fn reset(&mut self) -> Result<(), SessionError> {
        let phase = self.state.phase;
        if phase.is_running() {
            return Err(SessionError::InvalidState {
                action: "reset",
                phase,
            });
        }

        self.close_subscription();
        self.bump_generation();
        self.clock.reset();

        let previous = std::mem::take(&mut self.state);
        self.state = SessionState {
            devices: previous.devices,
            machine_types: previous.machine_types,
            notices: previous.notices,
            auto_stop_minutes: previous.auto_stop_minutes,
            in_flight: InFlight {
                devices: previous.in_flight.devices,
                machine_types: previous.in_flight.machine_types,
                ..InFlight::default()
            },
            ..SessionState::default()
        };
        tracing::info!("Session reset");
        Ok(())
    }

    fn submit_result(&mut self) -> Result<(), SessionError> {
        let phase = self.state.phase;
        if !phase.is_stopped() {
            return Err(SessionError::InvalidState {
                action: "submit result",
                phase,
            });
        }
        if self.state.in_flight.submit {
            return Err(SessionError::InFlight("submit"));
        }
        let device_id = self
            .state
            .selected_device
            .ok_or(SessionError::NoDeviceSelected)?;
        self.state.in_flight.submit = true;

        let generation = self.generation;
        let gateway = self.deps.measurements.clone();
        self.spawn_call(async move {
            let result = gateway.submit_result(device_id).await;
            SessionEvent::SubmitCompleted { generation, result }
        });
        Ok(())
    }

    // ---- completions ---------------------------------------------------

    fn on_devices_loaded(&mut self, result: GatewayResult<Vec<Device>>) {
        self.state.in_flight.devices = false;
        match result {
            Ok(devices) => {
                tracing::info!("Loaded {} test station(s)", devices.len());
                self.state.devices = devices;
            }
            Err(e) => self.notify(
                NoticeLevel::Error,
                format!("Could not load test stations: {}", e),
            ),
        }
    }

    fn on_machine_types_loaded(&mut self, result: GatewayResult<Vec<MachineType>>) {
        self.state.in_flight.machine_types = false;
        match result {
            Ok(machine_types) => {
                tracing::info!("Loaded {} machine type(s)", machine_types.len());
                self.state.machine_types = machine_types;
            }
            Err(e) => self.notify(
                NoticeLevel::Error,
                format!("Could not load machine types: {}", e),
            ),
        }
    }

    fn on_default_borders(
        &mut self,
        generation: u64,
        device_id: DeviceId,
        result: GatewayResult<Borders>,
    ) {
        if generation != self.generation || self.state.selected_device != Some(device_id) {
            tracing::debug!("Discarding stale default borders for test station {}", device_id);
            return;
        }
        match result {
            Ok(borders) => {
                self.state.borders.defaults = self.known_borders(borders);
                tracing::info!(
                    "Default borders loaded for test station {} ({} keys)",
                    device_id,
                    self.state.borders.defaults.len()
                );
                self.reevaluate();
            }
            Err(GatewayError::NotFound(_)) => {
                self.state.borders.defaults.clear();
                self.notify(
                    NoticeLevel::Info,
                    format!("No default borders configured for test station {}", device_id),
                );
            }
            Err(e) => self.notify(
                NoticeLevel::Error,
                format!("Could not load default borders: {}", e),
            ),
        }
    }

    fn on_machine_borders(
        &mut self,
        generation: u64,
        machine_type: MachineType,
        result: GatewayResult<Borders>,
    ) {
        if generation != self.generation
            || self.state.selected_machine_type.as_ref() != Some(&machine_type)
        {
            tracing::debug!("Discarding stale borders for machine type {}", machine_type);
            return;
        }
        match result {
            Ok(borders) => {
                self.state.borders.machine_type = self.known_borders(borders);
                tracing::info!(
                    "Borders loaded for machine type {} ({} keys)",
                    machine_type,
                    self.state.borders.machine_type.len()
                );
                self.reevaluate();
            }
            Err(GatewayError::NotFound(_)) => {
                self.state.borders.machine_type.clear();
                self.notify(
                    NoticeLevel::Warning,
                    format!("No borders configured for machine type {}", machine_type),
                );
            }
            Err(e) => self.notify(
                NoticeLevel::Error,
                format!("Could not load borders for {}: {}", machine_type, e),
            ),
        }
    }

    fn on_product_status(
        &mut self,
        generation: u64,
        serial_number: String,
        result: GatewayResult<ProductStatus>,
    ) {
        if generation != self.generation {
            tracing::debug!("Discarding stale product status for {}", serial_number);
            return;
        }
        self.state.in_flight.status_check = false;
        if serial_number != self.state.serial_number {
            tracing::debug!("Serial number changed, discarding status for {}", serial_number);
            return;
        }
        match result {
            Ok(status) => {
                self.state.product_status = Some(status);
                self.state.product_check_passed = status == self.settings.required_product_status;
                if self.state.product_check_passed {
                    self.notify(
                        NoticeLevel::Success,
                        format!("Product status: {}", status),
                    );
                } else {
                    self.notify(NoticeLevel::Info, format!("Product status: {}", status));
                }
            }
            Err(GatewayError::NotFound(_)) => {
                self.state.product_status = None;
                self.state.product_check_passed = false;
                self.notify(
                    NoticeLevel::Warning,
                    format!("Serial number {} not found", serial_number),
                );
            }
            Err(e) => {
                self.state.product_status = None;
                self.state.product_check_passed = false;
                self.notify(
                    NoticeLevel::Error,
                    format!("Could not fetch product status: {}", e),
                );
            }
        }
    }

    fn on_start_completed(&mut self, generation: u64, result: GatewayResult<StartedMeasurement>) {
        if generation != self.generation {
            tracing::debug!("Discarding stale start response");
            return;
        }
        self.state.in_flight.start = false;
        let phase = self.state.phase;
        if !phase.is_running() {
            // the backend may end the session before the start response arrives
            if let (true, Ok(started)) = (phase.is_stopped(), &result) {
                if self.state.first.is_empty() {
                    let initial = started.initial_snapshot.clone();
                    self.state.first = self.deps.catalog.retain_known(initial);
                }
                self.clock.backfill_start(started.start_instant);
            }
            tracing::debug!("Start response arrived while {}", phase);
            return;
        }

        match result {
            Ok(started) => {
                let initial = self.deps.catalog.retain_known(started.initial_snapshot);
                if phase == SessionPhase::Armed || self.state.first.is_empty() {
                    self.state.first = initial;
                }
                self.clock.arm(started.start_instant);
                self.set_phase(SessionPhase::Running);
                self.reevaluate();
                self.notify(NoticeLevel::Success, "Measurement started".to_string());

                if self.state.stop_after_start {
                    self.state.stop_after_start = false;
                    self.begin_stop("live data lost during start");
                }
            }
            Err(e) if phase == SessionPhase::Armed => {
                let previous = self.state.phase_before_start;
                self.set_phase(previous);
                self.state.stop_after_start = false;
                self.notify(
                    NoticeLevel::Error,
                    format!("Could not start measurement: {}", e),
                );
            }
            Err(e) => {
                // the stream already reported the start
                self.notify(
                    NoticeLevel::Warning,
                    format!("Start confirmation failed: {}", e),
                );
            }
        }
    }

    fn on_stop_completed(&mut self, generation: u64, result: GatewayResult<StoppedMeasurement>) {
        if generation != self.generation {
            tracing::debug!("Discarding stale stop response");
            return;
        }
        self.state.in_flight.stop = false;
        let was_running = self.state.phase.is_running();

        match result {
            Ok(stopped) => {
                let last = self.deps.catalog.retain_known(stopped.last_snapshot);
                if was_running || self.state.last.is_empty() {
                    self.state.last = last;
                }
                if was_running {
                    if let Some(start) = stopped.start_instant {
                        self.clock.backfill_start(start);
                    }
                    self.clock.freeze(stopped.end_instant);
                    self.notify(NoticeLevel::Success, "Measurement stopped".to_string());
                }
            }
            Err(e) => {
                self.notify(
                    NoticeLevel::Error,
                    format!("Stop measurement failed: {}", e),
                );
                if was_running {
                    self.clock.freeze(self.deps.time.now());
                }
            }
        }

        if was_running {
            self.enter_stopped();
        }
    }

    fn on_submit_completed(&mut self, generation: u64, result: GatewayResult<SubmitReceipt>) {
        if generation != self.generation {
            tracing::debug!("Discarding stale submit response");
            return;
        }
        self.state.in_flight.submit = false;
        match result {
            Ok(receipt) => self.notify(
                NoticeLevel::Success,
                receipt
                    .message
                    .unwrap_or_else(|| "Data transferred successfully".to_string()),
            ),
            Err(GatewayError::NoMatchingProtocol) => self.notify(
                NoticeLevel::Warning,
                "No matching protocol found for this measurement".to_string(),
            ),
            Err(e) => self.notify(NoticeLevel::Error, format!("Transfer failed: {}", e)),
        }
    }

    // ---- live stream ---------------------------------------------------

    fn on_stream(&mut self, generation: u64, event: StreamEvent) {
        if generation != self.generation {
            tracing::debug!("Discarding event from abandoned subscription: {:?}", event);
            return;
        }
        match event {
            StreamEvent::Opened => {
                self.state.stream = StreamStatus::Open;
                if let Some(subscription) = &self.subscription {
                    let device_id = subscription.device_id();
                    tracing::info!("Live data stream open for test station {}", device_id);
                    if !subscription.send(json!({ "deviceId": device_id })) {
                        tracing::warn!("Could not announce test station {} on the live channel", device_id);
                    }
                }
            }
            StreamEvent::Message(message) => self.on_message(message),
            StreamEvent::Closed(reason) => self.on_stream_closed(reason),
        }
    }

    fn on_message(&mut self, message: InboundMessage) {
        match message {
            InboundMessage::Metrics(update) => self.on_metric_update(update),
            InboundMessage::Lifecycle(lifecycle) => self.on_lifecycle(lifecycle),
            InboundMessage::Control(ControlMessage::StopPolling) => {
                if self.state.phase == SessionPhase::Running && !self.state.in_flight.stop {
                    self.notify(
                        NoticeLevel::Info,
                        "Backend stopped polling the test station".to_string(),
                    );
                    self.begin_stop("backend stopped polling");
                } else {
                    tracing::debug!("Ignoring stopPolling while {}", self.state.phase);
                }
            }
            InboundMessage::Error(ErrorMessage { error, retry }) => {
                let message = match retry {
                    Some(true) => format!("Live data error: {} (backend retrying)", error),
                    _ => format!("Live data error: {}", error),
                };
                self.notify(NoticeLevel::Error, message);
            }
        }
    }

    fn on_metric_update(&mut self, update: MetricUpdate) {
        if !self.state.phase.is_running() {
            tracing::debug!("Ignoring metric update while {}", self.state.phase);
            return;
        }

        match update.difference {
            Some(key) => {
                if !self.deps.catalog.is_counter(&key) {
                    tracing::debug!("Ignoring difference for non-counter metric {}", key);
                    return;
                }
                if let Some(delta) = update.values.get(&key) {
                    self.state.difference.insert(key, delta);
                }
            }
            None => {
                let values = self.deps.catalog.retain_known(update.values);
                let changed = self.state.current.apply_changes(&values);
                if !changed.is_empty() {
                    tracing::trace!("{} metric(s) changed", changed.len());
                    self.reevaluate();
                }
            }
        }
    }

    fn on_lifecycle(&mut self, lifecycle: LifecycleMessage) {
        let phase = self.state.phase;
        if !phase.is_running() {
            tracing::debug!("Ignoring lifecycle message while {}", phase);
            return;
        }

        if let Some(initial) = lifecycle.initial_data {
            if self.state.first.is_empty() {
                self.state.first = self.deps.catalog.retain_known(initial);
            }
        }
        if let Some(start) = lifecycle.start_time {
            self.clock.arm(start);
            if phase == SessionPhase::Armed {
                self.set_phase(SessionPhase::Running);
            }
        }
        if let Some(last) = lifecycle.last_data {
            self.state.last = self.deps.catalog.retain_known(last);
        }
        if let Some(end) = lifecycle.end_time {
            self.clock.freeze(end);
            self.notify(
                NoticeLevel::Info,
                "Measurement ended by the backend".to_string(),
            );
            let need_last = self.state.last.is_empty() && !self.state.in_flight.stop;
            if need_last {
                // collect lastData the stream did not deliver
                self.request_stop();
            }
            self.enter_stopped();
        }
    }

    fn on_stream_closed(&mut self, reason: CloseReason) {
        self.subscription = None;
        self.state.stream = StreamStatus::Closed(reason.clone());

        match self.state.phase {
            SessionPhase::Running => {
                self.notify(
                    NoticeLevel::Warning,
                    format!("Live data connection {}; stopping measurement", reason),
                );
                if !self.state.in_flight.stop {
                    self.begin_stop("live data closed");
                }
            }
            SessionPhase::Armed => {
                self.notify(
                    NoticeLevel::Warning,
                    format!("Live data connection {} during start", reason),
                );
                self.state.stop_after_start = true;
            }
            _ if reason != CloseReason::Normal => {
                self.notify(
                    NoticeLevel::Warning,
                    format!("Live data connection {}", reason),
                );
            }
            _ => tracing::info!("Live data stream closed"),
        }
    }

    fn on_tick(&mut self) {
        if self.state.phase != SessionPhase::Running {
            return;
        }
        if !self.state.warmed_up && self.clock.elapsed_seconds() >= self.settings.warmup_seconds {
            self.state.warmed_up = true;
            tracing::info!("Efficiency warm-up elapsed");
            self.reevaluate();
        }
        let Some(minutes) = self.state.auto_stop_minutes else {
            return;
        };
        if self.clock.elapsed_seconds() >= u64::from(minutes) * 60 && !self.state.in_flight.stop {
            self.notify(
                NoticeLevel::Info,
                format!("Auto-stop after {} minute(s)", minutes),
            );
            self.begin_stop("auto-stop");
        }
    }

    // ---- helpers -------------------------------------------------------

    fn begin_stop(&mut self, reason: &str) {
        tracing::info!("Stopping measurement ({})", reason);
        self.request_stop();
    }

    fn request_stop(&mut self) {
        let Some(device_id) = self.state.selected_device else {
            return;
        };
        self.state.in_flight.stop = true;
        let generation = self.generation;
        let gateway = self.deps.measurements.clone();
        self.spawn_call(async move {
            let result = gateway.stop_measurement(device_id).await;
            SessionEvent::StopCompleted { generation, result }
        });
    }

    fn enter_stopped(&mut self) {
        self.state.stop_after_start = false;
        self.set_phase(SessionPhase::Stopped);
        self.close_subscription();
    }

    fn open_subscription(&mut self, device_id: DeviceId) {
        let mut subscription = self.deps.live_stream.open(device_id);
        let generation = self.generation;

        if let Some(mut events) = subscription.take_events() {
            let tx = self.events.clone();
            tokio::spawn(async move {
                while let Some(event) = events.next().await {
                    let terminal = matches!(event, StreamEvent::Closed(_));
                    if tx.send(SessionEvent::Stream { generation, event }).is_err() || terminal {
                        return;
                    }
                }
                let _ = tx.send(SessionEvent::Stream {
                    generation,
                    event: StreamEvent::Closed(CloseReason::Abnormal(
                        "stream ended without close".to_string(),
                    )),
                });
            });
        }

        tracing::info!("Opened live subscription for test station {}", device_id);
        self.subscription = Some(subscription);
        self.state.stream = StreamStatus::Connecting;
    }

    fn close_subscription(&mut self) {
        if let Some(mut subscription) = self.subscription.take() {
            subscription.close();
            self.state.stream = StreamStatus::Closed(CloseReason::Normal);
        }
    }

    fn fetch_default_borders(&self, device_id: DeviceId) {
        let generation = self.generation;
        let gateway = self.deps.devices.clone();
        self.spawn_call(async move {
            let result = gateway.default_borders(device_id).await;
            SessionEvent::DefaultBordersLoaded {
                generation,
                device_id,
                result,
            }
        });
    }

    /// Invalidate every pending device-scoped response
    fn bump_generation(&mut self) {
        self.generation += 1;
        let catalog = self.state.in_flight;
        self.state.in_flight = InFlight {
            devices: catalog.devices,
            machine_types: catalog.machine_types,
            ..InFlight::default()
        };
        self.state.stop_after_start = false;
    }

    fn clear_measurements(&mut self) {
        self.state.first.clear();
        self.state.current.clear();
        self.state.last.clear();
        self.state.difference.clear();
        self.state.out_of_range.clear();
        self.state.warmed_up = false;
    }

    fn reevaluate(&mut self) {
        if self.state.current.is_empty() {
            return;
        }
        let fresh = self.evaluator.evaluate(
            &self.state.current,
            &self.state.borders,
            self.clock.elapsed_seconds(),
            self.state.selected_machine_type.is_some(),
        );
        if self.evaluator.apply(&mut self.state.out_of_range, fresh) {
            tracing::debug!(
                "Out-of-range state changed, {} key(s) flagged",
                self.state.out_of_range.len()
            );
        }
    }

    fn known_borders(&self, borders: Borders) -> Borders {
        borders
            .into_iter()
            .filter(|(key, _)| self.deps.catalog.contains(key))
            .collect()
    }

    fn set_phase(&mut self, phase: SessionPhase) {
        if self.state.phase != phase {
            tracing::info!("Session {} -> {}", self.state.phase, phase);
            self.state.phase = phase;
        }
    }

    fn notify(&mut self, level: NoticeLevel, message: String) {
        match level {
            NoticeLevel::Error => tracing::error!("{}", message),
            NoticeLevel::Warning => tracing::warn!("{}", message),
            NoticeLevel::Info | NoticeLevel::Success => tracing::info!("{}", message),
        }
        self.state.notices.push_back(Notice {
            level,
            message,
            at: self.deps.time.now(),
        });
        while self.state.notices.len() > self.settings.notice_capacity {
            self.state.notices.pop_front();
        }
    }

    fn spawn_call<F>(&self, call: F)
    where
        F: Future<Output = SessionEvent> + Send + 'static,
    {
        let events = self.events.clone();
        tokio::spawn(async move {
            let event = call.await;
            if events.send(event).is_err() {
                tracing::debug!("Session queue closed, dropping gateway result");
            }
        });
    }
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("phase", &self.state.phase)
            .field("generation", &self.generation)
            .field("selected_device", &self.state.selected_device)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::live_stream::Outbound;
    use crate::application::session_clock::testing::ManualTimeSource;
    use crate::application::testing::{FakeGateway, FakeLiveStream, borders};
    use crate::domain::border::Border;
    use crate::domain::metric::{MetricClass, MetricDefinition, MetricGroup, MetricKey};
    use crate::domain::range::OutOfRange;
    use chrono::{DateTime, Utc};
    use tokio::time::timeout;

    const D1: DeviceId = DeviceId(1);
    const D2: DeviceId = DeviceId(2);

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_700_000_000_000).unwrap()
    }

    fn at(millis: i64) -> DateTime<Utc> {
        t0() + chrono::Duration::milliseconds(millis)
    }

    fn gas() -> MetricKey {
        "GAS".into()
    }

    fn snapshot(entries: &[(&str, f64)]) -> Snapshot {
        entries.iter().map(|(k, v)| ((*k).into(), *v)).collect()
    }

    fn catalog() -> Arc<MetricCatalog> {
        let mut definitions = MetricCatalog::builtin().definitions().to_vec();
        definitions.push(MetricDefinition::new(
            "GAS",
            MetricGroup::Gas,
            MetricClass::Instantaneous,
        ));
        Arc::new(MetricCatalog::new(definitions))
    }

    fn test_settings() -> SessionSettings {
        SessionSettings {
            tick_interval: Duration::from_secs(3600),
            catalog_retry: RetryPolicy {
                attempts: 1,
                delay: Duration::from_millis(1),
            },
            ..SessionSettings::default()
        }
    }

    fn stopped_at(millis: i64, last: &[(&str, f64)]) -> GatewayResult<StoppedMeasurement> {
        Ok(StoppedMeasurement {
            last_snapshot: snapshot(last),
            start_instant: None,
            end_instant: at(millis),
        })
    }

    struct Harness {
        controller: SessionController,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        gateway: Arc<FakeGateway>,
        stream: Arc<FakeLiveStream>,
        time: Arc<ManualTimeSource>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_settings(test_settings())
        }

        fn with_settings(settings: SessionSettings) -> Self {
            let gateway = Arc::new(FakeGateway::default());
            *gateway.devices.lock().unwrap() =
                vec![Device::new(1, "Station 1"), Device::new(2, "Station 2")];
            *gateway.machine_types.lock().unwrap() = vec![MachineType::new("M1")];
            gateway
                .default_borders
                .lock()
                .unwrap()
                .insert(D1, borders(&[("GAS", Some(10.0), Some(50.0))]));
            gateway.machine_borders.lock().unwrap().insert(
                MachineType::new("M1"),
                borders(&[("GAS", Some(12.0), Some(48.0))]),
            );
            {
                let mut statuses = gateway.product_status.lock().unwrap();
                statuses.insert("4711".to_string(), 20);
                statuses.insert("4712".to_string(), 10);
            }

            let stream = Arc::new(FakeLiveStream::default());
            let time = ManualTimeSource::at(t0());
            let (tx, rx) = mpsc::unbounded_channel();
            let deps = SessionDependencies {
                devices: gateway.clone(),
                measurements: gateway.clone(),
                live_stream: stream.clone(),
                time: time.clone(),
                catalog: catalog(),
            };

            Self {
                controller: SessionController::new(deps, settings, tx),
                events: rx,
                gateway,
                stream,
                time,
            }
        }

        /// Catalog loaded, D1 selected with an open stream, M1 chosen, serial 4711 checked
        async fn configured() -> Self {
            let mut h = Self::new();
            h.prepare().await;
            h
        }

        async fn running() -> Self {
            let mut h = Self::configured().await;
            h.start().await;
            h
        }

        async fn prepare(&mut self) {
            self.act(SessionAction::RefreshCatalog).unwrap();
            self.settle().await;
            self.act(SessionAction::SelectDevice(D1)).unwrap();
            self.settle().await;
            self.push(StreamEvent::Opened).await;
            self.act(SessionAction::SelectMachineType(MachineType::new("M1")))
                .unwrap();
            self.settle().await;
            self.act(SessionAction::SetSerialNumber("4711".to_string()))
                .unwrap();
            self.act(SessionAction::CheckStatus).unwrap();
            self.settle().await;
        }

        async fn start(&mut self) {
            self.gateway
                .starts
                .lock()
                .unwrap()
                .push_back(Ok(StartedMeasurement {
                    initial_snapshot: snapshot(&[("GAS", 20.0)]),
                    start_instant: t0(),
                }));
            self.act(SessionAction::StartTask).unwrap();
            self.settle().await;
        }

        fn act(&mut self, action: SessionAction) -> Result<(), SessionError> {
            self.controller.dispatch(action)
        }

        async fn settle(&mut self) {
            while let Ok(Some(event)) =
                timeout(Duration::from_millis(50), self.events.recv()).await
            {
                self.controller.handle(event);
            }
        }

        async fn push(&mut self, event: StreamEvent) {
            self.stream.push(event);
            self.settle().await;
        }

        async fn metrics(&mut self, entries: &[(&str, f64)]) {
            self.push(StreamEvent::Message(InboundMessage::Metrics(MetricUpdate {
                values: snapshot(entries),
                difference: None,
            })))
            .await;
        }

        fn view(&self) -> SessionView {
            self.controller.view()
        }

        fn last_notice(&self) -> Notice {
            self.view().notices.last().cloned().expect("no notice")
        }
    }

    #[tokio::test]
    async fn test_full_measurement_cycle() {
        let mut h = Harness::running().await;

        let view = h.view();
        assert_eq!(view.phase, SessionPhase::Running);
        assert_eq!(view.first.get(&gas()), Some(20.0));
        assert_eq!(view.clock.start_instant, Some(t0()));
        assert_eq!(view.active_borders[&gas()], Border::new(Some(12.0), None, Some(48.0)));

        h.metrics(&[("GAS", 11.0)]).await;
        assert_eq!(
            h.view().out_of_range.get(&gas()),
            Some(OutOfRange { min: true, max: false })
        );

        h.metrics(&[("GAS", 40.0)]).await;
        let view = h.view();
        assert_eq!(view.current.get(&gas()), Some(40.0));
        assert_eq!(
            view.out_of_range.get(&gas()),
            Some(OutOfRange { min: true, max: false })
        );

        h.gateway
            .stops
            .lock()
            .unwrap()
            .push_back(stopped_at(300_000, &[("GAS", 40.0)]));
        h.time.set(at(301_500));
        h.act(SessionAction::StopTask).unwrap();
        h.settle().await;

        let view = h.view();
        assert_eq!(view.phase, SessionPhase::Stopped);
        assert!(view.stopped);
        assert_eq!(view.clock.elapsed_seconds, 300);
        assert_eq!(view.clock.elapsed_display, "00:05:00");
        assert!(!view.clock.running);
        assert_eq!(view.last.get(&gas()), Some(40.0));
        assert!(h.stream.close_requested(0));

        h.act(SessionAction::Reset).unwrap();
        let view = h.view();
        assert_eq!(view.phase, SessionPhase::Idle);
        assert!(view.first.is_empty());
        assert!(view.current.is_empty());
        assert!(view.last.is_empty());
        assert!(view.out_of_range.is_empty());
        assert_eq!(view.selected_device, None);
        assert_eq!(view.clock.elapsed_seconds, 0);
        assert_eq!(view.devices.len(), 2);
        assert_eq!(view.machine_types, vec![MachineType::new("M1")]);
    }

    #[tokio::test]
    async fn test_open_stream_announces_device() {
        let h = Harness::configured().await;

        assert_eq!(
            h.stream.outbound(0),
            vec![Outbound::Payload(serde_json::json!({ "deviceId": 1 }))]
        );
        assert_eq!(h.view().stream, StreamStatus::Open);
    }

    #[tokio::test]
    async fn test_device_change_rejected_while_running() {
        let mut h = Harness::running().await;

        let result = h.act(SessionAction::SelectDevice(D2));

        assert_eq!(
            result,
            Err(SessionError::InvalidState {
                action: "change test station",
                phase: SessionPhase::Running,
            })
        );
        assert_eq!(h.stream.opened(), vec![D1]);
        assert_eq!(h.view().selected_device, Some(D1));
    }

    #[tokio::test]
    async fn test_device_change_discards_stale_responses() {
        let mut h = Harness::new();
        h.gateway
            .default_borders
            .lock()
            .unwrap()
            .insert(D2, borders(&[("GAS", Some(1.0), Some(2.0))]));
        h.act(SessionAction::RefreshCatalog).unwrap();
        h.settle().await;

        h.act(SessionAction::SelectDevice(D1)).unwrap();
        h.act(SessionAction::SelectDevice(D2)).unwrap();
        h.settle().await;

        assert_eq!(h.stream.opened(), vec![D1, D2]);
        assert!(h.stream.close_requested(0));
        assert_eq!(
            h.view().borders.defaults,
            borders(&[("GAS", Some(1.0), Some(2.0))])
        );

        // the abandoned subscription can no longer touch the session
        h.stream.push_to(0, StreamEvent::Opened);
        h.settle().await;
        assert_eq!(h.view().stream, StreamStatus::Connecting);
    }

    #[tokio::test]
    async fn test_reselecting_same_device_keeps_subscription() {
        let mut h = Harness::new();
        h.act(SessionAction::RefreshCatalog).unwrap();
        h.settle().await;

        h.act(SessionAction::SelectDevice(D1)).unwrap();
        h.act(SessionAction::SelectDevice(D1)).unwrap();
        h.settle().await;

        assert_eq!(h.stream.opened(), vec![D1]);
    }

    #[tokio::test]
    async fn test_unknown_device_rejected() {
        let mut h = Harness::new();
        h.act(SessionAction::RefreshCatalog).unwrap();
        h.settle().await;

        assert_eq!(
            h.act(SessionAction::SelectDevice(DeviceId(9))),
            Err(SessionError::UnknownDevice(DeviceId(9)))
        );
        assert_eq!(h.view().phase, SessionPhase::Idle);
    }

    #[tokio::test]
    async fn test_missing_default_borders_are_empty() {
        let mut h = Harness::new();
        h.act(SessionAction::RefreshCatalog).unwrap();
        h.settle().await;

        h.act(SessionAction::SelectDevice(D2)).unwrap();
        h.settle().await;

        assert!(h.view().borders.defaults.is_empty());
        assert_eq!(h.last_notice().level, NoticeLevel::Info);
    }

    #[tokio::test]
    async fn test_metrics_ignored_before_start() {
        let mut h = Harness::configured().await;

        h.metrics(&[("GAS", 5.0)]).await;

        let view = h.view();
        assert!(view.current.is_empty());
        assert!(view.out_of_range.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_metric_keys_dropped() {
        let mut h = Harness::running().await;

        h.metrics(&[("GAS", 30.0), ("FLUX_CAPACITOR", 1.21)]).await;

        let view = h.view();
        assert_eq!(view.current.len(), 1);
        assert_eq!(view.current.get(&gas()), Some(30.0));
    }

    #[tokio::test]
    async fn test_clearing_policy_drops_recovered_flags() {
        let mut h = Harness::with_settings(SessionSettings {
            out_of_range_policy: OutOfRangePolicy::Clearing,
            ..test_settings()
        });
        h.prepare().await;
        h.start().await;

        h.metrics(&[("GAS", 11.0)]).await;
        assert!(h.view().out_of_range.get(&gas()).is_some());

        h.metrics(&[("GAS", 40.0)]).await;
        assert!(h.view().out_of_range.is_empty());
    }

    #[tokio::test]
    async fn test_difference_applies_to_counters_only() {
        let mut h = Harness::running().await;

        for key in ["GAS_METER", "GAS"] {
            h.push(StreamEvent::Message(InboundMessage::Metrics(MetricUpdate {
                values: snapshot(&[(key, 1.25)]),
                difference: Some(key.into()),
            })))
            .await;
        }

        let view = h.view();
        assert_eq!(view.difference.get(&"GAS_METER".into()), Some(1.25));
        assert_eq!(view.difference.get(&gas()), None);
        assert!(view.current.get(&"GAS_METER".into()).is_none());
    }

    #[tokio::test]
    async fn test_start_requires_passed_product_check() {
        let mut h = Harness::configured().await;
        h.act(SessionAction::SetSerialNumber("4712".to_string()))
            .unwrap();
        h.act(SessionAction::CheckStatus).unwrap();
        h.settle().await;

        let view = h.view();
        assert_eq!(view.product_status, Some(10));
        assert!(!view.product_check_passed);
        assert_eq!(
            h.act(SessionAction::StartTask),
            Err(SessionError::ProductCheckRequired)
        );
    }

    #[tokio::test]
    async fn test_serial_change_clears_product_check() {
        let mut h = Harness::configured().await;
        assert!(h.view().product_check_passed);

        h.act(SessionAction::SetSerialNumber("  999 ".to_string()))
            .unwrap();

        let view = h.view();
        assert_eq!(view.serial_number, "999");
        assert_eq!(view.product_status, None);
        assert!(!view.product_check_passed);
    }

    #[tokio::test]
    async fn test_start_requires_open_stream() {
        let mut h = Harness::new();
        h.act(SessionAction::RefreshCatalog).unwrap();
        h.settle().await;
        h.act(SessionAction::SelectDevice(D1)).unwrap();
        h.act(SessionAction::SetSerialNumber("4711".to_string()))
            .unwrap();
        h.act(SessionAction::CheckStatus).unwrap();
        h.settle().await;

        assert_eq!(
            h.act(SessionAction::StartTask),
            Err(SessionError::StreamNotOpen)
        );
    }

    #[tokio::test]
    async fn test_failed_start_returns_to_configuring() {
        let mut h = Harness::configured().await;

        h.act(SessionAction::StartTask).unwrap();
        assert_eq!(h.view().phase, SessionPhase::Armed);
        h.settle().await;

        let view = h.view();
        assert_eq!(view.phase, SessionPhase::Configuring);
        assert!(!view.clock.running);
        assert_eq!(h.last_notice().level, NoticeLevel::Error);
    }

    #[tokio::test]
    async fn test_auto_stop_after_limit() {
        let mut h = Harness::with_settings(SessionSettings {
            auto_stop_minutes: Some(1),
            ..test_settings()
        });
        h.prepare().await;
        h.start().await;
        h.gateway
            .stops
            .lock()
            .unwrap()
            .push_back(stopped_at(61_000, &[("GAS", 21.0)]));

        h.time.set(at(30_000));
        h.controller.handle(SessionEvent::Tick);
        h.settle().await;
        assert_eq!(h.gateway.count("stop"), 0);

        h.time.set(at(61_000));
        h.controller.handle(SessionEvent::Tick);
        h.settle().await;

        let view = h.view();
        assert_eq!(h.gateway.count("stop"), 1);
        assert_eq!(view.phase, SessionPhase::Stopped);
        assert_eq!(view.clock.elapsed_seconds, 61);
    }

    #[tokio::test]
    async fn test_backend_end_time_stops_session() {
        let mut h = Harness::running().await;

        h.push(StreamEvent::Message(InboundMessage::Lifecycle(
            LifecycleMessage {
                last_data: Some(snapshot(&[("GAS", 33.0)])),
                end_time: Some(at(120_000)),
                ..LifecycleMessage::default()
            },
        )))
        .await;

        let view = h.view();
        assert_eq!(view.phase, SessionPhase::Stopped);
        assert_eq!(view.clock.elapsed_seconds, 120);
        assert_eq!(view.last.get(&gas()), Some(33.0));
        assert_eq!(h.gateway.count("stop"), 0);
        assert!(h.stream.close_requested(0));
    }

    #[tokio::test]
    async fn test_end_time_without_last_data_fetches_it() {
        let mut h = Harness::running().await;
        h.gateway
            .stops
            .lock()
            .unwrap()
            .push_back(stopped_at(120_000, &[("GAS", 44.0)]));

        h.push(StreamEvent::Message(InboundMessage::Lifecycle(
            LifecycleMessage {
                end_time: Some(at(120_000)),
                ..LifecycleMessage::default()
            },
        )))
        .await;

        let view = h.view();
        assert_eq!(view.phase, SessionPhase::Stopped);
        assert_eq!(view.last.get(&gas()), Some(44.0));
        assert_eq!(h.gateway.count("stop"), 1);
    }

    #[tokio::test]
    async fn test_stop_polling_stops_measurement() {
        let mut h = Harness::running().await;
        h.gateway
            .stops
            .lock()
            .unwrap()
            .push_back(stopped_at(90_000, &[]));

        h.push(StreamEvent::Message(InboundMessage::Control(
            ControlMessage::StopPolling,
        )))
        .await;

        assert_eq!(h.view().phase, SessionPhase::Stopped);
        assert_eq!(h.gateway.count("stop"), 1);
    }

    #[tokio::test]
    async fn test_stream_loss_while_running_stops() {
        let mut h = Harness::running().await;
        h.gateway
            .stops
            .lock()
            .unwrap()
            .push_back(stopped_at(45_000, &[("GAS", 25.0)]));

        h.push(StreamEvent::Closed(CloseReason::Abnormal("1006".to_string())))
            .await;

        let view = h.view();
        assert_eq!(view.phase, SessionPhase::Stopped);
        assert_eq!(
            view.stream,
            StreamStatus::Closed(CloseReason::Abnormal("1006".to_string()))
        );
        assert_eq!(h.gateway.count("stop"), 1);
    }

    #[tokio::test]
    async fn test_failed_stop_still_freezes_clock() {
        let mut h = Harness::running().await;
        h.time.set(at(42_000));

        h.act(SessionAction::StopTask).unwrap();
        h.settle().await;

        let view = h.view();
        assert_eq!(view.phase, SessionPhase::Stopped);
        assert_eq!(view.clock.elapsed_seconds, 42);
        assert_eq!(h.last_notice().level, NoticeLevel::Error);
    }

    #[tokio::test]
    async fn test_stop_rejected_unless_running() {
        let mut h = Harness::configured().await;

        assert!(matches!(
            h.act(SessionAction::StopTask),
            Err(SessionError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_submit_without_matching_protocol() {
        let mut h = Harness::running().await;
        assert!(matches!(
            h.act(SessionAction::SubmitResult),
            Err(SessionError::InvalidState { .. })
        ));

        h.gateway
            .stops
            .lock()
            .unwrap()
            .push_back(stopped_at(10_000, &[]));
        h.act(SessionAction::StopTask).unwrap();
        h.settle().await;

        h.gateway
            .submits
            .lock()
            .unwrap()
            .push_back(Err(GatewayError::NoMatchingProtocol));
        h.act(SessionAction::SubmitResult).unwrap();
        h.settle().await;

        assert_eq!(h.gateway.count("submit 1"), 1);
        assert_eq!(h.last_notice().level, NoticeLevel::Warning);
    }

    #[tokio::test]
    async fn test_control_flags_follow_phase() {
        let mut h = Harness::configured().await;

        let controls = h.view().controls;
        assert!(controls.can_start);
        assert!(!controls.can_stop);
        assert!(controls.can_select_device);

        h.start().await;
        let controls = h.view().controls;
        assert!(!controls.can_start);
        assert!(controls.can_stop);
        assert!(!controls.can_select_device);
        assert!(!controls.can_reset);
    }

    #[tokio::test]
    async fn test_reset_rejected_while_running() {
        let mut h = Harness::running().await;

        assert!(h.act(SessionAction::Reset).is_err());
        assert_eq!(h.view().phase, SessionPhase::Running);
    }

    #[tokio::test]
    async fn test_notices_are_bounded() {
        let mut h = Harness::with_settings(SessionSettings {
            notice_capacity: 2,
            ..test_settings()
        });
        h.prepare().await;
        h.time.set(at(5_000));

        for n in 0..3 {
            h.push(StreamEvent::Message(InboundMessage::Error(ErrorMessage {
                error: format!("poll failed {}", n),
                retry: None,
            })))
            .await;
        }

        let notices = h.view().notices;
        assert_eq!(notices.len(), 2);
        assert_eq!(notices[1].message, "Live data error: poll failed 2");
        assert_eq!(notices[1].at, at(5_000));
    }

    fn efficiency() -> MetricKey {
        "ELECTRICAL_EFFICIENCY".into()
    }

    /// Running session whose machine type also bounds electrical efficiency
    async fn running_with_efficiency_border() -> Harness {
        let mut h = Harness::new();
        h.gateway.machine_borders.lock().unwrap().insert(
            MachineType::new("M1"),
            borders(&[
                ("GAS", Some(12.0), Some(48.0)),
                ("ELECTRICAL_EFFICIENCY", Some(30.0), Some(40.0)),
            ]),
        );
        h.prepare().await;
        h.start().await;
        h
    }

    #[tokio::test]
    async fn test_steady_efficiency_flagged_when_warmup_elapses() {
        let mut h = running_with_efficiency_border().await;

        h.time.set(at(1_199_000));
        h.metrics(&[("ELECTRICAL_EFFICIENCY", 12.0)]).await;
        h.controller.handle(SessionEvent::Tick);
        assert!(h.view().out_of_range.get(&efficiency()).is_none());

        h.time.set(at(1_200_000));
        h.controller.handle(SessionEvent::Tick);

        assert_eq!(
            h.view().out_of_range.get(&efficiency()),
            Some(OutOfRange { min: true, max: false })
        );
    }

    #[tokio::test]
    async fn test_repeated_value_does_not_reevaluate() {
        let mut h = running_with_efficiency_border().await;
        h.time.set(at(1_199_000));
        h.metrics(&[("GAS", 30.0), ("ELECTRICAL_EFFICIENCY", 12.0)]).await;
        let before = h.view().out_of_range;

        // past the warm-up, but nothing changed and no tick arrived
        h.time.set(at(1_200_000));
        h.metrics(&[("GAS", 30.0), ("ELECTRICAL_EFFICIENCY", 12.0)]).await;

        let view = h.view();
        assert!(before.is_empty());
        assert_eq!(view.out_of_range, before);
        assert_eq!(view.current.get(&efficiency()), Some(12.0));
    }

    #[tokio::test]
    async fn test_device_change_after_stop_clears_measurements() {
        let mut h = Harness::running().await;
        h.metrics(&[("GAS", 11.0)]).await;
        h.push(StreamEvent::Message(InboundMessage::Metrics(MetricUpdate {
            values: snapshot(&[("GAS_METER", 0.5)]),
            difference: Some("GAS_METER".into()),
        })))
        .await;
        h.gateway
            .stops
            .lock()
            .unwrap()
            .push_back(stopped_at(60_000, &[("GAS", 11.0)]));
        h.act(SessionAction::StopTask).unwrap();
        h.settle().await;

        let view = h.view();
        assert_eq!(view.phase, SessionPhase::Stopped);
        assert!(!view.first.is_empty());
        assert!(!view.current.is_empty());
        assert!(!view.last.is_empty());
        assert!(!view.difference.is_empty());
        assert!(!view.out_of_range.is_empty());

        h.act(SessionAction::SelectDevice(D2)).unwrap();
        h.settle().await;

        let view = h.view();
        assert_eq!(view.phase, SessionPhase::DeviceSelected);
        assert_eq!(view.selected_device, Some(D2));
        assert!(view.first.is_empty());
        assert!(view.current.is_empty());
        assert!(view.last.is_empty());
        assert!(view.difference.is_empty());
        assert!(view.out_of_range.is_empty());
        assert_eq!(view.clock.elapsed_seconds, 0);
        assert!(h.stream.close_requested(0));
        assert_eq!(h.stream.opened(), vec![D1, D2]);
    }

    #[tokio::test]
    async fn test_reset_keeps_auto_stop_choice() {
        let mut h = Harness::configured().await;

        h.act(SessionAction::SetAutoStop(Some(5))).unwrap();
        h.act(SessionAction::Reset).unwrap();

        assert_eq!(h.view().auto_stop_minutes, Some(5));
    }

    #[tokio::test]
    async fn test_start_response_after_backend_end_sets_first() {
        let mut h = Harness::configured().await;
        h.gateway
            .starts
            .lock()
            .unwrap()
            .push_back(Ok(StartedMeasurement {
                initial_snapshot: snapshot(&[("GAS", 20.0)]),
                start_instant: t0(),
            }));

        h.act(SessionAction::StartTask).unwrap();
        // the backend ends the session before the start call is answered
        let generation = h.controller.generation;
        h.controller.handle(SessionEvent::Stream {
            generation,
            event: StreamEvent::Message(InboundMessage::Lifecycle(LifecycleMessage {
                last_data: Some(snapshot(&[("GAS", 25.0)])),
                end_time: Some(at(90_000)),
                ..LifecycleMessage::default()
            })),
        });
        assert_eq!(h.view().phase, SessionPhase::Stopped);
        h.settle().await;

        let view = h.view();
        assert_eq!(view.phase, SessionPhase::Stopped);
        assert_eq!(view.first.get(&gas()), Some(20.0));
        assert_eq!(view.last.get(&gas()), Some(25.0));
        assert_eq!(view.clock.elapsed_seconds, 90);
        assert_eq!(h.gateway.count("stop"), 0);
    }
}
