// Session runtime - Single task owning the controller, fed by command and event channels
use crate::application::session_controller::{
    SessionAction, SessionController, SessionDependencies, SessionError, SessionEvent,
    SessionSettings,
};
use crate::domain::device::{DeviceId, MachineType};
use crate::domain::session::SessionView;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

enum SessionCommand {
    Dispatch {
        action: SessionAction,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Shutdown,
}

pub struct SessionRuntime;

impl SessionRuntime {
    /// Spawn the session task and start loading the device catalog
    pub fn spawn(
        deps: SessionDependencies,
        settings: SessionSettings,
    ) -> (SessionHandle, JoinHandle<()>) {
        let (events_tx, mut events) = mpsc::unbounded_channel::<SessionEvent>();
        let (commands_tx, mut commands) = mpsc::unbounded_channel::<SessionCommand>();

        let mut controller = SessionController::new(deps, settings, events_tx);
        if let Err(e) = controller.dispatch(SessionAction::RefreshCatalog) {
            tracing::warn!("Initial catalog load not started: {}", e);
        }
        let (view_tx, view_rx) = watch::channel(controller.view());

        let task = tokio::spawn(async move {
            tracing::info!("Session runtime started");
            loop {
                tokio::select! {
                    command = commands.recv() => match command {
                        Some(SessionCommand::Dispatch { action, reply }) => {
                            tracing::debug!("Action: {:?}", action);
                            let result = controller.dispatch(action);
                            publish(&view_tx, &controller);
                            let _ = reply.send(result);
                        }
                        Some(SessionCommand::Shutdown) | None => break,
                    },
                    Some(event) = events.recv() => {
                        controller.handle(event);
                        publish(&view_tx, &controller);
                    }
                }
            }
            controller.shutdown();
            publish(&view_tx, &controller);
            tracing::info!("Session runtime stopped");
        });

        let handle = SessionHandle {
            commands: commands_tx,
            view: view_rx,
        };
        (handle, task)
    }
}

fn publish(view_tx: &watch::Sender<SessionView>, controller: &SessionController) {
    let next = controller.view();
    view_tx.send_if_modified(|current| {
        if *current == next {
            false
        } else {
            *current = next;
            true
        }
    });
}

/// Cloneable front door to a running session
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    view: watch::Receiver<SessionView>,
}

impl SessionHandle {
    /// Queue an action and wait until the session has applied or rejected it
    pub async fn dispatch(&self, action: SessionAction) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Dispatch { action, reply })
            .map_err(|_| SessionError::RuntimeClosed)?;
        rx.await.map_err(|_| SessionError::RuntimeClosed)?
    }

    pub async fn refresh_catalog(&self) -> Result<(), SessionError> {
        self.dispatch(SessionAction::RefreshCatalog).await
    }

    pub async fn select_device(&self, device_id: DeviceId) -> Result<(), SessionError> {
        self.dispatch(SessionAction::SelectDevice(device_id)).await
    }

    pub async fn select_machine_type(&self, machine_type: MachineType) -> Result<(), SessionError> {
        self.dispatch(SessionAction::SelectMachineType(machine_type))
            .await
    }

    pub async fn set_serial_number(&self, serial: String) -> Result<(), SessionError> {
        self.dispatch(SessionAction::SetSerialNumber(serial)).await
    }

    pub async fn check_status(&self) -> Result<(), SessionError> {
        self.dispatch(SessionAction::CheckStatus).await
    }

    pub async fn set_auto_stop(&self, minutes: Option<u32>) -> Result<(), SessionError> {
        self.dispatch(SessionAction::SetAutoStop(minutes)).await
    }

    pub async fn start_task(&self) -> Result<(), SessionError> {
        self.dispatch(SessionAction::StartTask).await
    }

    pub async fn stop_task(&self) -> Result<(), SessionError> {
        self.dispatch(SessionAction::StopTask).await
    }

    pub async fn reset(&self) -> Result<(), SessionError> {
        self.dispatch(SessionAction::Reset).await
    }

    pub async fn submit_result(&self) -> Result<(), SessionError> {
        self.dispatch(SessionAction::SubmitResult).await
    }

    /// Latest published view
    pub fn view(&self) -> SessionView {
        self.view.borrow().clone()
    }

    /// Receiver that wakes on every published change
    pub fn watch(&self) -> watch::Receiver<SessionView> {
        self.view.clone()
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(SessionCommand::Shutdown);
    }
}
