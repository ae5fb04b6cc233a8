// Live stream contract - One subscription per selected device
use crate::domain::device::DeviceId;
use crate::domain::message::InboundMessage;
use crate::domain::session::CloseReason;
use futures::stream::BoxStream;
use serde_json::Value;
use tokio::sync::mpsc;

/// What a subscription reports to the session
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Opened,
    Message(InboundMessage),
    /// Terminal; nothing follows a close
    Closed(CloseReason),
}

/// Requests from the session to the transport
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Payload(Value),
    Close,
}

/// Opens live data subscriptions keyed by device
pub trait LiveStream: Send + Sync {
    fn open(&self, device_id: DeviceId) -> Subscription;
}

/// Handle to one open subscription.
///
/// The event stream is handed out once; closing is idempotent.
pub struct Subscription {
    device_id: DeviceId,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    events: Option<BoxStream<'static, StreamEvent>>,
}

impl Subscription {
    pub fn new(
        device_id: DeviceId,
        outbound: mpsc::UnboundedSender<Outbound>,
        events: BoxStream<'static, StreamEvent>,
    ) -> Self {
        Self {
            device_id,
            outbound: Some(outbound),
            events: Some(events),
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn take_events(&mut self) -> Option<BoxStream<'static, StreamEvent>> {
        self.events.take()
    }

    /// Queue a payload for the transport. Returns false once the subscription is closed.
    pub fn send(&self, payload: Value) -> bool {
        match &self.outbound {
            Some(tx) => tx.send(Outbound::Payload(payload)).is_ok(),
            None => false,
        }
    }

    pub fn close(&mut self) {
        if let Some(tx) = self.outbound.take() {
            tracing::debug!("Closing live subscription for device {}", self.device_id);
            // the transport may already be gone
            let _ = tx.send(Outbound::Close);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.as_ref().is_none_or(|tx| tx.is_closed())
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("device_id", &self.device_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}
