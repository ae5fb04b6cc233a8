// Live data channel - WebSocket transport behind the LiveStream contract
use crate::application::live_stream::{LiveStream, Outbound, StreamEvent, Subscription};
use crate::domain::device::DeviceId;
use crate::domain::message::decode_frame;
use crate::domain::session::CloseReason;
use futures::{SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message, error::ProtocolError};

#[derive(Debug, Clone)]
pub struct WsLiveStream {
    url: String,
}

impl WsLiveStream {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl LiveStream for WsLiveStream {
    fn open(&self, device_id: DeviceId) -> Subscription {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let events = channel_events(self.url.clone(), device_id, outbound_rx);
        Subscription::new(device_id, outbound_tx, events.boxed())
    }
}

enum Step {
    Outbound(Option<Outbound>),
    Frame(Option<Result<Message, WsError>>),
}

fn close_reason(frame: Option<CloseFrame>) -> CloseReason {
    match frame {
        None => CloseReason::Normal,
        Some(frame) if frame.code == CloseCode::Normal => CloseReason::Normal,
        Some(frame) => CloseReason::Abnormal(format!(
            "code {} {}",
            u16::from(frame.code),
            frame.reason.as_str()
        )),
    }
}

fn error_reason(error: WsError) -> CloseReason {
    match error {
        WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
            CloseReason::Abnormal("connection reset without close frame".to_string())
        }
        WsError::ConnectionClosed | WsError::AlreadyClosed => CloseReason::Normal,
        other => CloseReason::Error(other.to_string()),
    }
}

/// Connect, then relay outbound payloads and decoded frames until either side closes.
/// Always ends with exactly one `Closed`.
fn channel_events(
    url: String,
    device_id: DeviceId,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) -> impl Stream<Item = StreamEvent> + Send + 'static {
    async_stream::stream! {
        tracing::info!("Connecting live data channel {} for test station {}", url, device_id);
        let socket = match connect_async(url.as_str()).await {
            Ok((socket, _)) => socket,
            Err(e) => {
                tracing::warn!("Live data connection to {} failed: {}", url, e);
                yield StreamEvent::Closed(CloseReason::Error(e.to_string()));
                return;
            }
        };
        let (mut write, mut read) = socket.split();
        yield StreamEvent::Opened;

        loop {
            let step = tokio::select! {
                request = outbound.recv() => Step::Outbound(request),
                frame = read.next() => Step::Frame(frame),
            };

            match step {
                Step::Outbound(Some(Outbound::Payload(payload))) => {
                    if let Err(e) = write.send(Message::text(payload.to_string())).await {
                        yield StreamEvent::Closed(error_reason(e));
                        return;
                    }
                }
                Step::Outbound(Some(Outbound::Close)) | Step::Outbound(None) => {
                    tracing::debug!("Closing live data channel for test station {}", device_id);
                    // best effort; the peer may already be gone
                    let _ = write.send(Message::Close(None)).await;
                    yield StreamEvent::Closed(CloseReason::Normal);
                    return;
                }
                Step::Frame(Some(Ok(Message::Text(text)))) => match decode_frame(text.as_str()) {
                    Ok(messages) => {
                        for message in messages {
                            yield StreamEvent::Message(message);
                        }
                    }
                    Err(e) => tracing::warn!("Dropping undecodable live frame: {}", e),
                },
                Step::Frame(Some(Ok(Message::Close(frame)))) => {
                    let reason = close_reason(frame);
                    tracing::info!("Live data channel {}", reason);
                    yield StreamEvent::Closed(reason);
                    return;
                }
                Step::Frame(Some(Ok(Message::Binary(_)))) => {
                    tracing::debug!("Ignoring binary live frame");
                }
                Step::Frame(Some(Ok(_))) => {}
                Step::Frame(Some(Err(e))) => {
                    tracing::warn!("Live data channel error: {}", e);
                    yield StreamEvent::Closed(error_reason(e));
                    return;
                }
                Step::Frame(None) => {
                    yield StreamEvent::Closed(CloseReason::Abnormal(
                        "stream ended without close frame".to_string(),
                    ));
                    return;
                }
            }
        }
    }
}
