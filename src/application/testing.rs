// In-memory gateways and live stream for driving the session in tests
use crate::application::gateway::{
    DeviceGateway, GatewayError, GatewayResult, MeasurementGateway, StartedMeasurement,
    StoppedMeasurement, SubmitReceipt,
};
use crate::application::live_stream::{LiveStream, Outbound, StreamEvent, Subscription};
use crate::domain::border::{Border, Borders};
use crate::domain::device::{Device, DeviceId, MachineType, ProductStatus};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

fn unscripted(call: &str) -> GatewayError {
    GatewayError::Status {
        status: 500,
        message: format!("no scripted response for {}", call),
    }
}

pub fn borders(entries: &[(&str, Option<f64>, Option<f64>)]) -> Borders {
    entries
        .iter()
        .map(|(key, min, max)| ((*key).into(), Border::new(*min, None, *max)))
        .collect()
}

/// Scripted backend. Lookups answer from maps; start/stop/submit pop queued results.
#[derive(Default)]
pub struct FakeGateway {
    pub devices: Mutex<Vec<Device>>,
    pub machine_types: Mutex<Vec<MachineType>>,
    pub default_borders: Mutex<HashMap<DeviceId, Borders>>,
    pub machine_borders: Mutex<HashMap<MachineType, Borders>>,
    pub product_status: Mutex<HashMap<String, ProductStatus>>,
    pub starts: Mutex<VecDeque<GatewayResult<StartedMeasurement>>>,
    pub stops: Mutex<VecDeque<GatewayResult<StoppedMeasurement>>>,
    pub submits: Mutex<VecDeque<GatewayResult<SubmitReceipt>>>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeGateway {
    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }
}

#[async_trait]
impl DeviceGateway for FakeGateway {
    async fn list_devices(&self) -> GatewayResult<Vec<Device>> {
        self.record("list_devices".to_string());
        Ok(self.devices.lock().unwrap().clone())
    }

    async fn list_machine_types(&self) -> GatewayResult<Vec<MachineType>> {
        self.record("list_machine_types".to_string());
        Ok(self.machine_types.lock().unwrap().clone())
    }

    async fn machine_type_borders(&self, machine_type: &MachineType) -> GatewayResult<Borders> {
        self.record(format!("machine_type_borders {}", machine_type));
        self.machine_borders
            .lock()
            .unwrap()
            .get(machine_type)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(machine_type.to_string()))
    }

    async fn default_borders(&self, device_id: DeviceId) -> GatewayResult<Borders> {
        self.record(format!("default_borders {}", device_id));
        self.default_borders
            .lock()
            .unwrap()
            .get(&device_id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(device_id.to_string()))
    }

    async fn product_status(&self, serial_number: &str) -> GatewayResult<ProductStatus> {
        self.record(format!("product_status {}", serial_number));
        self.product_status
            .lock()
            .unwrap()
            .get(serial_number)
            .copied()
            .ok_or_else(|| GatewayError::NotFound(serial_number.to_string()))
    }
}

#[async_trait]
impl MeasurementGateway for FakeGateway {
    async fn start_measurement(
        &self,
        device_id: DeviceId,
        serial_number: &str,
    ) -> GatewayResult<StartedMeasurement> {
        self.record(format!("start {} {}", device_id, serial_number));
        self.starts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(unscripted("start")))
    }

    async fn stop_measurement(&self, device_id: DeviceId) -> GatewayResult<StoppedMeasurement> {
        self.record(format!("stop {}", device_id));
        self.stops
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(unscripted("stop")))
    }

    async fn submit_result(&self, device_id: DeviceId) -> GatewayResult<SubmitReceipt> {
        self.record(format!("submit {}", device_id));
        self.submits
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(unscripted("submit")))
    }
}

/// One subscription handed out by [`FakeLiveStream`]
pub struct FakeChannel {
    pub device_id: DeviceId,
    events: mpsc::UnboundedSender<StreamEvent>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
}

impl FakeChannel {
    pub fn push(&self, event: StreamEvent) {
        let _ = self.events.send(event);
    }

    /// Everything the session sent since the last drain
    pub fn drain(&mut self) -> Vec<Outbound> {
        let mut sent = Vec::new();
        while let Ok(outbound) = self.outbound.try_recv() {
            sent.push(outbound);
        }
        sent
    }
}

#[derive(Default)]
pub struct FakeLiveStream {
    pub channels: Mutex<Vec<FakeChannel>>,
}

impl FakeLiveStream {
    pub fn opened(&self) -> Vec<DeviceId> {
        self.channels.lock().unwrap().iter().map(|c| c.device_id).collect()
    }

    /// Push an event on the most recently opened subscription
    pub fn push(&self, event: StreamEvent) {
        let channels = self.channels.lock().unwrap();
        channels.last().expect("no subscription opened").push(event);
    }

    pub fn push_to(&self, index: usize, event: StreamEvent) {
        self.channels.lock().unwrap()[index].push(event);
    }

    pub fn outbound(&self, index: usize) -> Vec<Outbound> {
        self.channels.lock().unwrap()[index].drain()
    }

    /// Whether the session asked the transport to close
    pub fn close_requested(&self, index: usize) -> bool {
        self.outbound(index).contains(&Outbound::Close)
    }
}

impl LiveStream for FakeLiveStream {
    fn open(&self, device_id: DeviceId) -> Subscription {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        self.channels.lock().unwrap().push(FakeChannel {
            device_id,
            events: event_tx,
            outbound: outbound_rx,
        });
        Subscription::new(
            device_id,
            outbound_tx,
            UnboundedReceiverStream::new(event_rx).boxed(),
        )
    }
}
