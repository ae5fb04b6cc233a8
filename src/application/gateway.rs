// Gateway traits - Device/config and measurement operations of the bench backend
use crate::domain::border::Borders;
use crate::domain::device::{Device, DeviceId, MachineType, ProductStatus};
use crate::domain::metric::Snapshot;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Gateway returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("No matching protocol to submit")]
    NoMatchingProtocol,

    #[error("Invalid gateway response: {0}")]
    Decode(String),
}

impl GatewayError {
    /// Transport-level failures are worth retrying, answers from the backend are not
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::Http(e) => !e.is_decode(),
            GatewayError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StartedMeasurement {
    #[serde(rename = "initialData", default)]
    pub initial_snapshot: Snapshot,
    #[serde(rename = "startTime", with = "chrono::serde::ts_milliseconds")]
    pub start_instant: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StoppedMeasurement {
    #[serde(rename = "lastData", default)]
    pub last_snapshot: Snapshot,
    #[serde(rename = "startTime", default, with = "chrono::serde::ts_milliseconds_option")]
    pub start_instant: Option<DateTime<Utc>>,
    #[serde(rename = "endTime", with = "chrono::serde::ts_milliseconds")]
    pub end_instant: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SubmitReceipt {
    #[serde(default)]
    pub message: Option<String>,
}

#[async_trait]
pub trait DeviceGateway: Send + Sync {
    /// List all test stations
    async fn list_devices(&self) -> GatewayResult<Vec<Device>>;

    /// List machine types that carry their own borders
    async fn list_machine_types(&self) -> GatewayResult<Vec<MachineType>>;

    async fn machine_type_borders(&self, machine_type: &MachineType) -> GatewayResult<Borders>;

    async fn default_borders(&self, device_id: DeviceId) -> GatewayResult<Borders>;

    async fn product_status(&self, serial_number: &str) -> GatewayResult<ProductStatus>;
}

#[async_trait]
pub trait MeasurementGateway: Send + Sync {
    async fn start_measurement(
        &self,
        device_id: DeviceId,
        serial_number: &str,
    ) -> GatewayResult<StartedMeasurement>;

    async fn stop_measurement(&self, device_id: DeviceId) -> GatewayResult<StoppedMeasurement>;

    /// Transfer the finished session into the production protocol
    async fn submit_result(&self, device_id: DeviceId) -> GatewayResult<SubmitReceipt>;
}

/// Fixed-delay retry with a capped attempt count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> GatewayResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= self.attempts.max(1) || !e.is_transient() => {
                    tracing::error!("{} failed after {} attempt(s): {}", what, attempt, e);
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(
                        "{} failed (attempt {}/{}): {}. Retrying in {:?}",
                        what,
                        attempt,
                        self.attempts,
                        e,
                        self.delay
                    );
                    tokio::time::sleep(self.delay).await;
                }
            }
        }
    }
}
