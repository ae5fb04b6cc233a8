// HTTP gateway - reqwest adapter for the bench backend's REST API
use crate::application::gateway::{
    DeviceGateway, GatewayError, GatewayResult, MeasurementGateway, StartedMeasurement,
    StoppedMeasurement, SubmitReceipt,
};
use crate::domain::border::Borders;
use crate::domain::device::{Device, DeviceId, MachineType, ProductStatus};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct HttpGateway {
    base_url: String,
    client: Client,
}

impl HttpGateway {
    pub fn new(base_url: impl Into<String>, timeout: Option<Duration>) -> GatewayResult<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let base_url: String = base_url.into();

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: builder.build()?,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get(&self, path: &str) -> GatewayResult<Response> {
        let url = self.url(path);
        tracing::debug!("GET {}", url);
        Ok(self.client.get(&url).send().await?)
    }

    async fn post(&self, path: &str, body: Option<serde_json::Value>) -> GatewayResult<Response> {
        let url = self.url(path);
        tracing::debug!("POST {}", url);
        let request = self.client.post(&url);
        let request = match body {
            Some(body) => request.json(&body),
            None => request,
        };
        Ok(request.send().await?)
    }
}

/// Decode a successful body; 404 becomes `not_found`, other failures keep status and text
async fn decode<T: DeserializeOwned>(
    response: Response,
    not_found: impl FnOnce() -> GatewayError,
) -> GatewayResult<T> {
    match response.status() {
        status if status.is_success() => {
            let body = response.text().await?;
            serde_json::from_str(&body).map_err(|e| GatewayError::Decode(e.to_string()))
        }
        StatusCode::NOT_FOUND => Err(not_found()),
        status => {
            let message = response.text().await.unwrap_or_default();
            tracing::error!("Gateway returned {}: {}", status, message);
            Err(GatewayError::Status {
                status: status.as_u16(),
                message,
            })
        }
    }
}

fn unexpected_not_found(path: &str) -> impl FnOnce() -> GatewayError + '_ {
    move || GatewayError::Status {
        status: 404,
        message: format!("{} not found", path),
    }
}

#[async_trait]
impl DeviceGateway for HttpGateway {
    async fn list_devices(&self) -> GatewayResult<Vec<Device>> {
        let path = "/testStations";
        decode(self.get(path).await?, unexpected_not_found(path)).await
    }

    async fn list_machine_types(&self) -> GatewayResult<Vec<MachineType>> {
        let path = "/machine-types";
        decode(self.get(path).await?, unexpected_not_found(path)).await
    }

    async fn machine_type_borders(&self, machine_type: &MachineType) -> GatewayResult<Borders> {
        let path = format!(
            "/machine-types/{}",
            urlencoding::encode(machine_type.as_str())
        );
        let response = self.get(&path).await?;
        decode(response, || {
            GatewayError::NotFound(format!("borders for machine type {}", machine_type))
        })
        .await
    }

    async fn default_borders(&self, device_id: DeviceId) -> GatewayResult<Borders> {
        let path = format!("/testStations/{}/borders", device_id);
        let response = self.get(&path).await?;
        decode(response, || {
            GatewayError::NotFound(format!("default borders for test station {}", device_id))
        })
        .await
    }

    async fn product_status(&self, serial_number: &str) -> GatewayResult<ProductStatus> {
        let path = format!("/product/status/{}", urlencoding::encode(serial_number));
        let response = self.get(&path).await?;
        decode(response, || {
            GatewayError::NotFound(format!("product {}", serial_number))
        })
        .await
    }
}

#[async_trait]
impl MeasurementGateway for HttpGateway {
    async fn start_measurement(
        &self,
        device_id: DeviceId,
        serial_number: &str,
    ) -> GatewayResult<StartedMeasurement> {
        let path = format!("/testStations/{}/startMeasure", device_id);
        let body = json!({ "serialNumber": serial_number });
        let response = self.post(&path, Some(body)).await?;
        let started: StartedMeasurement = decode(response, unexpected_not_found(&path)).await?;
        tracing::info!(
            "Measurement started on test station {} at {}",
            device_id,
            started.start_instant
        );
        Ok(started)
    }

    async fn stop_measurement(&self, device_id: DeviceId) -> GatewayResult<StoppedMeasurement> {
        let path = format!("/testStations/{}/stopMeasure", device_id);
        let response = self.post(&path, None).await?;
        let stopped: StoppedMeasurement = decode(response, unexpected_not_found(&path)).await?;
        tracing::info!(
            "Measurement stopped on test station {} at {}",
            device_id,
            stopped.end_instant
        );
        Ok(stopped)
    }

    async fn submit_result(&self, device_id: DeviceId) -> GatewayResult<SubmitReceipt> {
        let path = format!("/protocols/{}/submit", device_id);
        let response = self.post(&path, None).await?;
        if response.status().is_success() {
            // an empty body is a plain acknowledgement
            let body = response.text().await?;
            if body.trim().is_empty() {
                return Ok(SubmitReceipt::default());
            }
            return serde_json::from_str(&body).map_err(|e| GatewayError::Decode(e.to_string()));
        }
        decode(response, || GatewayError::NoMatchingProtocol).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::border::Border;
    use mockito::{Matcher, Server};

    fn gateway(server: &Server) -> HttpGateway {
        HttpGateway::new(format!("{}/api/", server.url()), None).unwrap()
    }

    #[tokio::test]
    async fn test_list_devices() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/api/testStations")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"[{"id": 1, "testStationName": "Prüfstand 1"}, {"id": 2, "testStationName": "Prüfstand 2"}]"#)
            .create_async()
            .await;

        let devices = gateway(&server).list_devices().await.unwrap();

        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0], Device::new(1, "Prüfstand 1"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_machine_type_borders() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/api/machine-types/ASV_20")
            .with_status(200)
            .with_body(r#"{"GAS_PRESSURE": {"min": 18.0, "soll": 20.0, "max": 25.0}}"#)
            .create_async()
            .await;

        let borders = gateway(&server)
            .machine_type_borders(&MachineType::new("ASV_20"))
            .await
            .unwrap();

        assert_eq!(
            borders[&"GAS_PRESSURE".into()],
            Border::new(Some(18.0), Some(20.0), Some(25.0))
        );
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_missing_default_borders() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/api/testStations/3/borders")
            .with_status(404)
            .create_async()
            .await;

        let result = gateway(&server).default_borders(DeviceId(3)).await;

        assert!(matches!(result, Err(GatewayError::NotFound(_))));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_product_status() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/api/product/status/SN-4711")
            .with_status(200)
            .with_body("20")
            .create_async()
            .await;

        let status = gateway(&server).product_status("SN-4711").await.unwrap();

        assert_eq!(status, 20);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_start_measurement_sends_serial() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/testStations/1/startMeasure")
            .match_body(Matcher::Json(serde_json::json!({"serialNumber": "4711"})))
            .with_status(200)
            .with_body(r#"{"initialData": {"GAS_METER": "12.50"}, "startTime": 1700000000000}"#)
            .create_async()
            .await;

        let started = gateway(&server)
            .start_measurement(DeviceId(1), "4711")
            .await
            .unwrap();

        assert_eq!(started.start_instant.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(started.initial_snapshot.get(&"GAS_METER".into()), Some(12.5));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_stop_measurement() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/testStations/1/stopMeasure")
            .with_status(200)
            .with_body(
                r#"{"lastData": {"GAS_METER": 14.0}, "startTime": 1700000000000, "endTime": 1700000300000}"#,
            )
            .create_async()
            .await;

        let stopped = gateway(&server).stop_measurement(DeviceId(1)).await.unwrap();

        assert_eq!(stopped.end_instant.timestamp_millis(), 1_700_000_300_000);
        assert_eq!(
            stopped.start_instant.map(|t| t.timestamp_millis()),
            Some(1_700_000_000_000)
        );
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_error_keeps_status() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/testStations/1/stopMeasure")
            .with_status(503)
            .with_body("modbus timeout")
            .create_async()
            .await;

        let result = gateway(&server).stop_measurement(DeviceId(1)).await;

        match result {
            Err(e @ GatewayError::Status { status: 503, .. }) => assert!(e.is_transient()),
            other => panic!("unexpected result: {:?}", other),
        }
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_submit_without_protocol() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/protocols/1/submit")
            .with_status(404)
            .create_async()
            .await;

        let result = gateway(&server).submit_result(DeviceId(1)).await;

        assert!(matches!(result, Err(GatewayError::NoMatchingProtocol)));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_submit_receipt() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/protocols/2/submit")
            .with_status(200)
            .with_body(r#"{"message": "Protokoll 88 aktualisiert"}"#)
            .create_async()
            .await;

        let receipt = gateway(&server).submit_result(DeviceId(2)).await.unwrap();

        assert_eq!(receipt.message.as_deref(), Some("Protokoll 88 aktualisiert"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_malformed_body_is_decode_error() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/machine-types")
            .with_status(200)
            .with_body("<html>")
            .create_async()
            .await;

        let result = gateway(&server).list_machine_types().await;

        assert!(matches!(result, Err(GatewayError::Decode(_))));
    }
}
