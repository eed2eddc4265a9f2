//! HTTP/JSON client for the backend device-control service.
//!
//! Endpoints live under `{base_url}/api/{matrix|vna}/`. HTTP 4xx replies carry
//! a regular `{ success: false, message }` body and are decoded as such; 5xx
//! replies and network failures become [`TransportError`]s. The result export
//! endpoint answers with a zip body on success instead of JSON.

use super::{
    Ack, CommandReply, ConnectParams, DeviceApi, ExportReply, InstrumentClass,
    MeasurementStatus, MixerConfigReply, StartMeasurementReply, StartMeasurementRequest,
    StatusReport,
};
use crate::error::TransportError;
use crate::measurement::MeasurementResult;
use crate::protocol::{CommandString, MixerWire};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::trace;

/// `/api/matrix/status` body.
#[derive(Debug, Deserialize)]
struct RawMatrixStatus {
    connected: bool,
    #[serde(default)]
    port: Option<String>,
    #[serde(default)]
    baudrate: Option<u32>,
    #[serde(default)]
    device_ip: Option<String>,
    #[serde(default)]
    device_port: Option<u16>,
}

impl From<RawMatrixStatus> for StatusReport {
    fn from(raw: RawMatrixStatus) -> Self {
        StatusReport {
            connected: raw.connected,
            device_type: None,
            address: raw.device_ip,
            port: raw.device_port,
            serial_port: raw.port,
            baud_rate: raw.baudrate,
        }
    }
}

/// `/api/vna/status` body.
#[derive(Debug, Deserialize)]
struct RawVnaStatus {
    connected: bool,
    #[serde(default, rename = "type")]
    device_type: Option<String>,
    #[serde(default)]
    ip_address: Option<String>,
    #[serde(default)]
    port: Option<u16>,
}

impl From<RawVnaStatus> for StatusReport {
    fn from(raw: RawVnaStatus) -> Self {
        StatusReport {
            connected: raw.connected,
            device_type: raw.device_type,
            address: raw.ip_address,
            port: raw.port,
            serial_port: None,
            baud_rate: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawPorts {
    #[serde(default)]
    ports: Vec<String>,
}

fn connect_body(class: InstrumentClass, params: &ConnectParams) -> serde_json::Value {
    match (class, params) {
        (InstrumentClass::Vna, ConnectParams::Network { host, port, device }) => json!({
            "device_type": device.map(|d| d.id()),
            "ip_address": host,
            "port": port,
        }),
        (_, ConnectParams::Network { host, port, .. }) => json!({
            "type": "network",
            "ip": host,
            "port": port,
        }),
        (_, ConnectParams::Serial {
            port_name,
            baud_rate,
        }) => json!({
            "type": "serial",
            "port": port_name,
            "baudrate": baud_rate,
        }),
    }
}

/// [`DeviceApi`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpDeviceApi {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpDeviceApi {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Unreachable(format!("http client setup failed: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, class: InstrumentClass, endpoint: &str) -> String {
        format!("{}/api/{}/{}", self.base_url, class.path(), endpoint)
    }

    fn map_error(&self, error: reqwest::Error) -> TransportError {
        if error.is_timeout() {
            TransportError::Timeout(self.timeout)
        } else if error.is_decode() {
            TransportError::Decode(error.to_string())
        } else {
            TransportError::Unreachable(error.to_string())
        }
    }

    async fn decode<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, TransportError> {
        let status = response.status();
        let body = response.text().await.map_err(|e| self.map_error(e))?;
        trace!(%status, body = %body, "backend reply");

        if status.is_server_error() {
            let message = serde_json::from_str::<Ack>(&body)
                .ok()
                .and_then(|ack| ack.message)
                .unwrap_or(body);
            return Err(TransportError::Server {
                status: status.as_u16(),
                message,
            });
        }

        serde_json::from_str(&body).map_err(|e| {
            if status.is_success() {
                TransportError::Decode(e.to_string())
            } else {
                TransportError::Server {
                    status: status.as_u16(),
                    message: body.clone(),
                }
            }
        })
    }

    /// Binary body on success, `{ success: false, message }` otherwise.
    async fn decode_archive(
        &self,
        response: reqwest::Response,
    ) -> Result<ExportReply, TransportError> {
        let status = response.status();
        if status.is_success() {
            let archive = response.bytes().await.map_err(|e| self.map_error(e))?;
            trace!(%status, bytes = archive.len(), "backend archive");
            return Ok(ExportReply {
                success: true,
                archive: archive.to_vec(),
                message: None,
            });
        }
        let ack: Ack = self.decode(response).await?;
        Ok(ExportReply {
            success: false,
            archive: Vec::new(),
            message: ack.message,
        })
    }

    async fn get<T: DeserializeOwned>(&self, url: String) -> Result<T, TransportError> {
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;
        self.decode(response).await
    }

    async fn post<B, T>(&self, url: String, body: &B) -> Result<T, TransportError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;
        self.decode(response).await
    }
}

#[async_trait]
impl DeviceApi for HttpDeviceApi {
    async fn status(&self, class: InstrumentClass) -> Result<StatusReport, TransportError> {
        let url = self.url(class, "status");
        Ok(match class {
            InstrumentClass::Matrix => self.get::<RawMatrixStatus>(url).await?.into(),
            InstrumentClass::Vna => self.get::<RawVnaStatus>(url).await?.into(),
        })
    }

    async fn connect(
        &self,
        class: InstrumentClass,
        params: &ConnectParams,
    ) -> Result<Ack, TransportError> {
        self.post(self.url(class, "connect"), &connect_body(class, params))
            .await
    }

    async fn disconnect(&self, class: InstrumentClass) -> Result<Ack, TransportError> {
        self.post(self.url(class, "disconnect"), &json!({})).await
    }

    async fn command(
        &self,
        class: InstrumentClass,
        command: &CommandString,
    ) -> Result<CommandReply, TransportError> {
        self.post(
            self.url(class, "command"),
            &json!({ "command": command.as_str() }),
        )
        .await
    }

    async fn serial_ports(&self) -> Result<Vec<String>, TransportError> {
        let raw: RawPorts = self.get(self.url(InstrumentClass::Matrix, "ports")).await?;
        Ok(raw.ports)
    }

    async fn start_measurement(
        &self,
        request: &StartMeasurementRequest,
    ) -> Result<StartMeasurementReply, TransportError> {
        self.post(self.url(InstrumentClass::Vna, "start-measurement"), request)
            .await
    }

    async fn stop_measurement(&self) -> Result<Ack, TransportError> {
        self.post(self.url(InstrumentClass::Vna, "stop-measurement"), &json!({}))
            .await
    }

    async fn measurement_status(&self) -> Result<MeasurementStatus, TransportError> {
        self.get(self.url(InstrumentClass::Vna, "measurement-status"))
            .await
    }

    async fn get_mixer_config(&self) -> Result<MixerConfigReply, TransportError> {
        self.get(self.url(InstrumentClass::Vna, "mixer-config")).await
    }

    async fn set_mixer_config(
        &self,
        config: &MixerWire,
    ) -> Result<MixerConfigReply, TransportError> {
        self.post(self.url(InstrumentClass::Vna, "mixer-config"), config)
            .await
    }

    async fn export_results(
        &self,
        results: &[MeasurementResult],
    ) -> Result<ExportReply, TransportError> {
        let response = self
            .client
            .post(self.url(InstrumentClass::Vna, "export-data"))
            .json(&json!({ "results": results }))
            .send()
            .await
            .map_err(|e| self.map_error(e))?;
        self.decode_archive(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::VnaDevice;

    #[test]
    fn test_matrix_status_normalization() {
        let raw: RawMatrixStatus = serde_json::from_value(json!({
            "connected": true,
            "connection_type": "network",
            "device_ip": "192.168.2.11",
            "device_port": 5025,
            "timestamp": "2025-01-01T00:00:00"
        }))
        .unwrap();
        let report = StatusReport::from(raw);
        assert!(report.connected);
        assert_eq!(report.address.as_deref(), Some("192.168.2.11"));
        assert_eq!(report.port, Some(5025));
        assert_eq!(report.serial_port, None);
    }

    #[test]
    fn test_vna_status_normalization() {
        let raw: RawVnaStatus = serde_json::from_value(json!({
            "connected": true,
            "type": "rohde-zna26",
            "ip_address": "192.168.1.100",
            "port": 5025,
            "idn": "Rohde-Schwarz,ZNA26"
        }))
        .unwrap();
        let report = StatusReport::from(raw);
        assert_eq!(report.device_type.as_deref(), Some("rohde-zna26"));

        let raw: RawVnaStatus =
            serde_json::from_value(json!({ "connected": false, "message": "not connected" }))
                .unwrap();
        assert_eq!(StatusReport::from(raw), StatusReport::disconnected());
    }

    #[test]
    fn test_connect_bodies() {
        let body = connect_body(
            InstrumentClass::Matrix,
            &ConnectParams::serial("COM3", 115200),
        );
        assert_eq!(body, json!({ "type": "serial", "port": "COM3", "baudrate": 115200 }));

        let body = connect_body(
            InstrumentClass::Vna,
            &ConnectParams::vna(VnaDevice::Siyi3674L, "192.168.1.100", 5025),
        );
        assert_eq!(body["device_type"], "siyi-3674l");
        assert_eq!(body["ip_address"], "192.168.1.100");
    }

    #[test]
    fn test_export_body_uses_backend_field_names() {
        let results = vec![MeasurementResult {
            parameter: "S21".into(),
            measurements_taken: 3,
            artifact_path: "results/2025-01-01_10-00-00/S21.csv".into(),
        }];
        let body = json!({ "results": results });
        assert_eq!(
            body,
            json!({ "results": [{
                "parameter": "S21",
                "measurements": 3,
                "filename": "results/2025-01-01_10-00-00/S21.csv"
            }] })
        );
    }

    #[test]
    fn test_urls() {
        let api = HttpDeviceApi::new("http://127.0.0.1:5000/", Duration::from_secs(1)).unwrap();
        assert_eq!(
            api.url(InstrumentClass::Vna, "measurement-status"),
            "http://127.0.0.1:5000/api/vna/measurement-status"
        );
    }
}
