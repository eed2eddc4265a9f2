//! Request execution against the backend device-control service.
//!
//! [`DeviceApi`] is the seam to the backend: one async method per endpoint,
//! returning the backend's reply or a [`TransportError`]. The HTTP client in
//! [`http`] talks to the real service; [`mock`] provides a scriptable
//! implementation for tests and offline use.
//!
//! [`RequestGateway`] wraps a `DeviceApi` with the uniform policy every caller
//! relies on: a bounded timeout per request, `success: false` replies turned
//! into [`ConsoleError::Domain`], and transport failures kept distinct as
//! [`ConsoleError::Transport`]. The gateway owns no domain state.

pub mod http;
pub mod mock;

use crate::error::{ConsoleError, ConsoleResult, TransportError, ValidationError, ValidationErrors};
use crate::measurement::{MeasurementConfig, MeasurementResult, ParameterId};
use crate::protocol::{CommandString, MixerConfig, MixerVariant, MixerWire, VnaDevice};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Instrument category served by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentClass {
    Matrix,
    Vna,
}

impl InstrumentClass {
    /// Path segment under `/api/`.
    pub fn path(&self) -> &'static str {
        match self {
            InstrumentClass::Matrix => "matrix",
            InstrumentClass::Vna => "vna",
        }
    }
}

impl fmt::Display for InstrumentClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            InstrumentClass::Matrix => "matrix",
            InstrumentClass::Vna => "VNA",
        })
    }
}

/// Physical link to an instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Network,
    Serial,
}

/// Parameters of a connect request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectParams {
    Network {
        host: String,
        port: u16,
        /// VNA model; required when connecting a VNA.
        device: Option<VnaDevice>,
    },
    Serial {
        port_name: String,
        baud_rate: u32,
    },
}

impl ConnectParams {
    pub fn network(host: impl Into<String>, port: u16) -> Self {
        ConnectParams::Network {
            host: host.into(),
            port,
            device: None,
        }
    }

    pub fn vna(device: VnaDevice, host: impl Into<String>, port: u16) -> Self {
        ConnectParams::Network {
            host: host.into(),
            port,
            device: Some(device),
        }
    }

    pub fn serial(port_name: impl Into<String>, baud_rate: u32) -> Self {
        ConnectParams::Serial {
            port_name: port_name.into(),
            baud_rate,
        }
    }

    pub fn transport(&self) -> Transport {
        match self {
            ConnectParams::Network { .. } => Transport::Network,
            ConnectParams::Serial { .. } => Transport::Serial,
        }
    }

    /// `host:port` or `port-name@baud`.
    pub fn address(&self) -> String {
        match self {
            ConnectParams::Network { host, port, .. } => format!("{host}:{port}"),
            ConnectParams::Serial {
                port_name,
                baud_rate,
            } => format!("{port_name}@{baud_rate}"),
        }
    }

    /// Check the parameters are usable for `class`.
    ///
    /// VNAs are reached over the network only and need a device model.
    pub fn validate(&self, class: InstrumentClass) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::default();
        match self {
            ConnectParams::Network { host, port, device } => {
                if host.trim().is_empty() {
                    errors.push(ValidationError::MissingField("host"));
                }
                if *port == 0 {
                    errors.push(ValidationError::OutOfRange {
                        field: "port",
                        value: "0".to_string(),
                        allowed: "1..=65535".to_string(),
                    });
                }
                if class == InstrumentClass::Vna && device.is_none() {
                    errors.push(ValidationError::MissingField("device"));
                }
            }
            ConnectParams::Serial {
                port_name,
                baud_rate,
            } => {
                if class == InstrumentClass::Vna {
                    errors.push(ValidationError::OutOfRange {
                        field: "transport",
                        value: "serial".to_string(),
                        allowed: "network".to_string(),
                    });
                }
                if port_name.trim().is_empty() {
                    errors.push(ValidationError::MissingField("port_name"));
                }
                if *baud_rate == 0 {
                    errors.push(ValidationError::OutOfRange {
                        field: "baud_rate",
                        value: "0".to_string(),
                        allowed: "> 0".to_string(),
                    });
                }
            }
        }
        errors.into_result()
    }
}

/// Backend view of an instrument's connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub connected: bool,
    pub device_type: Option<String>,
    pub address: Option<String>,
    pub port: Option<u16>,
    pub serial_port: Option<String>,
    pub baud_rate: Option<u32>,
}

impl StatusReport {
    pub fn disconnected() -> Self {
        Self::default()
    }
}

/// Generic `{ success, message? }` reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}

impl Ack {
    pub fn ok() -> Self {
        Self {
            success: true,
            message: None,
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
        }
    }
}

/// Reply to a raw instrument command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandReply {
    pub success: bool,
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Body of a start-measurement request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartMeasurementRequest {
    pub device: Option<VnaDevice>,
    pub parameters: Vec<ParameterId>,
    pub measurement_count: u32,
    pub frequency_points: u32,
    pub start_frequency: f64,
    pub stop_frequency: f64,
}

impl StartMeasurementRequest {
    pub fn new(
        device: Option<VnaDevice>,
        parameters: Vec<ParameterId>,
        config: &MeasurementConfig,
    ) -> Self {
        Self {
            device,
            parameters,
            measurement_count: config.measurement_count,
            frequency_points: config.frequency_points,
            start_frequency: config.start_frequency_mhz,
            stop_frequency: config.stop_frequency_mhz,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartMeasurementReply {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub total_measurements: Option<u32>,
}

/// One measurement-status poll.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeasurementStatus {
    pub is_running: bool,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub current_measurement: u32,
    #[serde(default)]
    pub total_measurements: u32,
    #[serde(default)]
    pub results: Vec<MeasurementResult>,
}

/// Reply to a mixer-configuration read or write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MixerConfigReply {
    pub success: bool,
    #[serde(default)]
    pub config: Option<serde_json::Value>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Reply to a result-export request. On success `archive` holds the zip
/// produced by the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportReply {
    pub success: bool,
    pub archive: Vec<u8>,
    pub message: Option<String>,
}

/// The backend device-control API.
#[async_trait]
pub trait DeviceApi: Send + Sync {
    async fn status(&self, class: InstrumentClass) -> Result<StatusReport, TransportError>;

    async fn connect(
        &self,
        class: InstrumentClass,
        params: &ConnectParams,
    ) -> Result<Ack, TransportError>;

    async fn disconnect(&self, class: InstrumentClass) -> Result<Ack, TransportError>;

    async fn command(
        &self,
        class: InstrumentClass,
        command: &CommandString,
    ) -> Result<CommandReply, TransportError>;

    /// Serial ports visible to the backend host.
    async fn serial_ports(&self) -> Result<Vec<String>, TransportError>;

    async fn start_measurement(
        &self,
        request: &StartMeasurementRequest,
    ) -> Result<StartMeasurementReply, TransportError>;

    async fn stop_measurement(&self) -> Result<Ack, TransportError>;

    async fn measurement_status(&self) -> Result<MeasurementStatus, TransportError>;

    async fn get_mixer_config(&self) -> Result<MixerConfigReply, TransportError>;

    async fn set_mixer_config(&self, config: &MixerWire)
        -> Result<MixerConfigReply, TransportError>;

    /// Bundle the artifacts behind `results` into one archive.
    async fn export_results(
        &self,
        results: &[MeasurementResult],
    ) -> Result<ExportReply, TransportError>;
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl<'a> InFlightGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn rejected(message: Option<String>, fallback: &str) -> ConsoleError {
    ConsoleError::domain(message.unwrap_or_else(|| fallback.to_string()))
}

/// Uniform request executor in front of a [`DeviceApi`].
#[derive(Clone)]
pub struct RequestGateway {
    api: Arc<dyn DeviceApi>,
    timeout: Duration,
    in_flight: Arc<AtomicUsize>,
}

impl RequestGateway {
    pub fn new(api: Arc<dyn DeviceApi>, timeout: Duration) -> Self {
        Self {
            api,
            timeout,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Requests currently awaiting a reply.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    async fn execute<T, F>(&self, operation: &'static str, request: F) -> ConsoleResult<T>
    where
        F: Future<Output = Result<T, TransportError>>,
    {
        let _guard = InFlightGuard::enter(&self.in_flight);
        match tokio::time::timeout(self.timeout, request).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => {
                debug!(operation, error = %e, "backend request failed");
                Err(e.into())
            }
            Err(_) => {
                debug!(operation, timeout = ?self.timeout, "backend request timed out");
                Err(TransportError::Timeout(self.timeout).into())
            }
        }
    }

    pub async fn status(&self, class: InstrumentClass) -> ConsoleResult<StatusReport> {
        self.execute("status", self.api.status(class)).await
    }

    pub async fn connect(&self, class: InstrumentClass, params: &ConnectParams) -> ConsoleResult<()> {
        let ack = self.execute("connect", self.api.connect(class, params)).await?;
        if ack.success {
            Ok(())
        } else {
            Err(rejected(ack.message, "connection refused"))
        }
    }

    pub async fn disconnect(&self, class: InstrumentClass) -> ConsoleResult<()> {
        let ack = self.execute("disconnect", self.api.disconnect(class)).await?;
        if ack.success {
            Ok(())
        } else {
            Err(rejected(ack.message, "disconnect refused"))
        }
    }

    /// Send a command; returns the device's reply text, possibly empty.
    pub async fn command(
        &self,
        class: InstrumentClass,
        command: &CommandString,
    ) -> ConsoleResult<String> {
        let reply = self.execute("command", self.api.command(class, command)).await?;
        if reply.success {
            Ok(reply.response.unwrap_or_default())
        } else {
            Err(rejected(
                reply.message.or(reply.response),
                "command rejected",
            ))
        }
    }

    pub async fn serial_ports(&self) -> ConsoleResult<Vec<String>> {
        self.execute("serial_ports", self.api.serial_ports()).await
    }

    /// Submit a run; returns the backend's expected total, if given.
    pub async fn start_measurement(
        &self,
        request: &StartMeasurementRequest,
    ) -> ConsoleResult<Option<u32>> {
        let reply = self
            .execute("start_measurement", self.api.start_measurement(request))
            .await?;
        if reply.success {
            Ok(reply.total_measurements)
        } else {
            Err(rejected(reply.message, "measurement rejected"))
        }
    }

    pub async fn stop_measurement(&self) -> ConsoleResult<()> {
        let ack = self
            .execute("stop_measurement", self.api.stop_measurement())
            .await?;
        if ack.success {
            Ok(())
        } else {
            Err(rejected(ack.message, "stop refused"))
        }
    }

    pub async fn measurement_status(&self) -> ConsoleResult<MeasurementStatus> {
        self.execute("measurement_status", self.api.measurement_status())
            .await
    }

    /// Read the stored mixer configuration for `variant`, if the backend has
    /// one.
    pub async fn get_mixer_config(&self, variant: MixerVariant) -> ConsoleResult<Option<MixerConfig>> {
        let reply = self
            .execute("get_mixer_config", self.api.get_mixer_config())
            .await?;
        if !reply.success {
            return Err(rejected(reply.message, "mixer configuration unavailable"));
        }
        reply
            .config
            .map(|value| {
                MixerConfig::from_wire(variant, &value)
                    .map_err(|e| ConsoleError::from(TransportError::Decode(e.to_string())))
            })
            .transpose()
    }

    pub async fn set_mixer_config(&self, config: &MixerWire) -> ConsoleResult<()> {
        let reply = self
            .execute("set_mixer_config", self.api.set_mixer_config(config))
            .await?;
        if reply.success {
            Ok(())
        } else if !reply.errors.is_empty() {
            Err(ConsoleError::domain(reply.errors.join("; ")))
        } else {
            Err(rejected(reply.message, "mixer configuration rejected"))
        }
    }

    /// Fetch a zip of the artifacts named in `results`.
    pub async fn export_results(&self, results: &[MeasurementResult]) -> ConsoleResult<Vec<u8>> {
        if results.is_empty() {
            return Err(ValidationError::NothingToExport.into());
        }
        let reply = self
            .execute("export_results", self.api.export_results(results))
            .await?;
        if reply.success {
            Ok(reply.archive)
        } else {
            Err(rejected(reply.message, "export failed"))
        }
    }
}

impl fmt::Debug for RequestGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestGateway")
            .field("timeout", &self.timeout)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{MockDeviceApi, MockOp};
    use super::*;
    use crate::protocol::build_change_to;

    fn gateway(mock: &MockDeviceApi, timeout_ms: u64) -> RequestGateway {
        RequestGateway::new(Arc::new(mock.clone()), Duration::from_millis(timeout_ms))
    }

    #[test]
    fn test_vna_connect_requires_device_and_network() {
        let errors = ConnectParams::network("10.0.0.2", 5025)
            .validate(InstrumentClass::Vna)
            .unwrap_err();
        assert!(errors.contains(&ValidationError::MissingField("device")));

        assert!(ConnectParams::serial("/dev/ttyUSB0", 115200)
            .validate(InstrumentClass::Vna)
            .is_err());
        assert!(ConnectParams::serial("/dev/ttyUSB0", 115200)
            .validate(InstrumentClass::Matrix)
            .is_ok());
        assert!(ConnectParams::vna(VnaDevice::RohdeZna26, "10.0.0.2", 5025)
            .validate(InstrumentClass::Vna)
            .is_ok());
    }

    #[test]
    fn test_start_request_wire_shape() {
        let request = StartMeasurementRequest::new(
            Some(VnaDevice::RohdeZna26),
            vec![ParameterId::S11, ParameterId::S21],
            &MeasurementConfig::default(),
        );
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["device"], "rohde-zna26");
        assert_eq!(value["measurementCount"], 50);
        assert_eq!(value["frequencyPoints"], 201);
        assert_eq!(value["parameters"][1], "S21");
    }

    #[tokio::test]
    async fn test_rejection_maps_to_domain_error() {
        let mock = MockDeviceApi::new();
        mock.reject_next(MockOp::Command, "NAK - ROUTE:CHANGETO:1:1");
        let gw = gateway(&mock, 1000);

        let cmd = build_change_to(1, 1).unwrap();
        let err = gw.command(InstrumentClass::Matrix, &cmd).await.unwrap_err();
        assert!(matches!(err, ConsoleError::Domain { .. }));
        assert!(!err.is_backend_unavailable());
    }

    #[tokio::test]
    async fn test_transport_failure_is_backend_unavailable() {
        let mock = MockDeviceApi::new();
        mock.fail_next(MockOp::Status, TransportError::Unreachable("connection refused".into()));
        let gw = gateway(&mock, 1000);

        let err = gw.status(InstrumentClass::Vna).await.unwrap_err();
        assert!(err.is_backend_unavailable());
        assert_eq!(gw.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_export_requires_results() {
        let mock = MockDeviceApi::new();
        let gw = gateway(&mock, 1000);

        let err = gw.export_results(&[]).await.unwrap_err();
        assert!(err
            .validation_errors()
            .is_some_and(|errors| errors.contains(&ValidationError::NothingToExport)));
        assert_eq!(mock.call_count(MockOp::ExportResults), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_resolves_as_failure() {
        let mock = MockDeviceApi::new();
        mock.set_latency(Duration::from_secs(60));
        let gw = gateway(&mock, 500);

        let err = gw.status(InstrumentClass::Matrix).await.unwrap_err();
        assert!(matches!(
            err,
            ConsoleError::Transport(TransportError::Timeout(d)) if d == Duration::from_millis(500)
        ));
        assert_eq!(gw.in_flight(), 0);
    }
}
