//! Scriptable in-memory backend.
//!
//! `MockDeviceApi` simulates the device-control service without hardware:
//! - remote connection state per instrument class
//! - call logging for test verification
//! - one-shot transport failures and `success: false` rejections per operation
//! - gates that hold a request until the test releases it
//! - scripted measurement-status sequences
//! - result export answering with the exported paths, one per line
//! - simulated latency

use super::{
    Ack, CommandReply, ConnectParams, DeviceApi, ExportReply, InstrumentClass,
    MeasurementStatus, MixerConfigReply, StartMeasurementReply, StartMeasurementRequest,
    StatusReport,
};
use crate::error::TransportError;
use crate::measurement::{expected_total, MeasurementResult};
use crate::protocol::{CommandString, MixerWire};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};

/// Backend operation, used to target failure injection and gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Status,
    Connect,
    Disconnect,
    Command,
    SerialPorts,
    StartMeasurement,
    StopMeasurement,
    MeasurementStatus,
    GetMixerConfig,
    SetMixerConfig,
    ExportResults,
}

/// Holds one request of an operation until released or dropped.
#[derive(Debug)]
pub struct MockGate(oneshot::Sender<()>);

impl MockGate {
    pub fn release(self) {
        // The request may already have been abandoned by a timeout.
        let _ = self.0.send(());
    }
}

#[derive(Default)]
struct MockState {
    remote: HashMap<InstrumentClass, StatusReport>,
    call_log: Vec<(MockOp, String)>,
    failures: HashMap<MockOp, VecDeque<TransportError>>,
    rejections: HashMap<MockOp, VecDeque<String>>,
    gates: HashMap<MockOp, VecDeque<oneshot::Receiver<()>>>,
    command_replies: VecDeque<String>,
    scripted_statuses: VecDeque<MeasurementStatus>,
    last_status: MeasurementStatus,
    mixer_config: Option<serde_json::Value>,
    serial_ports: Vec<String>,
    latency: Duration,
}

/// In-memory [`DeviceApi`]. Clones share state.
#[derive(Clone, Default)]
pub struct MockDeviceApi {
    state: Arc<Mutex<MockState>>,
    calls_changed: Arc<Notify>,
}

impl MockDeviceApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Simulated latency applied to every request.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Change the backend's view of an instrument behind the console's back.
    pub fn set_remote_status(&self, class: InstrumentClass, status: StatusReport) {
        self.lock().remote.insert(class, status);
    }

    pub fn set_remote_connected(&self, class: InstrumentClass, connected: bool) {
        let mut state = self.lock();
        let entry = state.remote.entry(class).or_default();
        entry.connected = connected;
    }

    pub fn remote_status(&self, class: InstrumentClass) -> StatusReport {
        self.lock().remote.get(&class).cloned().unwrap_or_default()
    }

    /// Fail the next call of `op` with a transport error.
    pub fn fail_next(&self, op: MockOp, error: TransportError) {
        self.lock().failures.entry(op).or_default().push_back(error);
    }

    /// Answer the next call of `op` with `success: false`.
    pub fn reject_next(&self, op: MockOp, message: impl Into<String>) {
        self.lock()
            .rejections
            .entry(op)
            .or_default()
            .push_back(message.into());
    }

    /// Hold the next call of `op` until the returned gate is released.
    pub fn hold_next(&self, op: MockOp) -> MockGate {
        let (tx, rx) = oneshot::channel();
        self.lock().gates.entry(op).or_default().push_back(rx);
        MockGate(tx)
    }

    /// Queue the device reply for the next raw command.
    pub fn push_command_reply(&self, reply: impl Into<String>) {
        self.lock().command_replies.push_back(reply.into());
    }

    /// Queue measurement-status polls, answered in order. Once the queue is
    /// drained the last status keeps being returned.
    pub fn script_measurement<I>(&self, statuses: I)
    where
        I: IntoIterator<Item = MeasurementStatus>,
    {
        self.lock().scripted_statuses.extend(statuses);
    }

    pub fn store_mixer_config(&self, config: Option<serde_json::Value>) {
        self.lock().mixer_config = config;
    }

    pub fn stored_mixer_config(&self) -> Option<serde_json::Value> {
        self.lock().mixer_config.clone()
    }

    pub fn set_serial_ports(&self, ports: Vec<String>) {
        self.lock().serial_ports = ports;
    }

    /// Every call so far, formatted for assertions.
    pub fn call_log(&self) -> Vec<String> {
        self.lock().call_log.iter().map(|(_, s)| s.clone()).collect()
    }

    pub fn call_count(&self, op: MockOp) -> usize {
        self.lock().call_log.iter().filter(|(o, _)| *o == op).count()
    }

    pub fn clear_log(&self) {
        self.lock().call_log.clear();
    }

    /// Wait until `op` has been called at least `count` times.
    pub async fn wait_for_calls(&self, op: MockOp, count: usize) {
        loop {
            let notified = self.calls_changed.notified();
            if self.call_count(op) >= count {
                return;
            }
            notified.await;
        }
    }

    /// Log the call, then apply gate, latency and injected failure in that
    /// order. Returns a pending rejection message, if any.
    async fn enter(&self, op: MockOp, entry: String) -> Result<Option<String>, TransportError> {
        let (gate, latency) = {
            let mut state = self.lock();
            state.call_log.push((op, entry));
            let gate = state.gates.get_mut(&op).and_then(VecDeque::pop_front);
            (gate, state.latency)
        };
        self.calls_changed.notify_waiters();

        if let Some(gate) = gate {
            // A dropped gate releases the request too.
            let _ = gate.await;
        }
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.lock();
        if let Some(error) = state.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            return Err(error);
        }
        Ok(state.rejections.get_mut(&op).and_then(VecDeque::pop_front))
    }
}

fn identity(params: &ConnectParams) -> StatusReport {
    match params {
        ConnectParams::Network { host, port, device } => StatusReport {
            connected: true,
            device_type: device.map(|d| d.id().to_string()),
            address: Some(host.clone()),
            port: Some(*port),
            serial_port: None,
            baud_rate: None,
        },
        ConnectParams::Serial {
            port_name,
            baud_rate,
        } => StatusReport {
            connected: true,
            device_type: None,
            address: None,
            port: None,
            serial_port: Some(port_name.clone()),
            baud_rate: Some(*baud_rate),
        },
    }
}

#[async_trait]
impl DeviceApi for MockDeviceApi {
    async fn status(&self, class: InstrumentClass) -> Result<StatusReport, TransportError> {
        self.enter(MockOp::Status, format!("status {}", class.path()))
            .await?;
        Ok(self.remote_status(class))
    }

    async fn connect(
        &self,
        class: InstrumentClass,
        params: &ConnectParams,
    ) -> Result<Ack, TransportError> {
        let entry = format!("connect {} {}", class.path(), params.address());
        if let Some(message) = self.enter(MockOp::Connect, entry).await? {
            return Ok(Ack::rejected(message));
        }
        self.set_remote_status(class, identity(params));
        Ok(Ack::ok())
    }

    async fn disconnect(&self, class: InstrumentClass) -> Result<Ack, TransportError> {
        let entry = format!("disconnect {}", class.path());
        if let Some(message) = self.enter(MockOp::Disconnect, entry).await? {
            return Ok(Ack::rejected(message));
        }
        self.set_remote_status(class, StatusReport::disconnected());
        Ok(Ack::ok())
    }

    async fn command(
        &self,
        class: InstrumentClass,
        command: &CommandString,
    ) -> Result<CommandReply, TransportError> {
        let entry = format!("command {} {}", class.path(), command);
        if let Some(message) = self.enter(MockOp::Command, entry).await? {
            return Ok(CommandReply {
                success: false,
                response: None,
                message: Some(message),
            });
        }
        let response = self
            .lock()
            .command_replies
            .pop_front()
            .unwrap_or_else(|| "OK".to_string());
        Ok(CommandReply {
            success: true,
            response: Some(response),
            message: None,
        })
    }

    async fn serial_ports(&self) -> Result<Vec<String>, TransportError> {
        self.enter(MockOp::SerialPorts, "serial_ports".to_string())
            .await?;
        Ok(self.lock().serial_ports.clone())
    }

    async fn start_measurement(
        &self,
        request: &StartMeasurementRequest,
    ) -> Result<StartMeasurementReply, TransportError> {
        let parameters: Vec<String> = request.parameters.iter().map(|p| p.to_string()).collect();
        let entry = format!(
            "start_measurement {} x{}",
            parameters.join(","),
            request.measurement_count
        );
        if let Some(message) = self.enter(MockOp::StartMeasurement, entry).await? {
            return Ok(StartMeasurementReply {
                success: false,
                message: Some(message),
                total_measurements: None,
            });
        }
        let total = expected_total(request.parameters.len(), request.measurement_count);
        Ok(StartMeasurementReply {
            success: true,
            message: None,
            total_measurements: Some(total),
        })
    }

    async fn stop_measurement(&self) -> Result<Ack, TransportError> {
        if let Some(message) = self
            .enter(MockOp::StopMeasurement, "stop_measurement".to_string())
            .await?
        {
            return Ok(Ack::rejected(message));
        }
        self.lock().last_status.is_running = false;
        Ok(Ack::ok())
    }

    async fn measurement_status(&self) -> Result<MeasurementStatus, TransportError> {
        self.enter(MockOp::MeasurementStatus, "measurement_status".to_string())
            .await?;
        let mut state = self.lock();
        if let Some(next) = state.scripted_statuses.pop_front() {
            state.last_status = next;
        }
        Ok(state.last_status.clone())
    }

    async fn get_mixer_config(&self) -> Result<MixerConfigReply, TransportError> {
        if let Some(message) = self
            .enter(MockOp::GetMixerConfig, "get_mixer_config".to_string())
            .await?
        {
            return Ok(MixerConfigReply {
                success: false,
                message: Some(message),
                ..MixerConfigReply::default()
            });
        }
        Ok(MixerConfigReply {
            success: true,
            config: self.stored_mixer_config(),
            ..MixerConfigReply::default()
        })
    }

    async fn set_mixer_config(
        &self,
        config: &MixerWire,
    ) -> Result<MixerConfigReply, TransportError> {
        let value = serde_json::to_value(config)
            .map_err(|e| TransportError::Decode(e.to_string()))?;
        let entry = format!("set_mixer_config {value}");
        if let Some(message) = self.enter(MockOp::SetMixerConfig, entry).await? {
            return Ok(MixerConfigReply {
                success: false,
                errors: vec![message],
                ..MixerConfigReply::default()
            });
        }
        self.store_mixer_config(Some(value.clone()));
        Ok(MixerConfigReply {
            success: true,
            config: Some(value),
            ..MixerConfigReply::default()
        })
    }

    async fn export_results(
        &self,
        results: &[MeasurementResult],
    ) -> Result<ExportReply, TransportError> {
        let entry = format!("export_results {}", results.len());
        if let Some(message) = self.enter(MockOp::ExportResults, entry).await? {
            return Ok(ExportReply {
                success: false,
                archive: Vec::new(),
                message: Some(message),
            });
        }
        let listing: Vec<&str> = results.iter().map(|r| r.artifact_path.as_str()).collect();
        Ok(ExportReply {
            success: true,
            archive: listing.join("\n").into_bytes(),
            message: None,
        })
    }
}
