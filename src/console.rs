//! Operator session.
//!
//! A [`Console`] owns one [`ConnectionSupervisor`] per instrument class, the
//! session's [`MeasurementOrchestrator`], the parameter selection, the mixer
//! configuration being edited and the raw command history. Operator actions
//! go through its methods; nothing else mutates that state.
//!
//! ```
//! use rf_console::gateway::{mock::MockDeviceApi, ConnectParams};
//! use rf_console::{Console, ConsoleConfig};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let console = Console::new(ConsoleConfig::default(), Arc::new(MockDeviceApi::new()));
//! console
//!     .connect_matrix(ConnectParams::network("192.168.2.11", 5025))
//!     .await
//!     .unwrap();
//! let report = console.path_switch(12, 74).await.unwrap();
//! assert!(!report.is_error());
//! # });
//! ```

use crate::config::ConsoleConfig;
use crate::error::{ConsoleError, ConsoleResult};
use crate::gateway::http::HttpDeviceApi;
use crate::gateway::{ConnectParams, DeviceApi, InstrumentClass, RequestGateway};
use crate::measurement::{
    MeasurementConfig, MeasurementMode, MeasurementOrchestrator, MeasurementRun, ParameterId,
    ParameterSelection,
};
use crate::protocol::{
    build_change_to, build_path_switch, classify_response, parse_matrix_command, CommandHistory,
    CommandString, MixerConfig, ResponseReport, VnaDevice,
};
use crate::supervisor::ConnectionSupervisor;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct Console {
    config: ConsoleConfig,
    gateway: RequestGateway,
    matrix: ConnectionSupervisor,
    vna: ConnectionSupervisor,
    orchestrator: MeasurementOrchestrator,
    selection: ParameterSelection,
    mixer: Option<MixerConfig>,
    history: CommandHistory,
}

impl Console {
    /// Build a session on top of `api`.
    pub fn new(config: ConsoleConfig, api: Arc<dyn DeviceApi>) -> Self {
        let gateway = RequestGateway::new(api, config.backend.request_timeout());
        let reconcile = config.timing.reconcile_interval();
        Self {
            matrix: ConnectionSupervisor::new(InstrumentClass::Matrix, gateway.clone(), reconcile),
            vna: ConnectionSupervisor::new(InstrumentClass::Vna, gateway.clone(), reconcile),
            orchestrator: MeasurementOrchestrator::new(
                gateway.clone(),
                config.timing.measurement_poll_interval(),
            ),
            gateway,
            selection: ParameterSelection::default(),
            mixer: None,
            history: CommandHistory::new(),
            config,
        }
    }

    /// Build a session talking HTTP to the configured backend.
    pub fn connect_http(config: ConsoleConfig) -> ConsoleResult<Self> {
        config.validate()?;
        let api = HttpDeviceApi::new(&config.backend.base_url, config.backend.request_timeout())?;
        Ok(Self::new(config, Arc::new(api)))
    }

    pub fn config(&self) -> &ConsoleConfig {
        &self.config
    }

    pub fn matrix(&self) -> &ConnectionSupervisor {
        &self.matrix
    }

    pub fn vna(&self) -> &ConnectionSupervisor {
        &self.vna
    }

    pub fn orchestrator(&self) -> &MeasurementOrchestrator {
        &self.orchestrator
    }

    pub fn gateway(&self) -> &RequestGateway {
        &self.gateway
    }

    pub fn history(&self) -> &CommandHistory {
        &self.history
    }

    pub fn selection(&self) -> &ParameterSelection {
        &self.selection
    }

    pub fn mixer_config(&self) -> Option<&MixerConfig> {
        self.mixer.as_ref()
    }

    // --- background loops ---

    /// Start both reconcile loops.
    pub fn start_background(&self) {
        self.matrix.spawn_reconciler();
        self.vna.spawn_reconciler();
        info!("background reconciliation started");
    }

    /// Stop the reconcile loops and detach measurement polling.
    pub async fn shutdown(&self) {
        self.matrix.stop_reconciler().await;
        self.vna.stop_reconciler().await;
        self.orchestrator.cancel_polling();
        info!("console shut down");
    }

    // --- switch matrix ---

    pub async fn connect_matrix(&self, params: ConnectParams) -> ConsoleResult<()> {
        self.matrix.connect(params).await
    }

    pub async fn disconnect_matrix(&self) -> ConsoleResult<()> {
        self.matrix.disconnect().await
    }

    /// Serial ports visible to the backend host.
    pub async fn serial_ports(&self) -> ConsoleResult<Vec<String>> {
        self.gateway.serial_ports().await
    }

    async fn send_matrix(&self, command: &CommandString) -> ConsoleResult<ResponseReport> {
        self.matrix.ensure_connected()?;
        let reply = self
            .gateway
            .command(InstrumentClass::Matrix, command)
            .await?;
        let report = classify_response(command.as_str(), &reply);
        debug!(%command, status = %report.status, "matrix reply");
        if report.is_error() {
            return Err(ConsoleError::domain(report.message));
        }
        Ok(report)
    }

    /// Route `ROUTE:PATHSWITCH:{com1}:{com2}`.
    pub async fn path_switch(&self, com1: u32, com2: u32) -> ConsoleResult<ResponseReport> {
        let command = build_path_switch(com1, com2)?;
        self.send_matrix(&command).await
    }

    /// Route `ROUTE:CHANGETO:{switch_index}:{target_port}`.
    pub async fn change_to(
        &self,
        switch_index: u32,
        target_port: u32,
    ) -> ConsoleResult<ResponseReport> {
        let command = build_change_to(switch_index, target_port)?;
        self.send_matrix(&command).await
    }

    /// Validate and send an operator-typed command. Successful commands are
    /// added to the history.
    pub async fn send_raw_command(&mut self, line: &str) -> ConsoleResult<ResponseReport> {
        let command = parse_matrix_command(line)?.to_command_string();
        let report = self.send_matrix(&command).await?;
        self.history.record(command.into_string());
        Ok(report)
    }

    // --- VNA ---

    pub async fn connect_vna(&self, params: ConnectParams) -> ConsoleResult<()> {
        self.vna.connect(params).await
    }

    pub async fn disconnect_vna(&self) -> ConsoleResult<()> {
        self.vna.disconnect().await
    }

    /// Model of the connected VNA, if the backend reported a known one.
    pub fn vna_device(&self) -> Option<VnaDevice> {
        self.vna
            .snapshot()
            .identity
            .and_then(|identity| identity.device_type)
            .and_then(|id| id.parse().ok())
    }

    fn connected_vna_device(&self) -> ConsoleResult<VnaDevice> {
        self.vna.ensure_connected()?;
        self.vna_device().ok_or_else(|| {
            ConsoleError::InvalidState("connected VNA did not report a known model".to_string())
        })
    }

    // --- parameter selection ---

    pub fn set_mode(&mut self, mode: MeasurementMode) {
        self.selection.set_mode(mode);
    }

    pub fn toggle_parameter(&mut self, parameter: ParameterId) -> ConsoleResult<bool> {
        Ok(self.selection.toggle(parameter)?)
    }

    pub fn toggle_all(&mut self) {
        self.selection.toggle_all();
    }

    // --- mixer configuration ---

    /// Replace the mixer configuration being edited. Validated on save.
    pub fn edit_mixer_config(&mut self, config: MixerConfig) {
        self.mixer = Some(config);
    }

    /// Restore the factory defaults for the connected model.
    pub fn reset_mixer_config(&mut self) -> ConsoleResult<&MixerConfig> {
        let device = self.connected_vna_device()?;
        let variant = device.require_mixer()?;
        info!(%device, "mixer configuration reset to defaults");
        Ok(self.mixer.insert(MixerConfig::default_for(variant)))
    }

    /// Fetch the backend's stored configuration for the connected model.
    pub async fn load_mixer_config(&mut self) -> ConsoleResult<Option<&MixerConfig>> {
        let device = self.connected_vna_device()?;
        let variant = device.require_mixer()?;
        match self.gateway.get_mixer_config(variant).await {
            Ok(Some(config)) => self.mixer = Some(config),
            Ok(None) => debug!(%device, "backend has no stored mixer configuration"),
            Err(e) => {
                warn!(error = %e, "could not load mixer configuration, keeping local values");
                return Err(e);
            }
        }
        Ok(self.mixer.as_ref())
    }

    /// Validate the edited configuration for the connected model and send it.
    pub async fn save_mixer_config(&mut self) -> ConsoleResult<()> {
        let device = self.connected_vna_device()?;
        let variant = device.require_mixer()?;
        let config = self
            .mixer
            .get_or_insert_with(|| MixerConfig::default_for(variant))
            .clone();
        let wire = config.validated_wire(device)?;
        self.gateway.set_mixer_config(&wire).await?;
        info!(%device, "mixer configuration saved");
        Ok(())
    }

    // --- measurement ---

    /// Start a run over the current selection with the configured defaults.
    pub async fn start_measurement(&self) -> ConsoleResult<Uuid> {
        self.start_measurement_with(self.config.measurement.clone())
            .await
    }

    pub async fn start_measurement_with(&self, config: MeasurementConfig) -> ConsoleResult<Uuid> {
        self.vna.ensure_connected()?;
        self.orchestrator
            .start(self.vna_device(), self.selection.to_vec(), config)
            .await
    }

    /// Returns `false` when there was no running measurement.
    pub async fn stop_measurement(&self) -> ConsoleResult<bool> {
        self.orchestrator.stop().await
    }

    pub fn acknowledge_measurement(&self) -> ConsoleResult<()> {
        self.orchestrator.acknowledge()
    }

    pub fn measurement(&self) -> MeasurementRun {
        self.orchestrator.snapshot()
    }

    /// Ask the backend for a zip of the current run's result files.
    pub async fn export_results(&self) -> ConsoleResult<Vec<u8>> {
        let run = self.orchestrator.snapshot();
        let archive = self.gateway.export_results(&run.results).await?;
        info!(files = run.results.len(), bytes = archive.len(), "measurement results exported");
        Ok(archive)
    }
}
