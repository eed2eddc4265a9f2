//! VNA measurement runs.
//!
//! [`MeasurementOrchestrator`] drives one run at a time through
//! `Idle -> Submitting -> Running -> Completed | Failed`, with `Stopping`
//! while a stop request is in flight. While a run is `Running`, a background
//! task polls the backend on a fixed interval and replaces the local result
//! set with each reply.
//!
//! Every poll task carries a guard token. Cancelling the loop (or stopping the
//! run) clears the token first, so a poll reply that arrives late is dropped
//! instead of overwriting newer state.
//!
//! Snapshots of the run are published on a `tokio::sync::watch` channel for
//! the presentation layer.

pub mod config;
pub mod parameter;

pub use config::{MeasurementConfig, FREQUENCY_POINT_CHOICES, MAX_MEASUREMENT_COUNT};
pub use parameter::{MeasurementMode, ParameterFamily, ParameterId, ParameterSelection};

use crate::error::{ConsoleError, ConsoleResult, ValidationError};
use crate::gateway::{RequestGateway, StartMeasurementRequest};
use crate::protocol::VnaDevice;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One parameter's output as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasurementResult {
    pub parameter: String,
    #[serde(rename = "measurements", default)]
    pub measurements_taken: u32,
    #[serde(rename = "filename", default)]
    pub artifact_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RunState {
    #[default]
    Idle,
    Submitting,
    Running,
    Stopping,
    Completed,
    Failed(String),
}

impl RunState {
    /// `Completed` or `Failed`: waiting for acknowledgement.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed(_))
    }

    /// A new run may be started from this state.
    pub fn accepts_start(&self) -> bool {
        matches!(self, RunState::Idle) || self.is_terminal()
    }
}

/// Snapshot of the session's measurement run.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MeasurementRun {
    pub id: Option<Uuid>,
    pub state: RunState,
    pub device: Option<VnaDevice>,
    pub requested_parameters: Vec<ParameterId>,
    pub config: Option<MeasurementConfig>,
    pub progress_percent: f64,
    pub current_index: u32,
    pub total_count: u32,
    pub results: Vec<MeasurementResult>,
    pub started_at: Option<DateTime<Local>>,
}

/// Result of applying one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Applied; the run continues.
    Continue,
    /// Applied; the backend reported the run finished.
    Finished,
    /// Dropped: the token was revoked or the run left `Running`.
    Discarded,
}

/// Measurements a run takes: one per parameter per repeat, saturating.
pub fn expected_total(parameters: usize, measurement_count: u32) -> u32 {
    u32::try_from(parameters)
        .unwrap_or(u32::MAX)
        .saturating_mul(measurement_count)
}

struct PollHandle {
    token: Uuid,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl PollHandle {
    fn cancel(self) {
        if self.shutdown.send(()).is_err() && !self.task.is_finished() {
            self.task.abort();
        }
    }
}

#[derive(Default)]
struct Inner {
    run: MeasurementRun,
    active_poll: Option<Uuid>,
    poller: Option<PollHandle>,
}

impl Inner {
    fn token_is_live(&self, token: Uuid) -> bool {
        self.active_poll == Some(token) && self.run.state == RunState::Running
    }

    fn revoke_poller(&mut self) -> Option<PollHandle> {
        self.active_poll = None;
        self.poller.take()
    }
}

struct Shared {
    inner: Mutex<Inner>,
    snapshots: watch::Sender<MeasurementRun>,
    gateway: RequestGateway,
    poll_interval: Duration,
}

/// State machine for the session's measurement run. Clones share state.
#[derive(Clone)]
pub struct MeasurementOrchestrator {
    shared: Arc<Shared>,
}

impl MeasurementOrchestrator {
    pub fn new(gateway: RequestGateway, poll_interval: Duration) -> Self {
        let (snapshots, _) = watch::channel(MeasurementRun::default());
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner::default()),
                snapshots,
                gateway,
                poll_interval,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, inner: &Inner) {
        self.shared.snapshots.send_replace(inner.run.clone());
    }

    pub fn snapshot(&self) -> MeasurementRun {
        self.lock().run.clone()
    }

    pub fn state(&self) -> RunState {
        self.lock().run.state.clone()
    }

    /// Observe run snapshots as they change.
    pub fn subscribe(&self) -> watch::Receiver<MeasurementRun> {
        self.shared.snapshots.subscribe()
    }

    /// Whether a poll loop is currently attached to the run.
    pub fn is_polling(&self) -> bool {
        self.lock().active_poll.is_some()
    }

    /// Submit a new run.
    ///
    /// Nothing is sent when `parameters` is empty or `config` is invalid; the
    /// state is left untouched. A backend rejection leaves the run `Failed`.
    pub async fn start(
        &self,
        device: Option<VnaDevice>,
        parameters: Vec<ParameterId>,
        config: MeasurementConfig,
    ) -> ConsoleResult<Uuid> {
        let mut requested: Vec<ParameterId> = Vec::with_capacity(parameters.len());
        for p in parameters {
            if !requested.contains(&p) {
                requested.push(p);
            }
        }
        if requested.is_empty() {
            return Err(ValidationError::EmptyParameterSet.into());
        }
        config.validate()?;

        let run_id = Uuid::new_v4();
        {
            let mut inner = self.lock();
            if !inner.run.state.accepts_start() {
                return Err(ConsoleError::Busy(format!(
                    "a measurement is already {:?}",
                    inner.run.state
                )));
            }
            inner.run = MeasurementRun {
                id: Some(run_id),
                state: RunState::Submitting,
                device,
                requested_parameters: requested.clone(),
                config: Some(config.clone()),
                started_at: Some(Local::now()),
                ..MeasurementRun::default()
            };
            self.publish(&inner);
        }

        let request = StartMeasurementRequest::new(device, requested.clone(), &config);
        let submitted = self.shared.gateway.start_measurement(&request).await;

        let mut inner = self.lock();
        if inner.run.id != Some(run_id) || inner.run.state != RunState::Submitting {
            debug!(%run_id, "run changed while submitting; ignoring start reply");
            return submitted.map(|_| run_id);
        }
        match submitted {
            Ok(total) => {
                inner.run.state = RunState::Running;
                inner.run.total_count = total
                    .unwrap_or_else(|| expected_total(requested.len(), config.measurement_count));
                let handle = self.spawn_poller();
                inner.active_poll = Some(handle.token);
                inner.poller = Some(handle);
                self.publish(&inner);
                info!(
                    %run_id,
                    parameters = requested.len(),
                    total = inner.run.total_count,
                    "measurement started"
                );
                Ok(run_id)
            }
            Err(e) => {
                inner.run.state = RunState::Failed(e.to_string());
                self.publish(&inner);
                warn!(%run_id, error = %e, "measurement start rejected");
                Err(e)
            }
        }
    }

    fn spawn_poller(&self) -> PollHandle {
        let token = Uuid::new_v4();
        let (shutdown, mut shutdown_rx) = oneshot::channel::<()>();
        let weak = Arc::downgrade(&self.shared);
        let period = self.shared.poll_interval;

        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately; the first poll is one period out.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        debug!(%token, "measurement poll loop cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        let Some(shared) = weak.upgrade() else {
                            break;
                        };
                        let this = MeasurementOrchestrator { shared };
                        match this.poll_once(token).await {
                            PollOutcome::Continue => {}
                            PollOutcome::Finished | PollOutcome::Discarded => break,
                        }
                    }
                }
            }
        });

        PollHandle {
            token,
            shutdown,
            task,
        }
    }

    /// Fetch one status and apply it if `token` is still the live poll token.
    pub(crate) async fn poll_once(&self, token: Uuid) -> PollOutcome {
        if !self.lock().token_is_live(token) {
            return PollOutcome::Discarded;
        }

        let status = match self.shared.gateway.measurement_status().await {
            Ok(status) => status,
            Err(e) => {
                debug!(error = %e, "measurement poll failed, retrying next tick");
                return if self.lock().token_is_live(token) {
                    PollOutcome::Continue
                } else {
                    PollOutcome::Discarded
                };
            }
        };

        let mut inner = self.lock();
        if !inner.token_is_live(token) {
            debug!(%token, "discarding stale measurement poll");
            return PollOutcome::Discarded;
        }

        let run = &mut inner.run;
        run.progress_percent = if status.progress.is_finite() {
            status.progress.clamp(0.0, 100.0)
        } else {
            0.0
        };
        run.current_index = status.current_measurement;
        if status.total_measurements > 0 {
            run.total_count = status.total_measurements;
        }
        run.results = status.results;

        if status.is_running {
            self.publish(&inner);
            return PollOutcome::Continue;
        }

        inner.run.state = RunState::Completed;
        // The loop exits on its own; dropping the handle detaches it.
        drop(inner.revoke_poller());
        self.publish(&inner);
        info!(results = inner.run.results.len(), "measurement completed");
        PollOutcome::Finished
    }

    /// Stop the running measurement.
    ///
    /// Returns `Ok(false)` when no run is `Running`. Once issued, the local
    /// state becomes `Completed` whatever the backend answers.
    pub async fn stop(&self) -> ConsoleResult<bool> {
        let poller = {
            let mut inner = self.lock();
            if inner.run.state != RunState::Running {
                debug!(state = ?inner.run.state, "stop ignored, no running measurement");
                return Ok(false);
            }
            inner.run.state = RunState::Stopping;
            let poller = inner.revoke_poller();
            self.publish(&inner);
            poller
        };
        if let Some(poller) = poller {
            poller.cancel();
        }

        let result = self.shared.gateway.stop_measurement().await;

        {
            let mut inner = self.lock();
            if inner.run.state == RunState::Stopping {
                inner.run.state = RunState::Completed;
                self.publish(&inner);
            }
        }

        match result {
            Ok(()) => info!("measurement stopped"),
            Err(e) => warn!(error = %e, "measurement stopped, backend stop request failed"),
        }
        Ok(true)
    }

    /// Reset a finished run to `Idle`.
    pub fn acknowledge(&self) -> ConsoleResult<()> {
        let mut inner = self.lock();
        if inner.run.state == RunState::Idle {
            return Ok(());
        }
        if !inner.run.state.is_terminal() {
            return Err(ConsoleError::InvalidState(format!(
                "cannot acknowledge a measurement that is {:?}",
                inner.run.state
            )));
        }
        inner.run = MeasurementRun::default();
        self.publish(&inner);
        Ok(())
    }

    /// Detach the poll loop without touching the run state.
    ///
    /// Any poll already in flight is discarded on arrival. Returns whether a
    /// loop was attached.
    pub fn cancel_polling(&self) -> bool {
        let poller = self.lock().revoke_poller();
        match poller {
            Some(poller) => {
                poller.cancel();
                debug!("measurement polling cancelled");
                true
            }
            None => false,
        }
    }

    /// Reattach a poll loop to a `Running` run that has none.
    pub fn resume_polling(&self) -> ConsoleResult<()> {
        let mut inner = self.lock();
        if inner.run.state != RunState::Running {
            return Err(ConsoleError::InvalidState(
                "no running measurement to poll".to_string(),
            ));
        }
        if inner.poller.is_none() {
            let handle = self.spawn_poller();
            inner.active_poll = Some(handle.token);
            inner.poller = Some(handle);
            debug!("measurement polling resumed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::mock::{MockDeviceApi, MockOp};
    use crate::gateway::MeasurementStatus;

    fn orchestrator(mock: &MockDeviceApi) -> MeasurementOrchestrator {
        let gateway = RequestGateway::new(Arc::new(mock.clone()), Duration::from_secs(5));
        MeasurementOrchestrator::new(gateway, Duration::from_millis(800))
    }

    fn running(progress: f64, results: Vec<MeasurementResult>) -> MeasurementStatus {
        MeasurementStatus {
            is_running: true,
            progress,
            current_measurement: 1,
            total_measurements: 100,
            results,
        }
    }

    #[tokio::test]
    async fn test_empty_start_stays_idle() {
        let mock = MockDeviceApi::new();
        let orch = orchestrator(&mock);

        let err = orch
            .start(None, vec![], MeasurementConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ConsoleError::Validation(_)));
        assert_eq!(orch.state(), RunState::Idle);
        assert_eq!(mock.call_count(MockOp::StartMeasurement), 0);
    }

    #[tokio::test]
    async fn test_invalid_config_is_not_submitted() {
        let mock = MockDeviceApi::new();
        let orch = orchestrator(&mock);
        let config = MeasurementConfig {
            frequency_points: 333,
            ..MeasurementConfig::default()
        };
        assert!(orch.start(None, vec![ParameterId::S11], config).await.is_err());
        assert_eq!(orch.state(), RunState::Idle);
        assert_eq!(mock.call_count(MockOp::StartMeasurement), 0);
    }

    #[tokio::test]
    async fn test_oversized_count_is_not_submitted() {
        let mock = MockDeviceApi::new();
        let orch = orchestrator(&mock);
        let config = MeasurementConfig {
            measurement_count: 3_000_000_000,
            ..MeasurementConfig::default()
        };

        let err = orch
            .start(None, vec![ParameterId::S11, ParameterId::S21], config)
            .await
            .unwrap_err();
        assert!(err.validation_errors().is_some());
        assert_eq!(orch.state(), RunState::Idle);
        assert_eq!(mock.call_count(MockOp::StartMeasurement), 0);
    }

    #[test]
    fn test_expected_total_saturates() {
        assert_eq!(expected_total(4, 100), 400);
        assert_eq!(expected_total(2, 3_000_000_000), u32::MAX);
        assert_eq!(expected_total(usize::MAX, 2), u32::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_orchestrator_ends_polling() {
        let mock = MockDeviceApi::new();
        mock.script_measurement([running(10.0, vec![])]);
        let orch = orchestrator(&mock);
        orch.start(None, vec![ParameterId::S11], MeasurementConfig::default())
            .await
            .unwrap();
        mock.wait_for_calls(MockOp::MeasurementStatus, 1).await;
        drop(orch);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(mock.call_count(MockOp::MeasurementStatus), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_start_fails_without_polling() {
        let mock = MockDeviceApi::new();
        mock.reject_next(MockOp::StartMeasurement, "VNA not connected");
        let orch = orchestrator(&mock);

        let err = orch
            .start(None, vec![ParameterId::S11], MeasurementConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ConsoleError::Domain { .. }));
        assert_eq!(
            orch.state(),
            RunState::Failed("device rejected request: VNA not connected".into())
        );
        assert!(!orch.is_polling());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(mock.call_count(MockOp::MeasurementStatus), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_sets_running_and_total() {
        let mock = MockDeviceApi::new();
        mock.script_measurement([running(0.0, vec![])]);
        let orch = orchestrator(&mock);

        orch.start(
            Some(VnaDevice::RohdeZna26),
            vec![ParameterId::S11, ParameterId::S21, ParameterId::S11],
            MeasurementConfig::default(),
        )
        .await
        .unwrap();

        let run = orch.snapshot();
        assert_eq!(run.state, RunState::Running);
        assert_eq!(run.requested_parameters, vec![ParameterId::S11, ParameterId::S21]);
        assert_eq!(run.total_count, 100);
        assert_eq!(run.progress_percent, 0.0);
        assert!(orch.is_polling());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_while_running_is_busy() {
        let mock = MockDeviceApi::new();
        mock.script_measurement([running(10.0, vec![])]);
        let orch = orchestrator(&mock);
        let params = vec![ParameterId::S11];

        orch.start(None, params.clone(), MeasurementConfig::default())
            .await
            .unwrap();
        let err = orch
            .start(None, params, MeasurementConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ConsoleError::Busy(_)));
        assert_eq!(mock.call_count(MockOp::StartMeasurement), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_failure_is_retried() {
        let mock = MockDeviceApi::new();
        mock.script_measurement([running(40.0, vec![]), MeasurementStatus::default()]);
        mock.fail_next(
            MockOp::MeasurementStatus,
            crate::error::TransportError::Unreachable("blip".into()),
        );
        let orch = orchestrator(&mock);
        let mut rx = orch.subscribe();

        orch.start(None, vec![ParameterId::S22], MeasurementConfig::default())
            .await
            .unwrap();
        rx.wait_for(|run| run.state == RunState::Completed)
            .await
            .unwrap();
        assert_eq!(mock.call_count(MockOp::MeasurementStatus), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_token_is_discarded() {
        let mock = MockDeviceApi::new();
        mock.script_measurement([running(10.0, vec![])]);
        let orch = orchestrator(&mock);
        orch.start(None, vec![ParameterId::S11], MeasurementConfig::default())
            .await
            .unwrap();

        assert_eq!(orch.poll_once(Uuid::new_v4()).await, PollOutcome::Discarded);
        assert_eq!(mock.call_count(MockOp::MeasurementStatus), 0);
    }

    #[tokio::test]
    async fn test_acknowledge_rules() {
        let mock = MockDeviceApi::new();
        let orch = orchestrator(&mock);
        assert!(orch.acknowledge().is_ok());

        mock.reject_next(MockOp::StartMeasurement, "busy");
        let _ = orch
            .start(None, vec![ParameterId::S11], MeasurementConfig::default())
            .await;
        assert!(orch.state().is_terminal());
        orch.acknowledge().unwrap();
        assert_eq!(orch.snapshot(), MeasurementRun::default());
    }
}
