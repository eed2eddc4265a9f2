//! Connection supervision for one instrument class.
//!
//! A [`ConnectionSupervisor`] owns the console's belief about whether an
//! instrument is connected. The belief changes only through `connect`,
//! `disconnect` and `reconcile`:
//!
//! ```text
//! Disconnected --connect--> Connecting --ok--> Connected
//! Connected --disconnect--> Disconnecting --ok--> Disconnected
//! ```
//!
//! A failed transition reverts to the prior stable state. At most one
//! transition is in flight; a second one is rejected, not queued.
//!
//! Reconciliation adopts the backend's status as ground truth. It is skipped
//! while a transition is in flight, and every transition bumps an epoch so a
//! status poll that was already on the wire when the transition began is
//! discarded when it lands.

use crate::error::{ConsoleError, ConsoleResult};
use crate::gateway::{ConnectParams, InstrumentClass, RequestGateway, StatusReport, Transport};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnectionStatus {
    /// A connect or disconnect request is in flight.
    pub fn is_transitioning(&self) -> bool {
        matches!(
            self,
            ConnectionStatus::Connecting | ConnectionStatus::Disconnecting
        )
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnecting => "disconnecting",
        };
        f.pad(s)
    }
}

/// What the backend last told us about the connected device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceIdentity {
    pub device_type: Option<String>,
    pub address: Option<String>,
    pub port: Option<u16>,
    pub serial_port: Option<String>,
    pub baud_rate: Option<u32>,
    pub seen_at: DateTime<Local>,
}

impl DeviceIdentity {
    fn from_report(report: &StatusReport) -> Self {
        Self {
            device_type: report.device_type.clone(),
            address: report.address.clone(),
            port: report.port,
            serial_port: report.serial_port.clone(),
            baud_rate: report.baud_rate,
            seen_at: Local::now(),
        }
    }

    fn from_params(params: &ConnectParams) -> Self {
        match params {
            ConnectParams::Network { host, port, device } => Self {
                device_type: device.map(|d| d.id().to_string()),
                address: Some(host.clone()),
                port: Some(*port),
                serial_port: None,
                baud_rate: None,
                seen_at: Local::now(),
            },
            ConnectParams::Serial {
                port_name,
                baud_rate,
            } => Self {
                device_type: None,
                address: None,
                port: None,
                serial_port: Some(port_name.clone()),
                baud_rate: Some(*baud_rate),
                seen_at: Local::now(),
            },
        }
    }

    fn transport(&self) -> Transport {
        if self.serial_port.is_some() {
            Transport::Serial
        } else {
            Transport::Network
        }
    }

    fn address_text(&self) -> Option<String> {
        match (&self.serial_port, &self.address, self.port) {
            (Some(name), _, _) => Some(match self.baud_rate {
                Some(baud) => format!("{name}@{baud}"),
                None => name.clone(),
            }),
            (None, Some(host), Some(port)) => Some(format!("{host}:{port}")),
            (None, Some(host), None) => Some(host.clone()),
            _ => None,
        }
    }
}

/// Cached connection state of one instrument.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstrumentConnection {
    pub instrument_class: InstrumentClass,
    pub transport: Option<Transport>,
    pub address: Option<String>,
    pub status: ConnectionStatus,
    pub identity: Option<DeviceIdentity>,
}

impl InstrumentConnection {
    fn new(instrument_class: InstrumentClass) -> Self {
        Self {
            instrument_class,
            transport: None,
            address: None,
            status: ConnectionStatus::Disconnected,
            identity: None,
        }
    }

    fn set_connected(&mut self, identity: DeviceIdentity) {
        self.status = ConnectionStatus::Connected;
        self.transport = Some(identity.transport());
        self.address = identity.address_text();
        self.identity = Some(identity);
    }

    fn set_disconnected(&mut self) {
        self.status = ConnectionStatus::Disconnected;
        self.identity = None;
    }
}

/// Result of one reconciliation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Backend status adopted.
    Adopted { connected: bool },
    /// Not polled: a transition was in flight.
    Skipped,
    /// Polled, but a transition started meanwhile; reply dropped.
    Discarded,
    /// Backend unreachable; belief set to disconnected.
    Unreachable,
}

struct ReconcilerHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

struct Inner {
    conn: InstrumentConnection,
    /// Bumped when a transition starts and when it ends.
    epoch: u64,
    reconciler: Option<ReconcilerHandle>,
}

struct Shared {
    class: InstrumentClass,
    inner: Mutex<Inner>,
    snapshots: watch::Sender<InstrumentConnection>,
    gateway: RequestGateway,
    reconcile_interval: Duration,
}

/// Connection state machine for one instrument class. Clones share state.
#[derive(Clone)]
pub struct ConnectionSupervisor {
    shared: Arc<Shared>,
}

impl ConnectionSupervisor {
    pub fn new(class: InstrumentClass, gateway: RequestGateway, reconcile_interval: Duration) -> Self {
        let conn = InstrumentConnection::new(class);
        let (snapshots, _) = watch::channel(conn.clone());
        Self {
            shared: Arc::new(Shared {
                class,
                inner: Mutex::new(Inner {
                    conn,
                    epoch: 0,
                    reconciler: None,
                }),
                snapshots,
                gateway,
                reconcile_interval,
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
        self.shared.snapshots.send_replace(inner.conn.clone());
    }

    pub fn class(&self) -> InstrumentClass {
        self.shared.class
    }

    pub fn snapshot(&self) -> InstrumentConnection {
        self.lock().conn.clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.lock().conn.status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn subscribe(&self) -> watch::Receiver<InstrumentConnection> {
        self.shared.snapshots.subscribe()
    }

    /// Fail with `InvalidState` unless the instrument is connected.
    pub fn ensure_connected(&self) -> ConsoleResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ConsoleError::InvalidState(format!(
                "{} is not connected",
                self.shared.class
            )))
        }
    }

    /// Begin a transition from `from` into `to`. Returns the state to revert
    /// to on failure.
    fn begin_transition(
        &self,
        from: ConnectionStatus,
        to: ConnectionStatus,
    ) -> ConsoleResult<ConnectionStatus> {
        let mut inner = self.lock();
        let current = inner.conn.status;
        if current.is_transitioning() {
            return Err(ConsoleError::Busy(format!(
                "{} is already {current}",
                self.shared.class
            )));
        }
        if current != from {
            return Err(ConsoleError::InvalidState(format!(
                "{} is {current}",
                self.shared.class
            )));
        }
        inner.conn.status = to;
        inner.epoch += 1;
        self.publish(&inner);
        Ok(current)
    }

    /// Connect the instrument.
    ///
    /// Rejected with `Busy` while another transition is in flight.
    pub async fn connect(&self, params: ConnectParams) -> ConsoleResult<()> {
        let class = self.shared.class;
        params.validate(class)?;
        let prior = self.begin_transition(ConnectionStatus::Disconnected, ConnectionStatus::Connecting)?;
        debug!(%class, address = %params.address(), "connecting");

        let result = self.shared.gateway.connect(class, &params).await;

        let mut inner = self.lock();
        inner.epoch += 1;
        match result {
            Ok(()) => {
                inner.conn.set_connected(DeviceIdentity::from_params(&params));
                self.publish(&inner);
                info!(%class, address = %params.address(), "connection established");
                Ok(())
            }
            Err(e) => {
                inner.conn.status = prior;
                self.publish(&inner);
                warn!(%class, error = %e, "connect failed");
                Err(e)
            }
        }
    }

    /// Disconnect the instrument.
    pub async fn disconnect(&self) -> ConsoleResult<()> {
        let class = self.shared.class;
        let prior = self.begin_transition(ConnectionStatus::Connected, ConnectionStatus::Disconnecting)?;

        let result = self.shared.gateway.disconnect(class).await;

        let mut inner = self.lock();
        inner.epoch += 1;
        match result {
            Ok(()) => {
                inner.conn.set_disconnected();
                self.publish(&inner);
                info!(%class, "disconnected");
                Ok(())
            }
            Err(e) => {
                inner.conn.status = prior;
                self.publish(&inner);
                warn!(%class, error = %e, "disconnect failed");
                Err(e)
            }
        }
    }

    /// Poll the backend once and adopt its view.
    ///
    /// Never fails: a missed poll sets the belief to disconnected.
    pub async fn reconcile(&self) -> ReconcileOutcome {
        let class = self.shared.class;
        let epoch = {
            let inner = self.lock();
            if inner.conn.status.is_transitioning() {
                debug!(%class, status = %inner.conn.status, "reconcile skipped, transition in flight");
                return ReconcileOutcome::Skipped;
            }
            inner.epoch
        };

        let result = self.shared.gateway.status(class).await;

        let mut inner = self.lock();
        if inner.epoch != epoch || inner.conn.status.is_transitioning() {
            debug!(%class, "discarding stale status poll");
            return ReconcileOutcome::Discarded;
        }
        let before = inner.conn.status;
        let outcome = match result {
            Ok(report) if report.connected => {
                inner.conn.set_connected(DeviceIdentity::from_report(&report));
                ReconcileOutcome::Adopted { connected: true }
            }
            Ok(_) => {
                inner.conn.set_disconnected();
                ReconcileOutcome::Adopted { connected: false }
            }
            Err(e) => {
                if before == ConnectionStatus::Connected {
                    warn!(%class, error = %e, "status poll failed, assuming disconnected");
                } else {
                    debug!(%class, error = %e, "status poll failed");
                }
                inner.conn.set_disconnected();
                ReconcileOutcome::Unreachable
            }
        };
        if inner.conn.status != before {
            info!(%class, from = %before, to = %inner.conn.status, "connection state reconciled");
        }
        self.publish(&inner);
        outcome
    }

    /// Start the periodic reconcile loop. The first poll runs immediately.
    ///
    /// Returns `false` if a loop is already running.
    pub fn spawn_reconciler(&self) -> bool {
        let mut inner = self.lock();
        if inner.reconciler.is_some() {
            return false;
        }
        let (shutdown, mut shutdown_rx) = oneshot::channel::<()>();
        // The loop must not keep the supervisor alive; the sender drops with it.
        let weak = Arc::downgrade(&self.shared);
        let period = self.shared.reconcile_interval;
        let class = self.shared.class;

        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        debug!(%class, "reconciler shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let Some(shared) = weak.upgrade() else {
                            break;
                        };
                        ConnectionSupervisor { shared }.reconcile().await;
                    }
                }
            }
        });

        inner.reconciler = Some(ReconcilerHandle { shutdown, task });
        debug!(%class, interval = ?period, "reconciler started");
        true
    }

    /// Stop the reconcile loop and wait for it to exit.
    pub async fn stop_reconciler(&self) -> bool {
        let handle = self.lock().reconciler.take();
        let Some(handle) = handle else {
            return false;
        };
        if handle.shutdown.send(()).is_err() {
            handle.task.abort();
            return true;
        }
        let mut task = handle.task;
        if tokio::time::timeout(Duration::from_secs(5), &mut task)
            .await
            .is_err()
        {
            warn!(class = %self.shared.class, "reconciler did not stop in time, aborting");
            task.abort();
        }
        true
    }

    pub fn is_reconciling(&self) -> bool {
        self.lock().reconciler.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::gateway::mock::{MockDeviceApi, MockOp};
    use tracing::Instrument;
    use tracing_test::traced_test;

    fn supervisor(mock: &MockDeviceApi, class: InstrumentClass) -> ConnectionSupervisor {
        let gateway = RequestGateway::new(Arc::new(mock.clone()), Duration::from_secs(5));
        ConnectionSupervisor::new(class, gateway, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_connect_records_identity() {
        let mock = MockDeviceApi::new();
        let sup = supervisor(&mock, InstrumentClass::Matrix);

        sup.connect(ConnectParams::network("192.168.2.11", 5025))
            .await
            .unwrap();
        let conn = sup.snapshot();
        assert_eq!(conn.status, ConnectionStatus::Connected);
        assert_eq!(conn.transport, Some(Transport::Network));
        assert_eq!(conn.address.as_deref(), Some("192.168.2.11:5025"));
    }

    #[tokio::test]
    async fn test_failed_connect_reverts() {
        let mock = MockDeviceApi::new();
        mock.reject_next(MockOp::Connect, "handshake failed");
        let sup = supervisor(&mock, InstrumentClass::Matrix);

        let err = sup
            .connect(ConnectParams::serial("/dev/ttyUSB0", 115200))
            .await
            .unwrap_err();
        assert!(matches!(err, ConsoleError::Domain { .. }));
        assert_eq!(sup.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_invalid_params_never_reach_backend() {
        let mock = MockDeviceApi::new();
        let sup = supervisor(&mock, InstrumentClass::Vna);
        let err = sup
            .connect(ConnectParams::network("192.168.1.100", 5025))
            .await
            .unwrap_err();
        assert!(matches!(err, ConsoleError::Validation(_)));
        assert_eq!(mock.call_count(MockOp::Connect), 0);
    }

    #[tokio::test]
    async fn test_failed_disconnect_stays_connected() {
        let mock = MockDeviceApi::new();
        let sup = supervisor(&mock, InstrumentClass::Matrix);
        sup.connect(ConnectParams::network("192.168.2.11", 5025))
            .await
            .unwrap();

        mock.fail_next(MockOp::Disconnect, TransportError::Unreachable("down".into()));
        let err = sup.disconnect().await.unwrap_err();
        assert!(err.is_backend_unavailable());
        assert_eq!(sup.status(), ConnectionStatus::Connected);

        sup.disconnect().await.unwrap();
        assert_eq!(sup.status(), ConnectionStatus::Disconnected);
        assert!(matches!(
            sup.disconnect().await,
            Err(ConsoleError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_reconcile_adopts_remote_state() {
        let mock = MockDeviceApi::new();
        let sup = supervisor(&mock, InstrumentClass::Vna);

        mock.set_remote_status(
            InstrumentClass::Vna,
            StatusReport {
                connected: true,
                device_type: Some("rohde-zna26".into()),
                address: Some("192.168.1.100".into()),
                port: Some(5025),
                ..StatusReport::default()
            },
        );
        assert_eq!(
            sup.reconcile().await,
            ReconcileOutcome::Adopted { connected: true }
        );
        let conn = sup.snapshot();
        assert_eq!(conn.status, ConnectionStatus::Connected);
        assert_eq!(
            conn.identity.and_then(|i| i.device_type).as_deref(),
            Some("rohde-zna26")
        );

        mock.set_remote_connected(InstrumentClass::Vna, false);
        assert_eq!(
            sup.reconcile().await,
            ReconcileOutcome::Adopted { connected: false }
        );
        assert_eq!(sup.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_missed_poll_fails_safe() {
        let mock = MockDeviceApi::new();
        let sup = supervisor(&mock, InstrumentClass::Matrix);
        sup.connect(ConnectParams::network("192.168.2.11", 5025))
            .await
            .unwrap();

        mock.fail_next(MockOp::Status, TransportError::Timeout(Duration::from_secs(30)));
        assert_eq!(sup.reconcile().await, ReconcileOutcome::Unreachable);
        assert_eq!(sup.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_poll_in_flight_when_transition_starts_is_discarded() {
        let mock = MockDeviceApi::new();
        let sup = supervisor(&mock, InstrumentClass::Matrix);

        let gate = mock.hold_next(MockOp::Status);
        let poll = {
            let sup = sup.clone();
            tokio::spawn(async move { sup.reconcile().await })
        };
        mock.wait_for_calls(MockOp::Status, 1).await;

        sup.connect(ConnectParams::network("192.168.2.11", 5025))
            .await
            .unwrap();
        // Adopting this reply would flip the belief back to disconnected.
        mock.set_remote_connected(InstrumentClass::Matrix, false);
        gate.release();

        assert_eq!(poll.await.unwrap(), ReconcileOutcome::Discarded);
        assert_eq!(sup.status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_reconcile_during_connect_is_skipped() {
        let mock = MockDeviceApi::new();
        let sup = supervisor(&mock, InstrumentClass::Matrix);

        let gate = mock.hold_next(MockOp::Connect);
        let connect = {
            let sup = sup.clone();
            tokio::spawn(
                async move {
                    sup.connect(ConnectParams::network("192.168.2.11", 5025))
                        .await
                }
                .in_current_span(),
            )
        };
        mock.wait_for_calls(MockOp::Connect, 1).await;

        assert_eq!(sup.reconcile().await, ReconcileOutcome::Skipped);
        assert_eq!(sup.status(), ConnectionStatus::Connecting);
        assert_eq!(mock.call_count(MockOp::Status), 0);
        assert!(matches!(
            sup.connect(ConnectParams::network("192.168.2.11", 5025)).await,
            Err(ConsoleError::Busy(_))
        ));

        gate.release();
        connect.await.unwrap().unwrap();
        assert_eq!(sup.status(), ConnectionStatus::Connected);
        assert_eq!(mock.call_count(MockOp::Connect), 1);

        logs_assert(|lines: &[&str]| {
            match lines
                .iter()
                .filter(|line| line.contains("connection established"))
                .count()
            {
                1 => Ok(()),
                n => Err(format!("expected one connection log line, found {n}")),
            }
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconciler_loop_runs_on_interval() {
        let mock = MockDeviceApi::new();
        let sup = supervisor(&mock, InstrumentClass::Matrix);
        mock.set_remote_connected(InstrumentClass::Matrix, true);

        assert!(sup.spawn_reconciler());
        assert!(!sup.spawn_reconciler());
        mock.wait_for_calls(MockOp::Status, 1).await;
        tokio::time::sleep(Duration::from_millis(10_100)).await;
        assert_eq!(mock.call_count(MockOp::Status), 3);
        assert!(sup.is_connected());

        assert!(sup.stop_reconciler().await);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(mock.call_count(MockOp::Status), 3);
        assert!(!sup.stop_reconciler().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_supervisor_ends_reconciler() {
        let mock = MockDeviceApi::new();
        let sup = supervisor(&mock, InstrumentClass::Vna);

        assert!(sup.spawn_reconciler());
        mock.wait_for_calls(MockOp::Status, 1).await;
        drop(sup);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(mock.call_count(MockOp::Status), 1);
    }
}
