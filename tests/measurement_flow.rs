//! Measurement runs driven through the console against the mock backend.

use rf_console::config::ConsoleConfig;
use rf_console::gateway::mock::{MockDeviceApi, MockOp};
use rf_console::gateway::{ConnectParams, MeasurementStatus};
use rf_console::measurement::{
    MeasurementConfig, MeasurementMode, MeasurementResult, ParameterId, RunState,
};
use rf_console::protocol::VnaDevice;
use rf_console::{Console, ConsoleError, ValidationError};
use std::sync::Arc;
use std::time::Duration;

fn running(progress: f64, current: u32, results: Vec<MeasurementResult>) -> MeasurementStatus {
    MeasurementStatus {
        is_running: true,
        progress,
        current_measurement: current,
        total_measurements: 20,
        results,
    }
}

fn result(parameter: &str, taken: u32) -> MeasurementResult {
    MeasurementResult {
        parameter: parameter.to_string(),
        measurements_taken: taken,
        artifact_path: format!("data/{parameter}_{taken}.s2p"),
    }
}

fn sweep(count: u32) -> MeasurementConfig {
    MeasurementConfig {
        measurement_count: count,
        ..MeasurementConfig::default()
    }
}

async fn vna_console(mock: &MockDeviceApi) -> Console {
    let console = Console::new(ConsoleConfig::default(), Arc::new(mock.clone()));
    console
        .connect_vna(ConnectParams::vna(VnaDevice::RohdeZna26, "192.168.1.100", 5025))
        .await
        .unwrap();
    console
}

async fn wait_for_state(console: &Console, state: RunState) {
    let mut updates = console.orchestrator().subscribe();
    tokio::time::timeout(
        Duration::from_secs(60),
        updates.wait_for(|run| run.state == state),
    )
    .await
    .expect("timed out waiting for run state")
    .expect("orchestrator dropped");
}

#[tokio::test(start_paused = true)]
async fn test_run_completes_with_last_polled_results() {
    let mock = MockDeviceApi::new();
    let mut console = vna_console(&mock).await;
    console.toggle_parameter(ParameterId::S11).unwrap();
    console.toggle_parameter(ParameterId::S21).unwrap();

    let last = vec![result("S11", 10), result("S21", 10)];
    mock.script_measurement([
        running(25.0, 5, vec![]),
        running(50.0, 10, vec![result("S11", 10)]),
        running(75.0, 15, vec![result("S11", 10), result("S21", 5)]),
        MeasurementStatus {
            is_running: false,
            progress: 100.0,
            current_measurement: 20,
            total_measurements: 20,
            results: last.clone(),
        },
    ]);

    let run_id = console.start_measurement_with(sweep(10)).await.unwrap();
    let run = console.measurement();
    assert_eq!(run.state, RunState::Running);
    assert_eq!(run.total_count, 20);
    assert_eq!(run.device, Some(VnaDevice::RohdeZna26));

    wait_for_state(&console, RunState::Completed).await;

    let run = console.measurement();
    assert_eq!(run.id, Some(run_id));
    assert_eq!(run.results, last);
    assert_eq!(run.progress_percent, 100.0);
    assert_eq!(mock.call_count(MockOp::MeasurementStatus), 4);
    assert!(!console.orchestrator().is_polling());

    // No further polls once completed.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(mock.call_count(MockOp::MeasurementStatus), 4);
    assert!(mock
        .call_log()
        .contains(&"start_measurement S11,S21 x10".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_export_bundles_completed_results() {
    let mock = MockDeviceApi::new();
    let mut console = vna_console(&mock).await;
    console.toggle_parameter(ParameterId::S11).unwrap();
    console.toggle_parameter(ParameterId::S21).unwrap();

    let err = console.export_results().await.unwrap_err();
    assert!(err
        .validation_errors()
        .is_some_and(|errors| errors.contains(&ValidationError::NothingToExport)));
    assert_eq!(mock.call_count(MockOp::ExportResults), 0);

    mock.script_measurement([MeasurementStatus {
        is_running: false,
        progress: 100.0,
        current_measurement: 2,
        total_measurements: 2,
        results: vec![result("S11", 1), result("S21", 1)],
    }]);
    console.start_measurement_with(sweep(1)).await.unwrap();
    wait_for_state(&console, RunState::Completed).await;

    let archive = console.export_results().await.unwrap();
    assert_eq!(
        String::from_utf8(archive).unwrap(),
        "data/S11_1.s2p\ndata/S21_1.s2p"
    );
    assert!(mock.call_log().contains(&"export_results 2".to_string()));

    mock.reject_next(MockOp::ExportResults, "no CSV files found");
    let err = console.export_results().await.unwrap_err();
    assert!(matches!(&err, ConsoleError::Domain { message } if message == "no CSV files found"));
}

#[tokio::test(start_paused = true)]
async fn test_second_stop_is_a_no_op() {
    let mock = MockDeviceApi::new();
    let mut console = vna_console(&mock).await;
    console.toggle_all();
    mock.script_measurement([running(10.0, 1, vec![])]);

    console.start_measurement_with(sweep(5)).await.unwrap();
    assert!(console.stop_measurement().await.unwrap());
    assert!(!console.stop_measurement().await.unwrap());

    assert_eq!(console.measurement().state, RunState::Completed);
    assert_eq!(mock.call_count(MockOp::StopMeasurement), 1);
    assert!(!console.orchestrator().is_polling());
}

#[tokio::test(start_paused = true)]
async fn test_poll_in_flight_during_stop_is_dropped() {
    let mock = MockDeviceApi::new();
    let mut console = vna_console(&mock).await;
    console.toggle_parameter(ParameterId::S11).unwrap();

    let gate = mock.hold_next(MockOp::MeasurementStatus);
    mock.script_measurement([running(90.0, 45, vec![result("S11", 45)])]);
    console.start_measurement_with(sweep(50)).await.unwrap();
    mock.wait_for_calls(MockOp::MeasurementStatus, 1).await;

    assert!(console.stop_measurement().await.unwrap());
    gate.release();
    tokio::time::sleep(Duration::from_secs(5)).await;

    let run = console.measurement();
    assert_eq!(run.state, RunState::Completed);
    assert!(run.results.is_empty());
    assert_eq!(run.progress_percent, 0.0);
    assert_eq!(mock.call_count(MockOp::MeasurementStatus), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_polling_drops_late_reply_and_resumes() {
    let mock = MockDeviceApi::new();
    let mut console = vna_console(&mock).await;
    console.toggle_parameter(ParameterId::S11).unwrap();

    let finished = MeasurementStatus {
        is_running: false,
        progress: 100.0,
        current_measurement: 20,
        total_measurements: 20,
        results: vec![result("S11", 20)],
    };
    let gate = mock.hold_next(MockOp::MeasurementStatus);
    mock.script_measurement([running(50.0, 10, vec![result("S11", 10)]), finished.clone()]);
    console.start_measurement_with(sweep(20)).await.unwrap();
    mock.wait_for_calls(MockOp::MeasurementStatus, 1).await;

    let orchestrator = console.orchestrator();
    assert!(orchestrator.cancel_polling());
    assert!(!orchestrator.cancel_polling());
    gate.release();
    tokio::time::sleep(Duration::from_secs(5)).await;

    let run = console.measurement();
    assert_eq!(run.state, RunState::Running);
    assert!(run.results.is_empty());
    assert_eq!(run.progress_percent, 0.0);
    assert_eq!(mock.call_count(MockOp::MeasurementStatus), 1);
    assert!(!orchestrator.is_polling());

    orchestrator.resume_polling().unwrap();
    assert!(orchestrator.is_polling());
    wait_for_state(&console, RunState::Completed).await;

    let run = console.measurement();
    assert_eq!(run.results, finished.results);
    assert_eq!(mock.call_count(MockOp::MeasurementStatus), 2);
    assert!(matches!(
        orchestrator.resume_polling(),
        Err(ConsoleError::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_mode_change_prunes_selection() {
    let mock = MockDeviceApi::new();
    let mut console = vna_console(&mock).await;

    console.toggle_parameter(ParameterId::S11).unwrap();
    console.toggle_parameter(ParameterId::S22).unwrap();
    console.set_mode(MeasurementMode::Basic);
    assert_eq!(
        console.selection().to_vec(),
        vec![ParameterId::S11, ParameterId::S22]
    );
    console.set_mode(MeasurementMode::Mixer);
    assert!(console.selection().is_empty());

    let err = console.toggle_parameter(ParameterId::S11).unwrap_err();
    assert!(err
        .validation_errors()
        .is_some_and(|errors| matches!(
            errors.iter().next(),
            Some(ValidationError::ParameterNotInMode { .. })
        )));

    let err = console.start_measurement().await.unwrap_err();
    assert!(err
        .validation_errors()
        .is_some_and(|errors| errors.contains(&ValidationError::EmptyParameterSet)));
    assert_eq!(mock.call_count(MockOp::StartMeasurement), 0);
    assert_eq!(console.measurement().state, RunState::Idle);

    console.toggle_all();
    assert_eq!(
        console.selection().to_vec(),
        vec![
            ParameterId::Sc11,
            ParameterId::Sc12,
            ParameterId::Sc21,
            ParameterId::Sc22
        ]
    );
}

#[tokio::test]
async fn test_start_requires_connected_vna() {
    let mock = MockDeviceApi::new();
    let mut console = Console::new(ConsoleConfig::default(), Arc::new(mock.clone()));
    console.toggle_all();

    assert!(matches!(
        console.start_measurement().await,
        Err(ConsoleError::InvalidState(_))
    ));
    assert_eq!(mock.call_count(MockOp::StartMeasurement), 0);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_start_fails_and_allows_retry() {
    let mock = MockDeviceApi::new();
    let mut console = vna_console(&mock).await;
    console.toggle_parameter(ParameterId::S12).unwrap();

    mock.reject_next(MockOp::StartMeasurement, "VNA not ready");
    let err = console.start_measurement().await.unwrap_err();
    assert!(matches!(err, ConsoleError::Domain { .. }));
    assert!(matches!(console.measurement().state, RunState::Failed(_)));

    console.start_measurement().await.unwrap();
    assert_eq!(console.measurement().state, RunState::Running);
    assert!(matches!(
        console.start_measurement().await,
        Err(ConsoleError::Busy(_))
    ));

    console.stop_measurement().await.unwrap();
    console.acknowledge_measurement().unwrap();
    assert_eq!(console.measurement().state, RunState::Idle);
}
