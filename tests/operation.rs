use std::{
    env, fs,
    path::PathBuf,
    process,
    sync::{atomic::Ordering, Arc},
    thread,
    time::Duration,
};

use hexflash::{
    log_sink::LogSource,
    monitor::MonitorPump,
    operation::{CancelState, FlashFiles, OperationReport, FLASH_PASSWORD},
    Error, LogSink, OperationKind, OperationRequest, OperationStatus, Orchestrator,
    SessionManager, SessionState,
};
use pretty_assertions::assert_eq;

mod common;

use common::{connected_session, wait_for, Device, FakeCapability, Outcome};

struct Bench {
    session: SessionManager,
    device: Arc<Device>,
    capability: Arc<FakeCapability>,
    log: LogSink,
    orchestrator: Orchestrator,
}

fn bench(capability: FakeCapability) -> Bench {
    let (session, device) = connected_session();
    let capability = Arc::new(capability);
    let log = LogSink::new();
    let orchestrator = Orchestrator::new(session.clone(), capability.clone(), log.clone());

    Bench {
        session,
        device,
        capability,
        log,
        orchestrator,
    }
}

fn texts(log: &LogSink) -> Vec<String> {
    log.snapshot().iter().map(|e| e.text.clone()).collect()
}

/// Firmware, bootloader and partition table in a fresh directory
fn images(name: &str) -> (PathBuf, FlashFiles) {
    let dir = env::temp_dir().join(format!("hexflash-it-{}-{name}", process::id()));
    fs::create_dir_all(&dir).unwrap();
    for file in ["app.bin", "bootloader.bin", "partitions.bin"] {
        fs::write(dir.join(file), [0xe9; 64]).unwrap();
    }

    let files = FlashFiles::new(
        Some(dir.join("app.bin")),
        dir.join("bootloader.bin"),
        dir.join("partitions.bin"),
    );
    (dir, files)
}

#[test]
fn wrong_password_changes_nothing() {
    let bench = bench(FakeCapability::new(Outcome::Succeed));
    bench.session.begin_monitor().unwrap();
    let (dir, files) = images("password");

    let result = bench
        .orchestrator
        .submit(OperationRequest::Flash(files), "QWERTYUIOP");

    assert!(matches!(result, Err(Error::InvalidPassword)));
    assert_eq!(bench.session.state(), SessionState::ConnectedMonitoring);
    assert_eq!(bench.device.reads.load(Ordering::SeqCst), 0);
    assert!(bench.device.written().is_empty());
    assert_eq!(bench.capability.runs.load(Ordering::SeqCst), 0);
    assert_eq!(
        texts(&bench.log),
        ["❌ Flash cancelled: Incorrect password."]
    );

    assert!(matches!(
        bench.orchestrator.submit(OperationRequest::Erase, ""),
        Err(Error::InvalidPassword)
    ));
    assert_eq!(
        texts(&bench.log)[1],
        "❌ Flash erase cancelled: Incorrect password."
    );
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn custom_password_replaces_default() {
    let (session, _device) = connected_session();
    let orchestrator = Orchestrator::new(
        session,
        Arc::new(FakeCapability::new(Outcome::Succeed)),
        LogSink::new(),
    )
    .with_password("hunter2");

    assert!(matches!(
        orchestrator.submit(OperationRequest::Erase, FLASH_PASSWORD),
        Err(Error::InvalidPassword)
    ));
    let operation = orchestrator
        .submit(OperationRequest::Erase, "hunter2")
        .unwrap();
    assert_eq!(operation.wait(), OperationStatus::Succeeded);
}

#[test]
fn missing_files_are_all_reported() {
    let bench = bench(FakeCapability::new(Outcome::Succeed));
    let dir = env::temp_dir().join(format!("hexflash-it-{}-missing", process::id()));
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("bootloader.bin"), b"boot").unwrap();

    let files = FlashFiles::new(
        Some(dir.join("app.bin")),
        dir.join("bootloader.bin"),
        dir.join("partitions.bin"),
    );
    let result = bench
        .orchestrator
        .submit(OperationRequest::Flash(files), FLASH_PASSWORD);

    let Err(Error::MissingFile(missing)) = result else {
        panic!("expected MissingFile");
    };
    assert_eq!(
        missing.names(),
        [
            dir.join("app.bin").display().to_string(),
            dir.join("partitions.bin").display().to_string(),
        ]
    );
    assert_eq!(bench.session.state(), SessionState::ConnectedIdle);
    assert_eq!(bench.capability.runs.load(Ordering::SeqCst), 0);
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn erase_suspends_monitor_until_finished() {
    let bench = bench(FakeCapability::new(Outcome::Succeed).gated());
    let reports = bench.orchestrator.subscribe();
    bench.session.begin_monitor().unwrap();

    let operation = bench
        .orchestrator
        .submit(OperationRequest::Erase, FLASH_PASSWORD)
        .unwrap();
    bench.capability.wait_started();

    assert_eq!(bench.session.state(), SessionState::OperationInProgress);
    assert_eq!(bench.session.exclusive_holders(), 1);
    for _ in 0..10 {
        assert!(matches!(
            bench.session.poll_monitor(&mut [0; 64]),
            Ok(None)
        ));
    }
    assert!(matches!(
        bench.session.disconnect(),
        Err(Error::OperationInProgress)
    ));

    bench.capability.release();
    assert_eq!(operation.wait(), OperationStatus::Succeeded);
    assert_eq!(
        reports.recv_timeout(Duration::from_secs(5)).unwrap(),
        OperationReport {
            kind: OperationKind::Erase,
            status: OperationStatus::Succeeded,
        }
    );

    // The monitor is not resumed on its own.
    assert_eq!(bench.session.state(), SessionState::ConnectedIdle);
    assert_eq!(bench.session.exclusive_holders(), 0);
    assert!(matches!(
        bench.session.poll_monitor(&mut [0; 64]),
        Ok(None)
    ));

    let log = texts(&bench.log);
    assert_eq!(log.first().map(String::as_str), Some("Starting flash erase…"));
    assert_eq!(log.last().map(String::as_str), Some("✅ Flash erase complete."));
}

#[test]
fn monitor_pump_stays_off_the_port_during_erase() {
    let bench = bench(FakeCapability::new(Outcome::Succeed).gated().quiet());
    bench.session.begin_monitor().unwrap();
    let pump = MonitorPump::spawn(bench.session.clone(), bench.log.clone()).unwrap();
    wait_for(|| bench.device.reads.load(Ordering::SeqCst) > 0);

    let operation = bench
        .orchestrator
        .submit(OperationRequest::Erase, FLASH_PASSWORD)
        .unwrap();
    bench.capability.wait_started();

    // The capability never reads, so every read from here on is the pump's.
    let reads = bench.device.reads.load(Ordering::SeqCst);
    bench.device.emit(b"rst:0xc (SW_CPU_RESET)\r\n");
    thread::sleep(Duration::from_millis(100));

    assert_eq!(bench.device.reads.load(Ordering::SeqCst), reads);
    assert!(matches!(
        bench.session.poll_monitor(&mut [0; 64]),
        Ok(None)
    ));
    assert!(bench
        .log
        .snapshot()
        .iter()
        .all(|entry| entry.source != LogSource::Device));

    bench.capability.release();
    assert_eq!(operation.wait(), OperationStatus::Succeeded);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(bench.device.reads.load(Ordering::SeqCst), reads);

    // Output sent during the erase is still there once monitoring resumes.
    bench.session.begin_monitor().unwrap();
    wait_for(|| {
        bench
            .log
            .snapshot()
            .iter()
            .any(|entry| entry.source == LogSource::Device)
    });
    pump.stop();

    let device_lines: Vec<_> = bench
        .log
        .snapshot()
        .iter()
        .filter(|entry| entry.source == LogSource::Device)
        .map(|entry| entry.text.clone())
        .collect();
    assert_eq!(device_lines, ["rst:0xc (SW_CPU_RESET)"]);
}

#[test]
fn second_submission_is_rejected() {
    let bench = bench(FakeCapability::new(Outcome::Succeed).gated());
    let (dir, files) = images("twice");

    let first = bench
        .orchestrator
        .submit(OperationRequest::Flash(files.clone()), FLASH_PASSWORD)
        .unwrap();
    bench.capability.wait_started();

    assert!(matches!(
        bench
            .orchestrator
            .submit(OperationRequest::Flash(files), FLASH_PASSWORD),
        Err(Error::AlreadyInProgress(OperationKind::Flash))
    ));
    assert!(matches!(
        bench
            .orchestrator
            .submit(OperationRequest::Erase, FLASH_PASSWORD),
        Err(Error::AlreadyInProgress(OperationKind::Flash))
    ));

    bench.capability.release();
    assert_eq!(first.wait(), OperationStatus::Succeeded);
    assert_eq!(bench.capability.runs.load(Ordering::SeqCst), 1);
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn progress_lines_are_logged_while_running() {
    let bench = bench(
        FakeCapability::new(Outcome::Succeed)
            .gated()
            .with_lines(&["Connecting...", "Chip type: esp32", "Writing at 0x00010000"]),
    );
    let (dir, files) = images("progress");

    let operation = bench
        .orchestrator
        .submit(OperationRequest::Flash(files), FLASH_PASSWORD)
        .unwrap();
    bench.capability.wait_started();

    let log = texts(&bench.log);
    assert!(log.contains(&"Chip type: esp32".to_owned()));
    assert!(!operation.is_finished());
    assert!(bench
        .log
        .snapshot()
        .iter()
        .all(|entry| entry.source == LogSource::System));

    bench.capability.release();
    operation.wait();
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn failure_keeps_last_output_line() {
    let bench = bench(
        FakeCapability::new(Outcome::ExitCode(2))
            .with_lines(&["Connecting...", "A fatal error occurred: Failed to connect"]),
    );
    let (dir, files) = images("failure");

    let status = bench
        .orchestrator
        .submit(OperationRequest::Flash(files), FLASH_PASSWORD)
        .unwrap()
        .wait();

    assert_eq!(
        status,
        OperationStatus::Failed {
            reason: "Flashing tool exited with code 2".into(),
            last_line: Some("A fatal error occurred: Failed to connect".into()),
        }
    );
    assert!(texts(&bench.log).contains(&"❌ Flash failed: Flashing tool exited with code 2".into()));
    assert_eq!(bench.session.state(), SessionState::ConnectedIdle);
    assert_eq!(bench.capability.runs.load(Ordering::SeqCst), 1);
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn cancellation_is_confirmed_when_supported() {
    let bench = bench(FakeCapability::new(Outcome::Succeed).gated());
    let reports = bench.orchestrator.subscribe();

    assert!(matches!(bench.orchestrator.cancel(), Err(Error::NoOperation)));

    let operation = bench
        .orchestrator
        .submit(OperationRequest::Erase, FLASH_PASSWORD)
        .unwrap();
    bench.capability.wait_started();
    assert_eq!(operation.cancel_state(), CancelState::NotRequested);

    let state = bench.orchestrator.cancel().unwrap();
    assert!(matches!(
        state,
        CancelState::Requested | CancelState::Confirmed
    ));

    assert_eq!(operation.wait(), OperationStatus::Cancelled);
    assert_eq!(operation.cancel_state(), CancelState::Confirmed);
    assert_eq!(
        reports.recv_timeout(Duration::from_secs(5)).unwrap().status,
        OperationStatus::Cancelled
    );
    assert_eq!(bench.session.state(), SessionState::ConnectedIdle);
    assert!(texts(&bench.log).contains(&"Flash erase cancelled.".into()));
}

#[test]
fn uninterruptible_operation_runs_on_unobserved() {
    let bench = bench(FakeCapability::new(Outcome::Succeed).gated().uncancellable());
    let reports = bench.orchestrator.subscribe();

    let operation = bench
        .orchestrator
        .submit(OperationRequest::Erase, FLASH_PASSWORD)
        .unwrap();
    bench.capability.wait_started();

    assert!(matches!(
        bench.orchestrator.cancel(),
        Err(Error::Unsupported(OperationKind::Erase))
    ));
    assert!(!operation.is_observed());
    assert_eq!(operation.cancel_state(), CancelState::Requested);
    assert!(texts(&bench.log)
        .iter()
        .any(|line| line.contains("could not be interrupted")));

    // Still holding the port and running.
    assert_eq!(bench.session.state(), SessionState::OperationInProgress);

    bench.capability.release();
    assert_eq!(operation.wait(), OperationStatus::Succeeded);
    wait_for(|| bench.session.state() == SessionState::ConnectedIdle);
    assert!(reports.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn lost_port_fails_operation_and_disconnects() {
    let bench = bench(FakeCapability::new(Outcome::LosePort).gated());

    let operation = bench
        .orchestrator
        .submit(OperationRequest::Erase, FLASH_PASSWORD)
        .unwrap();
    bench.capability.wait_started();

    bench.device.unplugged.store(true, Ordering::SeqCst);
    bench.capability.release();

    assert!(matches!(operation.wait(), OperationStatus::Failed { .. }));
    assert_eq!(bench.session.state(), SessionState::Disconnected);
    assert!(texts(&bench.log).contains(&"Serial port lost, disconnected.".into()));
    assert!(bench.capability.finished.load(Ordering::SeqCst));
}

#[test]
fn lost_port_fails_operation_the_tool_reported_as_done() {
    let bench = bench(FakeCapability::new(Outcome::IgnoreLostPort).gated().quiet());
    let reports = bench.orchestrator.subscribe();

    let operation = bench
        .orchestrator
        .submit(OperationRequest::Erase, FLASH_PASSWORD)
        .unwrap();
    bench.capability.wait_started();

    bench.device.unplugged.store(true, Ordering::SeqCst);
    bench.capability.release();

    let OperationStatus::Failed { reason, .. } = operation.wait() else {
        panic!("expected a failed erase");
    };
    assert_eq!(reason, "serial port lost");
    assert!(matches!(
        reports.recv_timeout(Duration::from_secs(5)).unwrap().status,
        OperationStatus::Failed { .. }
    ));
    assert_eq!(bench.session.state(), SessionState::Disconnected);

    let log = texts(&bench.log);
    assert!(log.contains(&"❌ Flash erase failed: serial port lost".into()));
    assert!(!log.iter().any(|line| line.contains("complete")));
}

#[test]
fn operation_requires_connection() {
    let bench = bench(FakeCapability::new(Outcome::Succeed));
    bench.session.disconnect().unwrap();

    assert!(matches!(
        bench
            .orchestrator
            .submit(OperationRequest::Erase, FLASH_PASSWORD),
        Err(Error::NotConnected)
    ));
    assert!(bench.orchestrator.current().is_none());
}
