//! Supervision tests against the real driver executable.
#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use icp_bridge::{exit_codes, BridgeConfig, BridgeError, IcpBridge, LinkState};

const DRIVER: &str = env!("CARGO_BIN_EXE_icp-driver");

fn socket(dir: &Path) -> String {
    dir.join("icp.sock").to_string_lossy().into_owned()
}

fn bridge_config(dir: &Path) -> BridgeConfig {
    BridgeConfig {
        pipe_name: socket(dir),
        driver_path: Some(PathBuf::from(DRIVER)),
        verbose_driver: false,
        connect_timeout_ms: 300,
        launch_poll_ms: 50,
        restart_backoff_ms: 100,
        settle_delay_ms: 10,
        ..Default::default()
    }
}

fn blank() -> Vec<String> {
    vec![String::new(); 5]
}

fn is_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

fn kill(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

/// Wait until the bridge supervises a driver other than `old`.
async fn wait_for_new_pid(bridge: &IcpBridge, old: u32) -> u32 {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(pid) = bridge.driver_pid().filter(|pid| *pid != old) {
            if bridge.state() == LinkState::Connected {
                return pid;
            }
        }
        assert!(Instant::now() < deadline, "driver was not relaunched");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Start a driver by hand, the way a previous session would have left one.
fn start_manual_driver(pipe: &str) -> Child {
    let child = Command::new(DRIVER)
        .args(["--headless", "--pipe", pipe])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    while std::os::unix::net::UnixStream::connect(pipe).is_err() {
        assert!(Instant::now() < deadline, "manual driver never listened");
        std::thread::sleep(Duration::from_millis(20));
    }
    child
}

fn wait_child(child: &mut Child) -> std::process::ExitStatus {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(status) = child.try_wait().unwrap() {
            return status;
        }
        assert!(Instant::now() < deadline, "driver did not exit");
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_launch_draw_and_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let bridge = IcpBridge::new(bridge_config(dir.path()));

    bridge.connect_or_launch().await.unwrap();
    assert_eq!(bridge.state(), LinkState::Connected);
    assert!(bridge.supervision().owns_process);
    let pid = bridge.driver_pid().unwrap();
    assert!(is_alive(pid));

    assert_eq!(bridge.ping().await.unwrap(), serde_json::json!("pong"));
    bridge
        .draw_icp(
            vec![
                "UHF ⟦305.000⟧".into(),
                String::new(),
                String::new(),
                String::new(),
                String::new(),
            ],
            Some("DCS".into()),
        )
        .await
        .unwrap();

    bridge.shutdown().await;
    assert!(!is_alive(pid));
    assert!(!Path::new(&socket(dir.path())).exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_killed_driver_is_relaunched() {
    let dir = tempfile::tempdir().unwrap();
    let bridge = IcpBridge::new(bridge_config(dir.path()));
    bridge.connect_or_launch().await.unwrap();
    let first = bridge.driver_pid().unwrap();

    kill(first);
    let second = wait_for_new_pid(&bridge, first).await;
    assert_eq!(bridge.supervision().consecutive_failures, 1);
    bridge.draw_icp(blank(), None).await.unwrap();

    bridge.shutdown().await;
    assert!(!is_alive(second));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_third_consecutive_failure_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let bridge = IcpBridge::new(bridge_config(dir.path()));
    let (tx, rx) = mpsc::channel();
    bridge.on_unavailable(move |event| {
        let _ = tx.send(event.clone());
    });

    bridge.connect_or_launch().await.unwrap();
    let mut pid = bridge.driver_pid().unwrap();
    for _ in 0..2 {
        kill(pid);
        pid = wait_for_new_pid(&bridge, pid).await;
    }
    assert!(!bridge.is_unavailable());

    kill(pid);
    let event = tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_secs(10)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.failures, 3);
    assert_eq!(bridge.state(), LinkState::Fatal);
    assert!(bridge.is_unavailable());
    assert_eq!(bridge.driver_pid(), None);

    let err = bridge.draw_icp(blank(), None).await.unwrap_err();
    assert!(matches!(err, BridgeError::Fatal { failures: 3 }), "{err}");

    // Late subscribers still hear about it.
    let (late_tx, late_rx) = mpsc::channel();
    bridge.on_unavailable(move |event| {
        let _ = late_tx.send(event.failures);
    });
    assert_eq!(late_rx.try_recv().unwrap(), 3);

    bridge.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reuses_running_driver() {
    let dir = tempfile::tempdir().unwrap();
    let pipe = socket(dir.path());
    let mut manual = start_manual_driver(&pipe);

    let bridge = IcpBridge::new(bridge_config(dir.path()));
    bridge.connect_or_launch().await.unwrap();
    assert!(!bridge.supervision().owns_process);
    assert_eq!(bridge.driver_pid(), None);
    bridge.draw_icp(blank(), None).await.unwrap();

    // Shutdown still closes a driver it did not launch.
    bridge.shutdown().await;
    assert!(wait_child(&mut manual).success());
}

#[test]
fn test_second_driver_reports_address_in_use() {
    let dir = tempfile::tempdir().unwrap();
    let pipe = socket(dir.path());
    let mut first = start_manual_driver(&pipe);

    let status = Command::new(DRIVER)
        .args(["--headless", "--pipe", &pipe])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(exit_codes::ADDRESS_IN_USE));

    first.kill().unwrap();
    first.wait().unwrap();
}
