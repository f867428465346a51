//! End-to-end tests of the host bridge against an in-process driver server.
#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use icp_bridge::{
    BridgeConfig, BridgeError, CommandDispatcher, DriverConfig, DriverServer, IcpBridge,
    LinkState, PipeAddress, PipeListener, VirtualDevice,
};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Driver {
    device: Arc<VirtualDevice>,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl Driver {
    fn start(addr: &PipeAddress) -> Self {
        let listener = PipeListener::bind(addr).unwrap();
        let device = Arc::new(VirtualDevice::new());
        let dispatcher = CommandDispatcher::new(device.clone(), &DriverConfig::default());
        let server = DriverServer::new(listener, dispatcher);
        let stop = server.shutdown_token();
        let task = tokio::spawn(server.run());
        Self { device, stop, task }
    }

    async fn stop(self) {
        self.stop.cancel();
        self.task.await.unwrap();
    }
}

fn bridge_config(dir: &std::path::Path) -> BridgeConfig {
    BridgeConfig {
        pipe_name: dir.join("icp.sock").to_string_lossy().into_owned(),
        // Never launch anything from these tests.
        driver_path: Some(dir.join("no-such-driver")),
        connect_timeout_ms: 300,
        call_timeout_ms: 1000,
        settle_delay_ms: 10,
        ..Default::default()
    }
}

fn frame(rows: [&str; 5]) -> Vec<String> {
    rows.iter().map(|r| r.to_string()).collect()
}

#[tokio::test]
async fn test_ping_draw_and_clear() {
    let dir = tempfile::tempdir().unwrap();
    let config = bridge_config(dir.path());
    let driver = Driver::start(&PipeAddress::from_name(&config.pipe_name));
    let bridge = IcpBridge::new(config);

    assert_eq!(bridge.ping().await.unwrap(), json!("pong"));
    assert_eq!(bridge.state(), LinkState::Connected);
    assert!(!bridge.supervision().owns_process);
    assert_eq!(bridge.driver_pid(), None);

    bridge
        .draw_icp(frame(["UHF ⟦305.000⟧", "", "", "", ""]), Some("DCS".into()))
        .await
        .unwrap();
    let snap = driver.device.snapshot();
    assert_eq!(snap.row_text(0), "UHF 305.000");
    let inverted: Vec<usize> = snap
        .row_inverted(0)
        .iter()
        .enumerate()
        .filter(|(_, inv)| **inv)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(inverted, (4..=10).collect::<Vec<_>>());

    bridge.clear_icp().await.unwrap();
    let first = driver.device.snapshot();
    bridge.clear_icp().await.unwrap();
    let second = driver.device.snapshot();
    assert!(first.is_blank());
    assert_eq!(first.cells, second.cells);

    driver.stop().await;
}

#[tokio::test]
async fn test_concurrent_draws_are_serialized() {
    let dir = tempfile::tempdir().unwrap();
    let config = bridge_config(dir.path());
    let driver = Driver::start(&PipeAddress::from_name(&config.pipe_name));
    let bridge = Arc::new(IcpBridge::new(config));
    bridge.connect_or_launch().await.unwrap();

    let draws: Vec<_> = (0..8)
        .map(|n| {
            let bridge = Arc::clone(&bridge);
            tokio::spawn(async move {
                let row = format!("FRAME {n}");
                bridge
                    .draw_icp(frame([row.as_str(), "", "", "", ""]), None)
                    .await
            })
        })
        .collect();
    for draw in draws {
        draw.await.unwrap().unwrap();
    }

    let snap = driver.device.snapshot();
    assert_eq!(snap.frames, 8);
    assert!(snap.row_text(0).starts_with("FRAME "));

    driver.stop().await;
}

#[tokio::test]
async fn test_reconnects_after_driver_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = bridge_config(dir.path());
    let addr = PipeAddress::from_name(&config.pipe_name);
    let bridge = IcpBridge::new(config);

    let driver = Driver::start(&addr);
    bridge.ping().await.unwrap();
    driver.stop().await;

    // The stale connection fails the next call and is dropped.
    let err = bridge.ping().await.unwrap_err();
    assert!(err.is_connection_fatal(), "{err}");
    assert_eq!(bridge.state(), LinkState::Disconnected);

    // With no driver and nothing to launch, the call fails without retrying.
    let err = bridge.ping().await.unwrap_err();
    assert!(matches!(err, BridgeError::Process(_)), "{err}");

    let driver = Driver::start(&addr);
    assert_eq!(bridge.ping().await.unwrap(), json!("pong"));
    assert_eq!(bridge.state(), LinkState::Connected);
    assert!(!bridge.is_unavailable());
    driver.stop().await;
}

#[tokio::test]
async fn test_shutdown_blanks_and_closes_driver() {
    let dir = tempfile::tempdir().unwrap();
    let config = bridge_config(dir.path());
    let driver = Driver::start(&PipeAddress::from_name(&config.pipe_name));
    let bridge = IcpBridge::new(config);

    bridge
        .draw_icp(frame(["A", "B", "C", "D", "E"]), None)
        .await
        .unwrap();
    assert!(!driver.device.snapshot().is_blank());

    bridge.shutdown().await;
    assert_eq!(bridge.state(), LinkState::ShutDown);
    assert!(driver.device.snapshot().is_blank());

    // `close` stops the server on its own.
    tokio::time::timeout(Duration::from_secs(2), driver.task)
        .await
        .unwrap()
        .unwrap();

    // A second shutdown is a no-op.
    bridge.shutdown().await;
    assert!(matches!(
        bridge.draw_icp(frame(["", "", "", "", ""]), None).await,
        Err(BridgeError::ShuttingDown)
    ));
}
