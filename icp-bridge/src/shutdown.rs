//! Best-effort teardown of the driver link.
//!
//! Blanks the display and closes the driver so it never keeps showing stale
//! cockpit data after the host exits, even when the driver is slow or
//! already gone.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::client::Correlator;
use crate::config::BridgeConfig;
use crate::protocol::Command;
use crate::supervisor::Supervisor;

/// Runs the shutdown sequence at most once.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    correlator: Arc<Correlator>,
    supervisor: Arc<Supervisor>,
    config: BridgeConfig,
    started: AtomicBool,
}

impl ShutdownCoordinator {
    pub fn new(config: BridgeConfig, correlator: Arc<Correlator>, supervisor: Arc<Supervisor>) -> Self {
        Self {
            correlator,
            supervisor,
            config,
            started: AtomicBool::new(false),
        }
    }

    pub fn has_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Run the sequence. Returns `false` without doing anything if it already
    /// ran (or is running).
    pub async fn run(&self) -> bool {
        if self.started.swap(true, Ordering::AcqRel) {
            return false;
        }
        tracing::info!("shutting down ICP bridge");

        self.correlator.set_stopping();
        self.supervisor.shutdown_requested();

        // One budget covers every step below.
        let budget = self.config.shutdown_budget();
        let deadline = Instant::now() + budget;
        if tokio::time::timeout_at(deadline, self.blank_and_close()).await.is_err() {
            tracing::warn!("blank-and-close did not finish within {budget:?}");
        }

        if let Some(process) = self.supervisor.process() {
            let exit_wait = self.config.exit_wait().min(remaining(deadline));
            match process.wait_exit(exit_wait).await {
                Some(status) => tracing::info!("ICP driver exited: {status}"),
                None => {
                    process.terminate(remaining(deadline)).await;
                }
            }
        }

        if tokio::time::timeout_at(deadline, self.correlator.detach()).await.is_err() {
            tracing::warn!("driver connection still busy after {budget:?}");
        }
        tracing::info!("ICP bridge shut down");
        true
    }

    async fn blank_and_close(&self) {
        // Waits for any in-flight call to finish or time out.
        let mut gate = self.correlator.acquire().await;
        if !gate.is_attached() {
            tracing::debug!("no driver connection, skipping blank and close");
            return;
        }

        let timeout = self.config.shutdown_call_timeout();
        if let Err(e) = gate.call(Command::clear_icp(), timeout).await {
            tracing::warn!("clearIcp during shutdown failed: {e}");
        }
        tokio::time::sleep(self.config.settle_delay()).await;
        if let Err(e) = gate.call(Command::close(), timeout).await {
            tracing::warn!("close during shutdown failed: {e}");
        }
        gate.detach().await;
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;
    use crate::protocol::{encode_line, parse_request, Response};
    use crate::transport::PipeConnection;

    fn coordinator(correlator: Arc<Correlator>) -> ShutdownCoordinator {
        let config = BridgeConfig {
            settle_delay_ms: 10,
            shutdown_call_timeout_ms: 300,
            ..Default::default()
        };
        let supervisor = Arc::new(Supervisor::new(config.clone(), Arc::clone(&correlator)));
        ShutdownCoordinator::new(config, correlator, supervisor)
    }

    #[tokio::test]
    async fn test_waits_for_in_flight_draw() {
        let (host, driver) = tokio::io::duplex(4096);
        let correlator = Arc::new(Correlator::new());
        correlator.attach(PipeConnection::from_stream(host)).await;

        // A driver that answers drawIcp slowly and with an error, then
        // acknowledges everything else.
        let seen = tokio::spawn(async move {
            let mut conn = PipeConnection::from_stream(driver);
            let mut seen = Vec::new();
            while let Some(line) = conn.read_line().await.unwrap() {
                let req = parse_request(&line).unwrap();
                let name = req.command.name();
                seen.push(name);
                let resp = if name == "drawIcp" {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Response::failure(Some(req.id), "device busy")
                } else {
                    Response::success(req.id, serde_json::Value::Null)
                };
                conn.write_line(&encode_line(&resp).unwrap()).await.unwrap();
            }
            seen
        });

        let draw = {
            let correlator = Arc::clone(&correlator);
            tokio::spawn(async move {
                correlator
                    .call(
                        Command::draw_icp(vec![String::new(); 5], None),
                        Duration::from_secs(2),
                    )
                    .await
            })
        };
        // Let the draw take the gate first.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let shutdown = coordinator(Arc::clone(&correlator));
        assert!(shutdown.run().await);

        let draw = draw.await.unwrap();
        assert!(matches!(draw, Err(BridgeError::Command { .. })));
        assert_eq!(seen.await.unwrap(), vec!["drawIcp", "clearIcp", "close"]);
        assert!(!correlator.is_attached());
    }

    #[tokio::test]
    async fn test_queued_draw_is_refused() {
        let (host, driver) = tokio::io::duplex(4096);
        let correlator = Arc::new(Correlator::new());
        correlator.attach(PipeConnection::from_stream(host)).await;

        let seen = tokio::spawn(async move {
            let mut conn = PipeConnection::from_stream(driver);
            let mut seen = Vec::new();
            while let Some(line) = conn.read_line().await.unwrap() {
                let req = parse_request(&line).unwrap();
                seen.push(req.command.name());
                if req.command.name() == "drawIcp" {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                let resp = Response::success(req.id, serde_json::Value::Null);
                conn.write_line(&encode_line(&resp).unwrap()).await.unwrap();
            }
            seen
        });

        let draw = |correlator: &Arc<Correlator>| {
            let correlator = Arc::clone(correlator);
            tokio::spawn(async move {
                correlator
                    .call(
                        Command::draw_icp(vec![String::new(); 5], None),
                        Duration::from_secs(2),
                    )
                    .await
            })
        };
        // The first draw is on the wire, the second waits for the gate.
        let in_flight = draw(&correlator);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let queued = draw(&correlator);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(coordinator(Arc::clone(&correlator)).run().await);

        assert!(in_flight.await.unwrap().is_ok());
        assert!(matches!(
            queued.await.unwrap(),
            Err(BridgeError::ShuttingDown)
        ));
        assert_eq!(seen.await.unwrap(), vec!["drawIcp", "clearIcp", "close"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_owned_driver_is_killed_within_budget() {
        use crate::supervisor::DriverProcess;
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("stubborn-driver");
        std::fs::write(&script, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        let config = BridgeConfig {
            driver_path: Some(script),
            verbose_driver: false,
            exit_wait_ms: 5000,
            shutdown_budget_ms: 400,
            ..Default::default()
        };

        let correlator = Arc::new(Correlator::new());
        let supervisor = Arc::new(Supervisor::new(config.clone(), Arc::clone(&correlator)));
        supervisor.supervise(DriverProcess::spawn(&config).unwrap());
        let process = supervisor.process().unwrap();
        let shutdown = ShutdownCoordinator::new(config, correlator, Arc::clone(&supervisor));

        let started = std::time::Instant::now();
        assert!(shutdown.run().await);
        assert!(started.elapsed() < Duration::from_millis(1500));

        // The kill was issued even though the budget ran out first.
        let status = process.wait_exit(Duration::from_secs(5)).await.unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn test_runs_once_and_rejects_draws() {
        let correlator = Arc::new(Correlator::new());
        let shutdown = coordinator(Arc::clone(&correlator));
        assert!(shutdown.run().await);
        assert!(!shutdown.run().await);
        assert!(shutdown.has_started());

        let err = correlator
            .call(
                Command::draw_icp(vec![String::new(); 5], None),
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::ShuttingDown));
    }

    #[tokio::test]
    async fn test_unresponsive_driver_is_bounded() {
        let (host, _driver) = tokio::io::duplex(4096);
        let correlator = Arc::new(Correlator::new());
        correlator.attach(PipeConnection::from_stream(host)).await;

        let shutdown = coordinator(Arc::clone(&correlator));
        let started = std::time::Instant::now();
        assert!(shutdown.run().await);
        // Two short call timeouts plus the settle delay.
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!correlator.is_attached());
    }
}
