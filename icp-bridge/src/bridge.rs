//! Host-facing entry point.

use std::sync::Arc;

use serde_json::Value;

use crate::client::Correlator;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::events::{SubscriptionId, Unavailable};
use crate::frame::ROWS;
use crate::protocol::Command;
use crate::shutdown::ShutdownCoordinator;
use crate::supervisor::{LinkState, SupervisionState, Supervisor};

/// Drives the ICP display through the driver process.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
#[derive(Debug)]
pub struct IcpBridge {
    config: BridgeConfig,
    correlator: Arc<Correlator>,
    supervisor: Arc<Supervisor>,
    shutdown: ShutdownCoordinator,
}

impl IcpBridge {
    pub fn new(config: BridgeConfig) -> Self {
        let correlator = Arc::new(Correlator::new());
        let supervisor = Arc::new(Supervisor::new(config.clone(), Arc::clone(&correlator)));
        let shutdown =
            ShutdownCoordinator::new(config.clone(), Arc::clone(&correlator), Arc::clone(&supervisor));
        Self {
            config,
            correlator,
            supervisor,
            shutdown,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn state(&self) -> LinkState {
        self.supervisor.state()
    }

    pub fn supervision(&self) -> SupervisionState {
        self.supervisor.supervision()
    }

    /// Pid of the driver this bridge launched, while it is supervised.
    pub fn driver_pid(&self) -> Option<u32> {
        self.supervisor.process().map(|p| p.pid())
    }

    /// Connect to a running driver, or launch one.
    pub async fn connect_or_launch(&self) -> Result<()> {
        self.supervisor.connect_or_launch().await
    }

    /// Show a five-row frame. `lines` may contain inversion markers.
    pub async fn draw_icp(&self, lines: Vec<String>, font: Option<String>) -> Result<()> {
        if lines.len() != ROWS {
            return Err(BridgeError::InvalidFrame(format!(
                "Expected {ROWS} lines, got {}",
                lines.len()
            )));
        }
        self.call(Command::draw_icp(lines, font)).await.map(drop)
    }

    /// Blank the display.
    pub async fn clear_icp(&self) -> Result<()> {
        self.call(Command::clear_icp()).await.map(drop)
    }

    pub async fn ping(&self) -> Result<Value> {
        self.call(Command::ping()).await
    }

    async fn call(&self, command: Command) -> Result<Value> {
        if let Some(event) = self.supervisor.fatal().event() {
            return Err(BridgeError::Fatal {
                failures: event.failures,
            });
        }
        if self.correlator.is_stopping() && !command.permitted_while_stopping() {
            return Err(BridgeError::ShuttingDown);
        }
        if !self.correlator.is_attached() {
            self.supervisor.connect_or_launch().await?;
        }

        let result = self
            .correlator
            .call(command, self.config.call_timeout())
            .await;
        if let Err(e) = &result {
            if e.is_connection_fatal() {
                self.supervisor.connection_lost();
            }
        }
        result
    }

    /// Blank the display and stop the driver. Only the first call does
    /// anything.
    pub async fn shutdown(&self) {
        self.shutdown.run().await;
    }

    /// Subscribe to the one-shot "permanently unavailable" event. Invoked
    /// immediately if it already fired.
    pub fn on_unavailable(
        &self,
        callback: impl Fn(&Unavailable) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.supervisor.fatal().subscribe(callback)
    }

    pub fn remove_unavailable_callback(&self, id: SubscriptionId) -> bool {
        self.supervisor.fatal().unsubscribe(id)
    }

    pub fn is_unavailable(&self) -> bool {
        self.supervisor.fatal().is_fired()
    }
}
