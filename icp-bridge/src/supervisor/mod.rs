//! Driver process supervision.
//!
//! [`Supervisor`] decides whether to reuse a listening driver or launch one,
//! watches the processes it launched and relaunches them with backoff until
//! the failure budget runs out. All decisions come from the pure
//! [`StateMachine`]; this module only carries them out.

pub mod machine;
pub mod process;

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::client::Correlator;
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::events::{FatalLatch, Unavailable};
use crate::transport::{PipeAddress, PipeConnection};

pub use machine::{Action, LinkEvent, LinkState, StateMachine, SupervisionState, SupervisorPolicy};
pub use process::{exit_codes, DriverProcess, KILL_WAIT};

pub struct Supervisor {
    config: BridgeConfig,
    address: PipeAddress,
    correlator: Arc<Correlator>,
    machine: Mutex<StateMachine>,
    process: Mutex<Option<Arc<DriverProcess>>>,
    fatal: FatalLatch,
    /// Stops the restart loop. Checked between steps only.
    cancel: CancellationToken,
    /// Serializes connect attempts from callers and the restart loop.
    connect_lock: tokio::sync::Mutex<()>,
}

impl Supervisor {
    pub fn new(config: BridgeConfig, correlator: Arc<Correlator>) -> Self {
        let address = PipeAddress::from_name(&config.pipe_name);
        let policy = SupervisorPolicy::from_config(&config);
        Self {
            config,
            address,
            correlator,
            machine: Mutex::new(StateMachine::new(policy, Utc::now())),
            process: Mutex::new(None),
            fatal: FatalLatch::new(),
            cancel: CancellationToken::new(),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn address(&self) -> &PipeAddress {
        &self.address
    }

    pub fn state(&self) -> LinkState {
        self.machine.lock().state()
    }

    pub fn supervision(&self) -> SupervisionState {
        *self.machine.lock().supervision()
    }

    pub fn fatal(&self) -> &FatalLatch {
        &self.fatal
    }

    /// The driver process this bridge launched and still supervises.
    pub fn process(&self) -> Option<Arc<DriverProcess>> {
        self.process.lock().clone()
    }

    /// Stop restarting. A restart already past its last cancellation check
    /// still completes.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Record a broken pipe seen by a call.
    pub fn connection_lost(&self) {
        self.apply(LinkEvent::ConnectionLost);
    }

    /// Move to the terminal shutdown state.
    pub fn shutdown_requested(&self) {
        self.cancel();
        self.apply(LinkEvent::ShutdownRequested);
    }

    fn apply(&self, event: LinkEvent) -> Action {
        let mut machine = self.machine.lock();
        let before = machine.state();
        let action = machine.handle(event, Utc::now());
        let after = machine.state();
        if before != after {
            tracing::debug!("link {before:?} -> {after:?} on {event:?}");
        }
        action
    }

    /// Make sure a connection is attached, connecting to a listening driver
    /// or launching one as needed.
    pub async fn connect_or_launch(self: &Arc<Self>) -> Result<(), BridgeError> {
        let _connecting = self.connect_lock.lock().await;
        self.check_usable()?;
        if self.correlator.is_attached() {
            return Ok(());
        }
        if self.state() == LinkState::Restarting {
            // The restart loop owns reconnection right now.
            return Err(BridgeError::NotConnected);
        }

        self.apply(LinkEvent::ConnectRequested);
        match self.establish().await {
            Ok(owns_process) => {
                self.apply(LinkEvent::ConnectSucceeded { owns_process });
                Ok(())
            }
            Err(e) => {
                tracing::warn!("could not reach ICP driver: {e}");
                self.apply(LinkEvent::ConnectFailed);
                Err(e)
            }
        }
    }

    fn check_usable(&self) -> Result<(), BridgeError> {
        if let Some(event) = self.fatal.event() {
            return Err(BridgeError::Fatal {
                failures: event.failures,
            });
        }
        if self.cancel.is_cancelled() {
            return Err(BridgeError::ShuttingDown);
        }
        Ok(())
    }

    /// Connect directly, or spawn a driver and poll until it listens.
    /// Returns whether the connected driver is one this bridge launched.
    async fn establish(self: &Arc<Self>) -> Result<bool, BridgeError> {
        match PipeConnection::connect(&self.address, self.config.connect_timeout()).await {
            Ok(conn) => {
                tracing::info!("connected to running ICP driver at {}", self.address);
                self.correlator.attach(conn).await;
                return Ok(false);
            }
            Err(e) => tracing::debug!("no driver listening at {}: {e}", self.address),
        }

        let mut launched = Some(DriverProcess::spawn(&self.config)?);
        let launch_wait = self.config.launch_wait();
        let deadline = Instant::now() + launch_wait;

        loop {
            if self.cancel.is_cancelled() {
                if let Some(process) = &launched {
                    process.terminate(KILL_WAIT).await;
                }
                return Err(BridgeError::ShuttingDown);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let attempt = self.config.connect_timeout().min(remaining);
            match PipeConnection::connect(&self.address, attempt).await {
                Ok(conn) => {
                    self.correlator.attach(conn).await;
                    return Ok(match launched {
                        Some(process) => {
                            tracing::info!(
                                "connected to launched ICP driver (pid {})",
                                process.pid()
                            );
                            self.supervise(process);
                            true
                        }
                        None => false,
                    });
                }
                Err(e) => tracing::debug!("driver not accepting yet: {e}"),
            }

            if let Some(status) = launched.as_ref().and_then(DriverProcess::try_exit) {
                if status.code() == Some(exit_codes::ADDRESS_IN_USE) {
                    // Someone else bound the pipe first; connect to theirs.
                    tracing::info!("launched driver found the pipe taken, waiting for the owner");
                    launched = None;
                } else {
                    return Err(BridgeError::Process(format!(
                        "driver exited during launch: {status}"
                    )));
                }
            }

            if Instant::now() >= deadline {
                if let Some(process) = &launched {
                    process.terminate(KILL_WAIT).await;
                }
                return Err(BridgeError::LaunchTimeout(launch_wait));
            }
            let pause = self
                .config
                .launch_poll()
                .min(deadline.saturating_duration_since(Instant::now()));
            tokio::time::sleep(pause).await;
        }
    }

    /// Adopt a launched process and watch it for exit.
    pub(crate) fn supervise(self: &Arc<Self>, process: DriverProcess) {
        let process = Arc::new(process);
        *self.process.lock() = Some(Arc::clone(&process));
        let this = Arc::clone(self);
        tokio::spawn(async move { this.watch_exit(process).await });
    }

    async fn watch_exit(self: Arc<Self>, process: Arc<DriverProcess>) {
        let status = process.exited().await;
        {
            let mut current = self.process.lock();
            if current.as_ref().is_some_and(|p| Arc::ptr_eq(p, &process)) {
                *current = None;
            }
        }
        if self.cancel.is_cancelled() {
            tracing::debug!("driver (pid {}) exited during shutdown", process.pid());
            return;
        }
        match status {
            Some(status) => tracing::warn!(
                "ICP driver (pid {}) exited unexpectedly: {status}",
                process.pid()
            ),
            None => tracing::warn!("lost track of ICP driver (pid {})", process.pid()),
        }

        self.correlator.detach().await;
        let action = self.apply(LinkEvent::ProcessExited);
        self.run_restart_loop(action, format!("driver exited: {status:?}"))
            .await;
    }

    /// Carry out restart decisions until a relaunch sticks, the budget is
    /// spent or shutdown begins.
    async fn run_restart_loop(self: Arc<Self>, mut action: Action, mut reason: String) {
        loop {
            match action {
                Action::None => return,
                Action::RaiseFatal { failures } => {
                    self.raise_fatal(failures, reason);
                    return;
                }
                Action::Restart { backoff } => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    let _connecting = self.connect_lock.lock().await;
                    if self.cancel.is_cancelled() {
                        return;
                    }
                    tracing::info!("restarting ICP driver");
                    action = match self.establish().await {
                        Ok(owns_process) => {
                            self.apply(LinkEvent::ConnectSucceeded { owns_process })
                        }
                        Err(e) => {
                            tracing::warn!("ICP driver restart failed: {e}");
                            reason = e.to_string();
                            self.apply(LinkEvent::ConnectFailed)
                        }
                    };
                }
            }
        }
    }

    fn raise_fatal(&self, failures: u32, reason: String) {
        tracing::error!("ICP display permanently unavailable: {reason}");
        self.fatal.fire(Unavailable { failures, reason });
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("address", &self.address)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
