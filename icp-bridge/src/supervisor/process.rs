//! Spawning and terminating the driver process.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::{BridgeConfig, PIPE_NAME_ENV};
use crate::error::BridgeError;

/// Flag that keeps the driver from opening any window of its own.
pub const HEADLESS_FLAG: &str = "--headless";
pub const VERBOSE_FLAG: &str = "--verbose";

/// How long a forced kill normally waits for the process to be reaped.
pub const KILL_WAIT: Duration = Duration::from_secs(5);

/// Reserved driver exit codes.
pub mod exit_codes {
    /// Another driver already listens on the pipe.
    pub const ADDRESS_IN_USE: i32 = 3;
    /// The pipe could not be set up for any other reason.
    pub const TRANSPORT_FAILURE: i32 = 4;
}

/// Handle to a driver process the bridge spawned.
///
/// The child itself is owned by a reaper task that waits for it to exit
/// and publishes the status; killing goes through a token so the task stays
/// the only one touching the [`Child`].
#[derive(Debug)]
pub struct DriverProcess {
    pid: u32,
    kill: CancellationToken,
    exit: watch::Receiver<Option<ExitStatus>>,
}

impl DriverProcess {
    /// Launch the configured driver executable in headless mode.
    pub fn spawn(config: &BridgeConfig) -> Result<Self, BridgeError> {
        let exe = config.driver_executable();
        let mut cmd = Command::new(&exe);
        cmd.arg(HEADLESS_FLAG);
        if config.verbose_driver {
            cmd.arg(VERBOSE_FLAG);
        }
        // The driver resolves its resources relative to its install dir.
        if let Some(dir) = exe.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            cmd.current_dir(dir);
        }
        cmd.env(PIPE_NAME_ENV, &config.pipe_name);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(if config.verbose_driver {
            Stdio::inherit()
        } else {
            Stdio::null()
        });

        // Own session, so a forced kill can take the whole process group.
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        #[cfg(windows)]
        {
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        let child = cmd
            .spawn()
            .map_err(|e| BridgeError::Process(format!("{}: {e}", exe.display())))?;
        let pid = child
            .id()
            .ok_or_else(|| BridgeError::Process("driver exited before it was tracked".into()))?;
        tracing::info!("launched ICP driver {} (pid {pid})", exe.display());

        let kill = CancellationToken::new();
        let (tx, exit) = watch::channel(None);
        tokio::spawn(reap(child, pid, kill.clone(), tx));

        Ok(Self { pid, kill, exit })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Exit status, if the process has already exited.
    pub fn try_exit(&self) -> Option<ExitStatus> {
        *self.exit.borrow()
    }

    /// Wait for the process to exit.
    ///
    /// Also returns `None` if the reaper went away without seeing an exit,
    /// which only happens when the runtime is shutting down.
    pub async fn exited(&self) -> Option<ExitStatus> {
        let mut exit = self.exit.clone();
        let status = exit.wait_for(Option::is_some).await.ok()?;
        *status
    }

    /// Wait up to `timeout` for a natural exit.
    pub async fn wait_exit(&self, timeout: Duration) -> Option<ExitStatus> {
        tokio::time::timeout(timeout, self.exited())
            .await
            .ok()
            .flatten()
    }

    /// Kill the process and its children, then wait up to `wait` for it to
    /// be reaped. The kill is issued even when `wait` is zero.
    pub async fn terminate(&self, wait: Duration) -> Option<ExitStatus> {
        if let Some(status) = self.try_exit() {
            return Some(status);
        }
        tracing::warn!("force-terminating ICP driver (pid {})", self.pid);
        self.kill.cancel();
        self.wait_exit(wait).await
    }
}

/// Own the child until it exits, killing it when asked to.
async fn reap(
    mut child: Child,
    pid: u32,
    kill: CancellationToken,
    tx: watch::Sender<Option<ExitStatus>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill.cancelled() => {
            kill_tree(pid).await;
            let _ = child.start_kill();
            child.wait().await
        }
    };

    match status {
        Ok(status) => {
            tracing::info!("ICP driver (pid {pid}) exited: {status}");
            let _ = tx.send(Some(status));
        }
        Err(e) => tracing::error!("failed to wait for ICP driver (pid {pid}): {e}"),
    }
}

#[cfg(unix)]
async fn kill_tree(pid: u32) {
    // The driver leads its own session, so its pgid is its pid.
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
}

#[cfg(windows)]
async fn kill_tree(pid: u32) {
    let result = Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = result {
        tracing::warn!("taskkill for pid {pid} failed: {e}");
    }
}
