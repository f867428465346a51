//! Configuration for both ends of the bridge.
//!
//! Parsed from `icp.toml`:
//!
//! ```toml
//! [bridge]
//! pipe_name = "icp-bridge"
//! call_timeout_ms = 5000
//! failure_budget = 3
//!
//! [driver]
//! glyph_width = 12
//! glyph_height = 24
//! ```
//!
//! Every field has a default, so a missing file or section is fine.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::frame::{GlyphMetrics, DEFAULT_FONT};

/// Well-known channel name shared by host and driver.
pub const DEFAULT_PIPE_NAME: &str = "icp-bridge";

/// Environment variable through which the host hands its pipe name to a
/// driver it launches.
pub const PIPE_NAME_ENV: &str = "ICP_PIPE_NAME";

/// File name of the driver executable.
pub const DRIVER_EXECUTABLE: &str = if cfg!(windows) {
    "icp-driver.exe"
} else {
    "icp-driver"
};

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IcpConfig {
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub driver: DriverConfig,
}

impl IcpConfig {
    /// Load configuration from the default config file.
    pub fn load() -> Self {
        Self::load_from(&default_config_path())
    }

    /// Load configuration from a specific path.
    ///
    /// A missing file yields defaults; a malformed one is logged and also
    /// yields defaults.
    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!("ignoring malformed {}: {e}", path.display());
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }
}

/// Default location of `icp.toml`.
pub fn default_config_path() -> PathBuf {
    dirs_next::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("icp-bridge")
        .join("icp.toml")
}

/// Host-side bridge settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Channel name shared with the driver.
    #[serde(default = "default_pipe_name")]
    pub pipe_name: String,

    /// Driver executable. Defaults to `icp-driver` next to the current
    /// executable.
    #[serde(default)]
    pub driver_path: Option<PathBuf>,

    /// Pass `--verbose` to a launched driver.
    #[serde(default = "default_verbose")]
    pub verbose_driver: bool,

    /// Budget for a single connect attempt.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Budget for repeated connect attempts after launching the driver.
    #[serde(default = "default_launch_wait_ms")]
    pub launch_wait_ms: u64,

    /// Pause between connect attempts while waiting for a launched driver.
    #[serde(default = "default_launch_poll_ms")]
    pub launch_poll_ms: u64,

    /// Timeout for ordinary calls.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    /// Timeout for `clearIcp`/`close` during shutdown.
    #[serde(default = "default_shutdown_call_timeout_ms")]
    pub shutdown_call_timeout_ms: u64,

    /// Pause between the blanking `clearIcp` and `close`.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    /// How long to wait for an owned driver to exit before killing it.
    #[serde(default = "default_exit_wait_ms")]
    pub exit_wait_ms: u64,

    /// Overall budget for the blank-and-close part of shutdown.
    #[serde(default = "default_shutdown_budget_ms")]
    pub shutdown_budget_ms: u64,

    /// Pause before relaunching a driver that exited.
    #[serde(default = "default_restart_backoff_ms")]
    pub restart_backoff_ms: u64,

    /// Consecutive failures after which the bridge gives up for good.
    #[serde(default = "default_failure_budget")]
    pub failure_budget: u32,

    /// Failures older than this no longer count toward the budget.
    #[serde(default = "default_reset_window_secs")]
    pub reset_window_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            pipe_name: default_pipe_name(),
            driver_path: None,
            verbose_driver: default_verbose(),
            connect_timeout_ms: default_connect_timeout_ms(),
            launch_wait_ms: default_launch_wait_ms(),
            launch_poll_ms: default_launch_poll_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            shutdown_call_timeout_ms: default_shutdown_call_timeout_ms(),
            settle_delay_ms: default_settle_delay_ms(),
            exit_wait_ms: default_exit_wait_ms(),
            shutdown_budget_ms: default_shutdown_budget_ms(),
            restart_backoff_ms: default_restart_backoff_ms(),
            failure_budget: default_failure_budget(),
            reset_window_secs: default_reset_window_secs(),
        }
    }
}

impl BridgeConfig {
    /// Resolve the driver executable path.
    pub fn driver_executable(&self) -> PathBuf {
        if let Some(path) = &self.driver_path {
            return path.clone();
        }
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(DRIVER_EXECUTABLE)))
            .unwrap_or_else(|| PathBuf::from(DRIVER_EXECUTABLE))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn launch_wait(&self) -> Duration {
        Duration::from_millis(self.launch_wait_ms)
    }

    pub fn launch_poll(&self) -> Duration {
        Duration::from_millis(self.launch_poll_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn shutdown_call_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_call_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn exit_wait(&self) -> Duration {
        Duration::from_millis(self.exit_wait_ms)
    }

    pub fn shutdown_budget(&self) -> Duration {
        Duration::from_millis(self.shutdown_budget_ms)
    }

    pub fn restart_backoff(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_ms)
    }

    pub fn reset_window(&self) -> Duration {
        Duration::from_secs(self.reset_window_secs)
    }
}

fn default_pipe_name() -> String {
    DEFAULT_PIPE_NAME.into()
}

fn default_verbose() -> bool {
    cfg!(debug_assertions)
}

fn default_connect_timeout_ms() -> u64 {
    1200
}

fn default_launch_wait_ms() -> u64 {
    8000
}

fn default_launch_poll_ms() -> u64 {
    250
}

fn default_call_timeout_ms() -> u64 {
    5000
}

fn default_shutdown_call_timeout_ms() -> u64 {
    1500
}

fn default_settle_delay_ms() -> u64 {
    150
}

fn default_exit_wait_ms() -> u64 {
    2000
}

fn default_shutdown_budget_ms() -> u64 {
    6000
}

fn default_restart_backoff_ms() -> u64 {
    1000
}

fn default_failure_budget() -> u32 {
    3
}

fn default_reset_window_secs() -> u64 {
    3600
}

/// Driver-side rendering settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Glyph cell width in device pixels.
    #[serde(default = "default_glyph_width")]
    pub glyph_width: u32,

    /// Glyph cell height in device pixels.
    #[serde(default = "default_glyph_height")]
    pub glyph_height: u32,

    /// Font used by `clearIcp` and by draws that name none.
    #[serde(default = "default_font")]
    pub default_font: String,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            glyph_width: default_glyph_width(),
            glyph_height: default_glyph_height(),
            default_font: default_font(),
        }
    }
}

impl DriverConfig {
    pub fn metrics(&self) -> GlyphMetrics {
        GlyphMetrics {
            width: self.glyph_width,
            height: self.glyph_height,
        }
    }
}

fn default_glyph_width() -> u32 {
    GlyphMetrics::default().width
}

fn default_glyph_height() -> u32 {
    GlyphMetrics::default().height
}

fn default_font() -> String {
    DEFAULT_FONT.into()
}
