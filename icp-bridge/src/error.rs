//! Error taxonomy for bridge operations.

use std::time::Duration;

/// Error type for bridge operations.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The pipe is missing or broke while reading/writing.
    #[error("pipe transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The driver closed its end of the pipe.
    #[error("ICP driver closed the pipe")]
    Disconnected,

    /// No connection is attached to the call gate.
    #[error("not connected to the ICP driver")]
    NotConnected,

    /// A message could not be encoded or decoded.
    #[error("malformed bridge message: {0}")]
    Protocol(#[from] serde_json::Error),

    /// A peer sent a line over the length limit. The rest of that line was
    /// skipped and the stream is still usable.
    #[error("line of {0} bytes exceeds the length limit")]
    LineTooLong(usize),

    /// No matching response arrived within the call budget.
    #[error("{cmd} (id {id}) timed out after {elapsed:?}")]
    Timeout {
        cmd: &'static str,
        id: u64,
        elapsed: Duration,
    },

    /// The request could not be written within the call budget. Part of it
    /// may be on the wire, so the connection was dropped.
    #[error("{cmd} (id {id}) write timed out after {elapsed:?}")]
    WriteTimeout {
        cmd: &'static str,
        id: u64,
        elapsed: Duration,
    },

    /// The driver answered `ok:false`.
    #[error("ICP driver rejected {cmd}: {message}")]
    Command { cmd: &'static str, message: String },

    /// The driver process could not be spawned or died during launch.
    #[error("failed to launch ICP driver: {0}")]
    Process(String),

    /// The driver was spawned but never accepted a connection.
    #[error("ICP driver did not accept connections within {0:?}")]
    LaunchTimeout(Duration),

    /// The restart budget is exhausted; the device is permanently unavailable.
    #[error("ICP driver unavailable after {failures} consecutive failures")]
    Fatal { failures: u32 },

    /// The bridge is running its shutdown sequence.
    #[error("bridge is shutting down")]
    ShuttingDown,

    /// The caller handed over a frame that cannot be drawn.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

impl BridgeError {
    /// Whether the shared stream can no longer be trusted after this error.
    ///
    /// Write failures may have left half a request on the wire, so every
    /// transport-level failure forces a full reconnect.
    #[must_use]
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Disconnected | Self::WriteTimeout { .. }
        )
    }
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;
