//! Pure supervision state machine.
//!
//! No I/O happens here: the runtime feeds in [`LinkEvent`]s together with
//! the current wall-clock time and carries out the returned [`Action`].
//!
//! ```text
//!  Disconnected ──ConnectRequested──► Connecting ──ConnectSucceeded──► Connected
//!       ▲                                 │                              │  │
//!       └────────────ConnectFailed────────┘          ConnectionLost ─────┘  │
//!                                                                           │ ProcessExited
//!  Connected ◄──ConnectSucceeded── Restarting ◄──────(budget left)──────────┘
//!                                   │    ▲
//!                        ConnectFailed   │ (budget left)
//!                                   └────┘
//!                  (budget exhausted) ──► Fatal
//!
//!  any state ──ShutdownRequested──► ShutDown
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::BridgeConfig;

/// Connection state of the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    /// A supervised driver went away and is being relaunched.
    Restarting,
    /// The failure budget is exhausted. Terminal.
    Fatal,
    /// Shutdown has begun. Terminal.
    ShutDown,
}

impl LinkState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Fatal | Self::ShutDown)
    }
}

/// Something that happened to the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    ConnectRequested,
    ConnectSucceeded { owns_process: bool },
    ConnectFailed,
    /// The driver process the bridge spawned has exited.
    ProcessExited,
    /// A call found the pipe broken.
    ConnectionLost,
    ShutdownRequested,
}

/// What the runtime should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    /// Wait `backoff`, then connect or launch again.
    Restart { backoff: Duration },
    /// Fire the one-shot unavailable event.
    RaiseFatal { failures: u32 },
}

/// Restart policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorPolicy {
    pub failure_budget: u32,
    pub reset_window: chrono::Duration,
    pub restart_backoff: Duration,
}

impl SupervisorPolicy {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            failure_budget: config.failure_budget.max(1),
            reset_window: chrono::Duration::from_std(config.reset_window())
                .unwrap_or(chrono::Duration::MAX),
            restart_backoff: config.restart_backoff(),
        }
    }
}

impl Default for SupervisorPolicy {
    fn default() -> Self {
        Self::from_config(&BridgeConfig::default())
    }
}

/// Failure bookkeeping that persists for the life of the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisionState {
    pub consecutive_failures: u32,
    pub last_known_good_utc: DateTime<Utc>,
    pub owns_process: bool,
}

#[derive(Debug, Clone)]
pub struct StateMachine {
    state: LinkState,
    supervision: SupervisionState,
    policy: SupervisorPolicy,
}

impl StateMachine {
    pub fn new(policy: SupervisorPolicy, now: DateTime<Utc>) -> Self {
        Self {
            state: LinkState::Disconnected,
            supervision: SupervisionState {
                consecutive_failures: 0,
                last_known_good_utc: now,
                owns_process: false,
            },
            policy,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn supervision(&self) -> &SupervisionState {
        &self.supervision
    }

    pub fn policy(&self) -> &SupervisorPolicy {
        &self.policy
    }

    /// Apply `event` observed at `now`.
    pub fn handle(&mut self, event: LinkEvent, now: DateTime<Utc>) -> Action {
        use LinkState::*;

        if self.state.is_terminal() {
            return Action::None;
        }

        match (self.state, event) {
            (_, LinkEvent::ShutdownRequested) => {
                self.state = ShutDown;
                Action::None
            }

            (Disconnected, LinkEvent::ConnectRequested) => {
                self.state = Connecting;
                Action::None
            }
            (_, LinkEvent::ConnectRequested) => Action::None,

            // Also taken while Connected: a call may have dropped the stream
            // without the link noticing, and the fresh connection decides
            // which process is supervised.
            (
                Disconnected | Connecting | Restarting | Connected,
                LinkEvent::ConnectSucceeded { owns_process },
            ) => {
                self.state = Connected;
                self.supervision.last_known_good_utc = now;
                self.supervision.owns_process = owns_process;
                Action::None
            }
            (Fatal | ShutDown, LinkEvent::ConnectSucceeded { .. }) => Action::None,

            (Connecting, LinkEvent::ConnectFailed) => {
                self.state = Disconnected;
                Action::None
            }
            (Restarting, LinkEvent::ConnectFailed) => self.record_failure(now),
            (_, LinkEvent::ConnectFailed) => Action::None,

            // A broken pipe may be noticed by a call before the exit monitor
            // reports the process gone, so an owned exit still counts after
            // the link dropped to Disconnected.
            (Connected | Disconnected, LinkEvent::ProcessExited) if self.supervision.owns_process => {
                self.supervision.owns_process = false;
                self.record_failure(now)
            }
            (_, LinkEvent::ProcessExited) => Action::None,

            (Connected, LinkEvent::ConnectionLost) => {
                self.state = Disconnected;
                Action::None
            }
            (_, LinkEvent::ConnectionLost) => Action::None,
        }
    }

    fn record_failure(&mut self, now: DateTime<Utc>) -> Action {
        let since_good = now - self.supervision.last_known_good_utc;
        if since_good >= self.policy.reset_window {
            if self.supervision.consecutive_failures > 0 {
                tracing::info!(
                    "last good connection was {}s ago, resetting failure count",
                    since_good.num_seconds()
                );
            }
            self.supervision.consecutive_failures = 0;
        }
        self.supervision.consecutive_failures += 1;
        let failures = self.supervision.consecutive_failures;

        if failures >= self.policy.failure_budget {
            tracing::error!("ICP driver failed {failures} times in a row, giving up");
            self.state = LinkState::Fatal;
            Action::RaiseFatal { failures }
        } else {
            tracing::warn!(
                "ICP driver failure {failures}/{}, restarting",
                self.policy.failure_budget
            );
            self.state = LinkState::Restarting;
            Action::Restart {
                backoff: self.policy.restart_backoff,
            }
        }
    }
}
