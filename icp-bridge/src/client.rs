//! Call gate and response correlator.
//!
//! The pipe is a single ordered byte stream, so at most one call may be in
//! flight on it: interleaved writes would corrupt framing. [`Correlator`]
//! owns the connection behind an async mutex (the "gate"). A call holds the
//! gate while it writes its request and reads lines until the response with
//! its own id arrives. Everything else on the stream (the `ready`
//! notification, replies to calls that already timed out, `id:null` error
//! replies) is skipped.
//!
//! Failure policy on the shared stream:
//!
//! - a write error or a write that does not finish within the call budget
//!   may have left half a request on the wire, so the connection is dropped
//!   and the error is connection-fatal;
//! - a read error or EOF drops the connection as well;
//! - a read that merely times out leaves the connection attached. The late
//!   reply will be discarded by id on the next call.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;

use crate::error::BridgeError;
use crate::protocol::{encode_line, Command, DriverMessage, Request};
use crate::transport::PipeConnection;

/// Serializes callers onto one connection and matches replies by id.
#[derive(Debug)]
pub struct Correlator {
    gate: Mutex<Option<PipeConnection>>,
    /// Monotonically increasing request id. Never reset, so ids are unique
    /// across reconnects too.
    next_id: AtomicU64,
    /// Set once shutdown begins.
    stopping: AtomicBool,
}

impl Correlator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            gate: Mutex::new(None),
            next_id: AtomicU64::new(1),
            stopping: AtomicBool::new(false),
        }
    }

    /// Acquire exclusive use of the connection.
    pub async fn acquire(&self) -> GateGuard<'_> {
        GateGuard {
            slot: self.gate.lock().await,
            next_id: &self.next_id,
            stopping: &self.stopping,
        }
    }

    /// Issue one call and wait for its reply.
    ///
    /// While shutdown is in progress only `ping`, `clearIcp` and `close` are
    /// accepted; anything else fails without touching the pipe, including a
    /// call that was already queued on the gate when shutdown began.
    pub async fn call(&self, command: Command, timeout: Duration) -> Result<Value, BridgeError> {
        if self.is_stopping() && !command.permitted_while_stopping() {
            return Err(BridgeError::ShuttingDown);
        }
        self.acquire().await.call(command, timeout).await
    }

    /// Replace the connection, waiting for any in-flight call to finish.
    pub async fn attach(&self, conn: PipeConnection) {
        *self.gate.lock().await = Some(conn);
    }

    /// Drop the connection, waiting for any in-flight call to finish.
    pub async fn detach(&self) {
        self.acquire().await.detach().await;
    }

    /// Whether a connection is attached. A gate held by an in-flight call
    /// counts as attached.
    pub fn is_attached(&self) -> bool {
        self.gate
            .try_lock()
            .map(|slot| slot.is_some())
            .unwrap_or(true)
    }

    pub fn set_stopping(&self) {
        self.stopping.store(true, Ordering::Release);
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive ownership of the gate.
pub struct GateGuard<'a> {
    slot: MutexGuard<'a, Option<PipeConnection>>,
    next_id: &'a AtomicU64,
    stopping: &'a AtomicBool,
}

impl GateGuard<'_> {
    pub fn is_attached(&self) -> bool {
        self.slot.is_some()
    }

    /// Close and drop the connection.
    pub async fn detach(&mut self) {
        if let Some(mut conn) = self.slot.take() {
            conn.close().await;
        }
    }

    /// Issue one call while holding the gate.
    pub async fn call(&mut self, command: Command, timeout: Duration) -> Result<Value, BridgeError> {
        if self.stopping.load(Ordering::Acquire) && !command.permitted_while_stopping() {
            return Err(BridgeError::ShuttingDown);
        }
        let conn = self.slot.as_mut().ok_or(BridgeError::NotConnected)?;
        let cmd = command.name();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = encode_line(&Request { id, command })?;
        let started = Instant::now();
        let deadline = started + timeout;

        let written = tokio::time::timeout_at(deadline, conn.write_line(&line)).await;
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!("{cmd} (id {id}): write failed, dropping connection: {e}");
                self.slot.take();
                return Err(e);
            }
            Err(_) => {
                tracing::warn!("{cmd} (id {id}): write timed out, dropping connection");
                self.slot.take();
                return Err(BridgeError::WriteTimeout {
                    cmd,
                    id,
                    elapsed: started.elapsed(),
                });
            }
        }

        match tokio::time::timeout_at(deadline, await_response(conn, cmd, id)).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => {
                if e.is_connection_fatal() {
                    tracing::warn!("{cmd} (id {id}): {e}, dropping connection");
                    self.slot.take();
                }
                Err(e)
            }
            Err(_) => Err(BridgeError::Timeout {
                cmd,
                id,
                elapsed: started.elapsed(),
            }),
        }
    }
}

/// Read lines until the reply for `id` arrives.
async fn await_response(
    conn: &mut PipeConnection,
    cmd: &'static str,
    id: u64,
) -> Result<Value, BridgeError> {
    loop {
        let line = match conn.read_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return Err(BridgeError::Disconnected),
            Err(BridgeError::LineTooLong(len)) => {
                tracing::warn!("skipping {len} byte line from driver");
                continue;
            }
            Err(e) => return Err(e),
        };

        match DriverMessage::from_line(&line) {
            Ok(DriverMessage::Response(resp)) if resp.id == Some(id) => {
                return resp.into_result(cmd);
            }
            Ok(DriverMessage::Response(resp)) => {
                tracing::debug!(
                    "discarding response for id {:?} while waiting for {id}",
                    resp.id
                );
            }
            Ok(DriverMessage::Notification(notif)) => {
                tracing::debug!("skipping notification while waiting for {id}: {notif:?}");
            }
            Ok(DriverMessage::UnknownNotification(kind)) => {
                tracing::debug!("skipping unknown notification '{kind}'");
            }
            Err(e) => {
                tracing::warn!("skipping malformed line from driver: {e}: {line}");
            }
        }
    }
}
