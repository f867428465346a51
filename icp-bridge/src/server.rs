//! Driver-side command server.
//!
//! The driver process listens on the bridge pipe and serves every accepted
//! client on its own task. Clients are independent: nothing is broadcast
//! between them and the only shared state is the device and the frame
//! subscriber registry.
//!
//! ## Per-connection flow
//!
//! ```text
//! accept ──► {"type":"ready",...}
//!        ◄── {"id":1,"cmd":"ping","arg":{}}
//!        ──► {"id":1,"ok":true,"result":"pong"}
//!        ◄── {"id":2,"cmd":"close","arg":{}}
//!        ──► {"id":2,"ok":true,"result":null}   (flushed, then the server stops)
//! ```

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::DriverConfig;
use crate::device::IcpDevice;
use crate::error::BridgeError;
use crate::events::Subscribers;
use crate::frame::{DisplayFrame, GlyphMetrics};
use crate::protocol::{encode_line, parse_request, Command, DrawIcpArgs, Notification, Response};
use crate::transport::{PipeConnection, PipeListener};

/// Result of executing one request line.
#[derive(Debug)]
pub struct Dispatched {
    pub response: Response,
    /// The client asked the driver to terminate.
    pub close: bool,
}

/// Executes commands against a device.
pub struct CommandDispatcher {
    device: Arc<dyn IcpDevice>,
    frames: Arc<Subscribers<DisplayFrame>>,
    metrics: GlyphMetrics,
    default_font: String,
}

impl CommandDispatcher {
    pub fn new(device: Arc<dyn IcpDevice>, config: &DriverConfig) -> Self {
        Self {
            device,
            frames: Arc::new(Subscribers::new()),
            metrics: config.metrics(),
            default_font: config.default_font.clone(),
        }
    }

    /// Registry notified after every rendered frame.
    pub fn frame_subscribers(&self) -> Arc<Subscribers<DisplayFrame>> {
        Arc::clone(&self.frames)
    }

    /// Parse and execute one request line.
    ///
    /// Never fails: parse errors, command errors and panics all become
    /// `ok:false` responses.
    pub fn dispatch_line(&self, line: &str) -> Dispatched {
        let request = match parse_request(line) {
            Ok(request) => request,
            Err(response) => {
                tracing::warn!("rejecting request: {:?}", response.error);
                return Dispatched {
                    response,
                    close: false,
                };
            }
        };

        let id = request.id;
        let close = matches!(request.command, Command::Close(_));
        let cmd = request.command.name();
        tracing::debug!("executing {cmd} (id {id})");

        let outcome = catch_unwind(AssertUnwindSafe(|| self.execute(request.command)));
        let response = match outcome {
            Ok(Ok(result)) => Response::success(id, result),
            Ok(Err(e)) => {
                tracing::warn!("{cmd} (id {id}) failed: {e:#}");
                Response::failure(Some(id), format!("{e:#}"))
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "command panicked".to_string());
                tracing::error!("{cmd} (id {id}) panicked: {message}");
                Response::failure(Some(id), message)
            }
        };

        Dispatched { response, close }
    }

    fn execute(&self, command: Command) -> anyhow::Result<Value> {
        match command {
            Command::Ping(_) => Ok(Value::String("pong".into())),
            Command::DrawIcp(DrawIcpArgs { lines, font }) => {
                let font = font.as_deref().unwrap_or(&self.default_font);
                let frame = DisplayFrame::parse(&lines, Some(font)).map_err(anyhow::Error::msg)?;
                self.draw(&frame)
            }
            Command::ClearIcp(_) => {
                let frame = DisplayFrame::parse(&[""; crate::frame::ROWS], Some(&self.default_font))
                    .map_err(anyhow::Error::msg)?;
                self.draw(&frame)
            }
            Command::Close(_) => Ok(Value::Null),
        }
    }

    fn draw(&self, frame: &DisplayFrame) -> anyhow::Result<Value> {
        self.device.render(frame, &frame.placements(self.metrics))?;
        self.frames.notify(frame);
        Ok(Value::Null)
    }
}

/// Accept loop of the driver process.
pub struct DriverServer {
    listener: PipeListener,
    dispatcher: Arc<CommandDispatcher>,
    shutdown: CancellationToken,
}

impl DriverServer {
    pub fn new(listener: PipeListener, dispatcher: CommandDispatcher) -> Self {
        Self {
            listener,
            dispatcher: Arc::new(dispatcher),
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the server when cancelled. Cancelled by `close`.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serve clients until a `close` command arrives or the token is
    /// cancelled. Client tasks observe the same token and drop their
    /// connections on the way out.
    pub async fn run(mut self) {
        let mut clients = tokio::task::JoinSet::new();
        let pipe = self.listener.address().name().to_string();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => {
                        tracing::info!("client connected");
                        clients.spawn(serve_client(
                            conn,
                            Arc::clone(&self.dispatcher),
                            self.shutdown.clone(),
                            pipe.clone(),
                        ));
                    }
                    Err(e) => tracing::error!("failed to accept client: {e}"),
                },
            }
        }

        tracing::info!("driver server stopping");
        // Give clients a moment to flush, then drop every socket.
        let _ = tokio::time::timeout(std::time::Duration::from_millis(200), async {
            while clients.join_next().await.is_some() {}
        })
        .await;
        clients.abort_all();
    }
}

async fn serve_client(
    mut conn: PipeConnection,
    dispatcher: Arc<CommandDispatcher>,
    shutdown: CancellationToken,
    pipe: String,
) {
    let ready = Notification::Ready {
        pipe,
        pid: std::process::id(),
    };
    if let Err(e) = write_message(&mut conn, &ready).await {
        tracing::warn!("failed to send ready notification: {e}");
        return;
    }

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = conn.read_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                tracing::info!("client disconnected");
                break;
            }
            Err(BridgeError::LineTooLong(len)) => {
                tracing::warn!("rejecting {len} byte request line");
                let response = Response::failure(None, "Line too long");
                if let Err(e) = write_message(&mut conn, &response).await {
                    tracing::warn!("client write error: {e}");
                    break;
                }
                continue;
            }
            Err(e) => {
                tracing::warn!("client read error: {e}");
                break;
            }
        };

        let Dispatched { response, close } = dispatcher.dispatch_line(&line);
        if let Err(e) = write_message(&mut conn, &response).await {
            tracing::warn!("client write error: {e}");
            break;
        }
        if close {
            tracing::info!("close requested by client");
            shutdown.cancel();
            break;
        }
    }
    conn.close().await;
}

async fn write_message<T: serde::Serialize>(
    conn: &mut PipeConnection,
    msg: &T,
) -> Result<(), BridgeError> {
    let line = encode_line(msg)?;
    conn.write_line(&line).await
}
