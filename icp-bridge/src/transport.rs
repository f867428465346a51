//! Local pipe transport.
//!
//! The channel is addressed by a single well-known name. On Unix it is a
//! Unix domain socket under the runtime directory; on Windows it is the
//! named pipe `\\.\pipe\<name>`. The host connects as a client; the driver
//! listens and accepts any number of clients.
//!
//! A [`PipeConnection`] is a buffered line reader plus a writer over any
//! bidirectional byte stream, so tests can run the full codec over
//! `tokio::io::duplex`.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::BridgeError;

/// Longest accepted line, terminator included.
pub const MAX_LINE_LEN: usize = 1024 * 1024;

/// Resolved address of the bridge channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeAddress {
    name: String,
    #[cfg(unix)]
    path: PathBuf,
    #[cfg(windows)]
    path: String,
}

impl PipeAddress {
    /// Resolve a channel name.
    ///
    /// On Unix a name containing a path separator is used as the socket path
    /// verbatim; a bare name becomes `<runtime dir>/<name>.sock`.
    pub fn from_name(name: &str) -> Self {
        Self {
            name: name.to_string(),
            path: Self::resolve(name),
        }
    }

    #[cfg(unix)]
    fn resolve(name: &str) -> PathBuf {
        if name.contains('/') {
            return PathBuf::from(name);
        }
        std::env::var_os("XDG_RUNTIME_DIR")
            .map(PathBuf::from)
            .filter(|dir| dir.is_dir())
            .unwrap_or_else(std::env::temp_dir)
            .join(format!("{name}.sock"))
    }

    #[cfg(windows)]
    fn resolve(name: &str) -> String {
        format!(r"\\.\pipe\{name}")
    }

    /// The name the address was resolved from.
    pub fn name(&self) -> &str {
        &self.name
    }

    #[cfg(unix)]
    pub fn socket_path(&self) -> &std::path::Path {
        &self.path
    }

    #[cfg(windows)]
    pub fn pipe_path(&self) -> &str {
        &self.path
    }
}

impl std::fmt::Display for PipeAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        #[cfg(unix)]
        return write!(f, "{}", self.path.display());
        #[cfg(windows)]
        return write!(f, "{}", self.path);
    }
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One bidirectional line-oriented connection.
pub struct PipeConnection {
    reader: BufReader<BoxedReader>,
    writer: BoxedWriter,
    /// Bytes of a line that has not been completed yet. Kept across calls so
    /// that a read abandoned by a timeout does not lose data.
    pending: Vec<u8>,
    /// Length so far of an oversized line whose remainder is being skipped.
    discarding: Option<usize>,
}

impl PipeConnection {
    /// Wrap any bidirectional stream.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(Box::new(read_half)),
            writer: Box::new(write_half),
            pending: Vec::new(),
            discarding: None,
        }
    }

    /// Connect to a listening driver, giving up after `timeout`.
    pub async fn connect(addr: &PipeAddress, timeout: Duration) -> Result<Self, BridgeError> {
        match tokio::time::timeout(timeout, Self::connect_inner(addr)).await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::Transport(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect to {addr} timed out after {timeout:?}"),
            ))),
        }
    }

    #[cfg(unix)]
    async fn connect_inner(addr: &PipeAddress) -> Result<Self, BridgeError> {
        let stream = tokio::net::UnixStream::connect(addr.socket_path()).await?;
        Ok(Self::from_stream(stream))
    }

    #[cfg(windows)]
    async fn connect_inner(addr: &PipeAddress) -> Result<Self, BridgeError> {
        use tokio::net::windows::named_pipe::ClientOptions;

        /// All server instances are busy; retry shortly.
        const ERROR_PIPE_BUSY: i32 = 231;

        loop {
            match ClientOptions::new().open(addr.pipe_path()) {
                Ok(client) => return Ok(Self::from_stream(client)),
                Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY) => {}
                Err(e) => return Err(e.into()),
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Write one already-terminated line and flush it.
    pub async fn write_line(&mut self, line: &str) -> Result<(), BridgeError> {
        debug_assert!(line.ends_with('\n'));
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Read the next line without its terminator.
    ///
    /// Returns `None` on a clean EOF. Blank lines are skipped. Cancelling the
    /// returned future never loses bytes.
    ///
    /// A line longer than [`MAX_LINE_LEN`] is never buffered whole: once it
    /// crosses the limit the rest of it is skipped and
    /// [`BridgeError::LineTooLong`] is returned. The connection stays usable.
    pub async fn read_line(&mut self) -> Result<Option<String>, BridgeError> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                if let Some(len) = self.discarding.take() {
                    return Err(BridgeError::LineTooLong(len));
                }
                // Final unterminated line before EOF, if any.
                let tail = std::mem::take(&mut self.pending);
                let tail = String::from_utf8_lossy(&tail);
                let trimmed = tail.trim();
                return Ok((!trimmed.is_empty()).then(|| trimmed.to_string()));
            }

            let newline = available.iter().position(|b| *b == b'\n');
            let used = newline.map_or(available.len(), |at| at + 1);
            match &mut self.discarding {
                Some(len) => *len += used,
                None => self.pending.extend_from_slice(&available[..used]),
            }
            self.reader.consume(used);

            if self.pending.len() > MAX_LINE_LEN {
                self.discarding = Some(self.pending.len());
                self.pending = Vec::new();
            }
            if newline.is_none() {
                continue;
            }
            if let Some(len) = self.discarding.take() {
                return Err(BridgeError::LineTooLong(len));
            }

            let raw = std::mem::take(&mut self.pending);
            let line = String::from_utf8_lossy(&raw);
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                return Ok(Some(trimmed.to_string()));
            }
        }
    }

    /// Shut down the write half, signalling EOF to the peer.
    pub async fn close(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}

impl std::fmt::Debug for PipeConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeConnection")
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

/// Why the driver could not start listening.
#[derive(Debug)]
pub enum ListenError {
    /// Another driver already owns the channel.
    AddressInUse(PipeAddress),
    /// Any other setup failure.
    Io(io::Error),
}

impl std::fmt::Display for ListenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AddressInUse(addr) => write!(f, "{addr} is already in use"),
            Self::Io(e) => write!(f, "pipe setup failed: {e}"),
        }
    }
}

impl std::error::Error for ListenError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::AddressInUse(_) => None,
        }
    }
}

impl From<io::Error> for ListenError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Driver-side listener.
pub struct PipeListener {
    addr: PipeAddress,
    #[cfg(unix)]
    listener: tokio::net::UnixListener,
    #[cfg(windows)]
    next: tokio::net::windows::named_pipe::NamedPipeServer,
}

impl PipeListener {
    /// Bind the channel.
    ///
    /// On Unix a leftover socket file that nobody answers on is removed
    /// first; one with a live listener yields [`ListenError::AddressInUse`].
    #[cfg(unix)]
    pub fn bind(addr: &PipeAddress) -> Result<Self, ListenError> {
        let path = addr.socket_path();
        if path.exists() {
            if std::os::unix::net::UnixStream::connect(path).is_ok() {
                return Err(ListenError::AddressInUse(addr.clone()));
            }
            tracing::debug!("removing stale socket {}", path.display());
            std::fs::remove_file(path)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = tokio::net::UnixListener::bind(path).map_err(|e| {
            if e.kind() == io::ErrorKind::AddrInUse {
                ListenError::AddressInUse(addr.clone())
            } else {
                ListenError::Io(e)
            }
        })?;
        tracing::info!("listening on {addr}");

        Ok(Self {
            addr: addr.clone(),
            listener,
        })
    }

    #[cfg(windows)]
    pub fn bind(addr: &PipeAddress) -> Result<Self, ListenError> {
        use tokio::net::windows::named_pipe::ServerOptions;

        let next = ServerOptions::new()
            .first_pipe_instance(true)
            .create(addr.pipe_path())
            .map_err(|e| {
                if e.kind() == io::ErrorKind::PermissionDenied {
                    ListenError::AddressInUse(addr.clone())
                } else {
                    ListenError::Io(e)
                }
            })?;
        tracing::info!("listening on {addr}");

        Ok(Self {
            addr: addr.clone(),
            next,
        })
    }

    pub fn address(&self) -> &PipeAddress {
        &self.addr
    }

    /// Wait for the next client.
    #[cfg(unix)]
    pub async fn accept(&mut self) -> io::Result<PipeConnection> {
        let (stream, _) = self.listener.accept().await?;
        Ok(PipeConnection::from_stream(stream))
    }

    #[cfg(windows)]
    pub async fn accept(&mut self) -> io::Result<PipeConnection> {
        use tokio::net::windows::named_pipe::ServerOptions;

        self.next.connect().await?;
        let fresh = ServerOptions::new().create(self.addr.pipe_path())?;
        let connected = std::mem::replace(&mut self.next, fresh);
        Ok(PipeConnection::from_stream(connected))
    }
}

#[cfg(unix)]
impl Drop for PipeListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(self.addr.socket_path());
    }
}
