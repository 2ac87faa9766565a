//! Writing events to a running server.
//!
//! The client is write-only: the server never answers. Each call writes one
//! complete line straight to the underlying stream.
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use tally::client::LineClient;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client = LineClient::connect(&"tcp://127.0.0.1:8765".parse()?).await?;
//! client.count("web.hits", 1.0, None).await?;
//! client.gauge("web.load", 0.75, Some(1_393_762_211)).await?;
//! client.quit_server().await?;
//! # Ok(())
//! # }
//! ```

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

use crate::config::ListenAddr;
use crate::error::ServerError;
use crate::event::Event;
use crate::protocol::{self, SHUTDOWN_SENTINEL};

/// A boxed stream to a server.
pub type ServerStream = Box<dyn AsyncWrite + Send + Unpin>;

/// Sends protocol lines over any async writer.
#[derive(Debug)]
pub struct LineClient<W> {
    writer: W,
}

impl LineClient<ServerStream> {
    /// Connects to a server listening on `addr`.
    ///
    /// # Errors
    ///
    /// - [`ServerError::Io`] if the connection fails
    /// - [`ServerError::Unsupported`] for Unix sockets on other platforms
    pub async fn connect(addr: &ListenAddr) -> Result<Self, ServerError> {
        let writer: ServerStream = match addr {
            ListenAddr::Tcp(host_port) => Box::new(TcpStream::connect(host_port.as_str()).await?),
            #[cfg(unix)]
            ListenAddr::Unix(path) => Box::new(UnixStream::connect(path).await?),
            #[cfg(not(unix))]
            ListenAddr::Unix(_) => return Err(ServerError::Unsupported(addr.to_string())),
        };
        Ok(Self::new(writer))
    }
}

impl<W: AsyncWrite + Unpin> LineClient<W> {
    /// Wraps a writer.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Sends one event.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the write fails.
    pub async fn send(&mut self, event: &Event) -> Result<(), ServerError> {
        let mut line = protocol::encode(event);
        line.push('\n');
        self.write_line(&line).await
    }

    /// Sends a counter event.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the write fails.
    pub async fn count(&mut self, name: &str, value: f64, at: Option<i64>) -> Result<(), ServerError> {
        self.send(&Event::counter(name, value, at)).await
    }

    /// Sends a gauge event.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the write fails.
    pub async fn gauge(&mut self, name: &str, value: f64, at: Option<i64>) -> Result<(), ServerError> {
        self.send(&Event::gauge(name, value, at)).await
    }

    /// Asks the server to drain and stop.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the write fails.
    pub async fn quit_server(&mut self) -> Result<(), ServerError> {
        self.write_line(&format!("{SHUTDOWN_SENTINEL}\n")).await
    }

    /// Flushes and shuts down the write half.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the shutdown fails.
    pub async fn close(mut self) -> Result<(), ServerError> {
        self.writer.shutdown().await?;
        Ok(())
    }

    /// Returns the wrapped writer.
    pub fn into_inner(self) -> W {
        self.writer
    }

    async fn write_line(&mut self, line: &str) -> Result<(), ServerError> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }
}
