//! The ingestion server: line-encoded events in, buffered flushes out.
//!
//! # Design
//!
//! ```text
//!              ┌──────────── Listener (tcp:// or unix://) ───────────┐
//!              │ accept ──► task per connection ──► handle_line()    │
//!              └──────────────────────────────────────┬──────────────┘
//!                                                     │ push (no I/O)
//!   timer task ──► flush() ◄── volume trigger ◄── IngestBuffer
//!                     │
//!                     └──► spawn_blocking: record_batch + aggregate
//! ```
//!
//! State moves one way: `Accepting → Draining → Stopped`. The shutdown
//! sentinel (when allowed) or the cancellation future passed to
//! [`Server::run`] starts draining: the listener closes, lines still arriving
//! on open connections are ignored, the pass in flight is awaited and the
//! remaining buffer is committed and rolled up before `run` returns.
//!
//! Lines are admitted under a shared lock that [`Server::request_shutdown`]
//! takes exclusively before leaving `Accepting`. An event reported as
//! [`LineOutcome::Queued`] is therefore always in the buffer before the
//! final drain takes it.
//!
//! An unrecoverable storage failure in any flush pass also stops the server:
//! `run` drains what it can and returns that failure.

use std::future::Future;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::sync::watch;

use crate::buffer::IngestBuffer;
use crate::config::{ListenAddr, ServerConfig};
use crate::error::{Result, ServerError, StoreError};
use crate::flush::{FlushCoordinator, FlushReport};
use crate::protocol::{self, Line};
use crate::store::Store;

/// Lifecycle of a [`Server`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Accepting connections and event lines.
    Accepting,
    /// Shutdown requested; finishing the last flush.
    Draining,
    /// Everything buffered has been committed.
    Stopped,
}

/// What [`Server::handle_line`] did with a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineOutcome {
    /// An event was buffered.
    Queued,
    /// Blank line.
    Blank,
    /// Malformed line, logged and discarded.
    Rejected,
    /// The sentinel started a shutdown.
    Shutdown,
    /// The server is not accepting, or the sentinel is not allowed.
    Ignored,
}

/// A bound listener.
#[derive(Debug)]
pub enum Listener {
    /// TCP listener.
    Tcp(TcpListener),
    /// Unix domain socket listener and its path.
    #[cfg(unix)]
    Unix(UnixListener, std::path::PathBuf),
}

type Connection = Box<dyn AsyncRead + Send + Unpin>;

impl Listener {
    /// Binds a listen address. A stale Unix socket file is removed first.
    ///
    /// # Errors
    ///
    /// - [`ServerError::Bind`] if the address cannot be bound
    /// - [`ServerError::Unsupported`] for Unix sockets on other platforms
    pub async fn bind(addr: &ListenAddr) -> std::result::Result<Self, ServerError> {
        let bind_err = |source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        };
        match addr {
            ListenAddr::Tcp(host_port) => {
                let listener = TcpListener::bind(host_port.as_str()).await.map_err(bind_err)?;
                Ok(Self::Tcp(listener))
            }
            #[cfg(unix)]
            ListenAddr::Unix(path) => {
                remove_socket(path);
                let listener = UnixListener::bind(path).map_err(bind_err)?;
                Ok(Self::Unix(listener, path.clone()))
            }
            #[cfg(not(unix))]
            ListenAddr::Unix(_) => Err(ServerError::Unsupported(addr.to_string())),
        }
    }

    /// The bound address, with the actual port for `tcp://host:0`.
    pub fn local_addr(&self) -> ListenAddr {
        match self {
            Self::Tcp(listener) => match listener.local_addr() {
                Ok(addr) => ListenAddr::Tcp(addr.to_string()),
                Err(_) => ListenAddr::default(),
            },
            #[cfg(unix)]
            Self::Unix(_, path) => ListenAddr::Unix(path.clone()),
        }
    }

    async fn accept(&self) -> io::Result<(Connection, String)> {
        match self {
            Self::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok((Box::new(stream), peer.to_string()))
            }
            #[cfg(unix)]
            Self::Unix(listener, path) => {
                let (stream, _) = listener.accept().await?;
                Ok((Box::new(stream), path.display().to_string()))
            }
        }
    }

    fn close(self) {
        #[cfg(unix)]
        if let Self::Unix(listener, path) = self {
            drop(listener);
            remove_socket(&path);
        }
    }
}

#[cfg(unix)]
fn remove_socket(path: &Path) {
    if let Err(err) = std::fs::remove_file(path)
        && err.kind() != io::ErrorKind::NotFound
    {
        tracing::warn!(path = %path.display(), error = %err, "could not remove socket file");
    }
}

/// The ingestion server.
///
/// Cloning is cheap; clones share state, buffer and store.
#[derive(Debug, Clone)]
pub struct Server {
    coordinator: FlushCoordinator,
    allow_remote_shutdown: bool,
    state: Arc<watch::Sender<ServerState>>,
    admission: Arc<RwLock<()>>,
}

impl Server {
    /// Creates a server around a flush coordinator.
    pub fn new(coordinator: FlushCoordinator, allow_remote_shutdown: bool) -> Self {
        let (state, _) = watch::channel(ServerState::Accepting);
        Self {
            coordinator,
            allow_remote_shutdown,
            state: Arc::new(state),
            admission: Arc::new(RwLock::new(())),
        }
    }

    /// Opens the configured database and wires up buffer and coordinator.
    ///
    /// # Errors
    ///
    /// Returns the store error if the database cannot be opened.
    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        let store = Store::open(&config.database)?;
        let coordinator = FlushCoordinator::new(
            Arc::new(IngestBuffer::new()),
            Arc::new(Mutex::new(store)),
            config.flush_options(),
        );
        Ok(Self::new(coordinator, config.allow_remote_shutdown))
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// The flush coordinator.
    pub fn coordinator(&self) -> &FlushCoordinator {
        &self.coordinator
    }

    /// Moves `Accepting → Draining`. Returns false if already past
    /// `Accepting`.
    ///
    /// Waits for lines being admitted on other connections to land in the
    /// buffer first.
    pub fn request_shutdown(&self) -> bool {
        let _exclusive = self.admission.write().unwrap_or_else(PoisonError::into_inner);
        let started = self.state.send_if_modified(|state| {
            if *state == ServerState::Accepting {
                *state = ServerState::Draining;
                true
            } else {
                false
            }
        });
        if started {
            tracing::info!(backlog = self.coordinator.buffer().len(), "shutdown requested, draining");
        }
        started
    }

    /// Handles one inbound line. Never performs storage I/O.
    ///
    /// Must be called from within a tokio runtime, since a push may trigger
    /// a flush.
    pub fn handle_line(&self, line: &str) -> LineOutcome {
        let admitted = self.admission.read().unwrap_or_else(PoisonError::into_inner);
        if self.state() != ServerState::Accepting {
            return LineOutcome::Ignored;
        }
        match protocol::parse_line(line, Utc::now().timestamp()) {
            Ok(Line::Blank) => LineOutcome::Blank,
            Ok(Line::Shutdown) if self.allow_remote_shutdown => {
                drop(admitted);
                self.request_shutdown();
                LineOutcome::Shutdown
            }
            Ok(Line::Shutdown) => {
                tracing::warn!("shutdown sentinel ignored, remote shutdown is disabled");
                LineOutcome::Ignored
            }
            Ok(Line::Event(event)) => {
                // Busy is logged; a detached pass reports fatal errors as the fault
                let _ = self.coordinator.push(event);
                LineOutcome::Queued
            }
            Err(err) => {
                tracing::warn!(error = %err, "discarding malformed line");
                LineOutcome::Rejected
            }
        }
    }

    /// Reads lines until EOF or until the server stops accepting.
    ///
    /// Returns the number of events queued from this connection.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if reading fails.
    pub async fn serve_connection<R>(&self, reader: R) -> std::result::Result<usize, ServerError>
    where
        R: AsyncRead + Unpin,
    {
        let mut lines = BufReader::new(reader).lines();
        let mut queued = 0;
        while self.state() == ServerState::Accepting {
            let Some(line) = lines.next_line().await? else {
                break;
            };
            if self.handle_line(&line) == LineOutcome::Queued {
                queued += 1;
            }
        }
        Ok(queued)
    }

    /// Accepts connections until shutdown, then drains.
    ///
    /// Shutdown starts when a client sends the sentinel (if allowed) or when
    /// `cancel` completes. The flush timer runs every `flush_interval` while
    /// accepting.
    ///
    /// A flush pass failing unrecoverably also stops the server.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Fatal`] if a pass failed unrecoverably,
    /// otherwise the storage error of the final drain. The server is
    /// [`ServerState::Stopped`] either way.
    pub async fn run<F>(&self, listener: Listener, flush_interval: Duration, cancel: F) -> Result<FlushReport>
    where
        F: Future<Output = ()>,
    {
        let timer = self.coordinator.spawn_timer(flush_interval);
        let mut state_rx = self.state.subscribe();
        tokio::pin!(cancel);

        tracing::info!(listen = %listener.local_addr(), "accepting events");
        let fault = loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((conn, peer)) => self.spawn_connection(conn, peer),
                    Err(err) => tracing::warn!(error = %err, "accept failed"),
                },
                () = stopping(&mut state_rx) => break None,
                fault = self.coordinator.faulted() => {
                    tracing::error!(error = %fault, "storage failed, shutting down");
                    self.request_shutdown();
                    break Some(fault);
                }
                () = &mut cancel => {
                    self.request_shutdown();
                    break None;
                }
            }
        };

        listener.close();
        timer.abort();

        let report = self.coordinator.drain().await;
        self.state.send_replace(ServerState::Stopped);
        if let Some(fault) = fault {
            if let Err(err) = &report {
                tracing::warn!(error = %err, "final drain after storage failure also failed");
            }
            return Err(StoreError::Fatal(fault).into());
        }
        match &report {
            Ok(report) => tracing::info!(
                drained = report.drained,
                recorded = report.batch.recorded,
                "server stopped"
            ),
            Err(err) => tracing::error!(error = %err, "final drain failed, server stopped"),
        }
        report
    }

    fn spawn_connection(&self, conn: Connection, peer: String) {
        let this = self.clone();
        tokio::spawn(async move {
            tracing::debug!(%peer, "connection opened");
            match this.serve_connection(conn).await {
                Ok(queued) => tracing::debug!(%peer, queued, "connection closed"),
                Err(err) => tracing::warn!(%peer, error = %err, "connection failed"),
            }
        });
    }
}

async fn stopping(rx: &mut watch::Receiver<ServerState>) {
    let _ = rx.wait_for(|state| *state != ServerState::Accepting).await;
}

/// Binds the configured address and serves until the sentinel or `cancel`.
///
/// # Errors
///
/// Returns an error if the store cannot be opened, the address cannot be
/// bound, or the final drain fails.
pub async fn serve<F>(config: &ServerConfig, cancel: F) -> Result<FlushReport>
where
    F: Future<Output = ()>,
{
    config.validate()?;
    let server = Server::from_config(config)?;
    let listener = Listener::bind(&config.listen).await?;
    server.run(listener, config.flush_interval(), cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use crate::flush::FlushOptions;
    use crate::period::Period;

    fn server(allow_remote_shutdown: bool) -> Server {
        let coordinator = FlushCoordinator::new(
            Arc::new(IngestBuffer::new()),
            Arc::new(Mutex::new(Store::open_in_memory().unwrap())),
            FlushOptions {
                threshold: 0,
                ..FlushOptions::default()
            },
        );
        Server::new(coordinator, allow_remote_shutdown)
    }

    #[tokio::test]
    async fn test_handle_line_outcomes() {
        let server = server(true);

        assert_eq!(server.handle_line("counters a 1"), LineOutcome::Queued);
        assert_eq!(server.handle_line(""), LineOutcome::Blank);
        assert_eq!(server.handle_line("timers a 1"), LineOutcome::Rejected);
        assert_eq!(server.coordinator().buffer().len(), 1);

        assert_eq!(server.handle_line("SHUTDOWN:SERVER"), LineOutcome::Shutdown);
        assert_eq!(server.state(), ServerState::Draining);
        assert_eq!(server.handle_line("counters a 1"), LineOutcome::Ignored);
        assert_eq!(server.coordinator().buffer().len(), 1);
    }

    #[tokio::test]
    async fn test_sentinel_ignored_when_not_allowed() {
        let server = server(false);

        assert_eq!(server.handle_line("SHUTDOWN:SERVER"), LineOutcome::Ignored);
        assert_eq!(server.state(), ServerState::Accepting);
        assert_eq!(server.handle_line("gauges g 1"), LineOutcome::Queued);
    }

    #[tokio::test]
    async fn test_missing_timestamp_defaults_to_receipt_time() {
        let server = server(true);
        let before = Utc::now().timestamp();
        server.handle_line("gauges g 1");

        let events = server.coordinator().buffer().take_all();
        let at = events[0].at.unwrap();
        assert!(at >= before && at <= Utc::now().timestamp());
    }

    #[tokio::test]
    async fn test_serve_connection_stops_after_sentinel() {
        let server = server(true);
        let input: &[u8] = b"counters a 1 60\nbogus\ngauges b 2 60\nSHUTDOWN:SERVER\ncounters a 1 60\n";

        let queued = server.serve_connection(input).await.unwrap();
        assert_eq!(queued, 2);
        assert_eq!(server.coordinator().buffer().len(), 2);
        assert_eq!(server.state(), ServerState::Draining);
    }

    #[test]
    fn test_shutdown_waits_for_admitted_lines() {
        let server = server(true);
        let admitted = server.admission.read().unwrap();

        let other = server.clone();
        let shutdown = std::thread::spawn(move || other.request_shutdown());
        std::thread::sleep(Duration::from_millis(50));
        // Still accepting while a line holds admission
        assert_eq!(server.state(), ServerState::Accepting);

        drop(admitted);
        assert!(shutdown.join().unwrap());
        assert_eq!(server.state(), ServerState::Draining);
        assert_eq!(server.handle_line("counters a 1"), LineOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_storage_failure_stops_server() {
        let coordinator = FlushCoordinator::new(
            Arc::new(IngestBuffer::new()),
            Arc::new(Mutex::new(Store::open_in_memory().unwrap())),
            FlushOptions {
                threshold: 1,
                ..FlushOptions::default()
            },
        );
        coordinator
            .store()
            .lock()
            .unwrap()
            .exec("DROP TABLE counters; DROP TABLE aggregated_counters")
            .unwrap();
        let server = Server::new(coordinator, true);
        let listener = Listener::bind(&"tcp://127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        for _ in 0..5 {
            assert_eq!(server.handle_line("counters a 1 1393762211"), LineOutcome::Queued);
        }

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            server.run(listener, Duration::from_secs(3600), std::future::pending()),
        )
        .await
        .unwrap();

        assert!(matches!(
            result,
            Err(crate::TallyError::Store(StoreError::Fatal(_)))
        ));
        assert_eq!(server.state(), ServerState::Stopped);
        assert_eq!(server.handle_line("counters a 1"), LineOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_run_drains_on_cancel() {
        let server = server(true);
        let listener = Listener::bind(&"tcp://127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        server.handle_line("counters a.b 5 1393762211");

        let report = server
            .run(listener, Duration::from_secs(3600), async {})
            .await
            .unwrap();
        assert_eq!(report.drained, 1);
        assert_eq!(server.state(), ServerState::Stopped);

        let store = server.coordinator().store().lock().unwrap();
        let rows = store
            .aggregates(EventKind::Counter, Some(Period::Day), Some("a"))
            .unwrap();
        assert_eq!(rows[0].value, 5.0);
    }
}
