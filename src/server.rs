//! TCP server for newline-delimited record logging.
//!
//! Accepts connections, assembles `\n`-terminated records from each client's
//! byte stream, commits every record to the shared log, and echoes the full
//! log contents back after each commit. Also hosts the heartbeat task and
//! performs the orderly teardown sequence when shutdown is triggered.

use crate::config::Config;
use crate::heartbeat;
use crate::registry::{Registry, WorkerId};
use crate::shutdown::Shutdown;
use crate::store::RecordLog;
use bytes::BytesMut;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Read buffer size
const BUFFER_SIZE: usize = 16 * 1024;

/// Listen backlog
const BACKLOG: i32 = 128;

/// Record delimiter
const DELIMITER: u8 = b'\n';

/// Bind the listening socket with `SO_REUSEADDR` set.
///
/// Done synchronously so `main` can fail before daemonizing; the returned
/// listener is nonblocking and ready for `TcpListener::from_std`.
pub fn bind(addr: &str) -> io::Result<std::net::TcpListener> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Server instance
pub struct Server {
    config: Config,
    log: Arc<RecordLog>,
    registry: Arc<Registry>,
    shutdown: Shutdown,
}

impl Server {
    /// Create a new server instance around an already-created record log.
    pub fn new(config: Config, log: Arc<RecordLog>, shutdown: Shutdown) -> Self {
        Server {
            config,
            log,
            registry: Registry::new(),
            shutdown,
        }
    }

    /// Accept connections until shutdown, then tear everything down.
    ///
    /// Teardown order: close the listener, signal every registered
    /// connection, join the heartbeat, join every worker, delete the log
    /// file. The sequence runs once; repeated termination requests only
    /// re-observe the already-set flag.
    pub async fn run(&self, listener: std::net::TcpListener) -> io::Result<()> {
        let listener = TcpListener::from_std(listener)?;
        info!(address = %listener.local_addr()?, "Server listening");

        let heartbeat = tokio::spawn(heartbeat::run(
            Arc::clone(&self.log),
            self.config.heartbeat_interval,
            self.shutdown.clone(),
        ));

        loop {
            tokio::select! {
                res = listener.accept() => match res {
                    Ok((stream, peer)) => {
                        let (id, close) = self.registry.register(peer);
                        let handle = tokio::spawn(handle_connection(
                            stream,
                            peer,
                            id,
                            close,
                            Arc::clone(&self.log),
                            Arc::clone(&self.registry),
                            self.shutdown.clone(),
                        ));
                        self.registry.attach_handle(id, handle);
                    }
                    Err(e) => {
                        if self.shutdown.is_triggered() {
                            // Listener torn down during shutdown: normal exit.
                            break;
                        }
                        error!(error = %e, "Failed to accept connection");
                    }
                },
                _ = self.shutdown.wait() => break,
            }
        }

        drop(listener);
        self.registry.close_all();

        if let Err(e) = heartbeat.await {
            error!(error = %e, "Heartbeat task panicked");
        }
        for handle in self.registry.drain_handles() {
            if let Err(e) = handle.await {
                error!(error = %e, "Connection worker panicked");
            }
        }

        if let Err(e) = self.log.remove().await {
            warn!(error = %e, "Failed to remove record log");
        }
        info!("Server shutdown complete");
        Ok(())
    }
}

/// Handle a single client connection.
///
/// Assembles records in a private buffer; completed records are committed
/// and echoed one at a time. On exit for any reason, an unterminated tail
/// is flushed as a final record before the worker deregisters itself.
async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    id: WorkerId,
    close: Arc<Notify>,
    log: Arc<RecordLog>,
    registry: Arc<Registry>,
    shutdown: Shutdown,
) {
    info!(peer = %peer, "Accepted connection");
    let mut pending = BytesMut::with_capacity(BUFFER_SIZE);

    'conn: loop {
        tokio::select! {
            res = stream.read_buf(&mut pending) => match res {
                Ok(0) => {
                    debug!(peer = %peer, "Connection closed by client");
                    break 'conn;
                }
                Ok(_) => {}
                Err(e) => {
                    if !shutdown.is_triggered() {
                        warn!(peer = %peer, error = %e, "Read error");
                    }
                    break 'conn;
                }
            },
            _ = close.notified() => break 'conn,
            _ = shutdown.wait() => break 'conn,
        }

        // One received chunk may complete zero, one, or many records.
        while let Some(pos) = pending.iter().position(|&b| b == DELIMITER) {
            let record = pending.split_to(pos + 1);
            if let Err(e) = commit_and_echo(&log, &mut stream, &record, &close, &shutdown).await {
                if shutdown.is_triggered() {
                    debug!(peer = %peer, "Echo abandoned during shutdown");
                } else {
                    warn!(peer = %peer, error = %e, "Echo write failed");
                }
                break 'conn;
            }
        }
    }

    // Flush discipline: records fully assembled before the loop ended are
    // still committed one append each, then the unterminated tail as a final
    // record. Echoes here are best-effort.
    while let Some(pos) = pending.iter().position(|&b| b == DELIMITER) {
        let record = pending.split_to(pos + 1);
        if let Err(e) = commit_and_echo(&log, &mut stream, &record, &close, &shutdown).await {
            debug!(peer = %peer, error = %e, "Echo of trailing record failed");
        }
    }
    if !pending.is_empty() {
        if let Err(e) = commit_and_echo(&log, &mut stream, &pending, &close, &shutdown).await {
            debug!(peer = %peer, error = %e, "Echo of final record failed");
        }
    }

    registry.deregister(id);
    info!(peer = %peer, "Closed connection");
}

/// Commit one record and echo the full log back, all under one lock
/// acquisition so the echo reflects exactly the state after this commit.
///
/// Append and read-back failures are logged and non-fatal for the
/// connection; only a failed socket write is returned as an error. The echo
/// write races the close and shutdown signals so a worker blocked on a
/// stalled reader still observes forced closure instead of pinning the log
/// lock forever.
async fn commit_and_echo(
    log: &RecordLog,
    stream: &mut TcpStream,
    record: &[u8],
    close: &Notify,
    shutdown: &Shutdown,
) -> io::Result<()> {
    let guard = log.lock().await;

    if let Err(e) = guard.append(record).await {
        warn!(error = %e, "Append failed");
        return Ok(());
    }
    let contents = match guard.read_all().await {
        Ok(contents) => contents,
        Err(e) => {
            warn!(error = %e, "Log read-back failed");
            return Ok(());
        }
    };

    tokio::select! {
        res = stream.write_all(&contents) => res,
        _ = close.notified() => Err(aborted_by_shutdown()),
        _ = shutdown.wait() => Err(aborted_by_shutdown()),
    }
}

fn aborted_by_shutdown() -> io::Error {
    io::Error::new(
        io::ErrorKind::ConnectionAborted,
        "connection closed during shutdown",
    )
}
