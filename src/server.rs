//! TCP listener for coverage connections.
//!
//! Accepts device connections, hands each one to a worker task, reaps idle
//! workers on a fixed interval, and shuts the whole server down when a
//! connection opens with the bare frame delimiter.

use crate::config::Config;
use crate::coverage::CoverageStore;
use crate::frame::{FrameBuffer, DELIMITER};
use crate::ingest::Collector;
use crate::registry::WorkerRegistry;
use crate::session::TIMESTAMP_FORMAT;
use crate::trace::TraceWriter;
use crate::worker::Worker;
use chrono::Local;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, trace};

/// Listen backlog for the accepting socket
const LISTEN_BACKLOG: i32 = 1024;

/// Listener lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Starting,
    Accepting,
    ShuttingDown,
    Stopped,
}

/// State every connection task needs.
struct ConnectionContext {
    collector: Arc<Collector>,
    workers: Arc<WorkerRegistry>,
    shutdown: Arc<Notify>,
    buffer_size: usize,
    read_timeout: Duration,
    handshake_timeout: Duration,
}

/// Server instance
pub struct Server {
    config: Config,
    collector: Arc<Collector>,
    workers: Arc<WorkerRegistry>,
    shutdown: Arc<Notify>,
    state: watch::Sender<ServerState>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Self {
        let collector = Collector::new(CoverageStore::new(), TraceWriter::new(&config.out_dir));
        let (state, _) = watch::channel(ServerState::Starting);

        Server {
            config,
            collector: Arc::new(collector),
            workers: Arc::new(WorkerRegistry::new()),
            shutdown: Arc::new(Notify::new()),
            state,
        }
    }

    pub fn coverage(&self) -> &Arc<CoverageStore> {
        self.collector.coverage()
    }

    pub fn workers(&self) -> &Arc<WorkerRegistry> {
        &self.workers
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    /// Trigger the same shutdown path as the delimiter handshake.
    pub fn request_shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Bind the listening socket. Must be called inside the runtime.
    pub fn bind(&self) -> io::Result<TcpListener> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let socket = socket2::Socket::new(
            socket2::Domain::for_address(addr),
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;

        TcpListener::from_std(socket.into())
    }

    /// Bind and serve until shutdown.
    pub async fn run(&self) -> io::Result<()> {
        let listener = self.bind()?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until shutdown, then stop all
    /// workers, wait out the grace period and close the listener.
    ///
    /// An accept failure is fatal: the server still shuts down in order and
    /// the error is returned.
    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        let address = listener.local_addr()?;
        info!(
            address = %address,
            at = %Local::now().format(TIMESTAMP_FORMAT),
            "Coverage server starting"
        );
        self.set_state(ServerState::Accepting);

        let reaper = tokio::spawn(reap_task(
            Arc::clone(&self.workers),
            self.config.reap_interval,
            self.config.idle_timeout,
        ));

        let result = self.accept_loop(&listener).await;
        if let Err(e) = &result {
            error!(error = %e, "Failed to accept connection");
        }

        self.set_state(ServerState::ShuttingDown);
        reaper.abort();
        let stopping = self.workers.stop_all();
        info!(workers = stopping, "Stopping connections");
        tokio::time::sleep(self.config.shutdown_grace).await;

        drop(listener);
        self.set_state(ServerState::Stopped);

        let coverage = self.coverage();
        for app_id in coverage.applications() {
            info!(
                app_id = %app_id,
                coverage = coverage.application_coverage_ratio(&app_id),
                "Final application coverage"
            );
        }
        let stats = coverage.stats();
        info!(
            applications = stats.applications,
            devices = stats.devices,
            at = %Local::now().format(TIMESTAMP_FORMAT),
            "Coverage server shutting down"
        );
        result
    }

    async fn accept_loop(&self, listener: &TcpListener) -> io::Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => return Ok(()),
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    trace!(peer = %peer, "New connection");
                    self.spawn_connection(stream, peer);
                }
            }
        }
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let ctx = ConnectionContext {
            collector: Arc::clone(&self.collector),
            workers: Arc::clone(&self.workers),
            shutdown: Arc::clone(&self.shutdown),
            buffer_size: self.config.buffer_size,
            read_timeout: self.config.read_timeout,
            handshake_timeout: self.config.idle_timeout,
        };

        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, ctx).await {
                debug!(peer = %peer, error = %e, "Connection error");
            }
        });
    }

    fn set_state(&self, state: ServerState) {
        let previous = self.state.send_replace(state);
        debug!(from = ?previous, to = ?state, "Server state changed");
    }
}

/// Background task that evicts idle workers
async fn reap_task(workers: Arc<WorkerRegistry>, every: Duration, max_idle: Duration) {
    let mut interval = tokio::time::interval(every);

    loop {
        interval.tick().await;
        let reaped = workers.reap_idle(Instant::now(), max_idle);
        if reaped > 0 {
            debug!(reaped, live = workers.len(), "Reaper sweep");
        }
    }
}

/// Handle a single accepted connection.
///
/// The first four bytes decide what the connection is: the bare delimiter
/// shuts the server down, anything else is the start of a coverage stream
/// and is handed to a registered worker.
async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    ctx: ConnectionContext,
) -> io::Result<()> {
    let mut head = [0u8; DELIMITER.len()];
    match tokio::time::timeout(ctx.handshake_timeout, stream.read_exact(&mut head)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
            trace!(peer = %peer, "Connection closed before first frame");
            return Ok(());
        }
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            debug!(peer = %peer, "No data from connection, dropping it");
            return Ok(());
        }
    }

    if head == DELIMITER {
        info!(peer = %peer, "Shutdown requested");
        ctx.shutdown.notify_one();
        return Ok(());
    }

    let device = stream.local_addr()?.port();
    let worker = Arc::new(Worker::new(peer, device));
    let Some(slot) = ctx.workers.insert(Arc::clone(&worker)) else {
        debug!(peer = %peer, "Server is shutting down, dropping connection");
        return Ok(());
    };
    info!(
        peer = %peer,
        device,
        at = %Local::now().format(TIMESTAMP_FORMAT),
        "Accepting connection"
    );

    let buffer = FrameBuffer::with_prefix(&head, ctx.buffer_size);
    let result = worker
        .run(stream, buffer, &ctx.collector, ctx.read_timeout)
        .await;

    ctx.workers.remove(slot, &worker);
    trace!(peer = %peer, live = ctx.workers.len(), "Worker finished");
    result
}
