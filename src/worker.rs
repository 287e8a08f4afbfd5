//! Connection worker.
//!
//! Each accepted device connection is driven by one worker task. The task
//! owns the socket and its reassembly buffer; the `Worker` handle it shares
//! with the registry only exposes the stop flag and the last read time.

use crate::coverage::DeviceKey;
use crate::frame::FrameBuffer;
use crate::ingest::Collector;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::io::AsyncRead;
use tracing::{debug, trace, warn};

/// Shared view of one running connection.
#[derive(Debug)]
pub struct Worker {
    peer: SocketAddr,
    device: DeviceKey,
    created: Instant,
    /// Milliseconds after `created` of the most recent read.
    last_read: AtomicU64,
    stop: AtomicBool,
}

impl Worker {
    /// Create a handle. A fresh worker counts as having just read.
    pub fn new(peer: SocketAddr, device: DeviceKey) -> Self {
        Self {
            peer,
            device,
            created: Instant::now(),
            last_read: AtomicU64::new(0),
            stop: AtomicBool::new(false),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn device(&self) -> DeviceKey {
        self.device
    }

    /// Ask the read loop to exit. Takes effect the next time the loop
    /// checks, which is between reads.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Time of the most recent read.
    pub fn last_read(&self) -> Instant {
        self.created + Duration::from_millis(self.last_read.load(Ordering::Acquire))
    }

    /// How long the connection has gone without a read as of `now`.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_read())
    }

    fn touch(&self) {
        let elapsed = self.created.elapsed().as_millis() as u64;
        self.last_read.fetch_max(elapsed, Ordering::AcqRel);
    }

    /// Run the read loop until end of stream, a transport error, or a stop
    /// request.
    ///
    /// Every complete frame is handed to `collector` in arrival order. A
    /// frame that fails to process is logged and skipped. Reads wait at
    /// most `read_timeout` so the stop flag is rechecked regularly; an
    /// expired wait does not count as a read.
    pub async fn run<R>(
        &self,
        mut reader: R,
        mut buffer: FrameBuffer,
        collector: &Collector,
        read_timeout: Duration,
    ) -> io::Result<()>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            while let Some(frame) = buffer.next_frame() {
                trace!(peer = %self.peer, len = frame.len(), "Received frame");
                match collector.collect(&frame, self.device).await {
                    Ok(applied) => {
                        trace!(peer = %self.peer, app_id = %applied.app_id, hits = applied.hits, "Frame applied")
                    }
                    Err(e) => warn!(peer = %self.peer, error = %e, "Dropping coverage report"),
                }
            }

            if self.stop_requested() {
                debug!(peer = %self.peer, buffered = buffer.len(), "Worker stopped on request");
                return Ok(());
            }

            let n = match tokio::time::timeout(read_timeout, buffer.read_from(&mut reader)).await {
                Ok(result) => result?,
                Err(_) => continue,
            };
            self.touch();

            if n == 0 {
                trace!(peer = %self.peer, buffered = buffer.len(), "Connection closed by peer");
                return Ok(());
            }
        }
    }
}
