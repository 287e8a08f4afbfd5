//! Per-message coverage pipeline.
//!
//! Turns one decoded frame into a trace record on disk and counter
//! increments in the shared store. Disk and memory are updated
//! independently: a failed append is logged and the counters still move.

use crate::coverage::{CoverageBitmap, CoverageStore, DeviceKey};
use crate::protocol::{CoverageEvent, IngestError};
use crate::session::{SessionLookup, SessionTracker};
use crate::trace::TraceWriter;
use chrono::{Local, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

/// Summary of one applied message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub app_id: String,
    pub session_id: String,
    pub hits: usize,
    pub stopped: bool,
}

/// Shared ingestion state handed to every connection.
#[derive(Debug)]
pub struct Collector {
    coverage: Arc<CoverageStore>,
    sessions: SessionTracker,
    trace: TraceWriter,
}

impl Collector {
    pub fn new(coverage: Arc<CoverageStore>, trace: TraceWriter) -> Self {
        Self {
            coverage,
            sessions: SessionTracker::new(),
            trace,
        }
    }

    pub fn coverage(&self) -> &Arc<CoverageStore> {
        &self.coverage
    }

    pub fn sessions(&self) -> &SessionTracker {
        &self.sessions
    }

    /// Process one complete frame received on `device`.
    ///
    /// A bad ordinal stops processing of this message; increments applied
    /// before it are kept.
    pub async fn collect(&self, frame: &[u8], device: DeviceKey) -> Result<Applied, IngestError> {
        let event = CoverageEvent::decode(frame)?;
        let app_id = event.app_id.as_str();

        let bitmap = self.ensure_bitmap(app_id, device).await;

        let session = self.sessions.resolve(app_id, Local::now());
        if let SessionLookup::Opened(_) = &session {
            if let Err(e) = self.trace.ensure_app_dir(app_id).await {
                warn!(app_id, error = %e, "Failed to create application directory");
            }
        }

        if let Err(e) = self
            .trace
            .append(app_id, session.id(), Utc::now().timestamp_millis(), &event.data)
            .await
        {
            warn!(app_id, session = session.id(), error = %e, "Failed to append trace record");
        }

        let mut hits = 0;
        for ordinal in event.ordinals() {
            bitmap.hit(ordinal?)?;
            hits += 1;
        }

        if event.stop_requested {
            self.sessions.end(app_id);
        }

        debug!(
            app_id,
            device,
            hits,
            stop = event.stop_requested,
            recorder = event.recorder.as_deref().unwrap_or(""),
            "Applied coverage report"
        );

        Ok(Applied {
            app_id: event.app_id.clone(),
            session_id: session.id().to_string(),
            hits,
            stopped: event.stop_requested,
        })
    }

    /// Bitmap for `(app_id, device)`, allocating it on first sight.
    ///
    /// The method count comes from the application's index file the first
    /// time the application is seen. An unreadable index counts as zero
    /// methods.
    async fn ensure_bitmap(&self, app_id: &str, device: DeviceKey) -> Arc<CoverageBitmap> {
        if let Some(bitmap) = self.coverage.bitmap(app_id, device) {
            return bitmap;
        }

        let methods = match self.coverage.method_count(app_id) {
            Some(methods) => methods,
            None => self.trace.method_count(app_id).await.unwrap_or_else(|e| {
                warn!(app_id, error = %e, "Cannot read method index, assuming no methods");
                0
            }),
        };
        self.coverage.ensure_sized(app_id, device, methods)
    }
}
