//! On-disk layout under the output directory.
//!
//! ```text
//! <out_dir>/<app_id>/covids                     one method id per line
//! <out_dir>/<app_id>/coverage.dat.<session_id>  appended trace records
//! ```
//!
//! Each trace record is `#<epoch millis>\n<raw cov payload>\n`.

use std::io;
use std::path::PathBuf;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::trace;

/// Name of the per-application method index.
pub const METHOD_INDEX_FILE: &str = "covids";

/// Prefix of per-session trace files.
pub const TRACE_FILE_PREFIX: &str = "coverage.dat.";

/// Appends raw coverage reports to session files.
#[derive(Debug, Clone)]
pub struct TraceWriter {
    out_dir: PathBuf,
}

impl TraceWriter {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
        }
    }

    /// Directory holding everything for one application.
    pub fn app_dir(&self, app_id: &str) -> PathBuf {
        self.out_dir.join(app_id)
    }

    /// Trace file for one session.
    pub fn trace_path(&self, app_id: &str, session_id: &str) -> PathBuf {
        self.app_dir(app_id)
            .join(format!("{TRACE_FILE_PREFIX}{session_id}"))
    }

    /// Create the application directory if it does not exist yet.
    pub async fn ensure_app_dir(&self, app_id: &str) -> io::Result<()> {
        fs::create_dir_all(self.app_dir(app_id)).await
    }

    /// Number of methods listed in the application's index file.
    pub async fn method_count(&self, app_id: &str) -> io::Result<usize> {
        let path = self.app_dir(app_id).join(METHOD_INDEX_FILE);
        let contents = fs::read(&path).await?;
        Ok(count_lines(&contents))
    }

    /// Append one record to the session's trace file.
    ///
    /// The file is created on first use and never truncated afterwards.
    pub async fn append(
        &self,
        app_id: &str,
        session_id: &str,
        epoch_millis: i64,
        data: &str,
    ) -> io::Result<()> {
        let path = self.trace_path(app_id, session_id);
        let mut record = format!("#{epoch_millis}\n{data}");
        if !record.ends_with('\n') {
            record.push('\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(record.as_bytes()).await?;
        file.flush().await?;

        trace!(path = %path.display(), bytes = record.len(), "Appended trace record");
        Ok(())
    }
}

/// Count lines the way a line reader does: a final line without a
/// terminator still counts.
fn count_lines(contents: &[u8]) -> usize {
    let newlines = contents.iter().filter(|&&b| b == b'\n').count();
    match contents.last() {
        Some(b'\n') | None => newlines,
        Some(_) => newlines + 1,
    }
}
