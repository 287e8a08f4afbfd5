//! Coverage report envelope.
//!
//! Each frame carries one JSON object:
//!
//! ```text
//! {"id":"<app id>","cov":"0\n5\n17","stop":"false","recorder":"<name>"}
//! ```
//!
//! `cov` lists the method ordinals hit since the previous report, one per
//! line. `stop` is the string `"true"` when the device ends its session.

use serde::Deserialize;
use std::fmt;
use std::path::{Component, Path};

/// Envelope as it appears on the wire.
#[derive(Debug, Deserialize)]
struct WireEvent {
    id: String,
    #[serde(default)]
    cov: String,
    #[serde(default)]
    stop: Option<String>,
    #[serde(default)]
    recorder: Option<String>,
}

/// One decoded coverage report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverageEvent {
    pub app_id: String,
    /// Raw newline-separated ordinal list, persisted verbatim.
    pub data: String,
    pub stop_requested: bool,
    /// Informational only.
    pub recorder: Option<String>,
}

impl CoverageEvent {
    /// Decode a frame body.
    pub fn decode(frame: &[u8]) -> Result<Self, IngestError> {
        let text = std::str::from_utf8(frame).map_err(IngestError::Utf8)?;
        let wire: WireEvent = serde_json::from_str(text).map_err(IngestError::Decode)?;
        validate_app_id(&wire.id)?;

        Ok(CoverageEvent {
            app_id: wire.id,
            data: wire.cov,
            stop_requested: wire.stop.as_deref() == Some("true"),
            recorder: wire.recorder,
        })
    }

    /// Iterate the method ordinals in `data`, in order.
    ///
    /// Blank lines are skipped. The iterator yields an error for the first
    /// line that is not a non-negative integer; callers stop there.
    pub fn ordinals(&self) -> impl Iterator<Item = Result<usize, IngestError>> + '_ {
        self.data
            .split('\n')
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| {
                line.parse::<usize>()
                    .map_err(|_| IngestError::InvalidOrdinal(line.to_string()))
            })
    }
}

/// An application id names one directory directly under the output root,
/// so it must be exactly one plain path component.
fn validate_app_id(app_id: &str) -> Result<(), IngestError> {
    let mut components = Path::new(app_id).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None) if name == app_id => Ok(()),
        _ => Err(IngestError::InvalidAppId(app_id.to_string())),
    }
}

/// Errors scoped to a single message. None of these close the connection.
#[derive(Debug)]
pub enum IngestError {
    /// Frame is not valid UTF-8
    Utf8(std::str::Utf8Error),
    /// Frame is not a valid envelope
    Decode(serde_json::Error),
    /// Application id is not a single directory name
    InvalidAppId(String),
    /// A `cov` line is not a method ordinal
    InvalidOrdinal(String),
    /// Ordinal past the end of the application's bitmap
    OrdinalOutOfRange { ordinal: usize, methods: usize },
    /// No bitmap exists for the (application, device) pair
    UnknownDevice { app_id: String, device: u16 },
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestError::Utf8(e) => write!(f, "frame is not valid UTF-8: {e}"),
            IngestError::Decode(e) => write!(f, "malformed coverage envelope: {e}"),
            IngestError::InvalidAppId(id) => write!(f, "invalid application id '{id}'"),
            IngestError::InvalidOrdinal(line) => write!(f, "invalid method ordinal '{line}'"),
            IngestError::OrdinalOutOfRange { ordinal, methods } => write!(
                f,
                "method ordinal {ordinal} out of range for {methods} methods"
            ),
            IngestError::UnknownDevice { app_id, device } => {
                write!(f, "no coverage bitmap for app '{app_id}' on device {device}")
            }
        }
    }
}

impl std::error::Error for IngestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IngestError::Utf8(e) => Some(e),
            IngestError::Decode(e) => Some(e),
            _ => None,
        }
    }
}
