//! Active trace sessions per application.
//!
//! A session starts with the first event for an application that has no
//! active session and ends when an event requests a stop. Each session id
//! names its own trace file.

use chrono::{DateTime, Local};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tracing::info;

/// Timestamp layout used for session ids and lifecycle log lines.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";

/// Outcome of resolving the session for an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionLookup {
    /// The application already had an active session.
    Active(String),
    /// A session was opened for this event.
    Opened(String),
}

impl SessionLookup {
    pub fn id(&self) -> &str {
        match self {
            SessionLookup::Active(id) | SessionLookup::Opened(id) => id,
        }
    }
}

#[derive(Debug, Default)]
struct Sessions {
    active: HashMap<String, String>,
    /// Last timestamp handed out per application and how often it was reused.
    issued: HashMap<String, (String, u32)>,
}

/// Maps application id to its active session id.
#[derive(Debug, Default)]
pub struct SessionTracker {
    inner: Mutex<Sessions>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the active session for `app_id`, opening one stamped with `now`
    /// if there is none.
    ///
    /// Ids are unique per application even when two sessions open within
    /// the same second.
    pub fn resolve(&self, app_id: &str, now: DateTime<Local>) -> SessionLookup {
        let mut sessions = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(id) = sessions.active.get(app_id) {
            return SessionLookup::Active(id.clone());
        }

        let stamp = now.format(TIMESTAMP_FORMAT).to_string();
        let reuse = match sessions.issued.get(app_id) {
            Some((last, reuse)) if *last == stamp => reuse + 1,
            _ => 0,
        };
        sessions
            .issued
            .insert(app_id.to_string(), (stamp.clone(), reuse));
        let id = if reuse == 0 {
            stamp
        } else {
            format!("{stamp}_{reuse}")
        };

        info!(app_id, session = %id, "Opened trace session");
        sessions.active.insert(app_id.to_string(), id.clone());
        SessionLookup::Opened(id)
    }

    /// Active session id for `app_id`, if any.
    pub fn active(&self, app_id: &str) -> Option<String> {
        let sessions = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        sessions.active.get(app_id).cloned()
    }

    /// End the active session for `app_id`. Returns the ended id.
    pub fn end(&self, app_id: &str) -> Option<String> {
        let mut sessions = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let ended = sessions.active.remove(app_id);
        if let Some(id) = &ended {
            info!(app_id, session = %id, "Closed trace session");
        }
        ended
    }

    /// Number of applications with an active session.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .active
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
