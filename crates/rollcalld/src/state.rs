//! Stream lifecycle state shared by the controller and its threads.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation flag for one monitoring session.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Initializing,
    Running,
    Stopping,
}

/// Handle to the session created by [`StreamState::begin`].
#[derive(Debug, Clone)]
pub struct Session {
    pub id: u64,
    pub cancel: CancelToken,
}

#[derive(Debug)]
struct Inner {
    phase: Phase,
    session: u64,
    since: Option<DateTime<Utc>>,
    cancel: CancelToken,
}

/// The single owner of lifecycle transitions.
///
/// Every transition that belongs to a session is keyed by its id, so a
/// thread left over from an earlier session cannot move a newer one.
#[derive(Debug)]
pub struct StreamState {
    inner: Mutex<Inner>,
}

impl Default for StreamState {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                phase: Phase::Idle,
                session: 0,
                since: None,
                cancel: CancelToken::new(),
            }),
        }
    }
}

impl StreamState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> Phase {
        self.inner.lock().phase
    }

    pub fn since(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().since
    }

    /// Id of the current (or most recent) session.
    pub fn session_id(&self) -> u64 {
        self.inner.lock().session
    }

    /// Idle -> Initializing. `None` if a session is already active.
    pub fn begin(&self) -> Option<Session> {
        let mut inner = self.inner.lock();
        if inner.phase != Phase::Idle {
            return None;
        }
        inner.phase = Phase::Initializing;
        inner.session += 1;
        inner.since = Some(Utc::now());
        inner.cancel = CancelToken::new();
        tracing::debug!(session = inner.session, "stream initializing");
        Some(Session {
            id: inner.session,
            cancel: inner.cancel.clone(),
        })
    }

    /// Initializing -> Running, on the session's first frame.
    pub fn mark_running(&self, session: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.session == session && inner.phase == Phase::Initializing {
            inner.phase = Phase::Running;
            tracing::info!(session, "stream running");
            return true;
        }
        false
    }

    /// Running | Initializing -> Stopping. Cancels the session and returns
    /// its id; `None` if there is nothing to stop.
    pub fn request_stop(&self) -> Option<u64> {
        let mut inner = self.inner.lock();
        match inner.phase {
            Phase::Running | Phase::Initializing => {
                inner.phase = Phase::Stopping;
                inner.cancel.cancel();
                Some(inner.session)
            }
            Phase::Idle | Phase::Stopping => None,
        }
    }

    /// Stopping -> Idle.
    pub fn finish_stop(&self, session: u64) {
        let mut inner = self.inner.lock();
        if inner.session == session && inner.phase == Phase::Stopping {
            inner.phase = Phase::Idle;
            inner.since = None;
            tracing::info!(session, "stream stopped");
        }
    }

    /// Running | Initializing -> Idle, when the session ends on its own
    /// (fatal device error) or fails to start.
    pub fn end_session(&self, session: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.session == session && matches!(inner.phase, Phase::Running | Phase::Initializing) {
            inner.phase = Phase::Idle;
            inner.since = None;
            inner.cancel.cancel();
            return true;
        }
        false
    }

    /// Whether `session` is still the active session.
    pub fn is_live(&self, session: u64) -> bool {
        let inner = self.inner.lock();
        inner.session == session && matches!(inner.phase, Phase::Running | Phase::Initializing)
    }
}

/// Snapshot returned by `status()`.
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub phase: Phase,
    pub running: bool,
    /// Device opened, first frame not yet captured.
    pub busy: bool,
    pub since: Option<DateTime<Utc>>,
    pub known_identities: usize,
    pub frames_dropped: u64,
}
