//! Attendance marking with per-identity cooldown.

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use rollcall_core::{DetectionEvent, Role};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

use crate::state::CancelToken;

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Error, Debug)]
#[error("attendance persistence failed for {identity_id}: {reason}")]
pub struct PersistenceError {
    pub identity_id: String,
    pub reason: String,
}

/// Where "present" marks end up.
pub trait AttendanceSink: Send + Sync {
    fn mark_present(&self, identity_id: &str, role: Role, at: DateTime<Utc>) -> Result<(), PersistenceError>;
}

/// Suppresses repeat marks for an identity inside the cooldown window.
pub struct AttendanceDeduplicator {
    cooldown: chrono::Duration,
    last_marked: HashMap<String, DateTime<Utc>>,
}

impl AttendanceDeduplicator {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown: chrono::Duration::from_std(cooldown).unwrap_or(chrono::Duration::MAX),
            last_marked: HashMap::new(),
        }
    }

    /// Forward each event not in cooldown to `sink`. Returns how many were marked.
    ///
    /// A failed mark leaves the identity out of cooldown so the next
    /// detection retries it.
    pub fn handle_batch(&mut self, events: &[DetectionEvent], sink: &dyn AttendanceSink, now: DateTime<Utc>) -> usize {
        let mut marked = 0;
        for event in events {
            let id = &event.identity_id;
            if let Some(last) = self.last_marked.get(id) {
                if now.signed_duration_since(*last) < self.cooldown {
                    tracing::trace!(id = %id, "suppressed: in cooldown");
                    continue;
                }
            }
            match sink.mark_present(id, event.role, now) {
                Ok(()) => {
                    tracing::info!(id = %id, name = %event.name, role = %event.role, "marked present");
                    self.last_marked.insert(id.clone(), now);
                    marked += 1;
                }
                Err(e) => tracing::warn!(error = %e, "attendance mark failed; will retry on next detection"),
            }
        }
        marked
    }

    pub fn tracked(&self) -> usize {
        self.last_marked.len()
    }
}

/// Attendance worker loop: drain event batches until `cancel` is set.
///
/// Batches still queued when the token fires are left for the controller
/// to discard.
pub fn run_worker(
    events: Receiver<Vec<DetectionEvent>>,
    sink: &dyn AttendanceSink,
    cooldown: Duration,
    cancel: &CancelToken,
) {
    let mut dedup = AttendanceDeduplicator::new(cooldown);
    tracing::info!("attendance worker started");

    while !cancel.is_cancelled() {
        match events.recv_timeout(POLL_INTERVAL) {
            Ok(batch) => {
                if cancel.is_cancelled() {
                    break;
                }
                dedup.handle_batch(&batch, sink, Utc::now());
                let depth = events.len();
                if depth > 0 {
                    tracing::debug!(depth, "event queue backlog");
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    tracing::info!(identities = dedup.tracked(), "attendance worker exiting");
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Records every mark; fails the first `fail_first` calls.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub marks: Mutex<Vec<(String, Role, DateTime<Utc>)>>,
        pub fail_first: AtomicUsize,
    }

    impl AttendanceSink for RecordingSink {
        fn mark_present(&self, identity_id: &str, role: Role, at: DateTime<Utc>) -> Result<(), PersistenceError> {
            let remaining = self.fail_first.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_first.store(remaining - 1, Ordering::SeqCst);
                return Err(PersistenceError {
                    identity_id: identity_id.to_string(),
                    reason: "database locked".into(),
                });
            }
            self.marks.lock().push((identity_id.to_string(), role, at));
            Ok(())
        }
    }

    impl RecordingSink {
        pub fn count(&self) -> usize {
            self.marks.lock().len()
        }
    }

    pub(crate) fn event(id: &str, at: DateTime<Utc>) -> DetectionEvent {
        DetectionEvent {
            identity_id: id.into(),
            name: format!("name-{id}"),
            role: Role::Student,
            timestamp: at,
        }
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    #[test]
    fn test_first_detection_marks_once() {
        let sink = RecordingSink::default();
        let mut dedup = AttendanceDeduplicator::new(DEFAULT_COOLDOWN);
        let t0 = Utc::now();
        assert_eq!(dedup.handle_batch(&[event("S1", t0)], &sink, t0), 1);
        assert_eq!(sink.count(), 1);
        assert_eq!(sink.marks.lock()[0].0, "S1");
    }

    #[test]
    fn test_repeats_inside_window_suppressed() {
        let sink = RecordingSink::default();
        let mut dedup = AttendanceDeduplicator::new(DEFAULT_COOLDOWN);
        let t0 = Utc::now();
        dedup.handle_batch(&[event("S1", t0)], &sink, t0);
        for s in [1, 10, 29] {
            let t = t0 + secs(s);
            assert_eq!(dedup.handle_batch(&[event("S1", t)], &sink, t), 0);
        }
        assert_eq!(sink.count(), 1);

        let t = t0 + secs(30);
        assert_eq!(dedup.handle_batch(&[event("S1", t)], &sink, t), 1);
        assert_eq!(sink.count(), 2);
    }

    #[test]
    fn test_same_identity_twice_in_one_batch() {
        let sink = RecordingSink::default();
        let mut dedup = AttendanceDeduplicator::new(DEFAULT_COOLDOWN);
        let t0 = Utc::now();
        let marked = dedup.handle_batch(&[event("S1", t0), event("S2", t0), event("S1", t0)], &sink, t0);
        assert_eq!(marked, 2);
    }

    #[test]
    fn test_failure_does_not_start_cooldown() {
        let sink = RecordingSink::default();
        sink.fail_first.store(1, Ordering::SeqCst);
        let mut dedup = AttendanceDeduplicator::new(DEFAULT_COOLDOWN);
        let t0 = Utc::now();

        assert_eq!(dedup.handle_batch(&[event("S1", t0), event("S2", t0)], &sink, t0), 1);
        assert_eq!(sink.marks.lock()[0].0, "S2");

        let t1 = t0 + secs(1);
        assert_eq!(dedup.handle_batch(&[event("S1", t1)], &sink, t1), 1);
        assert_eq!(sink.count(), 2);
    }

    #[test]
    fn test_worker_stops_on_cancel() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let sink = Arc::new(RecordingSink::default());
        let cancel = CancelToken::new();

        let worker = {
            let sink = Arc::clone(&sink);
            let cancel = cancel.clone();
            std::thread::spawn(move || run_worker(rx, sink.as_ref(), DEFAULT_COOLDOWN, &cancel))
        };

        tx.send(vec![event("S1", Utc::now())]).unwrap();
        tx.send(vec![event("S1", Utc::now())]).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while sink.count() == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }

        cancel.cancel();
        worker.join().unwrap();
        assert_eq!(sink.count(), 1);
    }
}
