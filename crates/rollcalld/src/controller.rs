//! Capture lifecycle: device, capture thread, attendance worker and queues.

use crate::attendance::{self, AttendanceSink};
use crate::device::{DeviceLease, DeviceSlot};
use crate::state::{Phase, Session, Status, StreamState};
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use rollcall_core::{DetectionEvent, EngineError, RecognitionEngine};
use rollcall_hw::{CameraError, VideoSource};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_FRAME_QUEUE_CAPACITY: usize = 2;
pub const DEFAULT_JPEG_QUALITY: u8 = 80;
const TRANSIENT_BACKOFF: Duration = Duration::from_millis(10);
const STREAM_POLL: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("capture already running")]
    AlreadyRunning,
    #[error("capture not running")]
    NotRunning,
    #[error("cannot open capture device: {0}")]
    DeviceOpen(#[from] CameraError),
    #[error("cannot spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Reload(#[from] EngineError),
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub join_timeout: Duration,
    pub cooldown: Duration,
    pub frame_queue_capacity: usize,
    pub jpeg_quality: u8,
    pub transient_backoff: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            cooldown: attendance::DEFAULT_COOLDOWN,
            frame_queue_capacity: DEFAULT_FRAME_QUEUE_CAPACITY,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            transient_backoff: TRANSIENT_BACKOFF,
        }
    }
}

/// JPEG-encoded annotated frame for streaming.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
    pub jpeg: Vec<u8>,
    pub faces: usize,
}

struct Workers {
    session: u64,
    capture: JoinHandle<()>,
    attendance: JoinHandle<()>,
}

/// Owns the monitoring session.
pub struct CaptureController {
    config: ControllerConfig,
    source: Arc<dyn VideoSource>,
    engine: Arc<RecognitionEngine>,
    sink: Arc<dyn AttendanceSink>,
    state: Arc<StreamState>,
    slot: DeviceSlot,
    frames_tx: Sender<EncodedFrame>,
    frames_rx: Receiver<EncodedFrame>,
    events_tx: Sender<Vec<DetectionEvent>>,
    events_rx: Receiver<Vec<DetectionEvent>>,
    dropped: Arc<AtomicU64>,
    workers: Mutex<Option<Workers>>,
}

impl CaptureController {
    pub fn new(
        config: ControllerConfig,
        source: Arc<dyn VideoSource>,
        engine: Arc<RecognitionEngine>,
        sink: Arc<dyn AttendanceSink>,
    ) -> Self {
        let (frames_tx, frames_rx) = crossbeam_channel::bounded(config.frame_queue_capacity.max(1));
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        Self {
            config,
            source,
            engine,
            sink,
            state: Arc::new(StreamState::new()),
            slot: DeviceSlot::new(),
            frames_tx,
            frames_rx,
            events_tx,
            events_rx,
            dropped: Arc::new(AtomicU64::new(0)),
            workers: Mutex::new(None),
        }
    }

    pub fn engine(&self) -> &Arc<RecognitionEngine> {
        &self.engine
    }

    /// Open `source` and start capturing. Returns once both threads are spawned.
    pub fn start(&self, source: &str) -> Result<(), ControlError> {
        let session = self.state.begin().ok_or(ControlError::AlreadyRunning)?;
        self.reap_finished();

        let device = match self.source.open(source) {
            Ok(device) => device,
            Err(e) => {
                self.state.end_session(session.id);
                tracing::error!(source, error = %e, "failed to open capture device");
                return Err(ControlError::DeviceOpen(e));
            }
        };
        tracing::info!(source, device = %device.describe(), session = session.id, "capture device opened");

        self.drain_queues();
        self.dropped.store(0, Ordering::Relaxed);
        if let Err(e) = self.engine.reload() {
            tracing::warn!(error = %e, "gallery refresh on start failed");
        }
        self.slot.install(session.id, device);

        match self.spawn_workers(&session) {
            Ok(workers) => {
                *self.workers.lock() = Some(workers);
                Ok(())
            }
            Err(e) => {
                session.cancel.cancel();
                self.slot.release(session.id);
                self.state.end_session(session.id);
                Err(e)
            }
        }
    }

    fn spawn_workers(&self, session: &Session) -> Result<Workers, ControlError> {
        let capture = CaptureLoop {
            session: session.clone(),
            state: Arc::clone(&self.state),
            engine: Arc::clone(&self.engine),
            slot: self.slot.clone(),
            frames: self.frames_tx.clone(),
            events: self.events_tx.clone(),
            dropped: Arc::clone(&self.dropped),
            jpeg_quality: self.config.jpeg_quality,
            backoff: self.config.transient_backoff,
        };
        let capture = std::thread::Builder::new()
            .name("rollcall-capture".into())
            .spawn(move || capture.run())
            .map_err(|source| ControlError::Spawn { name: "capture", source })?;

        let events = self.events_rx.clone();
        let sink = Arc::clone(&self.sink);
        let cancel = session.cancel.clone();
        let cooldown = self.config.cooldown;
        let attendance = std::thread::Builder::new()
            .name("rollcall-attendance".into())
            .spawn(move || attendance::run_worker(events, sink.as_ref(), cooldown, &cancel))
            .map_err(|source| ControlError::Spawn {
                name: "attendance",
                source,
            })?;

        Ok(Workers {
            session: session.id,
            capture,
            attendance,
        })
    }

    /// Stop the session: cancel, join with a timeout, release the device and
    /// drain both queues. A no-op when idle.
    pub fn stop(&self) -> Result<(), ControlError> {
        let Some(session) = self.state.request_stop() else {
            tracing::debug!("stop requested while idle");
            return Ok(());
        };
        tracing::info!(session, "stopping capture");

        let deadline = Instant::now() + self.config.join_timeout;
        let workers = self.workers.lock().take();
        if let Some(workers) = workers {
            join_until(workers.capture, "capture", deadline);
            join_until(workers.attendance, "attendance", deadline);
        }

        self.slot.force_release(session, self.config.join_timeout);
        self.drain_queues();
        self.state.finish_stop(session);
        Ok(())
    }

    pub fn status(&self) -> Status {
        let phase = self.state.phase();
        Status {
            phase,
            running: phase == Phase::Running,
            busy: phase == Phase::Initializing,
            since: self.state.since(),
            known_identities: self.engine.known_identities(),
            frames_dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Live encoded frames for the current session.
    pub fn frames(&self) -> Result<FrameStream, ControlError> {
        let session = self.state.session_id();
        if !self.state.is_live(session) {
            return Err(ControlError::NotRunning);
        }
        Ok(FrameStream {
            rx: self.frames_rx.clone(),
            state: Arc::clone(&self.state),
            session,
        })
    }

    pub fn reload_gallery(&self) -> Result<usize, ControlError> {
        Ok(self.engine.reload()?)
    }

    /// (frames, event batches) currently queued.
    pub fn queue_depths(&self) -> (usize, usize) {
        (self.frames_rx.len(), self.events_rx.len())
    }

    fn drain_queues(&self) {
        let frames = self.frames_rx.try_iter().count();
        let events = self.events_rx.try_iter().count();
        if frames + events > 0 {
            tracing::debug!(frames, events, "discarded queued items");
        }
    }

    /// Join threads of a session that ended on its own.
    fn reap_finished(&self) {
        let workers = self.workers.lock().take();
        if let Some(old) = workers {
            tracing::debug!(session = old.session, "reaping previous session threads");
            let deadline = Instant::now() + self.config.join_timeout;
            join_until(old.capture, "capture", deadline);
            join_until(old.attendance, "attendance", deadline);
        }
    }
}

impl Drop for CaptureController {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!(error = %e, "stop on drop failed");
        }
    }
}

/// Join `handle` if it finishes before `deadline`; otherwise detach it.
fn join_until(handle: JoinHandle<()>, name: &str, deadline: Instant) {
    while !handle.is_finished() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    if handle.is_finished() {
        if handle.join().is_err() {
            tracing::error!(thread = name, "thread panicked");
        }
    } else {
        tracing::warn!(thread = name, "thread did not exit before timeout; detaching");
    }
}

/// State moved onto the capture thread.
struct CaptureLoop {
    session: Session,
    state: Arc<StreamState>,
    engine: Arc<RecognitionEngine>,
    slot: DeviceSlot,
    frames: Sender<EncodedFrame>,
    events: Sender<Vec<DetectionEvent>>,
    dropped: Arc<AtomicU64>,
    jpeg_quality: u8,
    backoff: Duration,
}

impl CaptureLoop {
    fn run(self) {
        let id = self.session.id;
        tracing::info!(session = id, "capture thread started");
        let lease = DeviceLease::new(self.slot.clone(), id);
        let mut first = true;

        while !self.session.cancel.is_cancelled() {
            match lease.read() {
                Ok(frame) => {
                    if first {
                        first = false;
                        self.state.mark_running(id);
                    }
                    self.handle(frame);
                }
                Err(e) if e.is_transient() => {
                    tracing::debug!(error = %e, "transient read failure");
                    std::thread::sleep(self.backoff);
                }
                Err(e) => {
                    if !self.session.cancel.is_cancelled() {
                        tracing::error!(session = id, error = %e, "capture ended");
                    }
                    drop(lease);
                    self.state.end_session(id);
                    tracing::info!(session = id, "capture thread exiting");
                    return;
                }
            }
        }

        drop(lease);
        tracing::info!(session = id, "capture thread exiting");
    }

    fn handle(&self, frame: rollcall_core::Frame) {
        let (annotated, events) = self.engine.process(frame);
        // The queues outlive the session; a cancelled thread must not feed the next one.
        if self.session.cancel.is_cancelled() {
            return;
        }

        if !events.is_empty() {
            // Unbounded; send only fails once every receiver is gone.
            let _ = self.events.send(events);
            tracing::debug!(depth = self.events.len(), "event queue depth");
        }

        let jpeg = match annotated.frame.encode_jpeg(self.jpeg_quality) {
            Ok(jpeg) => jpeg,
            Err(e) => {
                tracing::warn!(error = %e, "frame encode failed");
                return;
            }
        };
        let encoded = EncodedFrame {
            sequence: annotated.frame.sequence,
            captured_at: annotated.frame.captured_at,
            jpeg,
            faces: annotated.overlays.len(),
        };
        match self.frames.try_send(encoded) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

/// Blocking iterator over encoded frames; ends when the session stops.
pub struct FrameStream {
    rx: Receiver<EncodedFrame>,
    state: Arc<StreamState>,
    session: u64,
}

impl Iterator for FrameStream {
    type Item = EncodedFrame;

    fn next(&mut self) -> Option<EncodedFrame> {
        loop {
            if !self.state.is_live(self.session) {
                return None;
            }
            match self.rx.recv_timeout(STREAM_POLL) {
                Ok(frame) => return Some(frame),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }
}
