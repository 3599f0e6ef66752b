//! Guided enrollment sessions keyed by opaque tokens.

use chrono::Utc;
use parking_lot::Mutex;
use rollcall_core::sampler::{AcceptOutcome, Capture, CapturedSample, SamplerError};
use rollcall_core::{
    CaptureSampler, Embedding, EngineError, Frame, Identity, RecognitionEngine, Role, Sample, SamplerConfig,
    StoreError,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

pub const DEFAULT_SESSION_EXPIRY: Duration = Duration::from_secs(600);

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("unknown or expired enrollment session {0}")]
    UnknownSession(Uuid),
    #[error("invalid enrollment request: {0}")]
    Validation(String),
    #[error(transparent)]
    Sampler(#[from] SamplerError),
    #[error("no face could be encoded from the captured samples")]
    NoEmbeddings,
    #[error("saving identity failed: {0}")]
    Store(#[from] StoreError),
    #[error("identity saved but gallery reload failed: {0}")]
    Reload(#[from] EngineError),
}

/// Person being enrolled.
#[derive(Debug, Clone, PartialEq)]
pub struct Enrollee {
    pub id: String,
    pub name: String,
    pub role: Role,
}

impl Enrollee {
    /// Normalize and validate: id trimmed and upper-cased, name trimmed,
    /// both required.
    pub fn new(id: &str, name: &str, role: Role) -> Result<Self, EnrollError> {
        let id = id.trim().to_uppercase();
        let name = name.trim().to_string();
        if id.is_empty() {
            return Err(EnrollError::Validation("id is required".into()));
        }
        if name.is_empty() {
            return Err(EnrollError::Validation("name is required".into()));
        }
        Ok(Self { id, name, role })
    }
}

struct EnrollmentSession {
    enrollee: Enrollee,
    sampler: CaptureSampler,
    last_active: Instant,
}

/// Concurrent map of in-progress enrollments.
pub struct EnrollmentRegistry {
    engine: Arc<RecognitionEngine>,
    defaults: SamplerConfig,
    expiry: Duration,
    sessions: Mutex<HashMap<Uuid, Arc<Mutex<EnrollmentSession>>>>,
}

impl EnrollmentRegistry {
    pub fn new(engine: Arc<RecognitionEngine>, defaults: SamplerConfig, expiry: Duration) -> Self {
        Self {
            engine,
            defaults,
            expiry,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Open a capture session. `None` parameters take the configured defaults.
    pub fn create_sampler(
        &self,
        enrollee: Enrollee,
        target_count: Option<usize>,
        angle_threshold: Option<f32>,
    ) -> Result<Uuid, EnrollError> {
        let config = SamplerConfig {
            target_count: target_count.unwrap_or(self.defaults.target_count),
            angle_threshold: angle_threshold.unwrap_or(self.defaults.angle_threshold),
            crop_margin: self.defaults.crop_margin,
        };
        if config.target_count == 0 {
            return Err(EnrollError::Validation("target count must be at least 1".into()));
        }
        if !config.angle_threshold.is_finite() || config.angle_threshold < 0.0 {
            return Err(EnrollError::Validation("angle threshold must be a non-negative number".into()));
        }

        self.sweep_expired();
        let token = Uuid::new_v4();
        tracing::info!(%token, id = %enrollee.id, target = config.target_count, "enrollment session opened");
        let session = EnrollmentSession {
            enrollee,
            sampler: CaptureSampler::new(config),
            last_active: Instant::now(),
        };
        self.sessions.lock().insert(token, Arc::new(Mutex::new(session)));
        Ok(token)
    }

    /// Offer one sample to the session's sampler.
    pub fn accept(&self, token: Uuid, sample: Sample) -> Result<AcceptOutcome, EnrollError> {
        let session = self.session(token)?;
        let mut session = session.lock();
        session.last_active = Instant::now();

        let outcome = {
            let mut analyzer = self.engine.analyzer().lock();
            session.sampler.accept(sample, &mut **analyzer)
        };
        tracing::debug!(%token, accepted = outcome.accepted, message = %outcome.message, "enrollment sample");
        Ok(outcome)
    }

    /// The accepted set, once complete.
    pub fn finalize(&self, token: Uuid) -> Result<Vec<CapturedSample>, EnrollError> {
        let session = self.session(token)?;
        let mut session = session.lock();
        session.last_active = Instant::now();
        Ok(session.sampler.finalize()?)
    }

    /// Finalize, encode, persist and reload the gallery. The session is
    /// removed once the identity is saved.
    pub fn complete(&self, token: Uuid) -> Result<Identity, EnrollError> {
        let session = self.session(token)?;
        let (enrollee, samples) = {
            let mut session = session.lock();
            session.last_active = Instant::now();
            (session.enrollee.clone(), session.sampler.finalize()?)
        };

        let embeddings = self.encode_samples(&samples);
        if embeddings.is_empty() {
            return Err(EnrollError::NoEmbeddings);
        }

        let identity = Identity {
            id: enrollee.id,
            name: enrollee.name,
            role: enrollee.role,
            embeddings,
            created_at: Utc::now(),
        };
        self.engine.store().persist(&identity)?;
        self.sessions.lock().remove(&token);
        tracing::info!(
            id = %identity.id,
            vectors = identity.embeddings.len(),
            samples = samples.len(),
            "enrollment complete"
        );

        self.engine.reload()?;
        Ok(identity)
    }

    /// Drop a session. Returns `false` if it did not exist.
    pub fn cancel(&self, token: Uuid) -> bool {
        let removed = self.sessions.lock().remove(&token).is_some();
        if removed {
            tracing::info!(%token, "enrollment session cancelled");
        }
        removed
    }

    /// Remove sessions idle for longer than the expiry. Returns how many.
    pub fn sweep_expired(&self) -> usize {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, s| {
            // A session locked by a request is in use.
            s.try_lock().map_or(true, |s| s.last_active.elapsed() < self.expiry)
        });
        let swept = before - sessions.len();
        if swept > 0 {
            tracing::info!(swept, "expired enrollment sessions removed");
        }
        swept
    }

    pub fn active(&self) -> usize {
        self.sessions.lock().len()
    }

    fn session(&self, token: Uuid) -> Result<Arc<Mutex<EnrollmentSession>>, EnrollError> {
        // The map guard is dropped before the session lock is taken.
        let session = self
            .sessions
            .lock()
            .get(&token)
            .cloned()
            .ok_or(EnrollError::UnknownSession(token))?;
        let expired = session.lock().last_active.elapsed() >= self.expiry;
        if expired {
            let mut sessions = self.sessions.lock();
            if sessions.get(&token).is_some_and(|current| Arc::ptr_eq(current, &session)) {
                sessions.remove(&token);
            }
            tracing::info!(%token, "enrollment session expired");
            return Err(EnrollError::UnknownSession(token));
        }
        Ok(session)
    }

    /// Descriptor samples are used as-is; face crops go through the analyzer.
    fn encode_samples(&self, samples: &[CapturedSample]) -> Vec<Embedding> {
        let mut analyzer = self.engine.analyzer().lock();
        samples
            .iter()
            .filter_map(|sample| match &sample.capture {
                Capture::Embedding(embedding) => Some(embedding.clone()),
                Capture::Face(crop) => {
                    let frame = Frame::new(crop.clone(), 0);
                    let face = analyzer.detect(&frame).into_iter().next();
                    let embedding = face.and_then(|face| analyzer.encode(&frame, &face));
                    if embedding.is_none() {
                        tracing::debug!(yaw = sample.pose.yaw, "no encodable face in crop; skipping");
                    }
                    embedding
                }
            })
            .collect()
    }
}

/// Delete an enrolled identity and reload the gallery. Returns `false` if
/// no such identity was stored.
pub fn remove_identity(engine: &RecognitionEngine, id: &str) -> Result<bool, EnrollError> {
    let id = id.trim().to_uppercase();
    let removed = engine.store().delete(&id)?;
    if removed {
        engine.reload()?;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::testing::{scene_frame, FakeFace, ScriptedAnalyzer};
    use rollcall_core::{analyzer, Annotator, IdentityStore, Pose, RecognitionConfig};

    #[derive(Default)]
    struct MemoryStore {
        saved: Mutex<Vec<Identity>>,
    }

    impl IdentityStore for MemoryStore {
        fn load_all(&self) -> Result<Vec<Identity>, StoreError> {
            Ok(self.saved.lock().clone())
        }
        fn persist(&self, identity: &Identity) -> Result<(), StoreError> {
            self.saved.lock().push(identity.clone());
            Ok(())
        }
        fn delete(&self, id: &str) -> Result<bool, StoreError> {
            let mut saved = self.saved.lock();
            let before = saved.len();
            saved.retain(|i| i.id != id);
            Ok(saved.len() != before)
        }
    }

    /// Scene `key` shows one face turned by `yaw` degrees.
    fn turned_face(yaw: f32) -> FakeFace {
        // eyes 0.2 apart; yaw = 2 * atan(dx / span)
        let dx = 0.2 * (yaw.to_radians() / 2.0).tan();
        FakeFace::at(0.3, 0.3, 0.4, 0.4)
            .with_landmarks([(0.4, 0.45), (0.6, 0.45), (0.5, 0.45), (0.5 + dx, 0.55)])
            .with_embedding(vec![yaw / 100.0, 1.0])
    }

    fn registry(analyzer: ScriptedAnalyzer) -> (EnrollmentRegistry, Arc<MemoryStore>, Arc<RecognitionEngine>) {
        let store = Arc::new(MemoryStore::default());
        let engine = Arc::new(RecognitionEngine::new(
            RecognitionConfig::default(),
            Arc::clone(&store) as Arc<dyn IdentityStore>,
            analyzer::shared(analyzer),
            Annotator::new(),
        ));
        let registry = EnrollmentRegistry::new(Arc::clone(&engine), SamplerConfig::default(), DEFAULT_SESSION_EXPIRY);
        (registry, store, engine)
    }

    fn sweep_analyzer() -> ScriptedAnalyzer {
        (0..6u8).fold(ScriptedAnalyzer::new(), |a, i| a.scene(i + 1, vec![turned_face(i as f32 * 20.0)]))
    }

    fn ada() -> Enrollee {
        Enrollee::new("  s001 ", " Ada ", Role::Student).unwrap()
    }

    #[test]
    fn test_enrollee_normalized_and_validated() {
        let e = ada();
        assert_eq!(e.id, "S001");
        assert_eq!(e.name, "Ada");
        assert!(matches!(Enrollee::new(" ", "Ada", Role::Staff), Err(EnrollError::Validation(_))));
        assert!(matches!(Enrollee::new("T1", "", Role::Staff), Err(EnrollError::Validation(_))));
    }

    #[test]
    fn test_guided_capture_to_saved_identity() {
        let (registry, store, engine) = registry(sweep_analyzer());
        let token = registry.create_sampler(ada(), None, None).unwrap();

        for key in 1..=5u8 {
            let outcome = registry.accept(token, Sample::Frame(scene_frame(key, 200, 200))).unwrap();
            assert!(outcome.accepted, "yaw step {key}: {}", outcome.message);
        }
        let extra = registry.accept(token, Sample::Frame(scene_frame(6, 200, 200))).unwrap();
        assert!(!extra.accepted);

        assert_eq!(registry.finalize(token).unwrap().len(), 5);
        let identity = registry.complete(token).unwrap();
        assert_eq!(identity.id, "S001");
        assert_eq!(identity.embeddings.len(), 5);
        assert_eq!(store.saved.lock().len(), 1);
        assert_eq!(engine.known_identities(), 1);
        assert_eq!(registry.active(), 0);
        assert!(matches!(registry.finalize(token), Err(EnrollError::UnknownSession(_))));
    }

    #[test]
    fn test_similar_pose_rejected_with_guidance() {
        let (registry, _, _) = registry(sweep_analyzer());
        let token = registry.create_sampler(ada(), Some(3), None).unwrap();
        assert!(registry.accept(token, Sample::Frame(scene_frame(1, 200, 200))).unwrap().accepted);
        let again = registry.accept(token, Sample::Frame(scene_frame(1, 200, 200))).unwrap();
        assert!(!again.accepted);
        assert!(again.message.contains("1/3"), "{}", again.message);
    }

    #[test]
    fn test_complete_before_target_is_incomplete() {
        let (registry, store, _) = registry(sweep_analyzer());
        let token = registry.create_sampler(ada(), None, None).unwrap();
        registry.accept(token, Sample::Frame(scene_frame(1, 200, 200))).unwrap();
        assert!(matches!(
            registry.complete(token),
            Err(EnrollError::Sampler(SamplerError::CaptureIncomplete { captured: 1, target: 5 }))
        ));
        assert!(store.saved.lock().is_empty());
        assert_eq!(registry.active(), 1);
    }

    #[test]
    fn test_descriptor_samples_used_as_is() {
        let (registry, store, _) = registry(ScriptedAnalyzer::new());
        let token = registry.create_sampler(ada(), Some(2), None).unwrap();
        for yaw in [0.0, 30.0] {
            let sample = Sample::Descriptor {
                pose: Pose::new(yaw, 0.0, 0.0),
                embedding: Embedding::new(vec![yaw, 1.0]),
            };
            assert!(registry.accept(token, sample).unwrap().accepted);
        }
        let identity = registry.complete(token).unwrap();
        assert_eq!(identity.embeddings[1].values, vec![30.0, 1.0]);
        assert_eq!(store.saved.lock()[0].embeddings.len(), 2);
    }

    #[test]
    fn test_crops_without_faces_yield_no_embeddings() {
        // Faces detected on the frame but nothing encodable.
        let analyzer = ScriptedAnalyzer::new().scene(1, vec![FakeFace::at(0.3, 0.3, 0.4, 0.4)]);
        let (registry, _, _) = registry(analyzer);
        let token = registry.create_sampler(ada(), Some(1), None).unwrap();
        assert!(registry.accept(token, Sample::Frame(scene_frame(1, 200, 200))).unwrap().accepted);
        assert!(matches!(registry.complete(token), Err(EnrollError::NoEmbeddings)));
    }

    #[test]
    fn test_cancel_and_unknown_token() {
        let (registry, _, _) = registry(sweep_analyzer());
        let token = registry.create_sampler(ada(), None, None).unwrap();
        assert!(registry.cancel(token));
        assert!(!registry.cancel(token));
        assert!(matches!(
            registry.accept(token, Sample::Frame(scene_frame(1, 200, 200))),
            Err(EnrollError::UnknownSession(_))
        ));
    }

    #[test]
    fn test_idle_sessions_expire() {
        let (registry, _, engine) = registry(sweep_analyzer());
        let registry = EnrollmentRegistry::new(engine, SamplerConfig::default(), Duration::from_millis(20));
        let token = registry.create_sampler(ada(), None, None).unwrap();
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(registry.sweep_expired(), 1);
        assert!(matches!(registry.finalize(token), Err(EnrollError::UnknownSession(_))));
    }

    #[test]
    fn test_busy_session_does_not_block_others() {
        let (registry, _, _) = registry(sweep_analyzer());
        let busy = registry.create_sampler(ada(), None, None).unwrap();
        let bo = Enrollee::new("s002", "Bo", Role::Student).unwrap();
        let other = registry.create_sampler(bo.clone(), None, None).unwrap();
        let held = registry.sessions.lock().get(&busy).cloned().unwrap();

        std::thread::scope(|s| {
            let guard = held.lock();
            let waiting = s.spawn(|| registry.finalize(busy).is_err());
            std::thread::sleep(Duration::from_millis(50));

            let (tx, rx) = crossbeam_channel::bounded(1);
            let registry = &registry;
            s.spawn(move || {
                let created = registry.create_sampler(bo, Some(1), None).is_ok();
                let _ = tx.send(created && registry.cancel(other));
            });
            let done = rx.recv_timeout(Duration::from_secs(1));
            drop(guard);
            assert_eq!(done, Ok(true), "other sessions stalled behind a busy one");
            assert!(waiting.join().unwrap());
        });
    }

    #[test]
    fn test_rejects_bad_parameters() {
        let (registry, _, _) = registry(sweep_analyzer());
        assert!(matches!(registry.create_sampler(ada(), Some(0), None), Err(EnrollError::Validation(_))));
        assert!(matches!(registry.create_sampler(ada(), None, Some(-1.0)), Err(EnrollError::Validation(_))));
    }

    #[test]
    fn test_remove_identity_reloads_gallery() {
        let (registry, _, engine) = registry(ScriptedAnalyzer::new());
        let token = registry.create_sampler(ada(), Some(1), None).unwrap();
        let sample = Sample::Descriptor {
            pose: Pose::default(),
            embedding: Embedding::new(vec![1.0]),
        };
        registry.accept(token, sample).unwrap();
        registry.complete(token).unwrap();
        assert_eq!(engine.known_identities(), 1);

        assert!(remove_identity(&engine, " s001").unwrap());
        assert_eq!(engine.known_identities(), 0);
        assert!(!remove_identity(&engine, "S001").unwrap());
    }
}
