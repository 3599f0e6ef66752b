//! Frame recognition against the enrolled gallery.

use crate::analyzer::SharedAnalyzer;
use crate::annotate::{AnnotatedFrame, Annotator, Overlay};
use crate::frame::Frame;
use crate::gallery::{Gallery, IdentityStore, StoreError};
use crate::types::{DetectionEvent, Embedding, FaceRegion};
use chrono::Utc;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

pub const DEFAULT_FRAME_SKIP: u32 = 2;
pub const DEFAULT_SCALE: f32 = 0.5;
pub const DEFAULT_TOLERANCE: f32 = 0.42;
pub const DEFAULT_THRESHOLD: f32 = 0.6;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("gallery reload failed, keeping previous gallery: {0}")]
    GalleryReload(#[source] StoreError),
}

#[derive(Debug, Clone)]
pub struct RecognitionConfig {
    /// Frames passed through unprocessed between two recognized frames.
    pub frame_skip: u32,
    /// Downscale factor applied before detection.
    pub scale: f32,
    /// Maximum embedding distance for a stored vector to count as a hit.
    pub tolerance: f32,
    /// Minimum fraction of an identity's vectors that must hit.
    pub threshold: f32,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            frame_skip: DEFAULT_FRAME_SKIP,
            scale: DEFAULT_SCALE,
            tolerance: DEFAULT_TOLERANCE,
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

/// Matches faces in frames against the gallery and annotates them.
///
/// `process` is called from the capture thread while `reload` may run on any
/// other thread; the gallery is swapped whole under the write lock and every
/// frame is matched under a single read guard.
pub struct RecognitionEngine {
    config: RecognitionConfig,
    store: Arc<dyn IdentityStore>,
    analyzer: SharedAnalyzer,
    annotator: Annotator,
    gallery: RwLock<Arc<Gallery>>,
    generation: AtomicU64,
    frame_counter: AtomicU64,
}

impl RecognitionEngine {
    /// Create an engine with an empty gallery. Call [`reload`](Self::reload)
    /// to populate it.
    pub fn new(
        config: RecognitionConfig,
        store: Arc<dyn IdentityStore>,
        analyzer: SharedAnalyzer,
        annotator: Annotator,
    ) -> Self {
        Self {
            config,
            store,
            analyzer,
            annotator,
            gallery: RwLock::new(Arc::new(Gallery::default())),
            generation: AtomicU64::new(0),
            frame_counter: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &RecognitionConfig {
        &self.config
    }

    pub fn analyzer(&self) -> &SharedAnalyzer {
        &self.analyzer
    }

    pub fn store(&self) -> &Arc<dyn IdentityStore> {
        &self.store
    }

    /// Number of identities in the current gallery.
    pub fn known_identities(&self) -> usize {
        self.gallery.read().len()
    }

    /// Number of successful reloads so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Current gallery snapshot.
    pub fn gallery(&self) -> Arc<Gallery> {
        Arc::clone(&self.gallery.read())
    }

    /// Rescan the identity store and swap the gallery in one step.
    ///
    /// The store is read before the lock is taken; on failure the previous
    /// gallery stays in place.
    pub fn reload(&self) -> Result<usize, EngineError> {
        let identities = self.store.load_all().map_err(EngineError::GalleryReload)?;
        let gallery = Arc::new(Gallery::new(identities));
        let count = gallery.len();

        {
            let mut current = self.gallery.write();
            *current = gallery;
            self.generation.fetch_add(1, Ordering::AcqRel);
        }

        tracing::info!(identities = count, generation = self.generation(), "gallery reloaded");
        Ok(count)
    }

    /// Recognize faces in `frame`.
    ///
    /// Only every `frame_skip + 1`-th call does any work; the rest return the
    /// frame untouched with no events.
    pub fn process(&self, frame: Frame) -> (AnnotatedFrame, Vec<DetectionEvent>) {
        let n = self.frame_counter.fetch_add(1, Ordering::Relaxed) + 1;
        if n % (u64::from(self.config.frame_skip) + 1) != 0 {
            return (AnnotatedFrame::passthrough(frame), Vec::new());
        }
        if frame.is_empty() {
            tracing::debug!(sequence = frame.sequence, "skipping empty frame");
            return (AnnotatedFrame::passthrough(frame), Vec::new());
        }

        let small = frame.downscale(self.config.scale);
        let probes = self.extract(&small);
        if probes.is_empty() {
            return (self.annotator.annotate(frame, Vec::new()), Vec::new());
        }

        let sx = frame.width() as f32 / small.width() as f32;
        let sy = frame.height() as f32 / small.height() as f32;
        let now = Utc::now();

        let mut overlays = Vec::with_capacity(probes.len());
        let mut events = Vec::new();
        {
            let gallery = self.gallery.read();
            for (face, probe) in &probes {
                let region = face.rescale(sx, sy);
                let hit = probe
                    .as_ref()
                    .and_then(|p| gallery.first_match(p, self.config.tolerance, self.config.threshold));

                match hit {
                    Some(identity) => {
                        overlays.push(Overlay::known(region, identity.name.clone()));
                        events.push(DetectionEvent {
                            identity_id: identity.id.clone(),
                            name: identity.name.clone(),
                            role: identity.role,
                            timestamp: now,
                        });
                    }
                    None => overlays.push(Overlay::unknown(region)),
                }
            }
        }

        if !events.is_empty() {
            tracing::debug!(
                sequence = frame.sequence,
                faces = probes.len(),
                matched = events.len(),
                "frame recognized"
            );
        }

        (self.annotator.annotate(frame, overlays), events)
    }

    /// Detect and embed every face on the downscaled frame.
    fn extract(&self, small: &Frame) -> Vec<(FaceRegion, Option<Embedding>)> {
        let mut analyzer = self.analyzer.lock();
        let faces = analyzer.detect(small);
        faces
            .into_iter()
            .map(|face| {
                let embedding = analyzer.encode(small, &face);
                (face, embedding)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer;
    use crate::testing::{scene_frame, FakeFace, ScriptedAnalyzer};
    use crate::types::{Identity, Role};
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    /// Store whose contents tests can replace.
    #[derive(Default)]
    struct MemoryStore {
        identities: Mutex<Vec<Identity>>,
        fail: AtomicBool,
    }

    impl MemoryStore {
        fn set(&self, identities: Vec<Identity>) {
            *self.identities.lock() = identities;
        }
    }

    impl IdentityStore for MemoryStore {
        fn load_all(&self) -> Result<Vec<Identity>, StoreError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::Io {
                    path: "/faces".into(),
                    source: std::io::Error::other("disk gone"),
                });
            }
            Ok(self.identities.lock().clone())
        }

        fn persist(&self, identity: &Identity) -> Result<(), StoreError> {
            self.identities.lock().push(identity.clone());
            Ok(())
        }

        fn delete(&self, identity_id: &str) -> Result<bool, StoreError> {
            let mut ids = self.identities.lock();
            let before = ids.len();
            ids.retain(|i| i.id != identity_id);
            Ok(ids.len() != before)
        }
    }

    fn identity(id: &str, name: &str, vector: Vec<f32>) -> Identity {
        Identity {
            id: id.into(),
            name: name.into(),
            role: Role::Student,
            embeddings: vec![Embedding::new(vector)],
            created_at: Utc::now(),
        }
    }

    fn engine(store: Arc<MemoryStore>, analyzer: ScriptedAnalyzer, frame_skip: u32) -> RecognitionEngine {
        RecognitionEngine::new(
            RecognitionConfig {
                frame_skip,
                ..RecognitionConfig::default()
            },
            store,
            analyzer::shared(analyzer),
            Annotator::new(),
        )
    }

    fn two_face_analyzer() -> ScriptedAnalyzer {
        ScriptedAnalyzer::new().scene(
            9,
            vec![
                FakeFace::at(0.1, 0.2, 0.2, 0.3).with_embedding(vec![1.0, 0.0]),
                FakeFace::at(0.6, 0.2, 0.2, 0.3).with_embedding(vec![0.0, 1.0]),
            ],
        )
    }

    #[test]
    fn test_matched_and_unknown_faces() {
        let store = Arc::new(MemoryStore::default());
        store.set(vec![identity("S1", "Ada", vec![1.0, 0.0])]);
        let engine = engine(store, two_face_analyzer(), 0);
        engine.reload().unwrap();

        let (annotated, events) = engine.process(scene_frame(9, 200, 100));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].identity_id, "S1");
        assert_eq!(events[0].name, "Ada");
        assert_eq!(annotated.overlays.len(), 2);
        assert!(annotated.overlays[0].known);
        assert_eq!(annotated.overlays[1].label, "Unknown");
    }

    #[test]
    fn test_regions_rescaled_to_full_frame() {
        let store = Arc::new(MemoryStore::default());
        let engine = engine(store, two_face_analyzer(), 0);
        let (annotated, _) = engine.process(scene_frame(9, 200, 100));
        let r = &annotated.overlays[0].region;
        assert!((r.x - 20.0).abs() < 0.5, "x = {}", r.x);
        assert!((r.y - 20.0).abs() < 0.5, "y = {}", r.y);
        assert!((r.width - 40.0).abs() < 0.5, "w = {}", r.width);
    }

    #[test]
    fn test_frame_skip_processes_every_third_frame() {
        let store = Arc::new(MemoryStore::default());
        store.set(vec![identity("S1", "Ada", vec![1.0, 0.0])]);
        let engine = engine(store, two_face_analyzer(), 2);
        engine.reload().unwrap();

        let processed: Vec<bool> = (0..6)
            .map(|_| {
                let (annotated, events) = engine.process(scene_frame(9, 200, 100));
                assert_eq!(annotated.processed, !events.is_empty());
                annotated.processed
            })
            .collect();
        assert_eq!(processed, vec![false, false, true, false, false, true]);
    }

    #[test]
    fn test_first_qualifying_identity_wins() {
        // Known limitation: scan order decides, not closeness.
        let store = Arc::new(MemoryStore::default());
        store.set(vec![
            identity("S1", "Close enough", vec![1.3, 0.0]),
            identity("S2", "Exact", vec![1.0, 0.0]),
        ]);
        let engine = engine(store, two_face_analyzer(), 0);
        engine.reload().unwrap();
        let (_, events) = engine.process(scene_frame(9, 200, 100));
        assert_eq!(events[0].identity_id, "S1");
    }

    #[test]
    fn test_face_without_embedding_is_unknown() {
        let analyzer = ScriptedAnalyzer::new().scene(5, vec![FakeFace::at(0.1, 0.1, 0.3, 0.3)]);
        let store = Arc::new(MemoryStore::default());
        store.set(vec![identity("S1", "Ada", vec![1.0, 0.0])]);
        let engine = engine(store, analyzer, 0);
        engine.reload().unwrap();
        let (annotated, events) = engine.process(scene_frame(5, 200, 100));
        assert!(events.is_empty());
        assert!(!annotated.overlays[0].known);
    }

    #[test]
    fn test_failed_reload_keeps_previous_gallery() {
        let store = Arc::new(MemoryStore::default());
        store.set(vec![identity("S1", "Ada", vec![1.0, 0.0])]);
        let engine = engine(Arc::clone(&store), two_face_analyzer(), 0);
        engine.reload().unwrap();

        store.fail.store(true, Ordering::SeqCst);
        assert!(matches!(engine.reload(), Err(EngineError::GalleryReload(_))));
        assert_eq!(engine.known_identities(), 1);
        assert_eq!(engine.generation(), 1);
        let (_, events) = engine.process(scene_frame(9, 200, 100));
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_concurrent_reload_never_mixes_generations() {
        // Generation A names both faces "A-*", generation B names them "B-*".
        // A frame matched against a torn gallery would report one of each.
        let gen_a = vec![identity("A1", "A-left", vec![1.0, 0.0]), identity("A2", "A-right", vec![0.0, 1.0])];
        let gen_b = vec![identity("B1", "B-left", vec![1.0, 0.0]), identity("B2", "B-right", vec![0.0, 1.0])];

        let store = Arc::new(MemoryStore::default());
        store.set(gen_a.clone());
        let engine = Arc::new(engine(Arc::clone(&store), two_face_analyzer(), 0));
        engine.reload().unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let reloader = {
            let engine = Arc::clone(&engine);
            let store = Arc::clone(&store);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut flip = false;
                while !stop.load(Ordering::Relaxed) {
                    store.set(if flip { gen_a.clone() } else { gen_b.clone() });
                    engine.reload().unwrap();
                    flip = !flip;
                }
            })
        };

        let matchers: Vec<_> = (0..4)
            .map(|_| {
                let engine = Arc::clone(&engine);
                thread::spawn(move || {
                    for _ in 0..300 {
                        let (_, events) = engine.process(scene_frame(9, 64, 32));
                        assert_eq!(events.len(), 2);
                        let prefix = &events[0].name[..1];
                        assert!(
                            events.iter().all(|e| e.name.starts_with(prefix)),
                            "mixed generations in one frame: {events:?}"
                        );
                    }
                })
            })
            .collect();

        for m in matchers {
            m.join().unwrap();
        }
        stop.store(true, Ordering::Relaxed);
        reloader.join().unwrap();
        assert!(engine.generation() > 1);
    }
}
