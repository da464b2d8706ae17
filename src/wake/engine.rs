//! Streaming wake-word detection engine.
//!
//! Frames flow through normalize → feature extraction → feature ring →
//! embedding → embedding ring → classifiers. Both rings are bounded;
//! the oldest entries are evicted so detection latency cannot grow when
//! a consumer stalls upstream of us.

use crate::config::WakeConfig;
use crate::engines::FrameSource;
use crate::error::Result;
use crate::events::VoiceEvent;
use crate::messages::{AudioFrame, Detection};
use crate::wake::stages::{Embedding, FeatureFrame, WakeModelLoader, WakeStages};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// The frame-processing core, separate from engine lifecycle so it can
/// run inside the ingest task and come back out across stop/start.
pub struct WakePipeline {
    stages: WakeStages,
    feature_ring: VecDeque<FeatureFrame>,
    embedding_ring: VecDeque<Embedding>,
    feature_cap: usize,
    embedding_cap: usize,
    debounce: Duration,
    last_emit: Option<Instant>,
}

impl WakePipeline {
    pub fn new(stages: WakeStages, config: &WakeConfig) -> Self {
        let embed_window = stages.embedding.window();
        let classify_window = stages
            .classifiers
            .iter()
            .map(|c| c.window())
            .max()
            .unwrap_or(0);
        Self {
            stages,
            feature_ring: VecDeque::new(),
            embedding_ring: VecDeque::new(),
            feature_cap: embed_window + config.feature_ring_slack,
            embedding_cap: classify_window + config.embedding_ring_slack,
            debounce: Duration::from_millis(config.debounce_ms),
            last_emit: None,
        }
    }

    /// Number of registered wake phrase classifiers.
    pub fn classifier_count(&self) -> usize {
        self.stages.classifiers.len()
    }

    /// Current (feature, embedding) ring occupancy.
    pub fn buffered(&self) -> (usize, usize) {
        (self.feature_ring.len(), self.embedding_ring.len())
    }

    /// Run one frame through the pipeline.
    ///
    /// A stage failure drops this frame (logged) and leaves the pipeline
    /// ready for the next one. Returns a detection when a classifier
    /// fires outside the debounce interval.
    pub fn process_frame(&mut self, frame: &AudioFrame) -> Option<Detection> {
        let normalized: Vec<f32> = frame
            .samples
            .iter()
            .map(|&s| f32::from(s) / 32768.0)
            .collect();

        let features = match self.stages.features.extract(&normalized) {
            Ok(f) => f,
            Err(e) => {
                warn!("feature extraction failed, dropping frame: {e}");
                return None;
            }
        };
        for f in features {
            self.feature_ring.push_back(f);
            while self.feature_ring.len() > self.feature_cap {
                self.feature_ring.pop_front();
            }
        }

        let embed_window = self.stages.embedding.window();
        if self.feature_ring.len() < embed_window {
            return None;
        }
        let frames = self.feature_ring.make_contiguous();
        let window = &frames[frames.len() - embed_window..];
        let embedding = match self.stages.embedding.embed(window) {
            Ok(e) => e,
            Err(e) => {
                warn!("embedding failed, dropping frame: {e}");
                return None;
            }
        };
        self.embedding_ring.push_back(embedding);
        while self.embedding_ring.len() > self.embedding_cap {
            self.embedding_ring.pop_front();
        }

        let embeddings = self.embedding_ring.make_contiguous();
        let mut winner: Option<(String, f32)> = None;
        for classifier in &mut self.stages.classifiers {
            let window = classifier.window();
            if embeddings.len() < window {
                continue;
            }
            let slice = &embeddings[embeddings.len() - window..];
            let score = match classifier.score(slice) {
                Ok(s) => s,
                Err(e) => {
                    warn!("classifier '{}' failed, dropping frame: {e}", classifier.name());
                    return None;
                }
            };
            if score > classifier.threshold() {
                winner = Some((classifier.name().to_owned(), score));
                break; // first registered classifier above threshold wins
            }
        }

        let (model, score) = winner?;
        let now = Instant::now();
        if let Some(last) = self.last_emit {
            if now.duration_since(last) < self.debounce {
                debug!("wake hit on '{model}' suppressed by debounce");
                return None;
            }
        }
        self.last_emit = Some(now);
        self.embedding_ring.clear();
        info!("wake word detected: '{model}' score={score:.3}");
        Some(Detection {
            model,
            score,
            detected_at: now,
        })
    }
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<WakePipeline>,
}

/// Lifecycle wrapper around [`WakePipeline`]: model loading, frame
/// ingestion, pause/resume, and release.
pub struct WakeWordEngine {
    config: WakeConfig,
    source: Arc<dyn FrameSource>,
    loader: Arc<dyn WakeModelLoader>,
    detections: mpsc::Sender<Detection>,
    events: Option<broadcast::Sender<VoiceEvent>>,
    pipeline: Option<WakePipeline>,
    running: Option<Running>,
}

impl WakeWordEngine {
    pub fn new(
        config: WakeConfig,
        source: Arc<dyn FrameSource>,
        loader: Arc<dyn WakeModelLoader>,
        detections: mpsc::Sender<Detection>,
    ) -> Self {
        Self {
            config,
            source,
            loader,
            detections,
            events: None,
            pipeline: None,
            running: None,
        }
    }

    /// Attach an event broadcaster for host observability.
    pub fn with_events(mut self, tx: broadcast::Sender<VoiceEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Load the stage models. Fails fast when a required stage cannot be
    /// loaded, leaving the engine unusable until the next attempt.
    /// A no-op when models are already loaded.
    pub async fn initialize(&mut self) -> Result<()> {
        if self.pipeline.is_some() || self.running.is_some() {
            return Ok(());
        }
        let stages = self.loader.load().await?;
        info!(
            "wake models loaded: {} classifier(s), embedding window {}",
            stages.classifiers.len(),
            stages.embedding.window()
        );
        self.pipeline = Some(WakePipeline::new(stages, &self.config));
        Ok(())
    }

    /// Begin consuming frames. Returns `false` when the engine cannot
    /// run: models not loaded, no classifier registered, or microphone
    /// access denied. Calling `start` while running is a no-op `true`.
    pub async fn start(&mut self) -> bool {
        if self.running.is_some() {
            return true;
        }
        let Some(pipeline) = self.pipeline.take() else {
            error!("wake engine start refused: stage models not loaded");
            return false;
        };
        if pipeline.classifier_count() == 0 {
            error!("wake engine start refused: no classifier registered");
            self.pipeline = Some(pipeline);
            return false;
        }
        let stream = match self.source.open().await {
            Ok(s) => s,
            Err(e) => {
                error!("wake engine start refused: {e}");
                self.pipeline = Some(pipeline);
                return false;
            }
        };

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_ingest(
            pipeline,
            stream,
            self.detections.clone(),
            self.events.clone(),
            cancel.clone(),
        ));
        self.running = Some(Running { cancel, task });
        true
    }

    /// Halt frame ingestion and release the microphone. Models stay
    /// loaded so a later `start` resumes without reloading. Idempotent.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.cancel.cancel();
        match running.task.await {
            Ok(pipeline) => self.pipeline = Some(pipeline),
            Err(e) => error!("wake ingest task lost: {e}"),
        }
    }

    /// Stop ingestion and free the stage models.
    pub async fn release(&mut self) {
        self.stop().await;
        self.pipeline = None;
    }

    /// Whether the ingest loop is currently consuming frames.
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Whether stage models are loaded (running or paused).
    pub fn is_initialized(&self) -> bool {
        self.pipeline.is_some() || self.running.is_some()
    }
}

/// Frame ingest loop. Owns the pipeline while running and hands it back
/// on exit so models survive a pause.
async fn run_ingest(
    mut pipeline: WakePipeline,
    mut stream: crate::engines::FrameStream,
    detections: mpsc::Sender<Detection>,
    events: Option<broadcast::Sender<VoiceEvent>>,
    cancel: CancellationToken,
) -> WakePipeline {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = stream.recv() => {
                let Some(frame) = frame else {
                    warn!("wake frame source closed");
                    break;
                };
                if let Some(detection) = pipeline.process_frame(&frame) {
                    if let Some(tx) = &events {
                        let _ = tx.send(VoiceEvent::WakeDetected(detection.clone()));
                    }
                    // Never block the audio path on a slow consumer.
                    if detections.try_send(detection).is_err() {
                        warn!("detection dropped: consumer not keeping up");
                    }
                }
            }
        }
    }
    pipeline
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::error::VoiceError;
    use crate::wake::stages::{EmbeddingModel, FeatureModel, WakeClassifier};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// One feature frame per call carrying the mean absolute sample level.
    struct LevelFeature {
        fail_on_call: Option<usize>,
        calls: usize,
    }

    impl FeatureModel for LevelFeature {
        fn feature_dim(&self) -> usize {
            1
        }
        fn extract(&mut self, samples: &[f32]) -> Result<Vec<FeatureFrame>> {
            self.calls += 1;
            if self.fail_on_call == Some(self.calls) {
                return Err(VoiceError::Wake("scripted feature failure".into()));
            }
            let mean = samples.iter().map(|s| s.abs()).sum::<f32>() / samples.len() as f32;
            Ok(vec![vec![mean]])
        }
    }

    /// Mean of the window's level features.
    struct MeanEmbedding;

    impl EmbeddingModel for MeanEmbedding {
        fn window(&self) -> usize {
            3
        }
        fn dim(&self) -> usize {
            1
        }
        fn embed(&mut self, frames: &[FeatureFrame]) -> Result<Embedding> {
            assert_eq!(frames.len(), self.window(), "window contract violated");
            let mean = frames.iter().map(|f| f[0]).sum::<f32>() / frames.len() as f32;
            Ok(vec![mean])
        }
    }

    struct LevelClassifier {
        name: String,
        threshold: f32,
        calls: Arc<AtomicUsize>,
    }

    impl WakeClassifier for LevelClassifier {
        fn name(&self) -> &str {
            &self.name
        }
        fn window(&self) -> usize {
            2
        }
        fn threshold(&self) -> f32 {
            self.threshold
        }
        fn score(&mut self, embeddings: &[Embedding]) -> Result<f32> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(embeddings.iter().map(|e| e[0]).sum::<f32>() / embeddings.len() as f32)
        }
    }

    fn loud_frame() -> AudioFrame {
        AudioFrame {
            samples: vec![16_384; 1280], // ~0.5 normalized
            sample_rate: 16_000,
            captured_at: Instant::now(),
        }
    }

    fn pipeline_with(
        classifiers: Vec<Box<dyn WakeClassifier>>,
        debounce_ms: u64,
    ) -> WakePipeline {
        let stages = WakeStages {
            features: Box::new(LevelFeature {
                fail_on_call: None,
                calls: 0,
            }),
            embedding: Box::new(MeanEmbedding),
            classifiers,
        };
        let config = WakeConfig {
            debounce_ms,
            ..WakeConfig::default()
        };
        WakePipeline::new(stages, &config)
    }

    fn classifier(name: &str, threshold: f32) -> (Box<dyn WakeClassifier>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Box::new(LevelClassifier {
                name: name.to_owned(),
                threshold,
                calls: calls.clone(),
            }),
            calls,
        )
    }

    #[test]
    fn detects_after_windows_fill() {
        let (a, _) = classifier("hey-wisp", 0.4);
        let mut pipeline = pipeline_with(vec![a], 1500);

        // Embedding window 3, classification window 2: first possible
        // detection is on the fourth frame.
        for i in 1..=3 {
            assert!(pipeline.process_frame(&loud_frame()).is_none(), "frame {i}");
        }
        let detection = pipeline.process_frame(&loud_frame()).expect("detection");
        assert_eq!(detection.model, "hey-wisp");
        assert!(detection.score > 0.4);
    }

    #[test]
    fn first_registered_classifier_wins() {
        let (a, a_calls) = classifier("first", 0.4);
        let (b, b_calls) = classifier("second", 0.4);
        let mut pipeline = pipeline_with(vec![a, b], 1500);

        let mut detection = None;
        for _ in 0..6 {
            if let Some(d) = pipeline.process_frame(&loud_frame()) {
                detection = Some(d);
                break;
            }
        }
        let detection = detection.expect("detection");
        assert_eq!(detection.model, "first");
        assert!(a_calls.load(Ordering::SeqCst) > 0);
        // The second classifier is never consulted once the first wins.
        assert_eq!(b_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn emission_clears_embedding_ring() {
        let (a, _) = classifier("hey-wisp", 0.4);
        let mut pipeline = pipeline_with(vec![a], 0);

        for _ in 0..3 {
            assert!(pipeline.process_frame(&loud_frame()).is_none());
        }
        assert!(pipeline.process_frame(&loud_frame()).is_some());
        let (_, embeddings) = pipeline.buffered();
        assert_eq!(embeddings, 0, "embedding ring must clear on emission");

        // Refill takes two frames before the next detection is possible.
        assert!(pipeline.process_frame(&loud_frame()).is_none());
        assert!(pipeline.process_frame(&loud_frame()).is_some());
    }

    #[test]
    fn debounce_suppresses_back_to_back_hits() {
        let (a, _) = classifier("hey-wisp", 0.4);
        let mut pipeline = pipeline_with(vec![a], 60_000);

        let mut detections = 0;
        for _ in 0..20 {
            if pipeline.process_frame(&loud_frame()).is_some() {
                detections += 1;
            }
        }
        assert_eq!(detections, 1, "debounce must suppress repeat hits");
    }

    #[test]
    fn feature_failure_drops_frame_and_recovers() {
        let (a, _) = classifier("hey-wisp", 0.4);
        let stages = WakeStages {
            features: Box::new(LevelFeature {
                fail_on_call: Some(2),
                calls: 0,
            }),
            embedding: Box::new(MeanEmbedding),
            classifiers: vec![a],
        };
        let config = WakeConfig::default();
        let mut pipeline = WakePipeline::new(stages, &config);

        let mut detected = false;
        // One extra frame compensates for the dropped one.
        for _ in 0..5 {
            if pipeline.process_frame(&loud_frame()).is_some() {
                detected = true;
            }
        }
        assert!(detected, "pipeline must keep running after a dropped frame");
    }

    #[test]
    fn rings_stay_bounded() {
        let (a, _) = classifier("never", 2.0); // threshold no level reaches
        let config = WakeConfig::default();
        let feature_cap = 3 + config.feature_ring_slack;
        let embedding_cap = 2 + config.embedding_ring_slack;
        let mut pipeline = pipeline_with(vec![a], 1500);

        for _ in 0..100 {
            pipeline.process_frame(&loud_frame());
            let (features, embeddings) = pipeline.buffered();
            assert!(features <= feature_cap);
            assert!(embeddings <= embedding_cap);
        }
    }
}
