//! In-memory fakes for the capability seams, shared by the
//! integration suites.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(dead_code)] // not every suite uses every fake

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use wisp::engines::{AudioFocus, FrameSource, FrameStream, SpeechRecognizer, TranscriptSession};
use wisp::error::{Result, VoiceError};
use wisp::gateway::{AgentClient, AgentEvent, ChatAck, ChatHistory, ChatSend, TalkSessionConfig};
use wisp::messages::{AudioFrame, Transcript, TranscriptEvent};
use wisp::playback::synthesis::{
    AudioStream, LocalSynthesis, SpeechSynthesis, SynthesisRequest,
};
use wisp::playback::{AudioOutput, PcmSink};
use wisp::VoiceEvent;

// ── Audio frames ────────────────────────────────────────────────────

/// Frame source the test pushes frames into. Each `open` replaces the
/// delivery channel; pushes fail once the stream handle is dropped.
pub struct FakeFrameSource {
    slot: Mutex<Option<mpsc::Sender<AudioFrame>>>,
    opens: AtomicUsize,
    deny: AtomicBool,
}

impl FakeFrameSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(None),
            opens: AtomicUsize::new(0),
            deny: AtomicBool::new(false),
        })
    }

    pub fn deny_access(&self) {
        self.deny.store(true, Ordering::SeqCst);
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Push one frame toward the engine. Fails when no stream is open.
    pub fn push(&self, frame: AudioFrame) -> std::result::Result<(), ()> {
        let slot = self.slot.lock().unwrap();
        match slot.as_ref() {
            Some(tx) => tx.try_send(frame).map_err(|_| ()),
            None => Err(()),
        }
    }
}

#[async_trait]
impl FrameSource for FakeFrameSource {
    async fn open(&self) -> Result<FrameStream> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(VoiceError::Unavailable("microphone access denied".into()));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(64);
        *self.slot.lock().unwrap() = Some(tx);
        Ok(FrameStream::new(rx, CancellationToken::new()))
    }
}

/// A frame loud enough to trip the level-based fake classifiers.
pub fn loud_frame() -> AudioFrame {
    AudioFrame {
        samples: vec![16_384; 1280],
        sample_rate: 16_000,
        captured_at: Instant::now(),
    }
}

pub fn quiet_frame() -> AudioFrame {
    AudioFrame {
        samples: vec![0; 1280],
        sample_rate: 16_000,
        captured_at: Instant::now(),
    }
}

// ── Wake stages ─────────────────────────────────────────────────────

mod stages {
    use super::*;
    use wisp::wake::{EmbeddingModel, FeatureModel, WakeClassifier, WakeModelLoader, WakeStages};

    /// One feature per frame: mean absolute level.
    struct LevelFeature;

    impl FeatureModel for LevelFeature {
        fn feature_dim(&self) -> usize {
            1
        }
        fn extract(&mut self, samples: &[f32]) -> Result<Vec<Vec<f32>>> {
            let mean = samples.iter().map(|s| s.abs()).sum::<f32>() / samples.len().max(1) as f32;
            Ok(vec![vec![mean]])
        }
    }

    struct MeanEmbedding;

    impl EmbeddingModel for MeanEmbedding {
        fn window(&self) -> usize {
            2
        }
        fn dim(&self) -> usize {
            1
        }
        fn embed(&mut self, frames: &[Vec<f32>]) -> Result<Vec<f32>> {
            let mean = frames.iter().map(|f| f[0]).sum::<f32>() / frames.len() as f32;
            Ok(vec![mean])
        }
    }

    struct LevelClassifier {
        name: String,
        threshold: f32,
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
        fn score(&mut self, embeddings: &[Vec<f32>]) -> Result<f32> {
            Ok(embeddings.iter().map(|e| e[0]).sum::<f32>() / embeddings.len() as f32)
        }
    }

    /// Loads level-based stages: loud frames detect after a few frames.
    pub struct LevelLoader;

    #[async_trait]
    impl WakeModelLoader for LevelLoader {
        async fn load(&self) -> Result<WakeStages> {
            Ok(WakeStages {
                features: Box::new(LevelFeature),
                embedding: Box::new(MeanEmbedding),
                classifiers: vec![Box::new(LevelClassifier {
                    name: "hey-wisp".into(),
                    threshold: 0.25,
                })],
            })
        }
    }

    /// Loader that always fails, forcing the degraded wake mode.
    pub struct BrokenLoader;

    #[async_trait]
    impl WakeModelLoader for BrokenLoader {
        async fn load(&self) -> Result<WakeStages> {
            Err(VoiceError::Wake("model files missing".into()))
        }
    }
}

pub use stages::{BrokenLoader, LevelLoader};

// ── Speech recognition ──────────────────────────────────────────────

/// Handle for feeding events into one started fake session.
#[derive(Clone)]
pub struct SessionFeed {
    tx: mpsc::Sender<TranscriptEvent>,
    pub focus: AudioFocus,
}

impl SessionFeed {
    pub async fn update(&self, text: &str, is_final: bool) {
        let _ = self
            .tx
            .send(TranscriptEvent::Update(Transcript {
                text: text.to_owned(),
                is_final,
            }))
            .await;
    }

    pub async fn fail(&self, reason: &str) {
        let _ = self
            .tx
            .send(TranscriptEvent::Failed(reason.to_owned()))
            .await;
    }

    pub async fn end(&self) {
        let _ = self.tx.send(TranscriptEvent::Ended).await;
    }
}

type StartHook = Box<dyn Fn(AudioFocus) + Send + Sync>;

/// Recognizer whose sessions are driven by the test.
pub struct FakeRecognizer {
    sessions: Mutex<Vec<SessionFeed>>,
    fail_starts: AtomicUsize,
    on_start: Mutex<Option<StartHook>>,
}

impl FakeRecognizer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(Vec::new()),
            fail_starts: AtomicUsize::new(0),
            on_start: Mutex::new(None),
        })
    }

    /// Make the next `n` session starts fail.
    pub fn fail_next_starts(&self, n: usize) {
        self.fail_starts.store(n, Ordering::SeqCst);
    }

    /// Run a check at every session start (e.g. microphone exclusivity).
    pub fn on_start(&self, hook: impl Fn(AudioFocus) + Send + Sync + 'static) {
        *self.on_start.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn latest(&self) -> SessionFeed {
        self.sessions.lock().unwrap().last().unwrap().clone()
    }

    /// Wait until at least `n` sessions have been started.
    pub async fn wait_sessions(&self, n: usize) -> SessionFeed {
        let deadline = Instant::now() + Duration::from_secs(2);
        while self.session_count() < n {
            assert!(Instant::now() < deadline, "timed out waiting for session {n}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.latest()
    }
}

#[async_trait]
impl SpeechRecognizer for FakeRecognizer {
    async fn start(&self, focus: AudioFocus) -> Result<TranscriptSession> {
        if let Some(hook) = self.on_start.lock().unwrap().as_ref() {
            hook(focus);
        }
        let failing = self
            .fail_starts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(VoiceError::Recognizer("engine offline".into()));
        }
        let (session, tx, _stop) = TranscriptSession::channel(16);
        self.sessions.lock().unwrap().push(SessionFeed { tx, focus });
        Ok(session)
    }
}

// ── Agent gateway ───────────────────────────────────────────────────

#[derive(Default)]
struct AgentState {
    talk_config: TalkSessionConfig,
    sent: Vec<ChatSend>,
    history: ChatHistory,
    history_calls: usize,
    event_tx: Option<mpsc::Sender<AgentEvent>>,
    next_run: usize,
    fail_send: bool,
}

/// Scriptable in-memory agent gateway.
pub struct FakeAgentClient {
    state: Mutex<AgentState>,
}

impl FakeAgentClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(AgentState::default()),
        })
    }

    pub fn set_talk_config(&self, json: &str) {
        self.state.lock().unwrap().talk_config = serde_json::from_str(json).unwrap();
    }

    pub fn fail_sends(&self, fail: bool) {
        self.state.lock().unwrap().fail_send = fail;
    }

    pub fn sent(&self) -> Vec<ChatSend> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn history_calls(&self) -> usize {
        self.state.lock().unwrap().history_calls
    }

    /// Append an assistant text message stamped with the current time.
    pub fn push_assistant_reply(&self, text: &str) {
        let message = serde_json::from_value(serde_json::json!({
            "role": "assistant",
            "content": [{"type": "text", "text": text}],
            "timestamp": chrono::Utc::now().timestamp_millis(),
        }))
        .unwrap();
        self.state.lock().unwrap().history.messages.push(message);
    }

    /// Emit the terminal event for a run over the subscription.
    pub async fn send_final_event(&self, run_id: &str) {
        let tx = self.state.lock().unwrap().event_tx.clone();
        let tx = tx.expect("no active subscription");
        tx.send(AgentEvent {
            run_id: Some(run_id.to_owned()),
            state: Some("final".to_owned()),
        })
        .await
        .unwrap();
    }

    /// Wait until `n` chat sends have been recorded; returns the latest.
    pub async fn wait_sends(&self, n: usize) -> ChatSend {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            {
                let state = self.state.lock().unwrap();
                if state.sent.len() >= n {
                    return state.sent.last().unwrap().clone();
                }
            }
            assert!(Instant::now() < deadline, "timed out waiting for send {n}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl AgentClient for FakeAgentClient {
    async fn talk_config(&self, _include_secrets: bool) -> Result<TalkSessionConfig> {
        Ok(self.state.lock().unwrap().talk_config.clone())
    }

    async fn send_chat(&self, req: ChatSend) -> Result<ChatAck> {
        let mut state = self.state.lock().unwrap();
        if state.fail_send {
            return Err(VoiceError::Gateway("connection refused".into()));
        }
        state.next_run += 1;
        let run_id = format!("run-{}", state.next_run);
        state.sent.push(req);
        Ok(ChatAck { run_id })
    }

    async fn history(&self, _session_key: &str) -> Result<ChatHistory> {
        let mut state = self.state.lock().unwrap();
        state.history_calls += 1;
        Ok(state.history.clone())
    }

    async fn subscribe(&self, _session_key: &str) -> Result<mpsc::Receiver<AgentEvent>> {
        let (tx, rx) = mpsc::channel(16);
        self.state.lock().unwrap().event_tx = Some(tx);
        Ok(rx)
    }
}

// ── Synthesis ───────────────────────────────────────────────────────

pub enum SynthScript {
    /// Serve these byte chunks.
    Bytes(Vec<Bytes>),
    /// Fail the synthesis call.
    Fail(String),
    /// A stream that produces nothing until dropped.
    Hang,
}

/// Synthesis engine serving scripted outcomes in order. Once the script
/// is exhausted, calls serve an empty stream.
pub struct FakeSynthesis {
    configured: bool,
    script: Mutex<VecDeque<SynthScript>>,
    requests: Mutex<Vec<SynthesisRequest>>,
}

impl FakeSynthesis {
    pub fn new(configured: bool) -> Arc<Self> {
        Arc::new(Self {
            configured,
            script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn enqueue(&self, outcome: SynthScript) {
        self.script.lock().unwrap().push_back(outcome);
    }

    pub fn requests(&self) -> Vec<SynthesisRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechSynthesis for FakeSynthesis {
    fn is_configured(&self) -> bool {
        self.configured
    }

    async fn synthesize(&self, req: &SynthesisRequest) -> Result<AudioStream> {
        self.requests.lock().unwrap().push(req.clone());
        let outcome = self.script.lock().unwrap().pop_front();
        let format = req.response_format;
        match outcome {
            Some(SynthScript::Fail(reason)) => Err(VoiceError::Synthesis(reason)),
            Some(SynthScript::Hang) => Ok(AudioStream {
                format,
                bytes: futures_util::stream::pending().boxed(),
            }),
            Some(SynthScript::Bytes(chunks)) => Ok(AudioStream {
                format,
                bytes: futures_util::stream::iter(chunks.into_iter().map(Ok)).boxed(),
            }),
            None => Ok(AudioStream {
                format,
                bytes: futures_util::stream::empty().boxed(),
            }),
        }
    }
}

/// Local voice recording speak calls; honors the stop token.
pub struct FakeLocalVoice {
    pub spoken: Mutex<Vec<String>>,
}

impl FakeLocalVoice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            spoken: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl LocalSynthesis for FakeLocalVoice {
    async fn speak(&self, text: &str, stop: CancellationToken) -> Result<()> {
        self.spoken.lock().unwrap().push(text.to_owned());
        tokio::select! {
            _ = stop.cancelled() => {}
            _ = tokio::time::sleep(Duration::from_millis(10)) => {}
        }
        Ok(())
    }
}

// ── Audio output ────────────────────────────────────────────────────

/// Output device whose sinks record every sample; optionally slow, so
/// tests can stop playback mid-stream.
pub struct FakeOutputDevice {
    samples: Arc<Mutex<Vec<f32>>>,
    write_delay: Duration,
}

impl FakeOutputDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            samples: Arc::new(Mutex::new(Vec::new())),
            write_delay: Duration::ZERO,
        })
    }

    /// A device that takes `delay` per sink write.
    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            samples: Arc::new(Mutex::new(Vec::new())),
            write_delay: delay,
        })
    }

    pub fn sample_count(&self) -> usize {
        self.samples.lock().unwrap().len()
    }
}

impl AudioOutput for FakeOutputDevice {
    fn open(&self, _sample_rate: u32) -> Result<Box<dyn PcmSink>> {
        Ok(Box::new(FakeSink {
            samples: self.samples.clone(),
            write_delay: self.write_delay,
        }))
    }
}

struct FakeSink {
    samples: Arc<Mutex<Vec<f32>>>,
    write_delay: Duration,
}

impl PcmSink for FakeSink {
    fn write(&mut self, samples: &[f32]) -> Result<()> {
        if !self.write_delay.is_zero() {
            std::thread::sleep(self.write_delay);
        }
        self.samples.lock().unwrap().extend_from_slice(samples);
        Ok(())
    }
    fn drain(&mut self) -> Result<()> {
        Ok(())
    }
}

// ── Bytes helpers ───────────────────────────────────────────────────

/// Little-endian 16-bit PCM bytes for the raw transport.
pub fn pcm_bytes(samples: &[i16]) -> Bytes {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    Bytes::from(out)
}

/// A minimal mono 16-bit RIFF/WAV file for the streaming transport.
pub fn wav_bytes(samples: &[i16], sample_rate: u32) -> Bytes {
    let data_len = (samples.len() * 2) as u32;
    let mut out = Vec::with_capacity(44 + samples.len() * 2);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // PCM
    out.extend_from_slice(&1u16.to_le_bytes()); // mono
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&(sample_rate * 2).to_le_bytes()); // byte rate
    out.extend_from_slice(&2u16.to_le_bytes()); // block align
    out.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    Bytes::from(out)
}

/// Route crate logs through the env-filtered subscriber so failures can
/// be rerun with `RUST_LOG=wisp=debug`. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ── Event helpers ───────────────────────────────────────────────────

/// Wait for the first broadcast event matching `pred`.
pub async fn wait_for_event<F>(
    rx: &mut broadcast::Receiver<VoiceEvent>,
    timeout: Duration,
    mut pred: F,
) -> VoiceEvent
where
    F: FnMut(&VoiceEvent) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        assert!(!remaining.is_zero(), "timed out waiting for event");
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Ok(event)) if pred(&event) => return event,
            Ok(Ok(_)) => {}
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => {}
            Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => {
                panic!("event channel closed or timed out");
            }
        }
    }
}
