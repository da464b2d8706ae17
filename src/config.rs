//! Configuration types for the voice turn controller.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the voice subsystem.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// Wake-word detection pipeline settings.
    pub wake: WakeConfig,
    /// Wake listening cycle (trigger, capture, dispatch) settings.
    pub listen: WakeListenConfig,
    /// Talk mode (full-duplex conversation) settings.
    pub talk: TalkConfig,
    /// Speech playback settings.
    pub playback: PlaybackConfig,
}

/// Wake-word pipeline configuration.
///
/// Window geometry (feature frames per embedding, embeddings per
/// classification) is dictated by the loaded stage models; only
/// timing and buffering behavior is configured here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WakeConfig {
    /// Expected capture sample rate in Hz.
    pub sample_rate: u32,
    /// Samples per input frame handed to the pipeline.
    pub frame_samples: usize,
    /// Minimum gap between two emitted detections in ms.
    ///
    /// A classifier win inside this interval is suppressed outright.
    pub debounce_ms: u64,
    /// Extra feature frames retained beyond one embedding window.
    pub feature_ring_slack: usize,
    /// Extra embeddings retained beyond one classification window.
    pub embedding_ring_slack: usize,
    /// Bounded queue depth between the frame source and the engine.
    ///
    /// When the engine falls behind, the oldest pending frames are
    /// dropped at the source rather than stalling capture.
    pub frame_queue: usize,
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            frame_samples: 1280, // 80ms at 16kHz
            debounce_ms: 1500,
            feature_ring_slack: 8,
            embedding_ring_slack: 4,
            frame_queue: 32,
        }
    }
}

/// Wake listening cycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WakeListenConfig {
    /// Phrases scanned for in degraded (transcription-only) mode.
    ///
    /// Matching is case-insensitive substring containment against each
    /// final transcript.
    pub trigger_phrases: Vec<String>,
    /// How long a post-trigger command capture session may run in ms.
    pub capture_timeout_ms: u64,
    /// Length of each degraded-mode transcription session in ms.
    pub degraded_session_ms: u64,
    /// Pause between degraded-mode session restarts in ms.
    pub degraded_restart_pause_ms: u64,
}

impl Default for WakeListenConfig {
    fn default() -> Self {
        Self {
            trigger_phrases: vec!["hey wisp".to_owned()],
            capture_timeout_ms: 8_000,
            degraded_session_ms: 6_000,
            degraded_restart_pause_ms: 250,
        }
    }
}

/// Talk mode configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TalkConfig {
    /// Session key submitted with every chat message.
    pub session_key: String,
    /// Endpointing poll cadence in ms. The poll only runs while listening.
    pub poll_interval_ms: u64,
    /// Silence window in ms: a non-empty transcript with no update for
    /// this long is finalized into a turn.
    pub silence_window_ms: u64,
    /// Bound on waiting for the agent's terminal run event in ms.
    pub turn_timeout_ms: u64,
    /// Extra history-polling window after the turn timeout in ms.
    pub history_grace_ms: u64,
    /// Minimum interim transcript length (chars) that can interrupt
    /// playback.
    pub min_barge_len: usize,
    /// Whether user speech may interrupt assistant playback at all.
    /// The gateway talk config can override this per session.
    pub interrupt_on_speech: bool,
    /// Default synthesis voice when neither gateway config nor a
    /// directive provides one.
    pub voice: String,
    /// Default synthesis model.
    pub model: String,
    /// Default synthesis output format.
    pub format: crate::messages::OutputFormat,
    /// Default playback speed multiplier (None = engine default).
    pub speed: Option<f32>,
}

impl Default for TalkConfig {
    fn default() -> Self {
        Self {
            session_key: "main".to_owned(),
            poll_interval_ms: 350,
            silence_window_ms: 1200,
            turn_timeout_ms: 60_000,
            history_grace_ms: 20_000,
            min_barge_len: 12,
            interrupt_on_speech: true,
            voice: "alloy".to_owned(),
            model: "tts-1".to_owned(),
            format: crate::messages::OutputFormat::Mp3,
            speed: None,
        }
    }
}

/// Speech playback configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Sample rate of raw PCM synthesis output in Hz.
    pub pcm_sample_rate: u32,
    /// Samples written to the sink per chunk on the raw PCM transport.
    ///
    /// The stop flag is checked between chunks, so this bounds stop
    /// latency on that transport.
    pub pcm_chunk_samples: usize,
    /// Bounded queue depth (in fetched buffers) between the network
    /// fetch and the decoder or sink.
    pub fetch_queue: usize,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            pcm_sample_rate: 24_000,
            pcm_chunk_samples: 4096,
            fetch_queue: 32,
        }
    }
}
