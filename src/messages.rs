//! Message types passed between the audio path, the orchestrators, and
//! playback.

use serde::{Deserialize, Serialize};
use std::time::Instant;

/// A fixed-length block of raw microphone PCM.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Signed 16-bit samples, mono, at `sample_rate`.
    pub samples: Vec<i16>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Monotonic timestamp of capture.
    pub captured_at: Instant,
}

/// A wake-word detection emitted by the engine.
#[derive(Debug, Clone)]
pub struct Detection {
    /// Name of the classifier that fired.
    pub model: String,
    /// Score the classifier produced, above its threshold.
    pub score: f32,
    /// When the triggering frame was processed.
    pub detected_at: Instant,
}

/// A transcription snapshot from the recognizer.
///
/// Recognizers re-emit the whole utterance on every update; consumers
/// replace their copy wholesale rather than appending.
#[derive(Debug, Clone)]
pub struct Transcript {
    /// Full text of the utterance so far.
    pub text: String,
    /// Whether the recognizer considers the utterance complete.
    pub is_final: bool,
}

/// Events emitted by a recognizer session.
#[derive(Debug, Clone)]
pub enum TranscriptEvent {
    /// An interim or final transcription update.
    Update(Transcript),
    /// The session closed without error before a final result.
    Ended,
    /// The session failed.
    Failed(String),
}

/// Audio encodings a synthesis engine can return.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Compressed MP3 stream, decoded incrementally during playback.
    #[default]
    Mp3,
    /// RIFF/WAV container, decoded incrementally during playback.
    Wav,
    /// Raw 16-bit little-endian PCM, played in fixed-size chunks.
    Pcm,
}

impl OutputFormat {
    /// Wire name used in synthesis requests and gateway config.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Wav => "wav",
            Self::Pcm => "pcm",
        }
    }

    /// Parse a gateway-provided format name. Unknown names map to `None`
    /// so callers fall back to their configured default.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "mp3" => Some(Self::Mp3),
            "wav" => Some(Self::Wav),
            "pcm" => Some(Self::Pcm),
            _ => None,
        }
    }
}

/// An immutable description of one utterance to render.
///
/// Constructed once per playback session; overrides from a voice directive
/// are applied before construction, never after.
#[derive(Debug, Clone)]
pub struct PlaybackRequest {
    /// Text to speak, directive line already stripped.
    pub text: String,
    /// Synthesis voice identifier.
    pub voice: String,
    /// Synthesis model identifier.
    pub model: String,
    /// Encoding to request from the synthesis engine.
    pub format: OutputFormat,
    /// Playback speed multiplier, if overridden.
    pub speed: Option<f32>,
}

/// Lifecycle of a submitted conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    /// Submitted, reply not yet observed.
    Pending,
    /// Reply received and handed to playback.
    Completed,
    /// Submission or reply retrieval failed.
    Failed,
    /// No reply arrived within the await and extended polling windows.
    TimedOut,
}

/// One user-to-agent exchange tracked by talk mode.
#[derive(Debug, Clone)]
pub struct ConversationTurn {
    /// Run identifier returned by the gateway acknowledgement.
    pub run_id: String,
    /// The message that was submitted, annotation prefix included.
    pub user_text: String,
    /// Assistant reply text once observed.
    pub reply_text: Option<String>,
    /// Current lifecycle state.
    pub status: TurnStatus,
    /// Wall-clock submission time, milliseconds since the Unix epoch.
    pub submitted_at_ms: i64,
}

/// Outcome of one wake cycle, handed to the dispatch consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WakeDispatch {
    /// A command was captured after the wake word.
    Command(String),
    /// The capture window elapsed without usable speech.
    NoCommand,
}

/// Terminal result of a playback session.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackOutcome {
    /// The utterance played to the end.
    Completed,
    /// Playback was stopped after the given amount had played.
    Stopped { offset: std::time::Duration },
    /// The session failed on every transport it was allowed to try.
    Failed(String),
}

