//! Wisp: real-time spoken-dialogue turn controller.
//!
//! Mediates between continuous microphone audio, on-device wake-word
//! detection, a remote conversational agent, and spoken playback of the
//! agent's replies. Three cooperating state machines:
//!
//! - **Wake detection** ([`wake::WakeWordEngine`]): audio frames →
//!   feature extraction → embedding window → per-phrase classifiers →
//!   debounced detection events, all over bounded ring buffers.
//! - **Wake cycle** ([`wake::VoiceWakeOrchestrator`]): detection →
//!   bounded command capture → dispatch, with exclusive-microphone
//!   hand-off and a transcript-scanning degraded mode.
//! - **Talk mode** ([`talk::TalkModeOrchestrator`]): continuous
//!   listening, silence-based endpointing, turn submission to the agent
//!   gateway, reply playback with provider fallback, and barge-in.
//!
//! Recognition, synthesis, and the wake stage models are capability
//! traits injected at construction; the crate ships a synthesis HTTP
//! client, a built-in log-mel feature extractor, and (behind the
//! `device-audio` feature) cpal microphone/speaker backends.

#[cfg(feature = "device-audio")]
pub mod audio;
pub mod config;
pub mod engines;
pub mod error;
pub mod events;
pub mod gateway;
pub mod messages;
pub mod playback;
pub mod talk;
pub mod wake;

pub use config::{PlaybackConfig, TalkConfig, VoiceConfig, WakeConfig, WakeListenConfig};
pub use engines::{AudioFocus, FrameSource, FrameStream, SpeechRecognizer, TranscriptSession};
pub use error::{Result, VoiceError};
pub use events::{TalkState, Transport, VoiceEvent, WakePhase};
pub use gateway::AgentClient;
pub use messages::{
    AudioFrame, ConversationTurn, Detection, OutputFormat, PlaybackOutcome, PlaybackRequest,
    Transcript, TranscriptEvent, TurnStatus, WakeDispatch,
};
pub use playback::synthesis::{HttpSynthesisClient, LocalSynthesis, SpeechSynthesis};
pub use playback::{AudioOutput, PcmSink, SpeechPlaybackEngine};
pub use talk::TalkModeOrchestrator;
pub use wake::{VoiceWakeOrchestrator, WakeWordEngine};
