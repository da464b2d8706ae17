//! Observability events broadcast to hosts.
//!
//! Components take an optional `broadcast::Sender<VoiceEvent>` and publish
//! fire-and-forget: lagging receivers lose events rather than applying
//! backpressure to the voice path.

use crate::messages::{Detection, PlaybackOutcome, TurnStatus};

/// Wake listening cycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakePhase {
    /// Not listening.
    Idle,
    /// Wake engine consuming frames.
    WakeListening,
    /// Detection fired; hand-off to command capture in progress.
    Triggered,
    /// Bounded command capture session running.
    CapturingCommand,
}

/// Talk mode state, as published to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TalkState {
    /// Talk mode disabled.
    Off,
    /// Capturing user speech, waiting for an endpoint.
    Listening,
    /// Finalizing the current utterance into a turn.
    Finalizing,
    /// Turn submitted, waiting on the agent reply.
    AwaitingReply,
    /// Speaking the reply; background listening continues.
    Speaking,
}

/// Transport used by the active playback session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Compressed stream fetched and decoded incrementally.
    Stream,
    /// Raw PCM written to the sink in fixed-size chunks.
    RawPcm,
    /// On-device synthesis substituted for the remote engine.
    Local,
}

/// Events published for host UI and telemetry.
#[derive(Debug, Clone)]
pub enum VoiceEvent {
    /// Wake cycle moved to a new phase.
    WakePhase { phase: WakePhase },
    /// The wake engine emitted a detection.
    WakeDetected(Detection),
    /// Wake detection fell back to transcription scanning.
    WakeDegraded { reason: String },
    /// Talk mode moved to a new state.
    TalkState { state: TalkState },
    /// A turn was submitted to the agent.
    TurnSubmitted { run_id: String },
    /// A submitted turn reached a terminal status.
    TurnFinished { run_id: String, status: TurnStatus },
    /// Human-readable status detail (turn failures, directive issues,
    /// fallback substitutions).
    Status { message: String },
    /// Playback session started on the given transport.
    PlaybackStarted { transport: Transport },
    /// Playback session ended.
    PlaybackFinished { outcome: PlaybackOutcome },
}
