//! Capability contracts for the engines the controller mediates between.
//!
//! Recognition and capture are host-provided: the controller depends on
//! these traits and never on a concrete engine. Sessions are channel
//! handles; dropping a handle releases the underlying device.

use crate::error::Result;
use crate::messages::{AudioFrame, TranscriptEvent};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

/// Microphone focus requested for a recognizer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFocus {
    /// The session owns the microphone (post-trigger command capture).
    Exclusive,
    /// The session shares the audio path with other activity, such as
    /// assistant playback (talk-mode listening).
    Background,
}

/// Continuous fixed-size frame capture for the wake pipeline.
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Open the capture stream. Frames arrive on the returned handle at a
    /// fixed size and sample rate until the handle is dropped.
    ///
    /// Denied microphone access surfaces as
    /// [`crate::error::VoiceError::Unavailable`].
    async fn open(&self) -> Result<FrameStream>;
}

/// A live capture stream. Dropping it stops capture and releases the
/// microphone.
pub struct FrameStream {
    frames: mpsc::Receiver<AudioFrame>,
    _stop: DropGuard,
}

impl FrameStream {
    /// Bind a receiver to the cancellation token its producer watches.
    pub fn new(frames: mpsc::Receiver<AudioFrame>, stop: CancellationToken) -> Self {
        Self {
            frames,
            _stop: stop.drop_guard(),
        }
    }

    /// Next captured frame; `None` once the producer has shut down.
    pub async fn recv(&mut self) -> Option<AudioFrame> {
        self.frames.recv().await
    }
}

/// Streaming speech recognition.
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Start a transcription session with the requested focus.
    async fn start(&self, focus: AudioFocus) -> Result<TranscriptSession>;
}

/// A live recognizer session.
///
/// The recognizer re-emits the whole utterance on every update and sends
/// exactly one terminal event (`Update` with `is_final`, `Ended`, or
/// `Failed`) before closing the channel.
pub struct TranscriptSession {
    events: mpsc::Receiver<TranscriptEvent>,
    stop: CancellationToken,
}

impl TranscriptSession {
    /// Create a session plus the sender and cancellation token the
    /// recognizer drives. The recognizer stops producing when the token
    /// fires.
    pub fn channel(
        capacity: usize,
    ) -> (Self, mpsc::Sender<TranscriptEvent>, CancellationToken) {
        let (tx, rx) = mpsc::channel(capacity);
        let stop = CancellationToken::new();
        (
            Self {
                events: rx,
                stop: stop.clone(),
            },
            tx,
            stop,
        )
    }

    /// Next session event; `None` once the recognizer drops its sender.
    pub async fn recv(&mut self) -> Option<TranscriptEvent> {
        self.events.recv().await
    }

    /// Ask the recognizer to stop. Idempotent.
    pub fn stop(&self) {
        self.stop.cancel();
    }
}

impl Drop for TranscriptSession {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
