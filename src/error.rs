//! Error types for the voice subsystem.

/// Top-level error type for the voice turn controller.
#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    /// Audio device or stream error.
    #[error("audio error: {0}")]
    Audio(String),

    /// Wake-word pipeline error (stage model load or inference).
    #[error("wake error: {0}")]
    Wake(String),

    /// Speech recognizer error.
    #[error("recognizer error: {0}")]
    Recognizer(String),

    /// Speech synthesis error.
    #[error("synthesis error: {0}")]
    Synthesis(String),

    /// Playback session error.
    #[error("playback error: {0}")]
    Playback(String),

    /// Agent gateway transport error.
    #[error("gateway error: {0}")]
    Gateway(String),

    /// Gateway payload did not match the expected shape.
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// A required engine, model, or device is not available.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// A credential or config value the operation needs is absent.
    #[error("configuration missing: {0}")]
    ConfigurationMissing(String),

    /// A bounded wait elapsed without a result.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// HTTP transport error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),
}

impl VoiceError {
    /// Network or stream failures that justify a transport fallback or a
    /// single bounded retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Http(_) | Self::Io(_) | Self::Channel(_))
    }

    /// Bounded waits that elapsed; handled by graceful state transitions,
    /// never by retry storms.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, VoiceError>;
