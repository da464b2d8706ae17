//! Agent gateway contract and wire types.
//!
//! The gateway is an external collaborator; this module only pins down
//! the slice of its protocol talk mode depends on: sending a chat turn,
//! reading history, subscribing to run events, and fetching the talk
//! session config. Payload decoding is deliberately lenient — a missing
//! or malformed field is treated as absent and skipped, never raised.

use crate::error::Result;
use crate::messages::OutputFormat;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

/// One chat turn submitted to the agent.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSend {
    /// Conversation scope on the agent side.
    pub session_key: String,
    /// User message, interruption annotation included.
    pub message: String,
    /// Server-side budget for the run in milliseconds.
    pub timeout_ms: u64,
    /// Deduplication key for retried submissions.
    pub idempotency_key: String,
}

/// Acknowledgement of a submitted turn.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatAck {
    /// Identifier of the agent run handling this turn.
    pub run_id: String,
}

/// One content block inside a history message.
///
/// Only `"text"` blocks are meaningful here; anything else is carried
/// opaquely and skipped.
#[derive(Debug, Clone, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
}

/// One message from the conversation history.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    /// Milliseconds since the Unix epoch, when the gateway recorded it.
    #[serde(default)]
    pub timestamp: Option<i64>,
}

impl ChatMessage {
    /// First text block of the message, if any.
    pub fn text(&self) -> Option<&str> {
        self.content
            .iter()
            .find(|b| b.kind == "text")
            .and_then(|b| b.text.as_deref())
    }

    /// Whether this is an assistant reply.
    pub fn is_assistant(&self) -> bool {
        self.role == "assistant"
    }
}

/// Conversation history for one session key.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatHistory {
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

impl ChatHistory {
    /// First assistant message with non-empty text timestamped no earlier
    /// than `since_ms`. Messages with no timestamp cannot be ordered
    /// against the submission and are skipped.
    pub fn first_reply_since(&self, since_ms: i64) -> Option<&ChatMessage> {
        self.messages.iter().find(|m| {
            m.is_assistant()
                && m.timestamp.is_some_and(|t| t >= since_ms)
                && m.text().is_some_and(|t| !t.trim().is_empty())
        })
    }
}

/// An asynchronous run event from the gateway subscription.
///
/// Events arrive for every run on the session; only the terminal
/// `"final"` state of the awaited run matters to talk mode.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEvent {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
}

impl AgentEvent {
    /// Whether this event completes a pending wait for `run_id`.
    pub fn finalizes(&self, run_id: &str) -> bool {
        self.run_id.as_deref() == Some(run_id) && self.state.as_deref() == Some("final")
    }
}

/// Talk session configuration fetched from the gateway.
///
/// Every field is optional; absent values fall back to the local
/// [`crate::config::TalkConfig`]. Legacy wire names are accepted via
/// aliases.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TalkSessionConfig {
    #[serde(default, alias = "voiceId")]
    pub voice: Option<String>,
    #[serde(default, alias = "modelId")]
    pub model: Option<String>,
    #[serde(default, alias = "responseFormat")]
    pub output_format: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub interrupt_on_speech: Option<bool>,
    #[serde(default, alias = "mainKey")]
    pub session_key: Option<String>,
}

impl TalkSessionConfig {
    /// Output format as a typed value. An unrecognized name is logged and
    /// treated as absent.
    pub fn format(&self) -> Option<OutputFormat> {
        let name = self.output_format.as_deref()?;
        let parsed = OutputFormat::parse(name);
        if parsed.is_none() {
            warn!("unknown talk output format '{name}', using default");
        }
        parsed
    }
}

/// Typed access to the agent gateway.
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Fetch the talk session configuration.
    async fn talk_config(&self, include_secrets: bool) -> Result<TalkSessionConfig>;

    /// Submit one chat turn; returns the acknowledgement with the run id.
    async fn send_chat(&self, req: ChatSend) -> Result<ChatAck>;

    /// Fetch the conversation history for a session key.
    async fn history(&self, session_key: &str) -> Result<ChatHistory>;

    /// Subscribe to run events for a session key. The subscription ends
    /// when the receiver is dropped.
    async fn subscribe(&self, session_key: &str) -> Result<mpsc::Receiver<AgentEvent>>;
}
