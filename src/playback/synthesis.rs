//! Speech synthesis seams: the remote HTTP engine and the local
//! fallback voice.

use crate::error::{Result, VoiceError};
use crate::messages::OutputFormat;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// One synthesis call. Immutable once constructed.
#[derive(Debug, Clone, Serialize)]
pub struct SynthesisRequest {
    pub model: String,
    pub input: String,
    pub voice: String,
    pub response_format: OutputFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f32>,
}

/// A synthesized audio byte stream plus its declared encoding.
pub struct AudioStream {
    pub format: OutputFormat,
    pub bytes: BoxStream<'static, Result<Bytes>>,
}

impl std::fmt::Debug for AudioStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioStream")
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

/// Remote speech synthesis.
#[async_trait]
pub trait SpeechSynthesis: Send + Sync {
    /// Whether the engine has what it needs (credential, endpoint) to
    /// accept requests. `false` triggers the local substitution.
    fn is_configured(&self) -> bool;

    /// Synthesize speech, streaming bytes back as they are produced.
    async fn synthesize(&self, req: &SynthesisRequest) -> Result<AudioStream>;
}

/// On-device fallback voice, used when remote synthesis is unusable.
///
/// `speak` renders and plays the text itself and returns when done or
/// when the token fires.
#[async_trait]
pub trait LocalSynthesis: Send + Sync {
    async fn speak(&self, text: &str, stop: CancellationToken) -> Result<()>;
}

/// Remote synthesis over the speech HTTP endpoint.
///
/// POSTs `{model, input, voice, response_format, speed?}` with bearer
/// auth and streams the response body.
pub struct HttpSynthesisClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpSynthesisClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        let api_key = api_key.filter(|k| !k.trim().is_empty());
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/audio/speech", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl SpeechSynthesis for HttpSynthesisClient {
    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    async fn synthesize(&self, req: &SynthesisRequest) -> Result<AudioStream> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| VoiceError::ConfigurationMissing("synthesis API key".into()))?;

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(key)
            .json(req)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VoiceError::Synthesis(format!(
                "speech endpoint returned {status}: {body}"
            )));
        }

        info!(
            "synthesis stream open: model={} voice={} format={}",
            req.model,
            req.voice,
            req.response_format.as_str()
        );
        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(VoiceError::from))
            .boxed();
        Ok(AudioStream {
            format: req.response_format,
            bytes,
        })
    }
}
