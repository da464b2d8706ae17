//! Speech playback engine: single-flight sessions over two transports.
//!
//! Transport (a) streams compressed audio through an incremental decoder;
//! transport (b) writes raw PCM to the sink in fixed-size chunks with a
//! stop check between chunks. A raw-transport failure that was not an
//! explicit stop is retried exactly once via the compressed transport.
//! When remote synthesis is unusable, a local voice is substituted
//! silently and the substitution reported as status.

pub mod decode;
pub mod synthesis;

use crate::config::PlaybackConfig;
use crate::error::{Result, VoiceError};
use crate::events::{Transport, VoiceEvent};
use crate::messages::{OutputFormat, PlaybackOutcome, PlaybackRequest};
use crate::playback::decode::{ChannelRead, decode_stream};
use crate::playback::synthesis::{
    AudioStream, LocalSynthesis, SpeechSynthesis, SynthesisRequest,
};
use bytes::Bytes;
use futures_util::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Audio output device seam.
pub trait AudioOutput: Send + Sync {
    /// Open a mono sink at the given sample rate.
    fn open(&self, sample_rate: u32) -> Result<Box<dyn PcmSink>>;
}

/// A live output sink accepting mono f32 PCM.
///
/// `write` may block while the device drains; both methods run on
/// blocking threads. Dropping the sink releases the device.
pub trait PcmSink: Send {
    fn write(&mut self, samples: &[f32]) -> Result<()>;
    /// Block until everything written has been played out.
    fn drain(&mut self) -> Result<()>;
}

struct ActiveSession {
    stop: CancellationToken,
    played_ms: Arc<AtomicU64>,
    /// Whether the transport tracks a playback offset.
    offset_known: bool,
    task: JoinHandle<()>,
}

/// Manages exactly one playback session at a time.
///
/// Owned by a single orchestration context; `play` always tears down any
/// prior session before starting the next one.
pub struct SpeechPlaybackEngine {
    config: PlaybackConfig,
    synthesis: Arc<dyn SpeechSynthesis>,
    local: Option<Arc<dyn LocalSynthesis>>,
    output: Arc<dyn AudioOutput>,
    events: Option<broadcast::Sender<VoiceEvent>>,
    active: Option<ActiveSession>,
}

impl SpeechPlaybackEngine {
    pub fn new(
        config: PlaybackConfig,
        synthesis: Arc<dyn SpeechSynthesis>,
        output: Arc<dyn AudioOutput>,
    ) -> Self {
        Self {
            config,
            synthesis,
            local: None,
            output,
            events: None,
            active: None,
        }
    }

    /// Attach an on-device fallback voice.
    pub fn with_local(mut self, local: Arc<dyn LocalSynthesis>) -> Self {
        self.local = Some(local);
        self
    }

    /// Attach an event broadcaster for host observability.
    pub fn with_events(mut self, tx: broadcast::Sender<VoiceEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Start speaking. Any prior session is fully stopped first. The
    /// returned channel yields the session's terminal outcome; dropping
    /// it does not cancel playback.
    pub async fn play(&mut self, request: PlaybackRequest) -> oneshot::Receiver<PlaybackOutcome> {
        self.stop().await;

        let (done_tx, done_rx) = oneshot::channel();
        let stop = CancellationToken::new();
        let played_ms = Arc::new(AtomicU64::new(0));
        let remote = self.synthesis.is_configured();

        let session = Session {
            config: self.config.clone(),
            synthesis: self.synthesis.clone(),
            local: self.local.clone(),
            output: self.output.clone(),
            events: self.events.clone(),
            stop: stop.clone(),
            played_ms: played_ms.clone(),
        };
        let task = tokio::spawn(async move {
            let outcome = session.run(request, remote).await;
            session.publish(VoiceEvent::PlaybackFinished {
                outcome: outcome.clone(),
            });
            let _ = done_tx.send(outcome);
        });

        self.active = Some(ActiveSession {
            stop,
            played_ms,
            offset_known: remote,
            task,
        });
        done_rx
    }

    /// Stop the active session, if any, and wait for its teardown.
    /// Returns the played offset when the transport tracked one.
    /// Idempotent and safe with nothing active.
    pub async fn stop(&mut self) -> Option<Duration> {
        let session = self.active.take()?;
        session.stop.cancel();
        if let Err(e) = session.task.await {
            warn!("playback session task lost: {e}");
        }
        session
            .offset_known
            .then(|| Duration::from_millis(session.played_ms.load(Ordering::Relaxed)))
    }

    /// Whether a session is currently active.
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }
}

/// Everything one playback session needs, cloned out of the engine so
/// the engine handle stays free for `stop()`.
struct Session {
    config: PlaybackConfig,
    synthesis: Arc<dyn SpeechSynthesis>,
    local: Option<Arc<dyn LocalSynthesis>>,
    output: Arc<dyn AudioOutput>,
    events: Option<broadcast::Sender<VoiceEvent>>,
    stop: CancellationToken,
    played_ms: Arc<AtomicU64>,
}

impl Session {
    fn publish(&self, event: VoiceEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn outcome_for(&self, result: Result<()>) -> PlaybackOutcome {
        match result {
            _ if self.stop.is_cancelled() => PlaybackOutcome::Stopped {
                offset: Duration::from_millis(self.played_ms.load(Ordering::Relaxed)),
            },
            Ok(()) => PlaybackOutcome::Completed,
            Err(e) => PlaybackOutcome::Failed(e.to_string()),
        }
    }

    async fn run(&self, request: PlaybackRequest, remote: bool) -> PlaybackOutcome {
        if !remote {
            return self.run_local(&request).await;
        }

        let req = SynthesisRequest {
            model: request.model.clone(),
            input: request.text.clone(),
            voice: request.voice.clone(),
            response_format: request.format,
            speed: request.speed,
        };

        match request.format {
            OutputFormat::Pcm => {
                self.publish(VoiceEvent::PlaybackStarted {
                    transport: Transport::RawPcm,
                });
                match self.play_raw(&req).await {
                    Ok(()) => self.outcome_for(Ok(())),
                    Err(_) if self.stop.is_cancelled() => self.outcome_for(Ok(())),
                    Err(e) => {
                        // Exactly one fallback attempt via the compressed
                        // transport, with a fresh synthesis request.
                        warn!("raw PCM playback failed ({e}), retrying via stream");
                        self.publish(VoiceEvent::Status {
                            message: format!("raw playback failed, retrying as stream: {e}"),
                        });
                        self.publish(VoiceEvent::PlaybackStarted {
                            transport: Transport::Stream,
                        });
                        let retry = SynthesisRequest {
                            response_format: OutputFormat::Mp3,
                            ..req
                        };
                        self.outcome_for(self.play_stream(&retry).await)
                    }
                }
            }
            _ => {
                self.publish(VoiceEvent::PlaybackStarted {
                    transport: Transport::Stream,
                });
                self.outcome_for(self.play_stream(&req).await)
            }
        }
    }

    /// Remote synthesis is unusable: substitute the local voice.
    async fn run_local(&self, request: &PlaybackRequest) -> PlaybackOutcome {
        let Some(local) = &self.local else {
            self.publish(VoiceEvent::Status {
                message: "no synthesis engine available".to_owned(),
            });
            return PlaybackOutcome::Failed("no synthesis engine available".into());
        };
        info!("remote synthesis not configured, using local voice");
        self.publish(VoiceEvent::Status {
            message: "remote synthesis not configured; using local voice".to_owned(),
        });
        self.publish(VoiceEvent::PlaybackStarted {
            transport: Transport::Local,
        });
        self.outcome_for(local.speak(&request.text, self.stop.clone()).await)
    }

    /// Transport (a): stream compressed bytes into the incremental
    /// decoder. Playback starts as soon as the probe succeeds.
    async fn play_stream(&self, req: &SynthesisRequest) -> Result<()> {
        let stream = self.synthesis.synthesize(req).await?;
        let format = stream.format;
        let (byte_tx, byte_rx) = mpsc::channel(self.config.fetch_queue);

        let output = self.output.clone();
        let stop = self.stop.clone();
        let played = self.played_ms.clone();
        let decoder = tokio::task::spawn_blocking(move || {
            decode_stream(ChannelRead::new(byte_rx), format, output.as_ref(), &stop, &played)
        });

        let fetch_err = self.pump_fetch(stream, byte_tx).await;
        let decode_result = decoder
            .await
            .map_err(|e| VoiceError::Playback(format!("decode task lost: {e}")))?;

        // A fetch failure takes precedence: the decoder error it causes
        // (truncated stream) is a symptom.
        match fetch_err {
            Some(e) => Err(e),
            None => decode_result,
        }
    }

    /// Transport (b): raw 16-bit PCM, written in fixed-size chunks with a
    /// stop check between chunks.
    async fn play_raw(&self, req: &SynthesisRequest) -> Result<()> {
        let stream = self.synthesis.synthesize(req).await?;
        let (byte_tx, byte_rx) = mpsc::channel(self.config.fetch_queue);

        let output = self.output.clone();
        let stop = self.stop.clone();
        let played = self.played_ms.clone();
        let sample_rate = self.config.pcm_sample_rate;
        let chunk_samples = self.config.pcm_chunk_samples;
        let writer = tokio::task::spawn_blocking(move || {
            write_pcm_chunks(
                byte_rx,
                output.as_ref(),
                sample_rate,
                chunk_samples,
                &stop,
                &played,
            )
        });

        let fetch_err = self.pump_fetch(stream, byte_tx).await;
        let write_result = writer
            .await
            .map_err(|e| VoiceError::Playback(format!("pcm writer task lost: {e}")))?;

        match fetch_err {
            Some(e) => Err(e),
            None => write_result,
        }
    }

    /// Forward fetched bytes to the transport until the stream ends, the
    /// consumer hangs up, or a stop is requested. Returns the fetch
    /// error, if any; dropping the sender signals end-of-stream.
    async fn pump_fetch(
        &self,
        mut stream: AudioStream,
        byte_tx: mpsc::Sender<Bytes>,
    ) -> Option<VoiceError> {
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => {
                    debug!("fetch cancelled by stop request");
                    return None;
                }
                chunk = stream.bytes.next() => match chunk {
                    Some(Ok(bytes)) => {
                        if byte_tx.send(bytes).await.is_err() {
                            // Transport bailed; its result carries the cause.
                            return None;
                        }
                    }
                    Some(Err(e)) => return Some(e),
                    None => return None,
                },
            }
        }
    }
}

/// Blocking raw-PCM writer. Decodes little-endian i16 pairs to f32 and
/// writes `chunk_samples` at a time, checking the stop token between
/// chunks so an abort never waits on more than one chunk.
fn write_pcm_chunks(
    mut rx: mpsc::Receiver<Bytes>,
    output: &dyn AudioOutput,
    sample_rate: u32,
    chunk_samples: usize,
    stop: &CancellationToken,
    played_ms: &AtomicU64,
) -> Result<()> {
    let mut sink = output.open(sample_rate)?;
    let mut pending: Vec<u8> = Vec::new();
    let mut chunk: Vec<f32> = Vec::with_capacity(chunk_samples);
    let ms_per_chunk = |samples: usize| samples as u64 * 1000 / u64::from(sample_rate.max(1));

    while let Some(bytes) = rx.blocking_recv() {
        pending.extend_from_slice(&bytes);
        let usable = pending.len() & !1; // keep an odd trailing byte for later
        for pair in pending[..usable].chunks_exact(2) {
            chunk.push(f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0);
            if chunk.len() == chunk_samples {
                if stop.is_cancelled() {
                    debug!("raw playback stopped between chunks");
                    return Ok(());
                }
                sink.write(&chunk)?;
                played_ms.fetch_add(ms_per_chunk(chunk.len()), Ordering::Relaxed);
                chunk.clear();
            }
        }
        pending.drain(..usable);
    }

    if stop.is_cancelled() {
        return Ok(());
    }
    if !chunk.is_empty() {
        sink.write(&chunk)?;
        played_ms.fetch_add(ms_per_chunk(chunk.len()), Ordering::Relaxed);
    }
    sink.drain()
}
