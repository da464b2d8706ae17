//! Wake listening cycle: continuous detection, command capture, dispatch.
//!
//! The orchestrator runs the wake engine without exclusive microphone
//! focus. A detection pauses the engine, hands the microphone to a
//! bounded command-capture transcription session, dispatches whatever
//! that session yields, then resumes the engine. The microphone is held
//! by the engine, the capture session, or neither — never both.

use crate::config::{WakeConfig, WakeListenConfig};
use crate::engines::{AudioFocus, FrameSource, SpeechRecognizer};
use crate::events::{VoiceEvent, WakePhase};
use crate::messages::{TranscriptEvent, WakeDispatch};
use crate::wake::engine::WakeWordEngine;
use crate::wake::stages::WakeModelLoader;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DETECTION_CHANNEL_SIZE: usize = 4;

/// How a command-capture session ended.
enum CaptureEnd {
    /// Session produced something to hand to the dispatch consumer.
    Dispatch(WakeDispatch),
    /// Recognizer failed or closed without a final result; say nothing.
    Abort,
    /// The orchestrator is shutting down.
    Cancelled,
}

struct RunningCycle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Drives the wake → capture → dispatch cycle.
///
/// `start()` spawns the cycle task; `stop()` cancels it from any state,
/// including mid model-load. When the neural engine cannot initialize or
/// start, the cycle degrades to repeated short transcription sessions
/// scanned for the configured trigger phrases.
pub struct VoiceWakeOrchestrator {
    config: WakeListenConfig,
    wake_config: WakeConfig,
    source: Arc<dyn FrameSource>,
    loader: Arc<dyn WakeModelLoader>,
    recognizer: Arc<dyn SpeechRecognizer>,
    dispatch: mpsc::Sender<WakeDispatch>,
    events: Option<broadcast::Sender<VoiceEvent>>,
    running: Option<RunningCycle>,
}

impl VoiceWakeOrchestrator {
    pub fn new(
        config: WakeListenConfig,
        wake_config: WakeConfig,
        source: Arc<dyn FrameSource>,
        loader: Arc<dyn WakeModelLoader>,
        recognizer: Arc<dyn SpeechRecognizer>,
        dispatch: mpsc::Sender<WakeDispatch>,
    ) -> Self {
        Self {
            config,
            wake_config,
            source,
            loader,
            recognizer,
            dispatch,
            events: None,
            running: None,
        }
    }

    /// Attach an event broadcaster for host observability.
    pub fn with_events(mut self, tx: broadcast::Sender<VoiceEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Begin the wake cycle. A no-op while already running. Model loading
    /// happens inside the spawned task so `stop()` can interrupt it.
    pub fn start(&mut self) {
        if self.running.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let cycle = CycleTask {
            config: self.config.clone(),
            wake_config: self.wake_config.clone(),
            source: self.source.clone(),
            loader: self.loader.clone(),
            recognizer: self.recognizer.clone(),
            dispatch: self.dispatch.clone(),
            events: self.events.clone(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(cycle.run());
        self.running = Some(RunningCycle { cancel, task });
    }

    /// Global interrupt: from any state back to idle. Cancels the capture
    /// session, pending timers, and an in-flight model load. Idempotent.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.cancel.cancel();
        if let Err(e) = running.task.await {
            warn!("wake cycle task lost: {e}");
        }
    }

    /// Whether the cycle task is running.
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }
}

struct CycleTask {
    config: WakeListenConfig,
    wake_config: WakeConfig,
    source: Arc<dyn FrameSource>,
    loader: Arc<dyn WakeModelLoader>,
    recognizer: Arc<dyn SpeechRecognizer>,
    dispatch: mpsc::Sender<WakeDispatch>,
    events: Option<broadcast::Sender<VoiceEvent>>,
    cancel: CancellationToken,
}

impl CycleTask {
    fn publish(&self, event: VoiceEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn phase(&self, phase: WakePhase) {
        self.publish(VoiceEvent::WakePhase { phase });
    }

    async fn run(self) {
        let (det_tx, mut det_rx) = mpsc::channel(DETECTION_CHANNEL_SIZE);
        let mut engine = WakeWordEngine::new(
            self.wake_config.clone(),
            self.source.clone(),
            self.loader.clone(),
            det_tx,
        );
        if let Some(tx) = &self.events {
            engine = engine.with_events(tx.clone());
        }

        // Stop during the async model load discards the load result.
        let init = tokio::select! {
            _ = self.cancel.cancelled() => {
                self.phase(WakePhase::Idle);
                return;
            }
            r = engine.initialize() => r,
        };

        let engine_up = match init {
            Ok(()) => engine.start().await,
            Err(e) => {
                warn!("wake engine unavailable: {e}");
                false
            }
        };
        if !engine_up {
            self.degraded_loop().await;
            self.phase(WakePhase::Idle);
            return;
        }

        loop {
            self.phase(WakePhase::WakeListening);
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                detection = det_rx.recv() => {
                    let Some(detection) = detection else {
                        warn!("wake detection channel closed");
                        break;
                    };
                    debug!("wake cycle triggered by '{}'", detection.model);
                    self.phase(WakePhase::Triggered);
                    // Hand the microphone from the engine to the capture
                    // session. Models stay loaded across the pause.
                    engine.stop().await;

                    match self.capture_command().await {
                        CaptureEnd::Dispatch(dispatch) => {
                            if self.dispatch.send(dispatch).await.is_err() {
                                warn!("wake dispatch consumer gone");
                                break;
                            }
                        }
                        CaptureEnd::Abort => {}
                        CaptureEnd::Cancelled => break,
                    }

                    if !engine.start().await {
                        self.publish(VoiceEvent::Status {
                            message: "wake engine failed to resume".to_owned(),
                        });
                        self.degraded_loop().await;
                        break;
                    }
                }
            }
        }

        engine.release().await;
        self.phase(WakePhase::Idle);
    }

    /// Run one bounded, microphone-exclusive transcription session after a
    /// trigger. Ends on the first final transcript, the capture timeout,
    /// or a recognizer error — whichever comes first.
    async fn capture_command(&self) -> CaptureEnd {
        self.phase(WakePhase::CapturingCommand);
        let mut session = match self.recognizer.start(AudioFocus::Exclusive).await {
            Ok(s) => s,
            Err(e) => {
                warn!("command capture unavailable: {e}");
                return CaptureEnd::Abort;
            }
        };

        let timeout = Duration::from_millis(self.config.capture_timeout_ms);
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return CaptureEnd::Cancelled,
                _ = &mut deadline => {
                    debug!("command capture timed out");
                    return CaptureEnd::Dispatch(WakeDispatch::NoCommand);
                }
                event = session.recv() => match event {
                    Some(TranscriptEvent::Update(t)) if t.is_final => {
                        let text = t.text.trim().to_owned();
                        if text.is_empty() {
                            return CaptureEnd::Dispatch(WakeDispatch::NoCommand);
                        }
                        info!("captured command: {text}");
                        return CaptureEnd::Dispatch(WakeDispatch::Command(text));
                    }
                    Some(TranscriptEvent::Update(_)) => {}
                    Some(TranscriptEvent::Failed(e)) => {
                        warn!("command capture recognizer error: {e}");
                        return CaptureEnd::Abort;
                    }
                    Some(TranscriptEvent::Ended) | None => return CaptureEnd::Abort,
                },
            }
        }
        // Session drop releases the microphone on every path.
    }

    /// Engine-unavailable fallback: repeated short transcription sessions,
    /// each final transcript scanned for the configured trigger phrases by
    /// case-insensitive substring containment. Consecutive identical
    /// dispatches are deduplicated.
    async fn degraded_loop(&self) {
        let reason = "wake engine unavailable, scanning transcripts".to_owned();
        info!("{reason}");
        self.publish(VoiceEvent::WakeDegraded { reason });
        self.phase(WakePhase::WakeListening);

        let phrases: Vec<String> = self
            .config
            .trigger_phrases
            .iter()
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
        if phrases.is_empty() {
            warn!("degraded wake mode has no trigger phrases configured");
            self.cancel.cancelled().await;
            return;
        }

        let session_window = Duration::from_millis(self.config.degraded_session_ms);
        let restart_pause = Duration::from_millis(self.config.degraded_restart_pause_ms);
        let mut last_dispatched: Option<String> = None;

        'sessions: loop {
            if self.cancel.is_cancelled() {
                return;
            }
            let mut session = match self.recognizer.start(AudioFocus::Background).await {
                Ok(s) => s,
                Err(e) => {
                    warn!("degraded wake session unavailable: {e}");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        _ = tokio::time::sleep(restart_pause) => continue,
                    }
                }
            };

            let deadline = tokio::time::sleep(session_window);
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = &mut deadline => break,
                    event = session.recv() => match event {
                        Some(TranscriptEvent::Update(t)) if t.is_final => {
                            let lowered = t.text.to_lowercase();
                            let hit = phrases.iter().any(|p| lowered.contains(p.as_str()));
                            if hit && last_dispatched.as_deref() != Some(t.text.as_str()) {
                                info!("trigger phrase heard in transcript");
                                if self
                                    .dispatch
                                    .send(WakeDispatch::Command(t.text.clone()))
                                    .await
                                    .is_err()
                                {
                                    warn!("wake dispatch consumer gone");
                                    return;
                                }
                                last_dispatched = Some(t.text);
                            }
                            // Final transcript is a terminal recognizer
                            // event: restart the session.
                            break;
                        }
                        Some(TranscriptEvent::Update(_)) => {}
                        Some(TranscriptEvent::Failed(e)) => {
                            debug!("degraded wake session error: {e}");
                            break;
                        }
                        Some(TranscriptEvent::Ended) | None => break,
                    },
                }
            }

            drop(session);
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(restart_pause) => continue 'sessions,
            }
        }
    }
}
