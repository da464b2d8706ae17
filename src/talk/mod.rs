//! Talk mode: the full-duplex conversation loop.
//!
//! One single-writer `select!` loop owns all orchestration state.
//! Producers — the recognizer session, the gateway event subscription,
//! the poll timer, playback completion — feed the loop through channels;
//! nothing mutates state from outside it. Endpointing is silence-based:
//! the loop finalizes the live transcript once it has gone unchanged for
//! the silence window, regardless of the recognizer's own finality
//! signal.

pub mod directive;

use crate::config::TalkConfig;
use crate::engines::{AudioFocus, SpeechRecognizer, TranscriptSession};
use crate::error::{Result, VoiceError};
use crate::events::{TalkState, VoiceEvent};
use crate::gateway::{AgentClient, AgentEvent, ChatSend, TalkSessionConfig};
use crate::messages::{
    ConversationTurn, OutputFormat, PlaybackOutcome, PlaybackRequest, TranscriptEvent, TurnStatus,
};
use crate::playback::SpeechPlaybackEngine;
use crate::talk::directive::parse_reply;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pause before reopening a recognizer session after it ends or fails.
const SESSION_RESTART_PAUSE: Duration = Duration::from_millis(250);

/// Session-scoped synthesis settings: local config merged with whatever
/// the gateway talk config provided. Non-`once` directives update these.
#[derive(Debug, Clone)]
struct TalkSettings {
    session_key: String,
    voice: String,
    model: String,
    format: OutputFormat,
    speed: Option<f32>,
    interrupt_on_speech: bool,
}

impl TalkSettings {
    fn merge(local: &TalkConfig, remote: &TalkSessionConfig) -> Self {
        Self {
            session_key: remote
                .session_key
                .clone()
                .unwrap_or_else(|| local.session_key.clone()),
            voice: remote.voice.clone().unwrap_or_else(|| local.voice.clone()),
            model: remote.model.clone().unwrap_or_else(|| local.model.clone()),
            format: remote.format().unwrap_or(local.format),
            speed: local.speed,
            interrupt_on_speech: remote
                .interrupt_on_speech
                .unwrap_or(local.interrupt_on_speech),
        }
    }
}

/// Where the loop currently is. `Off` is represented by the task not
/// running; `Finalizing` is transient within one loop iteration.
enum Phase {
    Listening,
    AwaitingReply {
        run_id: String,
        /// Give up waiting for the terminal run event here.
        event_deadline: Instant,
        /// Give up on the turn entirely here.
        history_deadline: Instant,
        /// Set once history polling should happen on every tick: after
        /// the terminal event arrived, or after the event deadline.
        polling: bool,
    },
    Speaking,
}

struct RunningTalk {
    cancel: CancellationToken,
    task: JoinHandle<SpeechPlaybackEngine>,
}

/// Turn-taking orchestrator for spoken conversation with the agent.
pub struct TalkModeOrchestrator {
    config: TalkConfig,
    recognizer: Arc<dyn SpeechRecognizer>,
    client: Arc<dyn AgentClient>,
    playback: Option<SpeechPlaybackEngine>,
    events: Option<broadcast::Sender<VoiceEvent>>,
    running: Option<RunningTalk>,
}

impl TalkModeOrchestrator {
    pub fn new(
        config: TalkConfig,
        recognizer: Arc<dyn SpeechRecognizer>,
        client: Arc<dyn AgentClient>,
        playback: SpeechPlaybackEngine,
    ) -> Self {
        Self {
            config,
            recognizer,
            client,
            playback: Some(playback),
            events: None,
            running: None,
        }
    }

    /// Attach an event broadcaster for host observability.
    pub fn with_events(mut self, tx: broadcast::Sender<VoiceEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Enter talk mode: fetch the session config, subscribe to agent
    /// events, start background listening. A no-op while already enabled.
    pub async fn enable(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Ok(());
        }
        let engine = self
            .playback
            .take()
            .ok_or_else(|| VoiceError::Unavailable("playback engine lost".into()))?;

        // Gateway config is advisory: any failure falls back to local
        // defaults rather than blocking talk mode.
        let remote = match self.client.talk_config(true).await {
            Ok(c) => c,
            Err(e) => {
                warn!("talk config fetch failed, using local defaults: {e}");
                TalkSessionConfig::default()
            }
        };
        let settings = TalkSettings::merge(&self.config, &remote);

        let agent_rx = match self.client.subscribe(&settings.session_key).await {
            Ok(rx) => Some(rx),
            Err(e) => {
                warn!("agent event subscription failed, relying on history polling: {e}");
                None
            }
        };

        let cancel = CancellationToken::new();
        let talk = TalkLoop {
            config: self.config.clone(),
            settings,
            recognizer: self.recognizer.clone(),
            client: self.client.clone(),
            engine,
            events: self.events.clone(),
            cancel: cancel.clone(),
            phase: Phase::Listening,
            live_text: String::new(),
            last_update: None,
            interrupted_after: None,
            speaking_text: String::new(),
            pending_turn: None,
        };
        let task = tokio::spawn(talk.run(agent_rx));
        self.running = Some(RunningTalk { cancel, task });
        info!("talk mode enabled");
        Ok(())
    }

    /// Leave talk mode from any state: stops playback, ends the
    /// recognizer session, cancels timers and pending awaits. Idempotent.
    pub async fn disable(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.cancel.cancel();
        match running.task.await {
            Ok(engine) => self.playback = Some(engine),
            Err(e) => warn!("talk loop task lost: {e}"),
        }
        info!("talk mode disabled");
    }

    /// Whether talk mode is currently enabled.
    pub fn is_enabled(&self) -> bool {
        self.running.is_some()
    }
}

struct TalkLoop {
    config: TalkConfig,
    settings: TalkSettings,
    recognizer: Arc<dyn SpeechRecognizer>,
    client: Arc<dyn AgentClient>,
    engine: SpeechPlaybackEngine,
    events: Option<broadcast::Sender<VoiceEvent>>,
    cancel: CancellationToken,
    phase: Phase,
    /// Latest utterance text, replaced wholesale on every update.
    live_text: String,
    /// When `live_text` last changed; the endpointing clock.
    last_update: Option<Instant>,
    /// Playback offset of the last barge-in, consumed by the next turn.
    interrupted_after: Option<Duration>,
    /// Text the active playback session is speaking, for echo rejection.
    speaking_text: String,
    pending_turn: Option<ConversationTurn>,
}

impl TalkLoop {
    fn publish(&self, event: VoiceEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn set_phase(&mut self, phase: Phase) {
        let state = match &phase {
            Phase::Listening => TalkState::Listening,
            Phase::AwaitingReply { .. } => TalkState::AwaitingReply,
            Phase::Speaking => TalkState::Speaking,
        };
        self.phase = phase;
        self.publish(VoiceEvent::TalkState { state });
    }

    async fn run(mut self, mut agent_rx: Option<mpsc::Receiver<AgentEvent>>) -> SpeechPlaybackEngine {
        let poll = Duration::from_millis(self.config.poll_interval_ms);
        let mut session: Option<TranscriptSession> = None;
        let mut session_retry_at = Instant::now();
        let mut finished_rx: Option<oneshot::Receiver<PlaybackOutcome>> = None;

        self.publish(VoiceEvent::TalkState {
            state: TalkState::Listening,
        });

        loop {
            // Keep background listening alive across session ends.
            if session.is_none() && Instant::now() >= session_retry_at {
                match self.recognizer.start(AudioFocus::Background).await {
                    Ok(s) => session = Some(s),
                    Err(e) => {
                        debug!("recognizer session unavailable, retrying: {e}");
                        session_retry_at = Instant::now() + SESSION_RESTART_PAUSE;
                    }
                }
            }

            let tick = self.next_wakeup(poll);
            tokio::select! {
                _ = self.cancel.cancelled() => break,

                event = recv_transcript(session.as_mut()), if session.is_some() => {
                    match event {
                        Some(TranscriptEvent::Update(t)) => {
                            self.on_transcript(&t.text, &mut finished_rx).await;
                            if t.is_final {
                                // Terminal per session contract; reopen.
                                session = None;
                                session_retry_at = Instant::now();
                            }
                        }
                        Some(TranscriptEvent::Failed(e)) => {
                            debug!("recognizer session failed: {e}");
                            session = None;
                            session_retry_at = Instant::now() + SESSION_RESTART_PAUSE;
                        }
                        Some(TranscriptEvent::Ended) | None => {
                            session = None;
                            session_retry_at = Instant::now() + SESSION_RESTART_PAUSE;
                        }
                    }
                }

                event = recv_agent(agent_rx.as_mut()), if agent_rx.is_some() => {
                    match event {
                        Some(event) => self.on_agent_event(&event, &mut finished_rx).await,
                        None => {
                            warn!("agent event subscription closed");
                            agent_rx = None;
                        }
                    }
                }

                outcome = recv_outcome(finished_rx.as_mut()), if finished_rx.is_some() => {
                    finished_rx = None;
                    self.on_playback_done(outcome);
                }

                _ = tokio::time::sleep_until(tick) => {
                    self.on_tick(&mut finished_rx).await;
                }
            }
        }

        // Teardown: playback stopped, session and subscription dropped.
        self.engine.stop().await;
        self.publish(VoiceEvent::TalkState {
            state: TalkState::Off,
        });
        self.engine
    }

    /// Next timer wakeup: the poll cadence, capped by whichever turn
    /// deadline comes first. Recomputed every iteration, so deadlines
    /// armed by a superseded phase simply stop existing.
    fn next_wakeup(&self, poll: Duration) -> Instant {
        let tick = Instant::now() + poll;
        match &self.phase {
            Phase::AwaitingReply {
                event_deadline,
                history_deadline,
                polling,
                ..
            } => {
                let next = if *polling { *history_deadline } else { *event_deadline };
                tick.min(next)
            }
            _ => tick,
        }
    }

    /// A transcript update: replace the live text and, while speaking,
    /// decide whether it is a barge-in. An update recognized as our own
    /// playback echoed back is discarded outright — retaining it would
    /// finalize the assistant's words into the next user turn.
    async fn on_transcript(
        &mut self,
        text: &str,
        finished_rx: &mut Option<oneshot::Receiver<PlaybackOutcome>>,
    ) {
        if matches!(self.phase, Phase::Speaking) && is_echo(text.trim(), &self.speaking_text) {
            debug!("ignoring our own speech echoed back");
            return;
        }
        self.live_text = text.to_owned();
        self.last_update = Some(Instant::now());

        if !matches!(self.phase, Phase::Speaking) || !self.settings.interrupt_on_speech {
            return;
        }
        let candidate = text.trim();
        if candidate.chars().count() < self.config.min_barge_len {
            return;
        }

        info!("barge-in: stopping playback");
        let offset = self.engine.stop().await;
        self.interrupted_after = offset;
        *finished_rx = None; // outcome of the stopped session is discarded
        self.speaking_text.clear();
        self.set_phase(Phase::Listening);
    }

    /// Periodic tick: silence endpointing while listening, reply-wait
    /// bookkeeping while awaiting.
    async fn on_tick(&mut self, finished_rx: &mut Option<oneshot::Receiver<PlaybackOutcome>>) {
        match &self.phase {
            Phase::Listening => self.check_endpoint().await,
            Phase::AwaitingReply {
                run_id,
                event_deadline,
                history_deadline,
                polling,
            } => {
                let now = Instant::now();
                let run_id = run_id.clone();
                if now >= *history_deadline {
                    self.time_out_turn(&run_id);
                    return;
                }
                if *polling || now >= *event_deadline {
                    if !*polling {
                        debug!("no terminal event for run {run_id}, polling history");
                        self.mark_polling();
                    }
                    if let Some(reply) = self.fetch_reply().await {
                        self.complete_turn(&run_id, reply, finished_rx).await;
                    }
                }
            }
            Phase::Speaking => {}
        }
    }

    /// Finalize the live transcript once it has been silent long enough.
    /// Finalizing an empty transcript is a no-op.
    async fn check_endpoint(&mut self) {
        let silence = Duration::from_millis(self.config.silence_window_ms);
        let quiet_long_enough = self.last_update.is_some_and(|at| at.elapsed() >= silence);
        if !quiet_long_enough || self.live_text.trim().is_empty() {
            return;
        }
        if self
            .pending_turn
            .as_ref()
            .is_some_and(|t| t.status == TurnStatus::Pending)
        {
            // One pending turn per session key, no exceptions.
            warn!("finalize skipped: a turn is already pending");
            return;
        }

        self.publish(VoiceEvent::TalkState {
            state: TalkState::Finalizing,
        });
        let utterance = std::mem::take(&mut self.live_text);
        self.last_update = None;
        let utterance = utterance.trim().to_owned();
        info!("finalized utterance ({} chars)", utterance.len());

        let message = match self.interrupted_after.take() {
            Some(offset) => format!(
                "[interrupted your previous reply after {:.1}s] {utterance}",
                offset.as_secs_f64()
            ),
            None => utterance,
        };

        let req = ChatSend {
            session_key: self.settings.session_key.clone(),
            message: message.clone(),
            timeout_ms: self.config.turn_timeout_ms,
            idempotency_key: uuid::Uuid::new_v4().to_string(),
        };
        match self.client.send_chat(req).await {
            Ok(ack) => {
                let now = Instant::now();
                self.pending_turn = Some(ConversationTurn {
                    run_id: ack.run_id.clone(),
                    user_text: message,
                    reply_text: None,
                    status: TurnStatus::Pending,
                    submitted_at_ms: chrono::Utc::now().timestamp_millis(),
                });
                self.publish(VoiceEvent::TurnSubmitted {
                    run_id: ack.run_id.clone(),
                });
                self.set_phase(Phase::AwaitingReply {
                    run_id: ack.run_id,
                    event_deadline: now + Duration::from_millis(self.config.turn_timeout_ms),
                    history_deadline: now
                        + Duration::from_millis(
                            self.config.turn_timeout_ms + self.config.history_grace_ms,
                        ),
                    polling: false,
                });
            }
            Err(e) => {
                warn!("turn submission failed: {e}");
                self.publish(VoiceEvent::Status {
                    message: format!("turn submission failed: {e}"),
                });
                self.set_phase(Phase::Listening);
            }
        }
    }

    /// A gateway run event while awaiting: the terminal state of our run
    /// means the reply should be in history now. Everything else is
    /// ignored.
    async fn on_agent_event(
        &mut self,
        event: &AgentEvent,
        finished_rx: &mut Option<oneshot::Receiver<PlaybackOutcome>>,
    ) {
        let Phase::AwaitingReply { run_id, .. } = &self.phase else {
            return;
        };
        if !event.finalizes(run_id) {
            return;
        }
        let run_id = run_id.clone();
        debug!("run {run_id} reached terminal state");
        match self.fetch_reply().await {
            Some(reply) => self.complete_turn(&run_id, reply, finished_rx).await,
            None => {
                // History lagging behind the event; poll until it shows.
                self.mark_polling();
            }
        }
    }

    fn mark_polling(&mut self) {
        if let Phase::AwaitingReply { polling, .. } = &mut self.phase {
            *polling = true;
        }
    }

    /// Fetch history and pick the first assistant reply no older than the
    /// pending submission. Gateway errors degrade to "nothing yet".
    async fn fetch_reply(&self) -> Option<String> {
        let submitted_at_ms = self.pending_turn.as_ref()?.submitted_at_ms;
        match self.client.history(&self.settings.session_key).await {
            Ok(history) => history
                .first_reply_since(submitted_at_ms)
                .and_then(|m| m.text())
                .map(str::to_owned),
            Err(e) => {
                warn!("history fetch failed: {e}");
                None
            }
        }
    }

    fn time_out_turn(&mut self, run_id: &str) {
        if let Some(turn) = self.pending_turn.as_mut() {
            turn.status = TurnStatus::TimedOut;
        }
        warn!("turn {run_id} timed out with no reply");
        self.publish(VoiceEvent::TurnFinished {
            run_id: run_id.to_owned(),
            status: TurnStatus::TimedOut,
        });
        self.publish(VoiceEvent::Status {
            message: "no reply from agent within budget".to_owned(),
        });
        self.set_phase(Phase::Listening);
    }

    /// Reply in hand: apply the directive, mark the turn complete, start
    /// speaking (unless the reply was directive-only).
    async fn complete_turn(
        &mut self,
        run_id: &str,
        reply: String,
        finished_rx: &mut Option<oneshot::Receiver<PlaybackOutcome>>,
    ) {
        if let Some(turn) = self.pending_turn.as_mut() {
            turn.status = TurnStatus::Completed;
            turn.reply_text = Some(reply.clone());
        }
        self.publish(VoiceEvent::TurnFinished {
            run_id: run_id.to_owned(),
            status: TurnStatus::Completed,
        });

        let parsed = parse_reply(&reply);
        if !parsed.unknown_keys.is_empty() {
            self.publish(VoiceEvent::Status {
                message: format!(
                    "unrecognized directive keys: {}",
                    parsed.unknown_keys.join(", ")
                ),
            });
        }

        let mut voice = self.settings.voice.clone();
        let mut model = self.settings.model.clone();
        let mut speed = self.settings.speed;
        if let Some(directive) = &parsed.directive {
            if let Some(v) = &directive.voice {
                voice = v.clone();
            }
            if let Some(m) = &directive.model {
                model = m.clone();
            }
            if let Some(s) = directive.speed {
                speed = Some(s);
            }
            if !directive.once && !directive.is_empty() {
                self.settings.voice = voice.clone();
                self.settings.model = model.clone();
                self.settings.speed = speed;
            }
        }

        if parsed.text.is_empty() {
            debug!("directive-only reply, nothing to speak");
            self.set_phase(Phase::Listening);
            return;
        }

        self.speaking_text = parsed.text.clone();
        let rx = self
            .engine
            .play(PlaybackRequest {
                text: parsed.text,
                voice,
                model,
                format: self.settings.format,
                speed,
            })
            .await;
        *finished_rx = Some(rx);
        self.set_phase(Phase::Speaking);
    }

    fn on_playback_done(&mut self, outcome: PlaybackOutcome) {
        if let PlaybackOutcome::Failed(reason) = &outcome {
            warn!("playback failed: {reason}");
            self.publish(VoiceEvent::Status {
                message: format!("playback failed: {reason}"),
            });
        }
        self.speaking_text.clear();
        if matches!(self.phase, Phase::Speaking) {
            self.set_phase(Phase::Listening);
        }
    }
}

async fn recv_transcript(session: Option<&mut TranscriptSession>) -> Option<TranscriptEvent> {
    match session {
        Some(s) => s.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_agent(rx: Option<&mut mpsc::Receiver<AgentEvent>>) -> Option<AgentEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_outcome(rx: Option<&mut oneshot::Receiver<PlaybackOutcome>>) -> PlaybackOutcome {
    match rx {
        Some(rx) => rx
            .await
            .unwrap_or_else(|_| PlaybackOutcome::Failed("playback task dropped".into())),
        None => std::future::pending().await,
    }
}

/// Whether `candidate` is the tail of the text currently being spoken —
/// the recognizer hearing our own playback. Case- and whitespace-
/// insensitive.
fn is_echo(candidate: &str, speaking: &str) -> bool {
    if speaking.is_empty() {
        return false;
    }
    let norm = |s: &str| {
        s.chars()
            .filter(|c| !c.is_whitespace())
            .flat_map(char::to_lowercase)
            .collect::<String>()
    };
    let candidate = norm(candidate);
    if candidate.is_empty() {
        return true; // nothing but whitespace cannot be a barge-in
    }
    norm(speaking).ends_with(&candidate)
}
