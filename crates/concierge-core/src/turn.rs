//! Turn-taking for the presence-gated dialogue loop
//!
//! One [`TurnController`] owns the session context (busy flag, presence,
//! last greeting) and the single live [`DialogueTurn`]. It never performs I/O:
//! [`TurnController::dispatch`] maps an event to a list of [`TurnAction`]s that
//! the orchestrator applies to the avatar and presenter.

use crate::config::TurnConfig;
use crate::events::{Answer, AnswerAudio, KioskEvent, Notice, Routing, TransportEvent, TurnTrigger};
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Emotion the avatar returns to at the end of every answered or failed turn.
pub const NEUTRAL_EMOTION: &str = "neutral";

/// Phase of the dialogue turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Idle,
    Listening,
    Processing,
    Answering,
}

/// The single live turn.
#[derive(Debug, Clone)]
pub struct DialogueTurn {
    pub id: u64,
    pub trigger: TurnTrigger,
    pub phase: TurnPhase,
    pub user_text: Option<String>,
    pub answer_text: Option<String>,
    pub emotion: Option<String>,
    pub gesture: Option<String>,
    pub audio: AnswerAudio,
    pub started_at: DateTime<Utc>,
}

/// Session-wide state that used to be loose flags.
#[derive(Debug, Clone, Default)]
pub struct TurnSession {
    pub present: bool,
    pub busy: bool,
    pub last_greeting: Option<Instant>,
    /// Set when the microphone failed; only a manual request clears it.
    pub listen_paused: bool,
}

/// What the orchestrator should do after an event.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnAction {
    /// Spawn the runner for a freshly admitted turn.
    BeginTurn { id: u64, trigger: TurnTrigger },
    PhaseChanged(TurnPhase),
    SetEmotion(String),
    PlayGesture(String),
    ShowUserText(String),
    ShowAnswer { text: String, subtitles: bool },
    ShowRouting(Routing),
    ShowVideo(String),
    ShowNotice(Notice),
}

/// Presentation preferences taken from the ConfigStore.
#[derive(Debug, Clone)]
pub struct Presentation {
    pub subtitles_enabled: bool,
    pub video_avatar: bool,
}

impl Default for Presentation {
    fn default() -> Self {
        Self {
            subtitles_enabled: true,
            video_avatar: true,
        }
    }
}

pub struct TurnController {
    config: TurnConfig,
    presentation: Presentation,
    session: TurnSession,
    turn: Option<DialogueTurn>,
    next_id: u64,
}

impl TurnController {
    pub fn new(config: TurnConfig, presentation: Presentation) -> Self {
        Self {
            config,
            presentation,
            session: TurnSession::default(),
            turn: None,
            next_id: 1,
        }
    }

    pub fn phase(&self) -> TurnPhase {
        self.turn.as_ref().map_or(TurnPhase::Idle, |t| t.phase)
    }

    pub fn is_busy(&self) -> bool {
        self.session.busy
    }

    pub fn is_present(&self) -> bool {
        self.session.present
    }

    pub fn current(&self) -> Option<&DialogueTurn> {
        self.turn.as_ref()
    }

    /// The one state-transition function.
    pub fn dispatch(&mut self, event: KioskEvent, now: Instant) -> Vec<TurnAction> {
        let mut actions = Vec::new();
        match event {
            KioskEvent::PresenceChanged(present) => {
                let gained = present && !self.session.present;
                self.session.present = present;
                debug!(present, "presence changed");
                if gained {
                    self.try_start(TurnTrigger::Greeting, now, &mut actions);
                }
            }
            KioskEvent::TurnRequested(trigger) => self.try_start(trigger, now, &mut actions),
            KioskEvent::AudioGateOpened => {
                if self.phase() == TurnPhase::Listening {
                    self.set_phase(TurnPhase::Processing, &mut actions);
                }
            }
            KioskEvent::AudioSuppressed => {
                debug!("utterance suppressed, nothing sent");
                self.finish(&mut actions);
            }
            KioskEvent::Transport(event) => self.on_transport(event, &mut actions),
            KioskEvent::PlaybackEnded { timed_out } => {
                if timed_out {
                    warn!("⏱️ playback end not observed, forcing turn completion");
                }
                if self.turn.is_some() {
                    actions.push(TurnAction::SetEmotion(NEUTRAL_EMOTION.to_string()));
                }
                self.finish(&mut actions);
            }
            KioskEvent::TurnFailed(reason) => {
                warn!(%reason, "turn failed");
                self.fail(Notice::info(reason), &mut actions);
            }
            KioskEvent::DeviceUnavailable(reason) => {
                warn!(%reason, "🎙️ microphone unavailable, pausing automatic listening");
                self.session.listen_paused = true;
                self.fail(Notice::info(reason), &mut actions);
            }
        }
        actions
    }

    fn try_start(&mut self, trigger: TurnTrigger, now: Instant, actions: &mut Vec<TurnAction>) {
        if self.session.busy {
            debug!(?trigger, "turn already running, request dropped");
            return;
        }
        if !self.session.present {
            debug!(?trigger, "nobody present, request dropped");
            return;
        }
        match trigger {
            TurnTrigger::Listen if self.session.listen_paused => {
                debug!("microphone unavailable, waiting for a manual request");
                return;
            }
            TurnTrigger::Manual if self.session.listen_paused => {
                info!("manual request, resuming automatic listening");
                self.session.listen_paused = false;
            }
            _ => {}
        }
        if trigger == TurnTrigger::Greeting {
            if let Some(last) = self.session.last_greeting {
                if now.saturating_duration_since(last) < self.config.greet_suppression() {
                    debug!("greeted recently, skipping greeting");
                    return;
                }
            }
            self.session.last_greeting = Some(now);
        }

        let id = self.next_id;
        self.next_id += 1;
        self.session.busy = true;
        info!(id, ?trigger, "🗣️ turn started");
        self.turn = Some(DialogueTurn {
            id,
            trigger,
            phase: TurnPhase::Idle,
            user_text: None,
            answer_text: None,
            emotion: None,
            gesture: None,
            audio: AnswerAudio::None,
            started_at: Utc::now(),
        });
        self.set_phase(TurnPhase::Listening, actions);
        if trigger == TurnTrigger::Greeting {
            // Nothing to record for a greeting: its gate opens at once.
            self.set_phase(TurnPhase::Processing, actions);
        }
        actions.push(TurnAction::BeginTurn { id, trigger });
    }

    fn on_transport(&mut self, event: TransportEvent, actions: &mut Vec<TurnAction>) {
        match event {
            TransportEvent::UserText(text) => {
                let Some(turn) = self.turn.as_mut() else { return };
                if text.trim().is_empty() {
                    return;
                }
                turn.user_text = Some(text.clone());
                actions.push(TurnAction::ShowUserText(text));
            }
            TransportEvent::Answer(answer) => {
                if self.phase() != TurnPhase::Processing {
                    warn!(phase = ?self.phase(), "answer outside processing, ignored");
                    return;
                }
                self.apply_answer(answer, actions);
            }
            TransportEvent::AudioStart {
                sample_rate,
                emotion,
                gesture,
            } => {
                debug!(sample_rate, "answer audio started");
                let Some(turn) = self.turn.as_mut() else { return };
                if turn.emotion.is_none() {
                    if let Some(e) = emotion.filter(|e| !e.is_empty()) {
                        turn.emotion = Some(e.clone());
                        actions.push(TurnAction::SetEmotion(e));
                    }
                }
                if turn.gesture.is_none() {
                    if let Some(g) = gesture.filter(|g| is_gesture(g)) {
                        turn.gesture = Some(g.clone());
                        actions.push(TurnAction::PlayGesture(g));
                    }
                }
            }
            TransportEvent::VideoUrl(url) => {
                if self.turn.is_some() && self.presentation.video_avatar && !url.is_empty() {
                    actions.push(TurnAction::ShowVideo(url));
                }
            }
            TransportEvent::Clarify(text) => {
                if self.turn.is_some() {
                    actions.push(TurnAction::ShowAnswer {
                        text,
                        subtitles: true,
                    });
                }
                self.finish(actions);
            }
            TransportEvent::Empty => {
                debug!("empty transcription, nothing to answer");
                self.finish(actions);
            }
            TransportEvent::Failed(reason) => {
                warn!(%reason, "dialogue transport failed");
                self.fail(Notice::retryable(reason), actions);
            }
        }
    }

    fn apply_answer(&mut self, answer: Answer, actions: &mut Vec<TurnAction>) {
        let Some(turn) = self.turn.as_mut() else { return };
        let greeting = turn.trigger == TurnTrigger::Greeting;
        let emotion = answer
            .emotion
            .filter(|e| !e.is_empty())
            .or_else(|| greeting.then(|| self.config.greeting_emotion.clone()));
        let gesture = answer
            .gesture
            .filter(|g| is_gesture(g))
            .or_else(|| greeting.then(|| self.config.greeting_gesture.clone()));

        turn.answer_text = Some(answer.text.clone());
        turn.audio = answer.audio;
        turn.emotion = emotion.clone();
        turn.gesture = gesture.clone();

        if let Some(e) = emotion {
            actions.push(TurnAction::SetEmotion(e));
        }
        if let Some(g) = gesture {
            actions.push(TurnAction::PlayGesture(g));
        }
        actions.push(TurnAction::ShowAnswer {
            text: answer.text,
            subtitles: answer.subtitles.unwrap_or(self.presentation.subtitles_enabled),
        });
        if let Some(routing) = answer.routing.filter(|r| !r.is_empty()) {
            actions.push(TurnAction::ShowRouting(routing));
        }
        if self.presentation.video_avatar {
            if let Some(url) = answer.video_url.filter(|u| !u.is_empty()) {
                actions.push(TurnAction::ShowVideo(url));
            }
        }
        self.set_phase(TurnPhase::Answering, actions);
    }

    fn set_phase(&mut self, phase: TurnPhase, actions: &mut Vec<TurnAction>) {
        if let Some(turn) = self.turn.as_mut() {
            if turn.phase != phase {
                debug!(id = turn.id, from = ?turn.phase, to = ?phase, "turn phase");
                turn.phase = phase;
                actions.push(TurnAction::PhaseChanged(phase));
            }
        }
    }

    fn fail(&mut self, notice: Notice, actions: &mut Vec<TurnAction>) {
        if self.turn.is_some() {
            actions.push(TurnAction::SetEmotion(NEUTRAL_EMOTION.to_string()));
            actions.push(TurnAction::ShowNotice(notice));
        }
        self.finish(actions);
    }

    /// Back to idle and release the busy flag. Safe to call with no live turn.
    fn finish(&mut self, actions: &mut Vec<TurnAction>) {
        if let Some(turn) = self.turn.take() {
            info!(id = turn.id, "turn finished");
            actions.push(TurnAction::PhaseChanged(TurnPhase::Idle));
        }
        self.session.busy = false;
    }
}

fn is_gesture(name: &str) -> bool {
    !name.is_empty() && !name.eq_ignore_ascii_case("none")
}
