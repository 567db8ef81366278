//! The event vocabulary of the kiosk loop.
//!
//! Every asynchronous source (presence, capture, transport, playback) reports
//! into one channel of [`KioskEvent`]s, and [`crate::turn::TurnController::dispatch`]
//! is the only place that turns them into state transitions.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Why a turn is being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnTrigger {
    /// Presence was just gained. Subject to the re-greet suppression window.
    Greeting,
    /// Status tick: a visitor is present and the kiosk is idle.
    Listen,
    /// A visitor pressed retry after a failed turn.
    Manual,
}

/// Where the visitor should go, extracted by the service from its answer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Routing {
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default)]
    pub room: Option<String>,
    #[serde(default)]
    pub floor: Option<String>,
    #[serde(default)]
    pub contact: Option<String>,
}

impl Routing {
    pub fn is_empty(&self) -> bool {
        [&self.department, &self.room, &self.floor, &self.contact]
            .iter()
            .all(|field| field.as_deref().map_or(true, |v| v.trim().is_empty()))
    }
}

/// Everything the service said back for one turn, minus the audio.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Answer {
    pub text: String,
    pub emotion: Option<String>,
    pub gesture: Option<String>,
    pub routing: Option<Routing>,
    /// Per-reply override of the ConfigStore `subtitles_enabled` value.
    pub subtitles: Option<bool>,
    pub video_url: Option<String>,
    pub audio: AnswerAudio,
}

/// Where the spoken answer comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AnswerAudio {
    /// Text only.
    #[default]
    None,
    /// A resource on the service, fetched before playback.
    Resource(String),
    /// PCM pushed on the streaming channel.
    Stream,
}

/// Something the visitor should be told, briefly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub message: String,
    /// Whether a manual retry control should be offered.
    pub retry: bool,
}

impl Notice {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retry: true,
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retry: false,
        }
    }
}

/// Dialogue-level events reported by the turn runner.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The service's transcription of the visitor.
    UserText(String),
    Answer(Answer),
    /// Playback of the answer began; metadata here fills gaps the answer left.
    AudioStart {
        sample_rate: u32,
        emotion: Option<String>,
        gesture: Option<String>,
    },
    /// A rendered avatar video for the current answer became available.
    VideoUrl(String),
    /// Recognition was too unsure; the service asks the visitor to repeat.
    Clarify(String),
    /// Nothing was recognized. Ends the turn quietly.
    Empty,
    /// The channel or request failed. Ends the turn with a retryable notice.
    Failed(String),
}

/// Input of the single state-transition function.
#[derive(Debug, Clone, PartialEq)]
pub enum KioskEvent {
    PresenceChanged(bool),
    TurnRequested(TurnTrigger),
    /// Buffered: the amplitude gate passed. Streaming: the energy trigger fired.
    AudioGateOpened,
    /// Quiet audio or no speech before the trigger timeout. A policy skip.
    AudioSuppressed,
    Transport(TransportEvent),
    PlaybackEnded { timed_out: bool },
    /// A local failure (playback plumbing, capture already busy) ended the turn.
    TurnFailed(String),
    /// The microphone could not be opened or stopped delivering audio.
    /// Automatic listening stays paused until a manual request.
    DeviceUnavailable(String),
}

impl KioskEvent {
    /// Whether this event always ends the live turn.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            KioskEvent::AudioSuppressed
                | KioskEvent::PlaybackEnded { .. }
                | KioskEvent::TurnFailed(_)
                | KioskEvent::DeviceUnavailable(_)
                | KioskEvent::Transport(
                    TransportEvent::Clarify(_) | TransportEvent::Empty | TransportEvent::Failed(_)
                )
        )
    }
}

pub type EventSender = mpsc::UnboundedSender<KioskEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<KioskEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
