//! # Concierge Core - Reception Kiosk Conversation Loop
//!
//! Presence-gated, turn-based dialogue between a visitor standing at the kiosk
//! and a remote dialogue service, rendered through an avatar and subtitles.
//! Audio in and out is bare metal Rust (cpal / rodio), no browser involved.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                        Kiosk Orchestrator                          │
//! │  ┌──────────────┐   watch   ┌──────────────┐   actions            │
//! │  │   Presence   │─────────→ │     Turn     │─────────→ Avatar /   │
//! │  │   Monitor    │           │  Controller  │           Subtitles  │
//! │  └──────────────┘           └──────────────┘                      │
//! │                               ↑ events                            │
//! │  ┌──────────────┐  frames  ┌──────────────┐  reply  ┌───────────┐ │
//! │  │   Capture    │────────→ │  Transport   │───────→ │ Playback  │ │
//! │  │   (cpal)     │          │ (HTTP / WS)  │         │ (rodio)   │ │
//! │  └──────────────┘          └──────────────┘         └───────────┘ │
//! └───────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod avatar;
pub mod capture;
pub mod config;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod playback;
pub mod presence;
pub mod transport;
pub mod turn;

pub use audio::{AudioFrame, EncodedAudio, FrameSequencer};
pub use avatar::{AvatarReactor, SubtitlePresenter};
pub use capture::{
    amplitude_gate, AudioCaptureChannel, CpalMicrophone, EnergyTrigger, GateDecision, MicStream,
    MicrophoneSource, StreamOutcome,
};
pub use config::{
    CaptureConfig, KioskConfig, PlaybackConfig, PresenceSettings, ServiceConfig, StoreSettings,
    TransportMode, TurnConfig,
};
pub use error::{KioskError, KioskResult};
pub use events::{
    event_channel, Answer, AnswerAudio, KioskEvent, Notice, Routing, TransportEvent, TurnTrigger,
};
pub use orchestrator::{KioskHandle, KioskOrchestrator, TurnRunner};
pub use playback::{
    AmplitudeTap, AudioSink, MediaSource, PlaybackNote, PlaybackReport, ResponsePlaybackSynchronizer,
    RodioSink,
};
pub use presence::{DistanceTier, FaceLandmarks, PresenceMonitor, PresenceState};
pub use transport::{
    BufferedTransport, DialogueClient, DialogueReply, DialogueTransport, ReplyAudio, ReplyEvent,
    SessionTransport, StreamingTransport, Utterance,
};
pub use turn::{Presentation, TurnAction, TurnController, TurnPhase};
