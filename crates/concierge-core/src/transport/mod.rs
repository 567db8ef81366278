//! DialogueTransport: one contract over two wire strategies.
//!
//! ```text
//!   Utterance::Clip ──► BufferedTransport  ──► POST /api/dialogue ──┐
//!                                                                   ├─► DialogueReply
//!   Utterance::Frames ─► StreamingTransport ─► ws /ws/stream ───────┘     audio: Resource | Pcm
//! ```
//!
//! [`SessionTransport`] picks the implementation once per session.

pub mod buffered;
pub mod client;
pub mod protocol;
pub mod streaming;

pub use buffered::BufferedTransport;
pub use client::{DialogueClient, DialogueResponse, GreetingResponse};
pub use protocol::StreamEvent;
pub use streaming::StreamingTransport;

use crate::audio::{AudioFrame, EncodedAudio};
use crate::config::TransportMode;
use crate::error::{KioskError, KioskResult};
use crate::events::{Answer, AnswerAudio};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// What capture hands to the transport.
pub enum Utterance {
    /// One bounded, gated recording.
    Clip(EncodedAudio),
    /// Live frames; dropping the receiver tells capture the utterance is over.
    Frames(mpsc::Receiver<AudioFrame>),
}

/// Announced format of a streamed answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioStart {
    pub sample_rate: u32,
    pub channels: u16,
    pub emotion: Option<String>,
    pub gesture: Option<String>,
}

/// What flows from the streaming channel to playback after the answer.
#[derive(Debug)]
pub enum ReplyEvent {
    Start(AudioStart),
    Chunk(Vec<i16>),
    Video(String),
    End,
    /// The channel failed mid-answer; playback stops and the turn fails.
    Abort(KioskError),
}

pub type PcmStream = mpsc::Receiver<ReplyEvent>;

#[derive(Debug, Default)]
pub enum ReplyAudio {
    #[default]
    None,
    /// A playable resource on the service (relative or absolute URL).
    Resource(String),
    Pcm(PcmStream),
}

impl From<&ReplyAudio> for AnswerAudio {
    fn from(audio: &ReplyAudio) -> Self {
        match audio {
            ReplyAudio::None => AnswerAudio::None,
            ReplyAudio::Resource(reference) => AnswerAudio::Resource(reference.clone()),
            ReplyAudio::Pcm(_) => AnswerAudio::Stream,
        }
    }
}

/// Normalized result of one exchange.
#[derive(Debug, Default)]
pub struct DialogueReply {
    /// Absent for server-initiated greetings.
    pub user_text: Option<String>,
    pub answer: Answer,
    /// Set instead of an answer when recognition was too unsure.
    pub clarify: Option<String>,
    pub audio: ReplyAudio,
}

impl DialogueReply {
    /// Nothing recognized and nothing said.
    pub fn is_empty(&self) -> bool {
        self.clarify.is_none()
            && self.user_text.as_deref().map_or(true, |t| t.trim().is_empty())
            && self.answer.text.trim().is_empty()
            && matches!(self.audio, ReplyAudio::None)
    }
}

#[async_trait::async_trait]
pub trait DialogueTransport: Send {
    fn mode(&self) -> TransportMode;

    /// Establish whatever the transport needs before the first turn.
    async fn open(&mut self) -> KioskResult<()> {
        Ok(())
    }

    async fn send(&mut self, utterance: Utterance) -> KioskResult<DialogueReply>;

    /// Request a greeting. No audio is submitted.
    async fn greet(&mut self, text: &str) -> KioskResult<DialogueReply>;
}

/// The transport chosen for this session.
pub struct SessionTransport {
    active: Box<dyn DialogueTransport>,
    standby: Option<Box<dyn DialogueTransport>>,
}

impl SessionTransport {
    /// Use one transport for the whole session.
    pub fn fixed(transport: Box<dyn DialogueTransport>) -> Self {
        Self {
            active: transport,
            standby: None,
        }
    }

    /// Try `preferred` once. If it cannot connect, `fallback` serves the rest
    /// of the session.
    pub async fn negotiate(
        mut preferred: Box<dyn DialogueTransport>,
        fallback: Box<dyn DialogueTransport>,
    ) -> Self {
        match preferred.open().await {
            Ok(()) => {
                info!(mode = ?preferred.mode(), "🔌 dialogue transport ready");
                Self {
                    active: preferred,
                    standby: Some(fallback),
                }
            }
            Err(e) => {
                warn!(
                    error = %e,
                    "{:?} transport unavailable, using {:?} for this session",
                    preferred.mode(),
                    fallback.mode()
                );
                Self::fixed(fallback)
            }
        }
    }

    pub fn mode(&self) -> TransportMode {
        self.active.mode()
    }

    pub async fn send(&mut self, utterance: Utterance) -> KioskResult<DialogueReply> {
        let result = self.active.send(utterance).await;
        if let Err(KioskError::Connect(reason)) = &result {
            self.latch_fallback(reason);
        }
        result
    }

    pub async fn greet(&mut self, text: &str) -> KioskResult<DialogueReply> {
        self.active.greet(text).await
    }

    fn latch_fallback(&mut self, reason: &str) {
        if let Some(standby) = self.standby.take() {
            warn!(
                %reason,
                "reconnect failed, switching to {:?} for the rest of the session",
                standby.mode()
            );
            self.active = standby;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Scripted {
        mode: TransportMode,
        open_ok: bool,
        send_error: bool,
        sends: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl DialogueTransport for Scripted {
        fn mode(&self) -> TransportMode {
            self.mode
        }

        async fn open(&mut self) -> KioskResult<()> {
            if self.open_ok {
                Ok(())
            } else {
                Err(KioskError::Connect("refused".into()))
            }
        }

        async fn send(&mut self, _utterance: Utterance) -> KioskResult<DialogueReply> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            if self.send_error {
                Err(KioskError::Connect("refused".into()))
            } else {
                Ok(DialogueReply::default())
            }
        }

        async fn greet(&mut self, _text: &str) -> KioskResult<DialogueReply> {
            Ok(DialogueReply::default())
        }
    }

    fn scripted(mode: TransportMode, open_ok: bool, send_error: bool) -> (Box<Scripted>, Arc<AtomicUsize>) {
        let sends = Arc::new(AtomicUsize::new(0));
        (
            Box::new(Scripted {
                mode,
                open_ok,
                send_error,
                sends: Arc::clone(&sends),
            }),
            sends,
        )
    }

    fn clip() -> Utterance {
        Utterance::Clip(EncodedAudio::from_samples(&[0.0; 16], 16_000))
    }

    #[tokio::test]
    async fn failed_first_connect_falls_back_for_the_session() {
        let (streaming, stream_sends) = scripted(TransportMode::Streaming, false, false);
        let (buffered, buffered_sends) = scripted(TransportMode::Buffered, true, false);
        let mut session = SessionTransport::negotiate(streaming, buffered).await;
        assert_eq!(session.mode(), TransportMode::Buffered);
        session.send(clip()).await.unwrap();
        session.send(clip()).await.unwrap();
        assert_eq!(stream_sends.load(Ordering::SeqCst), 0);
        assert_eq!(buffered_sends.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn reconnect_failure_latches_fallback_once() {
        let (streaming, _) = scripted(TransportMode::Streaming, true, true);
        let (buffered, _) = scripted(TransportMode::Buffered, true, false);
        let mut session = SessionTransport::negotiate(streaming, buffered).await;
        assert_eq!(session.mode(), TransportMode::Streaming);
        assert!(session.send(clip()).await.is_err());
        assert_eq!(session.mode(), TransportMode::Buffered);
        assert!(session.send(clip()).await.is_ok());
    }

    #[test]
    fn reply_emptiness() {
        assert!(DialogueReply::default().is_empty());
        let reply = DialogueReply {
            user_text: Some("hi".into()),
            ..Default::default()
        };
        assert!(!reply.is_empty());
    }

    #[test]
    fn answer_audio_follows_the_reply() {
        let resource = ReplyAudio::Resource("/media/answer.wav".into());
        assert_eq!(
            AnswerAudio::from(&resource),
            AnswerAudio::Resource("/media/answer.wav".into())
        );
        let (_tx, rx) = mpsc::channel(1);
        assert_eq!(AnswerAudio::from(&ReplyAudio::Pcm(rx)), AnswerAudio::Stream);
        assert_eq!(AnswerAudio::from(&ReplyAudio::None), AnswerAudio::None);
    }
}
