//! Request/response transport: one upload, one structured reply.

use super::client::{DialogueClient, DialogueResponse, GreetingResponse};
use super::{DialogueReply, DialogueTransport, ReplyAudio, Utterance};
use crate::config::TransportMode;
use crate::error::{KioskError, KioskResult};
use crate::events::Answer;
use tracing::debug;

pub struct BufferedTransport {
    client: DialogueClient,
}

impl BufferedTransport {
    pub fn new(client: DialogueClient) -> Self {
        Self { client }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl From<DialogueResponse> for DialogueReply {
    fn from(res: DialogueResponse) -> Self {
        let audio = match non_empty(res.audio_url) {
            Some(url) => ReplyAudio::Resource(url),
            None => ReplyAudio::None,
        };
        DialogueReply {
            user_text: Some(res.user_text),
            answer: Answer {
                text: res.answer_text,
                emotion: non_empty(res.emotion),
                gesture: non_empty(res.gesture),
                routing: res.routing,
                subtitles: res.subtitles_enabled,
                video_url: non_empty(res.avatar_video_url),
                ..Default::default()
            },
            clarify: None,
            audio,
        }
    }
}

impl From<GreetingResponse> for DialogueReply {
    fn from(res: GreetingResponse) -> Self {
        DialogueReply {
            user_text: None,
            answer: Answer {
                text: res.bot_text,
                ..Default::default()
            },
            clarify: None,
            audio: non_empty(res.audio_path).map_or(ReplyAudio::None, ReplyAudio::Resource),
        }
    }
}

#[async_trait::async_trait]
impl DialogueTransport for BufferedTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::Buffered
    }

    async fn send(&mut self, utterance: Utterance) -> KioskResult<DialogueReply> {
        let Utterance::Clip(audio) = utterance else {
            return Err(KioskError::Config(
                "buffered transport expects a recorded clip".to_string(),
            ));
        };
        let res = self.client.dialogue(&audio).await?;
        debug!(user_text = %res.user_text, has_audio = res.audio_url.is_some(), "dialogue reply");
        Ok(res.into())
    }

    async fn greet(&mut self, text: &str) -> KioskResult<DialogueReply> {
        Ok(self.client.greet(text).await?.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_transcription_maps_to_empty_reply() {
        let reply: DialogueReply = DialogueResponse::default().into();
        assert!(reply.is_empty());
    }

    #[test]
    fn greeting_has_no_user_text() {
        let reply: DialogueReply = GreetingResponse {
            bot_text: "Welcome".into(),
            audio_path: Some("/media/greeting.wav".into()),
        }
        .into();
        assert!(reply.user_text.is_none());
        assert!(matches!(reply.audio, ReplyAudio::Resource(ref p) if p == "/media/greeting.wav"));
    }
}
