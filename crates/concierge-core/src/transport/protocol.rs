//! Frames of the persistent streaming channel.
//!
//! Text frames are JSON objects tagged by `type`. Binary frames that follow an
//! `audio_start` are raw little-endian PCM at the announced rate.

use crate::audio::pcm16_le_to_i16;
use crate::error::{KioskError, KioskResult};
use serde::{Deserialize, Serialize};
use tracing::debug;

fn one_channel() -> u16 {
    1
}

fn two_bytes() -> u16 {
    2
}

/// Server-to-client vocabulary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    UserText {
        #[serde(default)]
        text: String,
    },
    Answer {
        #[serde(default)]
        text: String,
        #[serde(default)]
        emotion: Option<String>,
        #[serde(default)]
        gesture: Option<String>,
    },
    AudioStart {
        #[serde(rename = "sampleRate")]
        sample_rate: u32,
        #[serde(default = "one_channel")]
        channels: u16,
        #[serde(rename = "sampleWidth", default = "two_bytes")]
        sample_width: u16,
        #[serde(default)]
        emotion: Option<String>,
        #[serde(default)]
        gesture: Option<String>,
    },
    AudioEnd,
    Error {
        #[serde(default)]
        message: String,
    },
    Clarify {
        #[serde(default)]
        text: String,
    },
    VideoUrl {
        url: String,
    },
    /// Decoded binary frame. Never appears as JSON.
    #[serde(skip)]
    AudioChunk(Vec<i16>),
}

const KNOWN_TYPES: &[&str] = &[
    "user_text",
    "answer",
    "audio_start",
    "audio_end",
    "error",
    "clarify",
    "video_url",
];

/// Parse a text frame. `Ok(None)` means a well-formed frame this client does not act on.
pub fn parse_text(text: &str) -> KioskResult<Option<StreamEvent>> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    let Some(kind) = value.get("type").and_then(|t| t.as_str()) else {
        // Untagged `{"error": "..."}` is how the service reports conversion failures.
        if let Some(err) = value.get("error") {
            let message = err.as_str().map(str::to_string).unwrap_or_else(|| err.to_string());
            return Ok(Some(StreamEvent::Error { message }));
        }
        return Err(KioskError::MalformedFrame(format!("untagged frame: {text}")));
    };
    if !KNOWN_TYPES.contains(&kind) {
        debug!(kind, "ignoring unknown stream frame");
        return Ok(None);
    }
    let event: StreamEvent = serde_json::from_value(value)?;
    if let StreamEvent::AudioStart {
        sample_rate,
        channels,
        sample_width,
        ..
    } = &event
    {
        if *sample_width != 2 {
            return Err(KioskError::MalformedFrame(format!(
                "unsupported sample width {sample_width}"
            )));
        }
        if *sample_rate == 0 || *channels == 0 {
            return Err(KioskError::MalformedFrame(
                "audio_start with zero rate or channels".to_string(),
            ));
        }
    }
    Ok(Some(event))
}

/// Parse a binary frame as 16-bit PCM.
pub fn parse_binary(bytes: &[u8]) -> KioskResult<StreamEvent> {
    if bytes.len() % 2 != 0 {
        return Err(KioskError::MalformedFrame(format!(
            "odd PCM frame length {}",
            bytes.len()
        )));
    }
    Ok(StreamEvent::AudioChunk(pcm16_le_to_i16(bytes)))
}
