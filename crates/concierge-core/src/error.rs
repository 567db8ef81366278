//! Error types for the concierge kiosk core

use thiserror::Error;

/// Result type alias for kiosk operations
pub type KioskResult<T> = Result<T, KioskError>;

/// Errors that can occur while running the presence-gated dialogue loop.
///
/// None of these end the process: the turn runner logs them, surfaces a
/// transient notice and returns the controller to idle.
#[derive(Error, Debug)]
pub enum KioskError {
    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Audio stream error: {0}")]
    AudioStream(String),

    #[error("Capture already active on this channel")]
    CaptureBusy,

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Streaming channel closed: {0}")]
    ChannelClosed(String),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Dialogue service error: {0}")]
    Remote(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl KioskError {
    /// Whether the failure came from the dialogue service or the channel to it.
    /// Transport failures offer the visitor a manual retry.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            KioskError::Connect(_)
                | KioskError::ChannelClosed(_)
                | KioskError::MalformedFrame(_)
                | KioskError::Remote(_)
                | KioskError::Http(_)
        )
    }

    /// Whether the microphone itself could not be used. Retrying on a timer
    /// will not help until someone fixes the device or its permission.
    pub fn is_device(&self) -> bool {
        matches!(self, KioskError::AudioDevice(_) | KioskError::AudioStream(_))
    }
}

impl From<cpal::DevicesError> for KioskError {
    fn from(err: cpal::DevicesError) -> Self {
        KioskError::AudioDevice(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for KioskError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        KioskError::AudioDevice(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for KioskError {
    fn from(err: cpal::BuildStreamError) -> Self {
        KioskError::AudioStream(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for KioskError {
    fn from(err: cpal::PlayStreamError) -> Self {
        KioskError::AudioStream(err.to_string())
    }
}

impl From<reqwest::Error> for KioskError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() {
            KioskError::Connect(err.to_string())
        } else {
            KioskError::Http(err.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for KioskError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                KioskError::ChannelClosed(err.to_string())
            }
            other => KioskError::Connect(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for KioskError {
    fn from(err: serde_json::Error) -> Self {
        KioskError::MalformedFrame(err.to_string())
    }
}

impl From<config::ConfigError> for KioskError {
    fn from(err: config::ConfigError) -> Self {
        KioskError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_classified() {
        assert!(KioskError::Connect("refused".into()).is_transport());
        assert!(KioskError::MalformedFrame("bad json".into()).is_transport());
        assert!(!KioskError::CaptureBusy.is_transport());
        assert!(!KioskError::AudioDevice("denied".into()).is_transport());
    }

    #[test]
    fn device_errors_are_classified() {
        assert!(KioskError::AudioDevice("permission denied".into()).is_device());
        assert!(KioskError::AudioStream("stream ended".into()).is_device());
        assert!(!KioskError::CaptureBusy.is_device());
        assert!(!KioskError::Remote("500".into()).is_device());
    }
}
