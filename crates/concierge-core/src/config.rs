//! Kiosk configuration.
//!
//! Two layers live here. [`StoreSettings`] mirrors the keys owned by the remote
//! ConfigStore (language, avatar, subtitles, presence tuning) and keeps their
//! wire names. Everything else is a local tunable with a named default. Both are
//! loaded through the `config` crate: defaults, then an optional TOML file, then
//! `CONCIERGE__*` environment variables.

use crate::error::KioskResult;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Region of interest as fractions (0..1) of the camera frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionOfInterest {
    pub top: f32,
    pub left: f32,
    pub width: f32,
    pub height: f32,
}

impl Default for RegionOfInterest {
    fn default() -> Self {
        Self {
            top: 0.0,
            left: 0.0,
            width: 1.0,
            height: 1.0,
        }
    }
}

impl RegionOfInterest {
    /// Whether a normalized point lies inside the region (edges inclusive).
    pub fn contains(&self, x: f32, y: f32) -> bool {
        x >= self.left && x <= self.left + self.width && y >= self.top && y <= self.top + self.height
    }
}

/// `presence.*` keys of the ConfigStore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceSettings {
    /// When false the kiosk behaves as if a visitor were always present.
    pub enabled: bool,
    /// 0..1, higher is stricter: minimum detector confidence for a face to count.
    pub sensitivity: f32,
    pub roi: RegionOfInterest,
    /// Maximum horizontal nose-to-mid-eye offset, in pixels, for a face to be attending.
    #[serde(rename = "attentionTolerancePx", alias = "attentiontolerancepx")]
    pub attention_tolerance_px: f32,
    #[serde(rename = "nearThreshold", alias = "nearthreshold")]
    pub near_threshold: f32,
    #[serde(rename = "mediumThreshold", alias = "mediumthreshold")]
    pub medium_threshold: f32,
    #[serde(rename = "holdMs", alias = "holdms")]
    pub hold_ms: u64,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            sensitivity: 0.7,
            roi: RegionOfInterest::default(),
            attention_tolerance_px: 80.0,
            near_threshold: 0.10,
            medium_threshold: 0.07,
            hold_ms: 20_000,
        }
    }
}

impl PresenceSettings {
    pub fn hold(&self) -> Duration {
        Duration::from_millis(self.hold_ms)
    }
}

/// Keys owned by the remote ConfigStore (`GET /api/config`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub language: String,
    pub extra_prompt: String,
    /// `video` or `image`.
    pub avatar_mode: String,
    pub avatar_image_path: String,
    pub subtitles_enabled: bool,
    pub presence: PresenceSettings,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            language: "kk".to_string(),
            extra_prompt: String::new(),
            avatar_mode: "video".to_string(),
            avatar_image_path: String::new(),
            subtitles_enabled: true,
            presence: PresenceSettings::default(),
        }
    }
}

impl StoreSettings {
    /// Parse a ConfigStore document. Missing keys fall back to defaults, unknown keys are ignored.
    pub fn from_json(value: serde_json::Value) -> KioskResult<Self> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn video_avatar(&self) -> bool {
        self.avatar_mode.eq_ignore_ascii_case("video")
    }
}

/// Where the dialogue service lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Base URL without trailing slash (e.g. http://localhost:8000).
    pub base_url: String,
    /// Path of the persistent streaming channel, appended to `base_url` with a ws scheme.
    pub stream_path: String,
    pub dialogue_path: String,
    pub greeting_path: String,
    pub config_path: String,
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            stream_path: "/ws/stream".to_string(),
            dialogue_path: "/api/dialogue".to_string(),
            greeting_path: "/api/greeting".to_string(),
            config_path: "/api/config".to_string(),
            request_timeout_ms: 60_000,
            connect_timeout_ms: 5_000,
        }
    }
}

impl ServiceConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// WebSocket URL of the streaming channel derived from `base_url`.
    pub fn stream_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{}{}", base, self.stream_path)
    }

    /// Absolute HTTP URL for a service path or a relative media reference.
    /// Absolute URLs pass through unchanged.
    pub fn http_url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        let base = self.base_url.trim_end_matches('/');
        if path.starts_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        }
    }
}

/// Which wire strategy the session prefers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    Buffered,
    Streaming,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub mode: TransportMode,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            mode: TransportMode::Streaming,
        }
    }
}

/// Microphone capture and the two energy heuristics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    /// Length of one buffered-mode utterance.
    pub buffered_duration_ms: u64,
    /// Buffered gate: utterances whose RMS is below this are never sent.
    pub quiet_rms: f32,
    /// Streaming trigger: per-window RMS that counts toward the trigger.
    pub trigger_rms: f32,
    /// Streaming trigger: consecutive loud windows required.
    pub trigger_windows: u32,
    pub trigger_window_ms: u64,
    /// Streaming emission cadence once triggered.
    pub frame_interval_ms: u64,
    /// Give up waiting for the streaming trigger after this long.
    pub trigger_timeout_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            buffered_duration_ms: 5_000,
            quiet_rms: 0.008,
            trigger_rms: 0.02,
            trigger_windows: 3,
            trigger_window_ms: 30,
            frame_interval_ms: 100,
            trigger_timeout_ms: 10_000,
        }
    }
}

impl CaptureConfig {
    pub fn buffered_duration(&self) -> Duration {
        Duration::from_millis(self.buffered_duration_ms)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    pub fn trigger_timeout(&self) -> Duration {
        Duration::from_millis(self.trigger_timeout_ms)
    }

    /// Samples in one trigger window.
    pub fn window_samples(&self) -> usize {
        ((self.sample_rate as u64 * self.trigger_window_ms) / 1000).max(1) as usize
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    /// No automatic greeting within this window of the previous one.
    pub greet_suppression_ms: u64,
    /// Status tick: how often an idle kiosk with a present visitor starts listening.
    pub status_interval_ms: u64,
    /// Sent to the greeting endpoint as `user_text`.
    pub greeting_text: String,
    pub greeting_emotion: String,
    pub greeting_gesture: String,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            greet_suppression_ms: 20_000,
            status_interval_ms: 500,
            greeting_text: "hello".to_string(),
            greeting_emotion: "happy".to_string(),
            greeting_gesture: "wave".to_string(),
        }
    }
}

impl TurnConfig {
    pub fn greet_suppression(&self) -> Duration {
        Duration::from_millis(self.greet_suppression_ms)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Turn completion is forced this long after the synchronizer receives
    /// the reply. Any media fetch counts against it.
    pub hard_timeout_ms: u64,
    /// Render-frame cadence for amplitude publication.
    pub render_interval_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            hard_timeout_ms: 30_000,
            render_interval_ms: 16,
        }
    }
}

impl PlaybackConfig {
    pub fn hard_timeout(&self) -> Duration {
        Duration::from_millis(self.hard_timeout_ms)
    }

    pub fn render_interval(&self) -> Duration {
        Duration::from_millis(self.render_interval_ms.max(1))
    }
}

/// Complete kiosk configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KioskConfig {
    pub settings: StoreSettings,
    pub service: ServiceConfig,
    pub transport: TransportConfig,
    pub capture: CaptureConfig,
    pub turn: TurnConfig,
    pub playback: PlaybackConfig,
}

impl KioskConfig {
    /// Load config from file and environment. Precedence: env `CONCIERGE__*` > file
    /// (`CONCIERGE_CONFIG` path, default `config/kiosk`) > defaults.
    pub fn load() -> KioskResult<Self> {
        let config_path =
            std::env::var("CONCIERGE_CONFIG").unwrap_or_else(|_| "config/kiosk".to_string());
        let built = config::Config::builder()
            .add_source(config::File::with_name(&config_path).required(false))
            .add_source(
                config::Environment::with_prefix("CONCIERGE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(built.try_deserialize()?)
    }

    /// Replace the ConfigStore-owned keys with a freshly fetched document.
    pub fn apply_store(&mut self, settings: StoreSettings) {
        self.settings = settings;
    }
}
