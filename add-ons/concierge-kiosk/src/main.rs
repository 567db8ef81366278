//! Concierge Kiosk (reception avatar process)
//!
//! Opens the microphone and speaker, reads face landmarks as JSON lines on
//! stdin, negotiates the dialogue transport and runs the conversation loop
//! until CTRL-C. Avatar and overlay calls are logged; a renderer attaches by
//! implementing `AvatarReactor` and `SubtitlePresenter`.

use anyhow::Context;
use concierge_core::presence::Detection;
use concierge_core::{
    AmplitudeTap, AudioCaptureChannel, AudioSink, AvatarReactor, BufferedTransport, CpalMicrophone,
    DialogueClient, FaceLandmarks, KioskConfig, KioskOrchestrator, KioskResult, MediaSource,
    Notice, PresenceMonitor, PresenceState, ResponsePlaybackSynchronizer, RodioSink, Routing,
    SessionTransport, StreamingTransport, SubtitlePresenter, TransportMode, TurnRunner,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Landmark frames buffered between stdin and the presence monitor.
const DETECTION_BUFFER: usize = 32;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (before any env::var calls)
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[concierge-kiosk] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = KioskConfig::load().context("load kiosk config")?;
    let client = DialogueClient::new(config.service.clone()).context("build dialogue client")?;
    match client.fetch_settings().await {
        Ok(settings) => config.apply_store(settings),
        Err(e) => tracing::warn!(error = %e, "ConfigStore unreachable, using local settings"),
    }

    tracing::info!(
        base_url = %config.service.base_url,
        mode = ?config.transport.mode,
        language = %config.settings.language,
        presence = config.settings.presence.enabled,
        "Concierge kiosk starting"
    );

    match CpalMicrophone::list_input_devices() {
        Ok(devices) => tracing::debug!(?devices, "input devices"),
        Err(e) => tracing::warn!(error = %e, "could not enumerate input devices"),
    }
    let mic = Arc::new(CpalMicrophone::new(config.capture.sample_rate));
    let capture = Arc::new(AudioCaptureChannel::new(mic, config.capture.clone()));

    let sink: Box<dyn AudioSink> = match RodioSink::new() {
        Ok(sink) => Box::new(sink),
        Err(e) => {
            tracing::error!(error = %e, "no audio output, answers will be silent");
            Box::new(SilentSink::default())
        }
    };
    let media: Arc<dyn MediaSource> = Arc::new(client.clone());
    let playback = ResponsePlaybackSynchronizer::new(sink, media, config.playback.clone());

    let buffered = Box::new(BufferedTransport::new(client.clone()));
    let transport = match config.transport.mode {
        TransportMode::Streaming => {
            SessionTransport::negotiate(Box::new(StreamingTransport::new(client)), buffered).await
        }
        TransportMode::Buffered => SessionTransport::fixed(buffered),
    };

    let presence = spawn_presence(&config);
    let runner = TurnRunner::new(capture, transport, playback, &config.turn);
    let orchestrator = KioskOrchestrator::new(
        &config,
        runner,
        presence,
        Box::new(LogAvatar),
        Box::new(LogOverlay),
    );
    let handle = orchestrator.handle();
    let kiosk = tokio::spawn(orchestrator.run());

    tokio::signal::ctrl_c().await.context("listen for CTRL-C")?;
    tracing::info!("CTRL-C received; shutting down kiosk");
    handle.shutdown();
    kiosk.await.context("kiosk loop panicked")?;
    Ok(())
}

/// Presence from the landmark feed, or a constant "present" when detection is off.
fn spawn_presence(config: &KioskConfig) -> watch::Receiver<PresenceState> {
    let settings = config.settings.presence.clone();
    if !settings.enabled {
        tracing::info!("presence detection disabled, treating visitor as present");
        let (tx, rx) = watch::channel(PresenceState::always_present());
        // Held by the task so the loop never sees the feed close.
        tokio::spawn(async move { tx.closed().await });
        return rx;
    }

    let (tx, rx) = watch::channel(PresenceState::absent());
    let (det_tx, det_rx) = mpsc::channel(DETECTION_BUFFER);
    tokio::spawn(PresenceMonitor::new(settings).run(det_rx, tx));
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if det_tx.send(parse_detection(&line)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "landmark feed read failed");
                    break;
                }
            }
        }
        tracing::info!("landmark feed closed");
    });
    rx
}

/// One stdin line: a landmarks object, `null` / blank for "no face", anything
/// else is a detector failure.
fn parse_detection(line: &str) -> Detection {
    let line = line.trim();
    if line.is_empty() || line == "null" {
        return Ok(None);
    }
    serde_json::from_str::<FaceLandmarks>(line)
        .map(Some)
        .map_err(|e| e.to_string())
}

#[derive(Default)]
struct SilentSink {
    tap: AmplitudeTap,
}

impl AudioSink for SilentSink {
    fn play_encoded(&mut self, _bytes: Vec<u8>) -> KioskResult<()> {
        Ok(())
    }

    fn play_pcm(&mut self, _samples: Vec<i16>, _channels: u16, _sample_rate: u32) -> KioskResult<()> {
        Ok(())
    }

    fn is_idle(&self) -> bool {
        true
    }

    fn stop(&mut self) {}

    fn tap(&self) -> AmplitudeTap {
        self.tap.clone()
    }
}

struct LogAvatar;

impl AvatarReactor for LogAvatar {
    fn set_emotion(&mut self, name: &str) {
        tracing::info!(emotion = name, "avatar emotion");
    }

    fn play_gesture(&mut self, name: &str) {
        tracing::info!(gesture = name, "avatar gesture");
    }

    fn set_amplitude(&mut self, amplitude: f32) {
        tracing::trace!(amplitude, "lipsync");
    }
}

struct LogOverlay;

impl SubtitlePresenter for LogOverlay {
    fn show_user_text(&mut self, text: &str) {
        tracing::info!(%text, "visitor said");
    }

    fn show_answer(&mut self, text: &str, subtitles: bool) {
        if subtitles {
            tracing::info!(%text, "answer");
        } else {
            tracing::debug!(%text, "answer (subtitles off)");
        }
    }

    fn show_routing(&mut self, routing: &Routing) {
        tracing::info!(
            department = ?routing.department,
            room = ?routing.room,
            floor = ?routing.floor,
            contact = ?routing.contact,
            "routing card"
        );
    }

    fn show_video(&mut self, url: &str) {
        tracing::info!(%url, "avatar video");
    }

    fn show_notice(&mut self, notice: &Notice) {
        tracing::warn!(message = %notice.message, retry = notice.retry, "notice");
    }

    fn clear(&mut self) {
        tracing::debug!("overlay cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_and_null_lines_mean_no_face() {
        assert_eq!(parse_detection(""), Ok(None));
        assert_eq!(parse_detection(" null "), Ok(None));
    }

    #[test]
    fn landmark_line_parses() {
        let line = r#"{"left_eye":{"x":290,"y":240},"right_eye":{"x":350,"y":240},"nose":{"x":320,"y":270},"frame_width":640,"frame_height":480}"#;
        let face = parse_detection(line).unwrap().unwrap();
        assert_eq!(face.frame_width, 640.0);
        assert_eq!(face.confidence, 1.0);
    }

    #[test]
    fn garbage_is_a_detector_failure() {
        assert!(parse_detection("{not json").is_err());
    }
}
