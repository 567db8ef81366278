//! Fakes shared by the integration tests.

#![allow(dead_code)]

use concierge_core::{
    AmplitudeTap, Answer, AudioSink, AvatarReactor, DialogueReply, DialogueTransport, KioskError,
    KioskResult, MediaSource, MicStream, MicrophoneSource, Notice, ReplyAudio, Routing,
    SubtitlePresenter, TransportMode, Utterance,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn level(amplitude: f32, len: usize) -> Vec<f32> {
    (0..len)
        .map(|i| if i % 2 == 0 { amplitude } else { -amplitude })
        .collect()
}

/// A microphone that delivers a fixed amount of constant-level audio per
/// open, then stays open and silent.
pub struct SteadyMic {
    pub amplitude: f32,
    pub chunks: usize,
}

impl SteadyMic {
    pub fn loud() -> Self {
        Self {
            amplitude: 0.2,
            chunks: 20,
        }
    }

    pub fn quiet() -> Self {
        Self {
            amplitude: 0.001,
            chunks: 20,
        }
    }
}

impl MicrophoneSource for SteadyMic {
    fn open(&self) -> KioskResult<MicStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        for _ in 0..self.chunks {
            let _ = tx.send(level(self.amplitude, 480));
        }
        Ok(MicStream::new(16_000, rx, tx))
    }
}

/// A microphone the operating system refuses to open.
pub struct DeniedMic;

impl MicrophoneSource for DeniedMic {
    fn open(&self) -> KioskResult<MicStream> {
        Err(KioskError::AudioDevice("microphone permission denied".to_string()))
    }
}

#[derive(Default)]
pub struct Counters {
    pub sends: AtomicUsize,
    pub greets: AtomicUsize,
    pub frames: AtomicUsize,
}

impl Counters {
    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    pub fn greets(&self) -> usize {
        self.greets.load(Ordering::SeqCst)
    }

    pub fn frames(&self) -> usize {
        self.frames.load(Ordering::SeqCst)
    }
}

/// Dialogue service stand-in with canned answers.
pub struct ScriptedTransport {
    pub mode: TransportMode,
    pub counters: Arc<Counters>,
    pub greet_delay: Duration,
}

impl ScriptedTransport {
    pub fn new(mode: TransportMode) -> (Self, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        (
            Self {
                mode,
                counters: Arc::clone(&counters),
                greet_delay: Duration::ZERO,
            },
            counters,
        )
    }
}

pub fn room_answer() -> Answer {
    Answer {
        text: "Room 214 is on the second floor".to_string(),
        emotion: Some("happy".to_string()),
        gesture: Some("point".to_string()),
        routing: Some(Routing {
            room: Some("214".to_string()),
            floor: Some("2".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait::async_trait]
impl DialogueTransport for ScriptedTransport {
    fn mode(&self) -> TransportMode {
        self.mode
    }

    async fn send(&mut self, utterance: Utterance) -> KioskResult<DialogueReply> {
        self.counters.sends.fetch_add(1, Ordering::SeqCst);
        if let Utterance::Frames(mut frames) = utterance {
            if frames.recv().await.is_some() {
                self.counters.frames.fetch_add(1, Ordering::SeqCst);
            }
        }
        Ok(DialogueReply {
            user_text: Some("where is room 214".to_string()),
            answer: room_answer(),
            clarify: None,
            audio: ReplyAudio::None,
        })
    }

    async fn greet(&mut self, _text: &str) -> KioskResult<DialogueReply> {
        tokio::time::sleep(self.greet_delay).await;
        self.counters.greets.fetch_add(1, Ordering::SeqCst);
        Ok(DialogueReply {
            answer: Answer {
                text: "Welcome!".to_string(),
                ..Default::default()
            },
            ..Default::default()
        })
    }
}

/// Output that finishes everything instantly.
#[derive(Default)]
pub struct IdleSink {
    pub tap: AmplitudeTap,
    pub pcm: Arc<AtomicUsize>,
}

impl AudioSink for IdleSink {
    fn play_encoded(&mut self, _bytes: Vec<u8>) -> KioskResult<()> {
        Ok(())
    }

    fn play_pcm(&mut self, samples: Vec<i16>, _channels: u16, _sample_rate: u32) -> KioskResult<()> {
        self.pcm.fetch_add(samples.len(), Ordering::SeqCst);
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

pub struct NoMedia;

#[async_trait::async_trait]
impl MediaSource for NoMedia {
    async fn fetch(&self, reference: &str) -> KioskResult<Vec<u8>> {
        Err(KioskError::Playback(format!("{reference} not available")))
    }
}

/// Avatar and overlay in one, logging every call except lipsync.
#[derive(Clone, Default)]
pub struct Recorder {
    pub log: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn entries(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn emotions(&self) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter_map(|e| e.strip_prefix("emotion:").map(str::to_string))
            .collect()
    }

    fn push(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }
}

impl AvatarReactor for Recorder {
    fn set_emotion(&mut self, name: &str) {
        self.push(format!("emotion:{name}"));
    }

    fn play_gesture(&mut self, name: &str) {
        self.push(format!("gesture:{name}"));
    }

    fn set_amplitude(&mut self, _amplitude: f32) {}
}

impl SubtitlePresenter for Recorder {
    fn show_user_text(&mut self, text: &str) {
        self.push(format!("user:{text}"));
    }

    fn show_answer(&mut self, text: &str, subtitles: bool) {
        self.push(format!("answer:{text}:{subtitles}"));
    }

    fn show_routing(&mut self, routing: &Routing) {
        self.push(format!("routing:{}", routing.room.clone().unwrap_or_default()));
    }

    fn show_video(&mut self, url: &str) {
        self.push(format!("video:{url}"));
    }

    fn show_notice(&mut self, notice: &Notice) {
        self.push(format!("notice:{}:{}", notice.message, notice.retry));
    }

    fn clear(&mut self) {
        self.push("clear".to_string());
    }
}
