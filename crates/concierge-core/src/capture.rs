//! **AudioCaptureChannel** - microphone acquisition and the two capture modes.
//!
//! Buffered mode records one bounded utterance and hands it to the amplitude
//! gate before anything is sent. Streaming mode waits for a local energy
//! trigger (N consecutive loud windows) and then emits frames at a fixed
//! cadence until the consumer hangs up, which is how the remote side signals
//! end of utterance.

use crate::audio::{decoded_rms, rms, AudioFrame, EncodedAudio, FrameSequencer};
use crate::config::CaptureConfig;
use crate::error::{KioskError, KioskResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// A live microphone: raw mono f32 chunks. Dropping it releases the device.
pub struct MicStream {
    pub sample_rate: u32,
    pub chunks: mpsc::UnboundedReceiver<Vec<f32>>,
    _device: Box<dyn Send>,
}

impl MicStream {
    pub fn new(
        sample_rate: u32,
        chunks: mpsc::UnboundedReceiver<Vec<f32>>,
        device_guard: impl Send + 'static,
    ) -> Self {
        Self {
            sample_rate,
            chunks,
            _device: Box::new(device_guard),
        }
    }
}

/// Something that can hand out an exclusive microphone stream.
pub trait MicrophoneSource: Send + Sync {
    fn open(&self) -> KioskResult<MicStream>;
}

/// Microphone backed by the default cpal input device.
///
/// The cpal `Stream` is not `Send` on every platform, so it lives on a
/// dedicated thread for as long as the returned [`MicStream`] is alive.
#[derive(Debug, Clone)]
pub struct CpalMicrophone {
    sample_rate: u32,
    /// Samples per emitted chunk (480 = 30ms at 16kHz).
    buffer_size: usize,
}

impl CpalMicrophone {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            buffer_size: (sample_rate as usize * 30) / 1000,
        }
    }

    /// List available input devices
    pub fn list_input_devices() -> KioskResult<Vec<String>> {
        let devices = cpal::default_host().input_devices()?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }

    fn start_stream(
        sample_rate: u32,
        buffer_size: usize,
        chunk_tx: mpsc::UnboundedSender<Vec<f32>>,
    ) -> KioskResult<cpal::Stream> {
        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| KioskError::AudioDevice("No input device available".to_string()))?;
        info!(
            "🎤 Using input device: {}",
            device.name().unwrap_or_else(|_| "Unknown".to_string())
        );
        let default_config = device.default_input_config()?;
        debug!("Default input config: {:?}", default_config);

        let stream_config = StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Fixed(buffer_size as u32),
        };

        let mut pending = Vec::with_capacity(buffer_size);
        let stream = device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                for &sample in data {
                    pending.push(sample);
                    if pending.len() >= buffer_size {
                        // Receiver gone means the capture finished; drop quietly.
                        let _ = chunk_tx.send(std::mem::replace(
                            &mut pending,
                            Vec::with_capacity(buffer_size),
                        ));
                    }
                }
            },
            move |err| {
                warn!("Audio input stream error: {}", err);
            },
            None,
        )?;
        stream.play()?;
        Ok(stream)
    }
}

impl MicrophoneSource for CpalMicrophone {
    fn open(&self) -> KioskResult<MicStream> {
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<KioskResult<()>>(1);
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let sample_rate = self.sample_rate;
        let buffer_size = self.buffer_size;

        thread::Builder::new()
            .name("concierge-mic".to_string())
            .spawn(move || {
                let stream = match Self::start_stream(sample_rate, buffer_size, chunk_tx) {
                    Ok(s) => {
                        let _ = ready_tx.send(Ok(()));
                        s
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Blocks until the MicStream (and with it `release_tx`) is dropped.
                let _ = release_rx.recv();
                drop(stream);
                debug!("microphone released");
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(MicStream::new(sample_rate, chunk_rx, release_tx)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(KioskError::AudioDevice(
                "microphone thread exited before reporting".to_string(),
            )),
        }
    }
}

/// Outcome of the buffered-mode amplitude gate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GateDecision {
    /// Loud enough, or undecodable (fail-open): send it.
    Send { rms: Option<f32> },
    /// Near-silent: never submitted.
    Suppress { rms: f32 },
}

impl GateDecision {
    pub fn should_send(&self) -> bool {
        matches!(self, GateDecision::Send { .. })
    }
}

/// Decode an utterance and compare its RMS with `threshold`.
pub fn amplitude_gate(audio: &EncodedAudio, threshold: f32) -> GateDecision {
    match decoded_rms(&audio.bytes) {
        Some(level) if level < threshold => GateDecision::Suppress { rms: level },
        Some(level) => GateDecision::Send { rms: Some(level) },
        None => {
            warn!("could not decode captured audio for the gate, sending anyway");
            GateDecision::Send { rms: None }
        }
    }
}

/// Requires `required` consecutive windows at or above `threshold`.
#[derive(Debug, Clone)]
pub struct EnergyTrigger {
    threshold: f32,
    required: u32,
    consecutive: u32,
}

impl EnergyTrigger {
    pub fn new(threshold: f32, required: u32) -> Self {
        Self {
            threshold,
            required: required.max(1),
            consecutive: 0,
        }
    }

    /// Feed one window's RMS. Returns true once the trigger has fired.
    pub fn feed(&mut self, window_rms: f32) -> bool {
        if window_rms >= self.threshold {
            self.consecutive += 1;
        } else {
            self.consecutive = 0;
        }
        self.fired()
    }

    pub fn fired(&self) -> bool {
        self.consecutive >= self.required
    }
}

/// How a streaming-mode capture ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// The trigger never fired within the timeout. Nothing was sent.
    NoSpeech,
    /// Frames were emitted until the consumer hung up.
    Ended { frames: u64 },
}

/// Releases the busy flag on every exit path.
struct ActiveCapture(Arc<AtomicBool>);

impl Drop for ActiveCapture {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Stops whichever capture is currently running on a channel.
#[derive(Clone)]
pub struct CaptureStopper(Arc<Notify>);

impl CaptureStopper {
    pub fn stop(&self) {
        self.0.notify_waiters();
    }
}

/// One microphone, one capture at a time.
pub struct AudioCaptureChannel {
    mic: Arc<dyn MicrophoneSource>,
    config: CaptureConfig,
    active: Arc<AtomicBool>,
    stop: Arc<Notify>,
}

impl AudioCaptureChannel {
    pub fn new(mic: Arc<dyn MicrophoneSource>, config: CaptureConfig) -> Self {
        Self {
            mic,
            config,
            active: Arc::new(AtomicBool::new(false)),
            stop: Arc::new(Notify::new()),
        }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn stopper(&self) -> CaptureStopper {
        CaptureStopper(Arc::clone(&self.stop))
    }

    fn begin(&self) -> KioskResult<ActiveCapture> {
        self.active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| KioskError::CaptureBusy)?;
        Ok(ActiveCapture(Arc::clone(&self.active)))
    }

    /// Record for `duration` (or until stopped) and return one encoded unit.
    pub async fn capture(&self, duration: Duration) -> KioskResult<EncodedAudio> {
        let _active = self.begin()?;
        let mut mic = self.mic.open()?;
        let mut samples: Vec<f32> = Vec::with_capacity(mic.sample_rate as usize * 5);
        let deadline = sleep(duration);
        tokio::pin!(deadline);
        let stopped = self.stop.notified();
        tokio::pin!(stopped);

        loop {
            tokio::select! {
                chunk = mic.chunks.recv() => match chunk {
                    Some(c) => samples.extend_from_slice(&c),
                    None => {
                        return Err(KioskError::AudioStream("microphone stream ended".to_string()));
                    }
                },
                _ = &mut deadline => break,
                _ = &mut stopped => {
                    debug!("capture stopped externally");
                    break;
                }
            }
        }
        // Pick up anything the device delivered right at the deadline.
        while let Ok(c) = mic.chunks.try_recv() {
            samples.extend_from_slice(&c);
        }
        debug!(samples = samples.len(), "buffered capture complete");
        Ok(EncodedAudio::from_samples(&samples, mic.sample_rate))
    }

    /// Apply the configured quiet threshold to a captured unit.
    pub fn gate(&self, audio: &EncodedAudio) -> GateDecision {
        amplitude_gate(audio, self.config.quiet_rms)
    }

    /// Streaming mode: wait for the energy trigger, call `on_open`, then emit
    /// frames every `frame_interval` into `frames` until its receiver is dropped.
    pub async fn stream_utterance<F>(
        &self,
        frames: mpsc::Sender<AudioFrame>,
        on_open: F,
    ) -> KioskResult<StreamOutcome>
    where
        F: FnOnce() + Send,
    {
        let _active = self.begin()?;
        let mut mic = self.mic.open()?;
        let window_len = self.config.window_samples();
        let mut trigger = EnergyTrigger::new(self.config.trigger_rms, self.config.trigger_windows);

        // Windows that make up the current loud run, kept so speech onset is not lost.
        let mut onset: Vec<f32> = Vec::new();
        let mut window: Vec<f32> = Vec::with_capacity(window_len);
        let give_up = Instant::now() + self.config.trigger_timeout();

        'trigger: loop {
            let chunk = tokio::select! {
                chunk = mic.chunks.recv() => chunk,
                _ = tokio::time::sleep_until(give_up) => {
                    debug!("no speech before trigger timeout");
                    return Ok(StreamOutcome::NoSpeech);
                }
            };
            let Some(chunk) = chunk else {
                return Err(KioskError::AudioStream("microphone stream ended".to_string()));
            };
            for sample in chunk {
                window.push(sample);
                if window.len() < window_len {
                    continue;
                }
                let level = rms(&window);
                if trigger.feed(level) {
                    onset.extend_from_slice(&window);
                    window.clear();
                    info!(rms = level, "🎙️ energy trigger fired, streaming");
                    break 'trigger;
                }
                if level >= self.config.trigger_rms {
                    onset.extend_from_slice(&window);
                } else {
                    onset.clear();
                }
                window.clear();
            }
        }

        on_open();
        let mut sequencer = FrameSequencer::new(mic.sample_rate);
        let mut pending = onset;
        pending.extend_from_slice(&window);
        let mut ticker = interval(self.config.frame_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            loop {
                match mic.chunks.try_recv() {
                    Ok(c) => pending.extend_from_slice(&c),
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        return Err(KioskError::AudioStream("microphone stream ended".to_string()));
                    }
                }
            }
            if frames.is_closed() {
                break;
            }
            if pending.is_empty() {
                continue;
            }
            let frame = sequencer.frame(&pending);
            pending.clear();
            if frames.send(frame).await.is_err() {
                break;
            }
        }
        let emitted = sequencer.emitted();
        debug!(frames = emitted, "streaming capture ended by consumer");
        Ok(StreamOutcome::Ended { frames: emitted })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Microphone that replays scripted chunks, then stays open and silent.
    pub(crate) struct ScriptedMic {
        pub sample_rate: u32,
        script: Mutex<Vec<Vec<f32>>>,
        pub opens: std::sync::atomic::AtomicUsize,
    }

    impl ScriptedMic {
        pub(crate) fn new(chunks: Vec<Vec<f32>>) -> Self {
            Self {
                sample_rate: 16_000,
                script: Mutex::new(chunks),
                opens: std::sync::atomic::AtomicUsize::new(0),
            }
        }
    }

    impl MicrophoneSource for ScriptedMic {
        fn open(&self) -> KioskResult<MicStream> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::unbounded_channel();
            for chunk in self.script.lock().unwrap().drain(..) {
                tx.send(chunk).unwrap();
            }
            // Keep the sender alive so the stream looks like an open device.
            Ok(MicStream::new(self.sample_rate, rx, tx))
        }
    }

    struct DeniedMic;

    impl MicrophoneSource for DeniedMic {
        fn open(&self) -> KioskResult<MicStream> {
            Err(KioskError::AudioDevice("permission denied".to_string()))
        }
    }

    pub(crate) fn level(amplitude: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| if i % 2 == 0 { amplitude } else { -amplitude })
            .collect()
    }

    fn channel(mic: ScriptedMic) -> AudioCaptureChannel {
        AudioCaptureChannel::new(Arc::new(mic), CaptureConfig::default())
    }

    #[test]
    fn trigger_needs_consecutive_loud_windows() {
        let mut t = EnergyTrigger::new(0.02, 3);
        assert!(!t.feed(0.05));
        assert!(!t.feed(0.001));
        assert!(!t.feed(0.05));
        assert!(!t.feed(0.05));
        assert!(t.feed(0.05));
    }

    #[test]
    fn one_loud_then_one_quiet_window_does_not_trigger() {
        let mut t = EnergyTrigger::new(0.02, 3);
        t.feed(0.5);
        t.feed(0.0);
        assert!(!t.fired());
    }

    #[test]
    fn gate_suppresses_quiet_audio() {
        let quiet = EncodedAudio::from_samples(&level(0.004, 16_000), 16_000);
        assert!(matches!(amplitude_gate(&quiet, 0.008), GateDecision::Suppress { .. }));
        let loud = EncodedAudio::from_samples(&level(0.1, 16_000), 16_000);
        assert!(amplitude_gate(&loud, 0.008).should_send());
    }

    #[test]
    fn gate_fails_open_on_undecodable_audio() {
        let junk = EncodedAudio {
            bytes: b"webm-ish garbage".to_vec(),
            sample_rate: 16_000,
            sample_count: 0,
        };
        assert_eq!(amplitude_gate(&junk, 0.008), GateDecision::Send { rms: None });
    }

    #[tokio::test(start_paused = true)]
    async fn buffered_capture_collects_until_duration() {
        let ch = channel(ScriptedMic::new(vec![level(0.1, 480); 10]));
        let audio = ch.capture(Duration::from_millis(500)).await.unwrap();
        assert_eq!(audio.sample_count, 4800);
        assert!(!ch.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn second_concurrent_capture_is_rejected() {
        let ch = Arc::new(channel(ScriptedMic::new(vec![])));
        let first = {
            let ch = Arc::clone(&ch);
            tokio::spawn(async move { ch.capture(Duration::from_secs(1)).await })
        };
        tokio::task::yield_now().await;
        assert!(ch.is_active());
        assert!(matches!(
            ch.capture(Duration::from_secs(1)).await,
            Err(KioskError::CaptureBusy)
        ));
        assert!(first.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn capture_can_be_stopped_early() {
        let ch = Arc::new(channel(ScriptedMic::new(vec![level(0.1, 480)])));
        let stopper = ch.stopper();
        let task = {
            let ch = Arc::clone(&ch);
            tokio::spawn(async move { ch.capture(Duration::from_secs(60)).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        stopper.stop();
        let audio = task.await.unwrap().unwrap();
        assert_eq!(audio.sample_count, 480);
    }

    #[tokio::test]
    async fn denied_microphone_fails_capture_and_releases_channel() {
        let ch = AudioCaptureChannel::new(Arc::new(DeniedMic), CaptureConfig::default());
        assert!(matches!(
            ch.capture(Duration::from_millis(10)).await,
            Err(KioskError::AudioDevice(_))
        ));
        assert!(!ch.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn streaming_does_not_open_on_isolated_noise() {
        // loud, quiet, loud, quiet ... never three in a row
        let mut script = Vec::new();
        for i in 0..20 {
            script.push(level(if i % 2 == 0 { 0.3 } else { 0.0 }, 480));
        }
        let ch = channel(ScriptedMic::new(script));
        let (tx, mut rx) = mpsc::channel(8);
        let mut opened = false;
        let outcome = ch.stream_utterance(tx, || opened = true).await.unwrap();
        assert_eq!(outcome, StreamOutcome::NoSpeech);
        assert!(!opened);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn streaming_emits_ordered_frames_after_trigger() {
        let mut script = vec![level(0.0, 480); 4];
        script.extend(vec![level(0.2, 480); 3]);
        let ch = channel(ScriptedMic::new(script));
        let (tx, mut rx) = mpsc::channel(8);
        let mut opened = false;
        let consumer = tokio::spawn(async move {
            let first = rx.recv().await.unwrap();
            drop(rx);
            first
        });
        let outcome = ch.stream_utterance(tx, || opened = true).await.unwrap();
        let first = consumer.await.unwrap();
        assert!(opened);
        assert_eq!(first.sequence, 0);
        // the three triggering windows are carried in the first frame
        assert!(first.payload.starts_with(b"RIFF"));
        assert_eq!(first.payload.len(), 44 + 3 * 480 * 2);
        assert!(matches!(outcome, StreamOutcome::Ended { frames: 1 }));
    }
}
