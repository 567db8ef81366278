//! ResponsePlaybackSynchronizer - plays the answer and feeds lipsync
//!
//! The sink is wrapped in an analysis tap: the audio thread stores a running
//! RMS into an atomic after every block it renders, and the render tick reads
//! it. Neither side ever waits on the other.

use crate::config::PlaybackConfig;
use crate::error::{KioskError, KioskResult};
use crate::transport::{AudioStart, ReplyAudio, ReplyEvent};
use rodio::{OutputStream, Sink, Source};
use std::io::Cursor;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Samples per amplitude update on the audio thread.
const TAP_BLOCK: usize = 256;

/// Rate assumed for PCM that arrives without an `audio_start`.
const FALLBACK_SAMPLE_RATE: u32 = 16_000;

/// Latest output amplitude, shared lock-free between the sink and the avatar.
#[derive(Debug, Clone, Default)]
pub struct AmplitudeTap(Arc<AtomicU32>);

impl AmplitudeTap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, level: f32) {
        self.0.store(level.to_bits(), Ordering::Relaxed);
    }

    pub fn level(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// Source adapter that reports block RMS into an [`AmplitudeTap`].
pub struct Tapped<S> {
    inner: S,
    tap: AmplitudeTap,
    sum: f32,
    count: usize,
}

impl<S> Tapped<S> {
    pub fn new(inner: S, tap: AmplitudeTap) -> Self {
        Self {
            inner,
            tap,
            sum: 0.0,
            count: 0,
        }
    }
}

impl<S: Source<Item = f32>> Iterator for Tapped<S> {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        match self.inner.next() {
            Some(sample) => {
                self.sum += sample * sample;
                self.count += 1;
                if self.count >= TAP_BLOCK {
                    self.tap.set((self.sum / self.count as f32).sqrt());
                    self.sum = 0.0;
                    self.count = 0;
                }
                Some(sample)
            }
            None => {
                self.tap.set(0.0);
                None
            }
        }
    }
}

impl<S: Source<Item = f32>> Source for Tapped<S> {
    fn current_frame_len(&self) -> Option<usize> {
        self.inner.current_frame_len()
    }

    fn channels(&self) -> u16 {
        self.inner.channels()
    }

    fn sample_rate(&self) -> u32 {
        self.inner.sample_rate()
    }

    fn total_duration(&self) -> Option<Duration> {
        self.inner.total_duration()
    }
}

/// Where answer audio goes.
pub trait AudioSink: Send {
    /// Queue an encoded resource (WAV/MP3/...).
    fn play_encoded(&mut self, bytes: Vec<u8>) -> KioskResult<()>;
    /// Queue raw interleaved 16-bit PCM.
    fn play_pcm(&mut self, samples: Vec<i16>, channels: u16, sample_rate: u32) -> KioskResult<()>;
    /// Nothing queued or playing.
    fn is_idle(&self) -> bool;
    /// Drop everything queued.
    fn stop(&mut self);
    fn tap(&self) -> AmplitudeTap;
}

/// Fetches a resource referenced by a buffered reply.
#[async_trait::async_trait]
pub trait MediaSource: Send + Sync {
    async fn fetch(&self, reference: &str) -> KioskResult<Vec<u8>>;
}

/// Default output device through rodio.
///
/// `OutputStream` must stay on the thread that opened it; a parked helper
/// thread owns it until this sink is dropped.
pub struct RodioSink {
    sink: Arc<Sink>,
    tap: AmplitudeTap,
    _release: std::sync::mpsc::Sender<()>,
}

impl RodioSink {
    pub fn new() -> KioskResult<Self> {
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<KioskResult<Arc<Sink>>>(1);
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

        thread::Builder::new()
            .name("concierge-speaker".to_string())
            .spawn(move || {
                let opened = OutputStream::try_default()
                    .map_err(|e| KioskError::Playback(e.to_string()))
                    .and_then(|(stream, handle)| {
                        Sink::try_new(&handle)
                            .map(|sink| (stream, Arc::new(sink)))
                            .map_err(|e| KioskError::Playback(e.to_string()))
                    });
                match opened {
                    Ok((stream, sink)) => {
                        let _ = ready_tx.send(Ok(sink));
                        let _ = release_rx.recv();
                        drop(stream);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })?;

        let sink = ready_rx.recv().map_err(|_| {
            KioskError::Playback("speaker thread exited before reporting".to_string())
        })??;
        info!("🔊 output sink ready");
        Ok(Self {
            sink,
            tap: AmplitudeTap::new(),
            _release: release_tx,
        })
    }
}

impl AudioSink for RodioSink {
    fn play_encoded(&mut self, bytes: Vec<u8>) -> KioskResult<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let source = rodio::Decoder::new(Cursor::new(bytes))
            .map_err(|e| KioskError::Playback(format!("Decode failed: {}", e)))?;
        self.sink
            .append(Tapped::new(source.convert_samples::<f32>(), self.tap.clone()));
        Ok(())
    }

    fn play_pcm(&mut self, samples: Vec<i16>, channels: u16, sample_rate: u32) -> KioskResult<()> {
        if samples.is_empty() {
            return Ok(());
        }
        let buffer = rodio::buffer::SamplesBuffer::new(channels, sample_rate, samples);
        self.sink
            .append(Tapped::new(buffer.convert_samples::<f32>(), self.tap.clone()));
        Ok(())
    }

    fn is_idle(&self) -> bool {
        self.sink.empty()
    }

    fn stop(&mut self) {
        self.sink.stop();
        self.tap.set(0.0);
    }

    fn tap(&self) -> AmplitudeTap {
        self.tap.clone()
    }
}

/// Side information surfaced while a streamed answer plays.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackNote {
    Started(AudioStart),
    Video(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackReport {
    /// The natural end was not observed before the hard timeout.
    pub timed_out: bool,
    /// PCM samples queued (streaming mode only).
    pub samples: usize,
    pub elapsed: Duration,
}

pub struct ResponsePlaybackSynchronizer {
    sink: Box<dyn AudioSink>,
    media: Arc<dyn MediaSource>,
    config: PlaybackConfig,
}

impl ResponsePlaybackSynchronizer {
    pub fn new(sink: Box<dyn AudioSink>, media: Arc<dyn MediaSource>, config: PlaybackConfig) -> Self {
        Self {
            sink,
            media,
            config,
        }
    }

    /// The analysis tap of the active sink, for the render tick.
    pub fn tap(&self) -> AmplitudeTap {
        self.sink.tap()
    }

    /// Play one reply to completion, or until the hard timeout. The timeout
    /// runs from this call, so fetching a resource counts against it.
    ///
    /// Device and decode failures are logged and count as completion. A
    /// streaming abort (channel error, malformed frame) stops the sink and is
    /// returned so the turn can fail.
    pub async fn play<F>(&mut self, audio: ReplyAudio, mut notify: F) -> KioskResult<PlaybackReport>
    where
        F: FnMut(PlaybackNote) + Send,
    {
        let started = Instant::now();
        let mut samples = 0usize;
        let outcome = timeout(
            self.config.hard_timeout(),
            self.drive(audio, &mut notify, &mut samples),
        )
        .await;

        let timed_out = match outcome {
            Ok(Ok(())) => false,
            Ok(Err(e)) if e.is_transport() => {
                self.sink.stop();
                self.sink.tap().set(0.0);
                return Err(e);
            }
            Ok(Err(e)) => {
                warn!(error = %e, "playback failed, completing turn");
                self.sink.stop();
                false
            }
            Err(_) => {
                warn!("⏱️ playback end not observed within {:?}", self.config.hard_timeout());
                self.sink.stop();
                true
            }
        };
        self.sink.tap().set(0.0);
        let report = PlaybackReport {
            timed_out,
            samples,
            elapsed: started.elapsed(),
        };
        debug!(?report, "playback finished");
        Ok(report)
    }

    async fn drive<F>(&mut self, audio: ReplyAudio, notify: &mut F, samples: &mut usize) -> KioskResult<()>
    where
        F: FnMut(PlaybackNote) + Send,
    {
        match audio {
            ReplyAudio::None => return Ok(()),
            ReplyAudio::Resource(reference) => {
                let bytes = self
                    .media
                    .fetch(&reference)
                    .await
                    .map_err(|e| KioskError::Playback(format!("fetching {reference}: {e}")))?;
                self.sink.play_encoded(bytes)?;
            }
            ReplyAudio::Pcm(mut stream) => {
                let mut format: Option<(u16, u32)> = None;
                while let Some(event) = stream.recv().await {
                    match event {
                        ReplyEvent::Start(start) => {
                            debug!(sample_rate = start.sample_rate, channels = start.channels, "answer audio start");
                            format = Some((start.channels, start.sample_rate));
                            notify(PlaybackNote::Started(start));
                        }
                        ReplyEvent::Chunk(pcm) => {
                            let (channels, rate) = match format {
                                Some(f) => f,
                                None => {
                                    warn!("PCM before audio_start, assuming {} Hz mono", FALLBACK_SAMPLE_RATE);
                                    format = Some((1, FALLBACK_SAMPLE_RATE));
                                    (1, FALLBACK_SAMPLE_RATE)
                                }
                            };
                            *samples += pcm.len();
                            self.sink.play_pcm(pcm, channels, rate)?;
                        }
                        ReplyEvent::Video(url) => notify(PlaybackNote::Video(url)),
                        ReplyEvent::End => break,
                        ReplyEvent::Abort(e) => return Err(e),
                    }
                }
            }
        }
        self.wait_idle().await;
        Ok(())
    }

    async fn wait_idle(&mut self) {
        let mut tick = interval(self.config.render_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            if self.sink.is_idle() {
                return;
            }
        }
    }
}
