//! Audio units and the arithmetic both capture modes share.
//!
//! Samples are f32 normalized to -1.0..1.0 inside the kiosk; on the wire they
//! are little-endian 16-bit mono PCM in a WAV container, both for the buffered
//! upload and for each streamed frame.

use std::io::Cursor;
use tokio::time::Instant;

/// One streaming-mode frame: produced once by capture, consumed once by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// A complete WAV chunk (16-bit mono PCM) the service can decode on its own.
    pub payload: Vec<u8>,
    /// Strictly increasing within a turn, starting at 0.
    pub sequence: u64,
    /// Milliseconds since the turn's capture started.
    pub timestamp_ms: u64,
}

/// One buffered-mode utterance, encoded for upload.
#[derive(Debug, Clone)]
pub struct EncodedAudio {
    /// WAV container bytes.
    pub bytes: Vec<u8>,
    pub sample_rate: u32,
    /// Length of the raw capture in samples.
    pub sample_count: usize,
}

impl EncodedAudio {
    pub fn from_samples(samples: &[f32], sample_rate: u32) -> Self {
        Self {
            bytes: pcm_f32_to_wav(samples, sample_rate),
            sample_rate,
            sample_count: samples.len(),
        }
    }
}

/// Stamps and encodes frames for one turn.
#[derive(Debug)]
pub struct FrameSequencer {
    next: u64,
    sample_rate: u32,
    started: Instant,
}

impl FrameSequencer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            next: 0,
            sample_rate,
            started: Instant::now(),
        }
    }

    pub fn frame(&mut self, samples: &[f32]) -> AudioFrame {
        let frame = AudioFrame {
            payload: pcm_f32_to_wav(samples, self.sample_rate),
            sequence: self.next,
            timestamp_ms: self.started.elapsed().as_millis() as u64,
        };
        self.next += 1;
        frame
    }

    /// Frames stamped so far.
    pub fn emitted(&self) -> u64 {
        self.next
    }
}

/// Root-mean-square level of a block of samples. Empty input is silent.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / samples.len() as f64).sqrt() as f32
}

pub fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * 32767.0).round() as i16
}

pub fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

pub fn f32_to_pcm16_le(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        out.extend_from_slice(&f32_to_i16(s).to_le_bytes());
    }
    out
}

/// Decode little-endian 16-bit PCM. A trailing odd byte is dropped.
pub fn pcm16_le_to_i16(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Encode f32 PCM (mono) to 16-bit WAV bytes for upload or a streamed frame.
pub fn pcm_f32_to_wav(samples: &[f32], sample_rate: u32) -> Vec<u8> {
    let data_len = (samples.len() * 2) as u32;
    let mut buf = Vec::with_capacity(44 + data_len as usize);
    // RIFF header
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&(36 + data_len).to_le_bytes());
    buf.extend_from_slice(b"WAVE");
    // fmt subchunk
    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM
    buf.extend_from_slice(&1u16.to_le_bytes()); // mono
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    buf.extend_from_slice(&(sample_rate * 2).to_le_bytes()); // byte rate
    buf.extend_from_slice(&2u16.to_le_bytes()); // block align
    buf.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
    // data subchunk
    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&data_len.to_le_bytes());
    buf.extend_from_slice(&f32_to_pcm16_le(samples));
    buf
}

/// Decode an encoded unit (WAV/MP3/...) and compute RMS over all samples.
/// Returns `None` when the unit cannot be decoded.
pub fn decoded_rms(bytes: &[u8]) -> Option<f32> {
    let decoder = rodio::Decoder::new(Cursor::new(bytes.to_vec())).ok()?;
    let mut sum = 0.0f64;
    let mut count = 0usize;
    for sample in decoder {
        let s = i16_to_f32(sample) as f64;
        sum += s * s;
        count += 1;
    }
    if count == 0 {
        return Some(0.0);
    }
    Some((sum / count as f64).sqrt() as f32)
}
