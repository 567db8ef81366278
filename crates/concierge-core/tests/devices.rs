//! Real microphone and speaker.
//!
//! Note: These tests require audio devices and will not work in CI environments.

mod common;

use common::init_tracing;
use concierge_core::{
    AudioCaptureChannel, AudioSink, CaptureConfig, CpalMicrophone, RodioSink,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
#[ignore] // Requires a microphone
async fn capture_two_seconds_from_default_input() {
    init_tracing();
    println!("Input devices: {:?}", CpalMicrophone::list_input_devices().unwrap());

    let config = CaptureConfig::default();
    let channel = AudioCaptureChannel::new(Arc::new(CpalMicrophone::new(config.sample_rate)), config);
    let audio = channel.capture(Duration::from_secs(2)).await.unwrap();

    println!("captured {} samples, gate: {:?}", audio.sample_count, channel.gate(&audio));
    assert!(audio.sample_count > 0);
    assert!(!channel.is_active());
}

#[tokio::test]
#[ignore] // Requires a speaker
async fn play_one_second_tone() {
    init_tracing();
    let mut sink = RodioSink::new().unwrap();
    let tone: Vec<i16> = (0..16_000)
        .map(|i| ((i as f32 * 440.0 * std::f32::consts::TAU / 16_000.0).sin() * 8_000.0) as i16)
        .collect();

    sink.play_pcm(tone, 1, 16_000).unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    println!("amplitude mid-tone: {:.3}", sink.tap().level());
    while !sink.is_idle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(sink.tap().level(), 0.0);
}
