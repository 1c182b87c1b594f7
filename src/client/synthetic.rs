//! Stand-in media used until (or instead of) real devices.

use std::f32::consts::TAU;
use std::time::Duration;

use bytes::Bytes;

use super::g711;
use super::track::{LocalTrack, MediaFrame, TrackSource};
use super::transport::MediaKind;

const TONE_HZ: f32 = 440.0;
/// Quiet enough to be inaudible, loud enough not to read as a dead line.
const TONE_AMPLITUDE: f32 = 24.0;
const AUDIO_FRAME: Duration = Duration::from_millis(20);

pub const PATTERN_WIDTH: usize = 160;
pub const PATTERN_HEIGHT: usize = 120;
const PATTERN_FRAME: Duration = Duration::from_millis(500);
const BAR_WIDTH: usize = 16;

/// One 20 ms µ-law frame of the tone, advancing `phase`.
pub fn tone_frame(phase: &mut f32) -> Vec<u8> {
    let step = TAU * TONE_HZ / g711::SAMPLE_RATE as f32;
    let mut out = Vec::with_capacity(g711::FRAME_SAMPLES);
    for _ in 0..g711::FRAME_SAMPLES {
        out.push(g711::encode((phase.sin() * TONE_AMPLITUDE) as i16));
        *phase = (*phase + step) % TAU;
    }
    out
}

/// Grayscale test pattern: dark background with a bright vertical bar that
/// moves one bar-width per frame.
pub fn pattern_frame(tick: u64, width: usize, height: usize) -> Vec<u8> {
    let bar_start = (tick as usize * BAR_WIDTH) % width.max(1);
    let mut out = vec![0x20u8; width * height];
    for row in out.chunks_mut(width.max(1)) {
        for x in bar_start..(bar_start + BAR_WIDTH).min(width) {
            row[x] = 0xE0;
        }
    }
    out
}

/// Start a synthetic audio track. Frames flow until the track is stopped.
pub fn tone() -> LocalTrack {
    let track = LocalTrack::new(MediaKind::Audio, TrackSource::Synthetic, "synthetic tone");
    let producer = track.clone();
    tokio::spawn(async move {
        let mut phase = 0.0f32;
        let mut ticker = tokio::time::interval(AUDIO_FRAME);
        loop {
            tokio::select! {
                _ = producer.stopped() => break,
                _ = ticker.tick() => producer.push(MediaFrame {
                    data: Bytes::from(tone_frame(&mut phase)),
                    duration: AUDIO_FRAME,
                }),
            }
        }
    });
    track
}

/// Start a synthetic video track at 2 frames per second.
pub fn pattern() -> LocalTrack {
    let track = LocalTrack::new(MediaKind::Video, TrackSource::Synthetic, "synthetic pattern");
    let producer = track.clone();
    tokio::spawn(async move {
        let mut tick = 0u64;
        let mut ticker = tokio::time::interval(PATTERN_FRAME);
        loop {
            tokio::select! {
                _ = producer.stopped() => break,
                _ = ticker.tick() => {
                    producer.push(MediaFrame {
                        data: Bytes::from(pattern_frame(tick, PATTERN_WIDTH, PATTERN_HEIGHT)),
                        duration: PATTERN_FRAME,
                    });
                    tick = tick.wrapping_add(1);
                }
            }
        }
    });
    track
}
