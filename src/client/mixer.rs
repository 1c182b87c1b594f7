//! Sums microphone and system audio into one outgoing track so a single
//! sender carries both.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::broadcast::{self, error::TryRecvError};

use super::g711;
use super::track::{LocalTrack, MediaFrame, TrackSource};
use super::transport::MediaKind;

const MIX_PERIOD: Duration = Duration::from_millis(20);

/// Mix two µ-law frames sample by sample with saturation. The shorter input
/// is padded with silence.
pub fn mix_frames(a: &[u8], b: &[u8]) -> Vec<u8> {
    let len = a.len().max(b.len());
    (0..len)
        .map(|i| {
            let x = i32::from(g711::decode(a.get(i).copied().unwrap_or(g711::SILENCE)));
            let y = i32::from(g711::decode(b.get(i).copied().unwrap_or(g711::SILENCE)));
            let sum = (x + y).clamp(i32::from(i16::MIN), i32::from(i16::MAX));
            g711::encode(sum as i16)
        })
        .collect()
}

fn latest(rx: &mut broadcast::Receiver<MediaFrame>) -> Option<MediaFrame> {
    let mut last = None;
    loop {
        match rx.try_recv() {
            Ok(frame) => last = Some(frame),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty | TryRecvError::Closed) => return last,
        }
    }
}

/// Start mixing `primary` and `secondary`. The returned track runs until it
/// is stopped or either input stops.
pub fn start(primary: &LocalTrack, secondary: &LocalTrack) -> LocalTrack {
    let output = LocalTrack::new(MediaKind::Audio, TrackSource::Mixed, "mixed audio");
    let out = output.clone();
    let primary = primary.clone();
    let secondary = secondary.clone();
    tokio::spawn(async move {
        let mut a = primary.subscribe();
        let mut b = secondary.subscribe();
        let mut ticker = tokio::time::interval(MIX_PERIOD);
        loop {
            tokio::select! {
                _ = out.stopped() => break,
                _ = primary.stopped() => break,
                _ = secondary.stopped() => break,
                _ = ticker.tick() => {
                    let (fa, fb) = (latest(&mut a), latest(&mut b));
                    if fa.is_none() && fb.is_none() {
                        continue;
                    }
                    let empty = Bytes::new();
                    let mixed = mix_frames(
                        fa.as_ref().map_or(&empty, |f| &f.data),
                        fb.as_ref().map_or(&empty, |f| &f.data),
                    );
                    out.push(MediaFrame {
                        data: Bytes::from(mixed),
                        duration: MIX_PERIOD,
                    });
                }
            }
        }
        out.stop();
    });
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_is_identity() {
        let voice = g711::encode_frame(&[1000, -2000, 300]);
        assert_eq!(mix_frames(&voice, &[g711::SILENCE; 3]), voice);
        assert_eq!(mix_frames(&voice, &[]), voice);
    }

    #[test]
    fn mixing_sums_and_saturates() {
        let a = g711::encode_frame(&[1000, 30000]);
        let b = g711::encode_frame(&[1000, 30000]);
        let mixed = g711::decode_frame(&mix_frames(&a, &b));
        assert!((mixed[0] - 2000).abs() < 100);
        assert!(mixed[1] > 30000);
    }

    #[tokio::test(start_paused = true)]
    async fn mixer_follows_input_lifetime() {
        let mic = LocalTrack::new(MediaKind::Audio, TrackSource::Device, "mic");
        let system = LocalTrack::new(MediaKind::Audio, TrackSource::External, "system audio");
        let mixed = start(&mic, &system);
        let mut rx = mixed.subscribe();
        tokio::task::yield_now().await;

        mic.push(MediaFrame {
            data: Bytes::from(g711::encode_frame(&[500; 4])),
            duration: MIX_PERIOD,
        });
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.data.len(), 4);

        system.stop();
        tokio::time::sleep(MIX_PERIOD * 2).await;
        assert!(mixed.is_stopped());
    }
}
