//! Audio devices through cpal.
//!
//! cpal streams are not `Send`, so each stream lives on its own thread for as
//! long as its track (or playback handle) is alive.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::MediaError;

use super::g711;
use super::media::DeviceProvider;
use super::track::{LocalTrack, MediaFrame, TrackSource};
use super::transport::MediaKind;

const FRAME_DURATION: Duration = Duration::from_millis(20);
const PARK_INTERVAL: Duration = Duration::from_millis(100);

/// Turns device-rate interleaved samples into 20 ms µ-law frames at 8 kHz.
pub struct Downsampler {
    device_rate: u32,
    acc: u32,
    channels: usize,
    pending: Vec<i16>,
}

impl Downsampler {
    pub fn new(device_rate: u32, channels: u16) -> Self {
        Self {
            device_rate: device_rate.max(g711::SAMPLE_RATE),
            acc: 0,
            channels: usize::from(channels.max(1)),
            pending: Vec::with_capacity(g711::FRAME_SAMPLES),
        }
    }

    /// Feed interleaved samples in `[-1.0, 1.0]`; returns completed frames.
    pub fn feed(&mut self, interleaved: &[f32]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        for frame in interleaved.chunks(self.channels) {
            self.acc += g711::SAMPLE_RATE;
            if self.acc < self.device_rate {
                continue;
            }
            self.acc -= self.device_rate;
            let mono = frame.iter().sum::<f32>() / frame.len() as f32;
            self.pending
                .push((mono.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16);
            if self.pending.len() == g711::FRAME_SAMPLES {
                frames.push(g711::encode_frame(&self.pending));
                self.pending.clear();
            }
        }
        frames
    }
}

/// Opens the default input device. There is no camera backend.
pub struct CpalDevices;

#[async_trait]
impl DeviceProvider for CpalDevices {
    async fn open_microphone(&self) -> Result<LocalTrack, MediaError> {
        let (ready_tx, ready_rx) = oneshot::channel();
        std::thread::Builder::new()
            .name("mic-capture".into())
            .spawn(move || run_capture(ready_tx))
            .map_err(|e| MediaError::Device(e.to_string()))?;
        ready_rx
            .await
            .map_err(|_| MediaError::Device("capture thread exited".into()))?
    }

    async fn open_camera(&self) -> Result<LocalTrack, MediaError> {
        Err(MediaError::Unavailable("camera"))
    }
}

fn run_capture(ready: oneshot::Sender<Result<LocalTrack, MediaError>>) {
    let opened = open_input();
    let (stream, track) = match opened {
        Ok(pair) => pair,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let stop = track.stop_token();
    info!(device = %track.label(), "Microphone capture started");
    if ready.send(Ok(track)).is_err() {
        return;
    }
    while !stop.is_cancelled() {
        std::thread::sleep(PARK_INTERVAL);
    }
    drop(stream);
    debug!("Microphone capture stopped");
}

fn open_input() -> Result<(cpal::Stream, LocalTrack), MediaError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(MediaError::Unavailable("microphone"))?;
    let config = device
        .default_input_config()
        .map_err(|e| MediaError::Device(e.to_string()))?;
    let label = device.name().unwrap_or_else(|_| "microphone".into());
    let track = LocalTrack::new(MediaKind::Audio, TrackSource::Device, label);
    let downsampler = Downsampler::new(config.sample_rate().0, config.channels());

    let format = config.sample_format();
    let stream_config: cpal::StreamConfig = config.into();
    let stream = match format {
        SampleFormat::F32 => build_input::<f32>(&device, &stream_config, downsampler, track.clone()),
        SampleFormat::I16 => build_input::<i16>(&device, &stream_config, downsampler, track.clone()),
        SampleFormat::U16 => build_input::<u16>(&device, &stream_config, downsampler, track.clone()),
        other => Err(MediaError::Device(format!("unsupported sample format {other:?}"))),
    }?;
    stream.play().map_err(|e| MediaError::Device(e.to_string()))?;
    Ok((stream, track))
}

fn build_input<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut downsampler: Downsampler,
    track: LocalTrack,
) -> Result<cpal::Stream, MediaError>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let mut scratch = Vec::new();
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                scratch.clear();
                scratch.extend(data.iter().map(|s| s.to_sample::<f32>()));
                for frame in downsampler.feed(&scratch) {
                    track.push(MediaFrame {
                        data: Bytes::from(frame),
                        duration: FRAME_DURATION,
                    });
                }
            },
            |err| warn!(error = %err, "Input stream error"),
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => MediaError::Unavailable("microphone"),
            other => MediaError::Device(other.to_string()),
        })
}

struct PlaybackInner {
    queues: parking_lot::Mutex<HashMap<String, VecDeque<f32>>>,
    output_rate: AtomicU32,
    stop: CancellationToken,
}

/// Plays decoded remote audio on the default output device. Each remote
/// track has its own queue; the output callback sums them.
#[derive(Clone)]
pub struct Playback {
    inner: Arc<PlaybackInner>,
}

impl Playback {
    fn detached(output_rate: u32) -> Self {
        Self {
            inner: Arc::new(PlaybackInner {
                queues: parking_lot::Mutex::new(HashMap::new()),
                output_rate: AtomicU32::new(output_rate),
                stop: CancellationToken::new(),
            }),
        }
    }

    /// Open the default output device.
    pub fn start() -> Result<Self, MediaError> {
        let playback = Self::detached(48_000);
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let handle = playback.clone();
        std::thread::Builder::new()
            .name("playback".into())
            .spawn(move || handle.run(ready_tx))
            .map_err(|e| MediaError::Device(e.to_string()))?;
        ready_rx
            .recv()
            .map_err(|_| MediaError::Device("playback thread exited".into()))??;
        Ok(playback)
    }

    fn run(self, ready: std::sync::mpsc::Sender<Result<(), MediaError>>) {
        let stream = match self.open_output() {
            Ok(stream) => stream,
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        };
        let _ = ready.send(Ok(()));
        while !self.inner.stop.is_cancelled() {
            std::thread::sleep(PARK_INTERVAL);
        }
        drop(stream);
    }

    fn open_output(&self) -> Result<cpal::Stream, MediaError> {
        let device = cpal::default_host()
            .default_output_device()
            .ok_or(MediaError::Unavailable("speaker"))?;
        let config = device
            .default_output_config()
            .map_err(|e| MediaError::Device(e.to_string()))?;
        self.inner
            .output_rate
            .store(config.sample_rate().0, Ordering::Relaxed);
        let format = config.sample_format();
        let stream_config: cpal::StreamConfig = config.into();
        let stream = match format {
            SampleFormat::F32 => self.build_output::<f32>(&device, &stream_config),
            SampleFormat::I16 => self.build_output::<i16>(&device, &stream_config),
            SampleFormat::U16 => self.build_output::<u16>(&device, &stream_config),
            other => Err(MediaError::Device(format!("unsupported sample format {other:?}"))),
        }?;
        stream.play().map_err(|e| MediaError::Device(e.to_string()))?;
        Ok(stream)
    }

    fn build_output<T>(&self, device: &cpal::Device, config: &cpal::StreamConfig) -> Result<cpal::Stream, MediaError>
    where
        T: SizedSample + FromSample<f32> + Send + 'static,
    {
        let channels = usize::from(config.channels.max(1));
        let playback = self.clone();
        let mut mono = Vec::new();
        device
            .build_output_stream(
                config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    mono.resize(data.len() / channels, 0.0);
                    playback.fill(&mut mono);
                    for (frame, value) in data.chunks_mut(channels).zip(mono.iter()) {
                        for sample in frame {
                            *sample = T::from_sample(*value);
                        }
                    }
                },
                |err| warn!(error = %err, "Output stream error"),
                None,
            )
            .map_err(|e| MediaError::Device(e.to_string()))
    }

    /// Queue 8 kHz PCM from `source`, resampled to the output rate. At most
    /// one second is kept per source.
    pub fn push(&self, source: &str, pcm: &[i16]) {
        let rate = self.inner.output_rate.load(Ordering::Relaxed);
        let step = f64::from(g711::SAMPLE_RATE) / f64::from(rate.max(1));
        let limit = rate as usize;
        let mut queues = self.inner.queues.lock();
        let queue = queues.entry(source.to_string()).or_default();
        let mut position = 0.0f64;
        while (position as usize) < pcm.len() {
            queue.push_back(f32::from(pcm[position as usize]) / f32::from(i16::MAX));
            position += step;
        }
        let excess = queue.len().saturating_sub(limit);
        queue.drain(..excess);
    }

    pub fn remove(&self, source: &str) {
        self.inner.queues.lock().remove(source);
    }

    /// Fill `out` with the sum of all sources, silence where they run dry.
    fn fill(&self, out: &mut [f32]) {
        let mut queues = self.inner.queues.lock();
        for value in out.iter_mut() {
            let sum: f32 = queues.values_mut().filter_map(VecDeque::pop_front).sum();
            *value = sum.clamp(-1.0, 1.0);
        }
    }

    pub fn stop(&self) {
        self.inner.stop.cancel();
    }
}
