//! Local media for a call.
//!
//! A call always has a microphone track and a camera track, real or
//! synthetic, so every peer connection gets the same media lines from the
//! start. Upgrading to a real device later swaps the track inside the existing
//! sender and needs no renegotiation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::error::MediaError;

use super::mixer;
use super::synthetic;
use super::track::LocalTrack;
use super::transport::{MediaKind, PeerTransport, TrackPurpose};

/// A peer name and its current transport.
pub type PeerHandle = (String, Arc<dyn PeerTransport>);

/// Opens capture devices.
#[async_trait]
pub trait DeviceProvider: Send + Sync {
    async fn open_microphone(&self) -> Result<LocalTrack, MediaError>;
    async fn open_camera(&self) -> Result<LocalTrack, MediaError>;
}

/// Provider with nothing to open. Used by listeners and headless runs.
pub struct NoDevices;

#[async_trait]
impl DeviceProvider for NoDevices {
    async fn open_microphone(&self) -> Result<LocalTrack, MediaError> {
        Err(MediaError::Unavailable("microphone"))
    }

    async fn open_camera(&self) -> Result<LocalTrack, MediaError> {
        Err(MediaError::Unavailable("camera"))
    }
}

#[derive(Debug, Clone)]
pub struct MediaOptions {
    /// Listen-only: no device access, synthetic tracks stay muted.
    pub listener: bool,
    /// Mix system audio into the microphone sender instead of a separate one.
    pub mixing: bool,
    pub device_timeout: Duration,
}

impl Default for MediaOptions {
    fn default() -> Self {
        Self {
            listener: false,
            mixing: true,
            device_timeout: Duration::from_millis(1500),
        }
    }
}

struct Slots {
    microphone: LocalTrack,
    camera: LocalTrack,
    system_audio: Option<LocalTrack>,
    screen: Option<LocalTrack>,
    /// Microphone plus system audio while sharing with mixing enabled.
    mixed: Option<LocalTrack>,
    audio_muted: bool,
    video_muted: bool,
}

impl Slots {
    fn outgoing_audio(&self) -> LocalTrack {
        self.mixed.clone().unwrap_or_else(|| self.microphone.clone())
    }
}

pub struct MediaFoundation {
    devices: Arc<dyn DeviceProvider>,
    options: MediaOptions,
    slots: parking_lot::Mutex<Slots>,
}

impl MediaFoundation {
    /// Acquire local media, falling back to synthetic tracks for anything
    /// that is refused, missing or too slow. Returns user-facing notices for
    /// each fallback.
    pub async fn establish(devices: Arc<dyn DeviceProvider>, options: MediaOptions) -> (Self, Vec<String>) {
        let mut notices = Vec::new();

        let (microphone, camera) = if options.listener {
            info!("Listener mode, using muted synthetic media");
            let microphone = synthetic::tone();
            let camera = synthetic::pattern();
            microphone.set_enabled(false);
            camera.set_enabled(false);
            (microphone, camera)
        } else {
            let microphone = match acquire(devices.as_ref(), MediaKind::Audio, options.device_timeout).await {
                Ok(track) => track,
                Err(e) => {
                    warn!(error = %e, "Microphone unavailable, using synthetic audio");
                    notices.push(fallback_notice(&e));
                    synthetic::tone()
                }
            };
            let camera = match acquire(devices.as_ref(), MediaKind::Video, options.device_timeout).await {
                Ok(track) => track,
                Err(e) => {
                    warn!(error = %e, "Camera unavailable, using synthetic video");
                    notices.push(fallback_notice(&e));
                    synthetic::pattern()
                }
            };
            (microphone, camera)
        };

        let listener = options.listener;
        let foundation = Self {
            devices,
            options,
            slots: parking_lot::Mutex::new(Slots {
                microphone,
                camera,
                system_audio: None,
                screen: None,
                mixed: None,
                audio_muted: listener,
                video_muted: listener,
            }),
        };
        (foundation, notices)
    }

    pub fn is_listener(&self) -> bool {
        self.options.listener
    }

    /// Tracks to attach to a new peer connection, in attach order.
    pub fn attachments(&self) -> Vec<(TrackPurpose, LocalTrack)> {
        let slots = self.slots.lock();
        let mut out = vec![(TrackPurpose::Microphone, slots.outgoing_audio())];
        if slots.mixed.is_none() {
            if let Some(system) = &slots.system_audio {
                out.push((TrackPurpose::SystemAudio, system.clone()));
            }
        }
        out.push((TrackPurpose::Camera, slots.camera.clone()));
        if let Some(screen) = &slots.screen {
            out.push((TrackPurpose::Screen, screen.clone()));
        }
        out
    }

    pub fn microphone(&self) -> LocalTrack {
        self.slots.lock().microphone.clone()
    }

    pub fn camera(&self) -> LocalTrack {
        self.slots.lock().camera.clone()
    }

    pub fn is_sharing(&self) -> bool {
        self.slots.lock().screen.is_some()
    }

    /// Replace a synthetic microphone with the real one on every peer.
    /// Returns the peers whose sender had to be re-added and so need a new
    /// offer.
    pub async fn upgrade_microphone(&self, peers: &[PeerHandle]) -> Result<Vec<String>, MediaError> {
        if self.options.listener {
            debug!("Listener keeps synthetic audio");
            return Ok(Vec::new());
        }
        if !self.slots.lock().microphone.is_synthetic() {
            return Ok(Vec::new());
        }
        let real = acquire(self.devices.as_ref(), MediaKind::Audio, self.options.device_timeout).await?;

        let (outgoing, old, old_mix) = {
            let mut slots = self.slots.lock();
            real.set_enabled(!slots.audio_muted);
            let old = std::mem::replace(&mut slots.microphone, real.clone());
            // A running mix must pick up the new input.
            let old_mix = slots.mixed.take();
            if old_mix.is_some() {
                if let Some(system) = &slots.system_audio {
                    slots.mixed = Some(mixer::start(&real, system));
                }
            }
            (slots.outgoing_audio(), old, old_mix)
        };

        let renegotiate = substitute(TrackPurpose::Microphone, &outgoing, peers).await;
        old.stop();
        if let Some(mix) = old_mix {
            mix.stop();
        }
        info!(track = %outgoing.id(), "Microphone upgraded");
        Ok(renegotiate)
    }

    /// Replace a synthetic camera with the real one on every peer.
    pub async fn upgrade_camera(&self, peers: &[PeerHandle]) -> Result<Vec<String>, MediaError> {
        if self.options.listener {
            debug!("Listener keeps synthetic video");
            return Ok(Vec::new());
        }
        if !self.slots.lock().camera.is_synthetic() {
            return Ok(Vec::new());
        }
        let real = acquire(self.devices.as_ref(), MediaKind::Video, self.options.device_timeout).await?;
        let old = {
            let mut slots = self.slots.lock();
            real.set_enabled(!slots.video_muted);
            std::mem::replace(&mut slots.camera, real.clone())
        };
        let renegotiate = substitute(TrackPurpose::Camera, &real, peers).await;
        old.stop();
        info!(track = %real.id(), "Camera upgraded");
        Ok(renegotiate)
    }

    /// Mute or unmute outgoing audio or video. Listeners stay muted.
    ///
    /// Unmuting a synthetic track first tries the real device again, so a
    /// permission granted after joining takes effect. Returns the peers that
    /// need a new offer.
    pub async fn set_muted(&self, kind: MediaKind, muted: bool, peers: &[PeerHandle]) -> Vec<String> {
        if self.options.listener && !muted {
            debug!(?kind, "Listener cannot unmute");
            return Vec::new();
        }
        {
            let mut slots = self.slots.lock();
            match kind {
                MediaKind::Audio => slots.audio_muted = muted,
                MediaKind::Video => slots.video_muted = muted,
            }
        }

        let mut renegotiate = Vec::new();
        if !muted {
            let upgraded = match kind {
                MediaKind::Audio => self.upgrade_microphone(peers).await,
                MediaKind::Video => self.upgrade_camera(peers).await,
            };
            match upgraded {
                Ok(peers) => renegotiate = peers,
                Err(e) => debug!(?kind, error = %e, "Device still unavailable, unmuting synthetic track"),
            }
        }

        let slots = self.slots.lock();
        match kind {
            MediaKind::Audio => slots.microphone.set_enabled(!slots.audio_muted),
            MediaKind::Video => slots.camera.set_enabled(!slots.video_muted),
        }
        renegotiate
    }

    pub fn is_muted(&self, kind: MediaKind) -> bool {
        let slots = self.slots.lock();
        match kind {
            MediaKind::Audio => slots.audio_muted,
            MediaKind::Video => slots.video_muted,
        }
    }

    /// Start sending a screen track, with optional system audio. Returns the
    /// peers that need a new offer.
    pub async fn start_screen_share(
        &self,
        video: LocalTrack,
        system_audio: Option<LocalTrack>,
        peers: &[PeerHandle],
    ) -> Vec<String> {
        let (mixed, separate, retired) = {
            let mut slots = self.slots.lock();
            let mut retired = Vec::new();
            if let Some(previous) = slots.screen.replace(video.clone()) {
                if previous != video {
                    retired.push(previous);
                }
            }
            retired.extend(slots.mixed.take());
            retired.extend(slots.system_audio.take());

            let (mut mixed, mut separate) = (None, None);
            if let Some(system) = system_audio {
                if self.options.mixing {
                    let mix = mixer::start(&slots.microphone, &system);
                    slots.mixed = Some(mix.clone());
                    mixed = Some(mix);
                } else {
                    separate = Some(system.clone());
                }
                slots.system_audio = Some(system);
            }
            (mixed, separate, retired)
        };

        let mut renegotiate = attach(TrackPurpose::Screen, &video, peers).await;
        if let Some(mix) = mixed {
            renegotiate.extend(substitute(TrackPurpose::Microphone, &mix, peers).await);
        }
        if let Some(system) = separate {
            renegotiate.extend(attach(TrackPurpose::SystemAudio, &system, peers).await);
        }
        for track in retired {
            track.stop();
        }
        renegotiate.sort();
        renegotiate.dedup();
        info!(peers = peers.len(), "Screen share started");
        renegotiate
    }

    /// Stop sharing and put the plain microphone back. Returns the peers that
    /// need a new offer.
    pub async fn stop_screen_share(&self, peers: &[PeerHandle]) -> Vec<String> {
        let (screen, system, mixed, microphone) = {
            let mut slots = self.slots.lock();
            (
                slots.screen.take(),
                slots.system_audio.take(),
                slots.mixed.take(),
                slots.microphone.clone(),
            )
        };
        if screen.is_none() {
            return Vec::new();
        }

        silence(TrackPurpose::Screen, peers).await;
        let mut renegotiate = Vec::new();
        if mixed.is_some() {
            renegotiate = substitute(TrackPurpose::Microphone, &microphone, peers).await;
        } else if system.is_some() {
            silence(TrackPurpose::SystemAudio, peers).await;
        }
        for track in [screen, system, mixed].into_iter().flatten() {
            track.stop();
        }
        info!("Screen share stopped");
        renegotiate
    }

    /// Stop every local track.
    pub fn shutdown(&self) {
        let slots = self.slots.lock();
        slots.microphone.stop();
        slots.camera.stop();
        for track in [&slots.system_audio, &slots.screen, &slots.mixed].into_iter().flatten() {
            track.stop();
        }
    }
}

async fn acquire(devices: &dyn DeviceProvider, kind: MediaKind, limit: Duration) -> Result<LocalTrack, MediaError> {
    let (what, opened) = match kind {
        MediaKind::Audio => ("microphone", tokio::time::timeout(limit, devices.open_microphone()).await),
        MediaKind::Video => ("camera", tokio::time::timeout(limit, devices.open_camera()).await),
    };
    opened.map_err(|_| MediaError::Timeout(what))?
}

fn fallback_notice(error: &MediaError) -> String {
    match error {
        MediaError::PermissionDenied(what) => format!("Permission for the {what} was denied; sending placeholder media"),
        MediaError::Unavailable(what) => format!("No {what} found; sending placeholder media"),
        MediaError::Timeout(what) => format!("The {what} did not respond in time; sending placeholder media"),
        MediaError::Device(message) => format!("Device error ({message}); sending placeholder media"),
    }
}

/// Swap `track` into the `purpose` sender of every peer. Peers where the
/// swap fails get the track added instead and are returned for renegotiation.
async fn substitute(purpose: TrackPurpose, track: &LocalTrack, peers: &[PeerHandle]) -> Vec<String> {
    let swaps = peers.iter().map(|(name, transport)| async move {
        match transport.replace_track(purpose, Some(track)).await {
            Ok(()) => None,
            Err(e) => {
                warn!(peer = %name, ?purpose, error = %e, "Track replacement failed, adding a sender");
                match transport.add_track(purpose, track).await {
                    Ok(()) => Some(name.clone()),
                    Err(e) => {
                        warn!(peer = %name, ?purpose, error = %e, "Could not add sender");
                        None
                    }
                }
            }
        }
    });
    join_all(swaps).await.into_iter().flatten().collect()
}

/// Add a new sender on every peer; each success needs renegotiation.
async fn attach(purpose: TrackPurpose, track: &LocalTrack, peers: &[PeerHandle]) -> Vec<String> {
    let adds = peers.iter().map(|(name, transport)| async move {
        match transport.add_track(purpose, track).await {
            Ok(()) => Some(name.clone()),
            Err(e) => {
                warn!(peer = %name, ?purpose, error = %e, "Could not add sender");
                None
            }
        }
    });
    join_all(adds).await.into_iter().flatten().collect()
}

async fn silence(purpose: TrackPurpose, peers: &[PeerHandle]) {
    let clears = peers.iter().map(|(name, transport)| async move {
        if let Err(e) = transport.replace_track(purpose, None).await {
            debug!(peer = %name, ?purpose, error = %e, "Could not clear sender");
        }
    });
    join_all(clears).await;
}
