//! [`PeerTransport`] on top of webrtc-rs.
//!
//! Every sender owns a fixed local track: a `TrackLocalStaticSample` for
//! PCMU audio, a `TrackLocalStaticRTP` fed by our own packetizer for raw
//! video. Frames reach it through a pump task subscribed to the current
//! [`LocalTrack`], so replacing a track only re-points the pump and the
//! media line never changes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_PCMU};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp::packetizer::{new_packetizer, Packetizer, Payloader};
use webrtc::rtp::sequence::new_random_sequencer;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;

use crate::error::{Result, TransportError};

use super::capture::Playback;
use super::g711;
use super::track::{LocalTrack, MediaFrame};
use super::transport::{
    IceCandidate, MediaKind, PeerTransport, RemoteTrackInfo, SdpKind, SessionDescription,
    SignalingState, TrackPurpose, TransportContext, TransportEvent, TransportEventKind,
    TransportFactory, TransportState,
};

const RTCP_BUFFER: usize = 1500;

/// Video frames are uncompressed pattern bytes, so they travel under their
/// own dynamic payload type instead of pretending to be VP8.
pub const MIME_TYPE_RAW_PATTERN: &str = "video/x-roomcall-pattern";
const RAW_PATTERN_PAYLOAD_TYPE: u8 = 120;
const VIDEO_CLOCK_RATE: u32 = 90_000;
const RTP_MTU: usize = 1200;

pub struct RtcFactory {
    api: API,
    ice_servers: Vec<String>,
    playback: Option<Playback>,
}

impl RtcFactory {
    pub fn new(ice_servers: Vec<String>, playback: Option<Playback>) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: raw_pattern_codec(),
                payload_type: RAW_PATTERN_PAYLOAD_TYPE,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self {
            api,
            ice_servers,
            playback,
        })
    }
}

#[async_trait]
impl TransportFactory for RtcFactory {
    async fn create(&self, ctx: TransportContext) -> std::result::Result<Arc<dyn PeerTransport>, TransportError> {
        let mut config = RTCConfiguration::default();
        if !self.ice_servers.is_empty() {
            config.ice_servers = vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }];
        }
        let pc = Arc::new(self.api.new_peer_connection(config).await.map_err(classify)?);
        let transport = RtcTransport {
            remote: ctx.remote.clone(),
            pc,
            senders: parking_lot::Mutex::new(HashMap::new()),
            closed: CancellationToken::new(),
        };
        transport.install_handlers(ctx, self.playback.clone());
        Ok(Arc::new(transport))
    }
}

/// Splits a frame into MTU-sized chunks with no payload header.
#[derive(Debug, Clone, Default)]
struct RawPayloader;

impl Payloader for RawPayloader {
    fn payload(&mut self, mtu: usize, b: &Bytes) -> std::result::Result<Vec<Bytes>, webrtc::rtp::Error> {
        if mtu == 0 {
            return Ok(Vec::new());
        }
        Ok((0..b.len())
            .step_by(mtu)
            .map(|start| b.slice(start..(start + mtu).min(b.len())))
            .collect())
    }

    fn clone_to(&self) -> Box<dyn Payloader + Send + Sync> {
        Box::new(self.clone())
    }
}

type SharedPacketizer = Arc<parking_lot::Mutex<Box<dyn Packetizer + Send + Sync>>>;

#[derive(Clone)]
enum SenderTrack {
    Audio(Arc<TrackLocalStaticSample>),
    /// The packetizer outlives pumps so sequence numbers stay continuous
    /// across track replacement.
    Video(Arc<TrackLocalStaticRTP>, SharedPacketizer),
}

impl SenderTrack {
    fn new(purpose: TrackPurpose) -> Self {
        let id = format!("{}-{}", purpose.marker(), uuid::Uuid::new_v4());
        let stream = purpose.marker().to_owned();
        match purpose.kind() {
            MediaKind::Audio => SenderTrack::Audio(Arc::new(TrackLocalStaticSample::new(
                RtcTransport::codec(purpose),
                id,
                stream,
            ))),
            MediaKind::Video => {
                let packetizer: Box<dyn Packetizer + Send + Sync> = Box::new(new_packetizer(
                    RTP_MTU,
                    0,
                    0,
                    Box::new(RawPayloader),
                    Box::new(new_random_sequencer()),
                    VIDEO_CLOCK_RATE,
                ));
                SenderTrack::Video(
                    Arc::new(TrackLocalStaticRTP::new(RtcTransport::codec(purpose), id, stream)),
                    Arc::new(parking_lot::Mutex::new(packetizer)),
                )
            }
        }
    }

    fn local(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        match self {
            SenderTrack::Audio(sample) => Arc::clone(sample) as Arc<dyn TrackLocal + Send + Sync>,
            SenderTrack::Video(rtp, _) => Arc::clone(rtp) as Arc<dyn TrackLocal + Send + Sync>,
        }
    }

    fn id(&self) -> String {
        match self {
            SenderTrack::Audio(sample) => sample.id().to_owned(),
            SenderTrack::Video(rtp, _) => rtp.id().to_owned(),
        }
    }

    async fn write(&self, frame: MediaFrame) -> std::result::Result<(), webrtc::Error> {
        match self {
            SenderTrack::Audio(sample) => {
                let sample_data = Sample {
                    data: frame.data,
                    duration: frame.duration,
                    ..Default::default()
                };
                sample.write_sample(&sample_data).await
            }
            SenderTrack::Video(rtp, packetizer) => {
                let samples = (frame.duration.as_secs_f64() * f64::from(VIDEO_CLOCK_RATE)) as u32;
                let packets = packetizer.lock().packetize(&frame.data, samples)?;
                for packet in &packets {
                    rtp.write_rtp(packet).await?;
                }
                Ok(())
            }
        }
    }
}

struct SenderSlot {
    track: SenderTrack,
    pump: CancellationToken,
}

pub struct RtcTransport {
    remote: String,
    pc: Arc<RTCPeerConnection>,
    senders: parking_lot::Mutex<HashMap<TrackPurpose, SenderSlot>>,
    closed: CancellationToken,
}

impl RtcTransport {
    fn install_handlers(&self, ctx: TransportContext, playback: Option<Playback>) {
        let TransportContext {
            remote,
            generation,
            events,
        } = ctx;

        let (tx, peer) = (events.clone(), remote.clone());
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let (tx, peer) = (tx.clone(), peer.clone());
                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        debug!(peer = %peer, "ICE gathering complete");
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = tx.send(TransportEvent {
                                remote: peer,
                                generation,
                                kind: TransportEventKind::LocalCandidate(IceCandidate {
                                    candidate: init.candidate,
                                    sdp_mid: init.sdp_mid,
                                    sdp_mline_index: init.sdp_mline_index,
                                    username_fragment: init.username_fragment,
                                }),
                            });
                        }
                        Err(e) => warn!(peer = %peer, error = %e, "Could not serialize ICE candidate"),
                    }
                })
            }));

        let (tx, peer) = (events.clone(), remote.clone());
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                debug!(peer = %peer, state = %s, "Peer connection state changed");
                let _ = tx.send(TransportEvent {
                    remote: peer.clone(),
                    generation,
                    kind: TransportEventKind::StateChanged(transport_state(s)),
                });
                Box::pin(async {})
            }));

        let (tx, peer, closed) = (events, remote, self.closed.clone());
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
                let kind = match track.kind() {
                    RTPCodecType::Video => MediaKind::Video,
                    _ => MediaKind::Audio,
                };
                let info = RemoteTrackInfo {
                    id: track.id(),
                    stream_id: track.stream_id(),
                    kind,
                    label: String::new(),
                    display_surface: None,
                };
                let _ = tx.send(TransportEvent {
                    remote: peer.clone(),
                    generation,
                    kind: TransportEventKind::RemoteTrack(info),
                });
                let playback = playback.clone().filter(|_| kind == MediaKind::Audio);
                let (peer, closed) = (peer.clone(), closed.clone());
                Box::pin(async move {
                    tokio::spawn(read_remote(track, playback, peer, closed));
                })
            },
        ));
    }

    fn codec(purpose: TrackPurpose) -> RTCRtpCodecCapability {
        match purpose.kind() {
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_PCMU.to_owned(),
                clock_rate: g711::SAMPLE_RATE,
                channels: 1,
                ..Default::default()
            },
            MediaKind::Video => raw_pattern_codec(),
        }
    }

    fn start_pump(&self, purpose: TrackPurpose, sender: SenderTrack, track: &LocalTrack) -> CancellationToken {
        let token = self.closed.child_token();
        let stop = token.clone();
        let track = track.clone();
        let peer = self.remote.clone();
        tokio::spawn(async move {
            let mut frames = track.subscribe();
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = track.stopped() => break,
                    frame = frames.recv() => match frame {
                        Ok(frame) => {
                            if let Err(e) = sender.write(frame).await {
                                if matches!(e, webrtc::Error::ErrConnectionClosed) {
                                    break;
                                }
                                debug!(peer = %peer, ?purpose, error = %e, "Sample write failed");
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => debug!(peer = %peer, ?purpose, skipped, "Sender lagging"),
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });
        token
    }
}

fn raw_pattern_codec() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_RAW_PATTERN.to_owned(),
        clock_rate: VIDEO_CLOCK_RATE,
        ..Default::default()
    }
}

async fn read_remote(track: Arc<TrackRemote>, playback: Option<Playback>, peer: String, closed: CancellationToken) {
    let source = format!("{peer}/{}", track.id());
    loop {
        let packet = tokio::select! {
            _ = closed.cancelled() => break,
            packet = track.read_rtp() => packet,
        };
        match packet {
            Ok((packet, _)) => {
                if let Some(playback) = &playback {
                    playback.push(&source, &g711::decode_frame(&packet.payload));
                }
            }
            Err(e) => {
                debug!(peer = %peer, error = %e, "Remote track ended");
                break;
            }
        }
    }
    if let Some(playback) = &playback {
        playback.remove(&source);
    }
}

#[async_trait]
impl PeerTransport for RtcTransport {
    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
            RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
            RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::Stable,
        }
    }

    fn connection_state(&self) -> TransportState {
        transport_state(self.pc.connection_state())
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn create_offer(&self, ice_restart: bool) -> std::result::Result<SessionDescription, TransportError> {
        let options = RTCOfferOptions {
            ice_restart,
            ..Default::default()
        };
        let offer = self.pc.create_offer(Some(options)).await.map_err(classify)?;
        Ok(from_rtc(offer))
    }

    async fn create_answer(&self) -> std::result::Result<SessionDescription, TransportError> {
        let answer = self.pc.create_answer(None).await.map_err(classify)?;
        Ok(from_rtc(answer))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> std::result::Result<(), TransportError> {
        self.pc.set_local_description(to_rtc(desc)?).await.map_err(classify)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> std::result::Result<(), TransportError> {
        self.pc.set_remote_description(to_rtc(desc)?).await.map_err(classify)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> std::result::Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc.add_ice_candidate(init).await.map_err(classify)
    }

    async fn add_track(&self, purpose: TrackPurpose, track: &LocalTrack) -> std::result::Result<(), TransportError> {
        purpose.check_track(track)?;
        let existing = self.senders.lock().get(&purpose).map(|slot| slot.track.clone());
        if let Some(sender) = existing {
            let pump = self.start_pump(purpose, sender, track);
            if let Some(slot) = self.senders.lock().get_mut(&purpose) {
                std::mem::replace(&mut slot.pump, pump).cancel();
            }
            return Ok(());
        }

        let local = SenderTrack::new(purpose);
        let sender = self.pc.add_track(local.local()).await.map_err(classify)?;

        // Incoming RTCP must be drained for interceptors to work.
        tokio::spawn(async move {
            let mut buf = vec![0u8; RTCP_BUFFER];
            while sender.read(&mut buf).await.is_ok() {}
        });

        let pump = self.start_pump(purpose, local.clone(), track);
        self.senders.lock().insert(purpose, SenderSlot { track: local, pump });
        debug!(peer = %self.remote, ?purpose, track = %track.id(), "Sender added");
        Ok(())
    }

    async fn replace_track(&self, purpose: TrackPurpose, track: Option<&LocalTrack>) -> std::result::Result<(), TransportError> {
        if let Some(track) = track {
            purpose.check_track(track)?;
        }
        let sender = self
            .senders
            .lock()
            .get(&purpose)
            .map(|slot| slot.track.clone())
            .ok_or_else(|| TransportError::InvalidState(format!("no {purpose:?} sender")))?;
        let pump = match track {
            Some(track) => self.start_pump(purpose, sender, track),
            None => CancellationToken::new(),
        };
        if let Some(slot) = self.senders.lock().get_mut(&purpose) {
            std::mem::replace(&mut slot.pump, pump).cancel();
        }
        Ok(())
    }

    fn sender_track_id(&self, purpose: TrackPurpose) -> Option<String> {
        self.senders
            .lock()
            .get(&purpose)
            .map(|slot| slot.track.id())
    }

    async fn close(&self) {
        self.closed.cancel();
        if let Err(e) = self.pc.close().await {
            debug!(peer = %self.remote, error = %e, "Error closing peer connection");
        }
        info!(peer = %self.remote, "Peer connection closed");
    }
}

fn transport_state(state: RTCPeerConnectionState) -> TransportState {
    match state {
        RTCPeerConnectionState::Connecting => TransportState::Connecting,
        RTCPeerConnectionState::Connected => TransportState::Connected,
        RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
        RTCPeerConnectionState::Failed => TransportState::Failed,
        RTCPeerConnectionState::Closed => TransportState::Closed,
        _ => TransportState::New,
    }
}

fn from_rtc(desc: RTCSessionDescription) -> SessionDescription {
    let kind = match desc.sdp_type {
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        _ => SdpKind::Offer,
    };
    SessionDescription { kind, sdp: desc.sdp }
}

fn to_rtc(desc: SessionDescription) -> std::result::Result<RTCSessionDescription, TransportError> {
    let parsed = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
        // No constructor for rollback; it carries no SDP to parse.
        SdpKind::Rollback => {
            return serde_json::from_value(json!({ "type": "rollback", "sdp": "" }))
                .map_err(|e| TransportError::Other(e.to_string()))
        }
    };
    parsed.map_err(classify)
}

/// Map a webrtc-rs error onto the recovery-relevant categories.
fn classify(err: webrtc::Error) -> TransportError {
    use webrtc::Error as E;
    match err {
        E::ErrConnectionClosed => TransportError::Closed,
        E::Dtls(e) => TransportError::RoleConflict(e.to_string()),
        e @ (E::ErrSignalingStateProposedTransitionInvalid { .. }
        | E::ErrSignalingStateCannotRollback
        | E::ErrIncorrectSignalingState
        | E::ErrNoRemoteDescription) => TransportError::InvalidState(e.to_string()),
        e => TransportError::Other(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::track::TrackSource;

    #[test]
    fn errors_map_to_recovery_categories() {
        assert_eq!(classify(webrtc::Error::ErrConnectionClosed), TransportError::Closed);
        assert!(matches!(
            classify(webrtc::Error::Dtls(webrtc::dtls::Error::ErrConnClosed)),
            TransportError::RoleConflict(_)
        ));
        assert!(matches!(
            classify(webrtc::Error::ErrSignalingStateProposedTransitionInvalid {
                from: RTCSignalingState::Stable,
                applying: RTCSdpType::Answer,
                is_local: false,
            }),
            TransportError::InvalidState(_)
        ));
        assert!(matches!(
            classify(webrtc::Error::ErrIncorrectSignalingState),
            TransportError::InvalidState(_)
        ));
        // Wording alone never decides the category.
        assert!(matches!(
            classify(webrtc::Error::new("DTLS role mismatch in signaling state".into())),
            TransportError::Other(_)
        ));
    }

    #[test]
    fn raw_frames_split_at_the_mtu() {
        let frame = Bytes::from(vec![7u8; 2500]);
        let chunks = RawPayloader.payload(1000, &frame).unwrap();
        let sizes: Vec<usize> = chunks.iter().map(Bytes::len).collect();
        assert_eq!(sizes, vec![1000, 1000, 500]);
        assert!(RawPayloader.payload(1000, &Bytes::new()).unwrap().is_empty());
    }

    #[test]
    fn rollback_converts_without_sdp() {
        let rollback = to_rtc(SessionDescription::rollback()).unwrap();
        assert_eq!(rollback.sdp_type, RTCSdpType::Rollback);
        assert_eq!(from_rtc(rollback).kind, SdpKind::Rollback);
    }

    #[tokio::test]
    async fn offer_lists_senders_in_attach_order() {
        let factory = RtcFactory::new(Vec::new(), None).unwrap();
        let (events, _rx) = tokio::sync::mpsc::unbounded_channel();
        let transport = factory
            .create(TransportContext {
                remote: "B".into(),
                generation: 1,
                events,
            })
            .await
            .unwrap();
        let mic = LocalTrack::new(MediaKind::Audio, TrackSource::Synthetic, "tone");
        let cam = LocalTrack::new(MediaKind::Video, TrackSource::Synthetic, "pattern");
        transport.add_track(TrackPurpose::Microphone, &mic).await.unwrap();
        transport.add_track(TrackPurpose::Camera, &cam).await.unwrap();

        let offer = transport.create_offer(false).await.unwrap();
        let audio = offer.sdp.find("m=audio").unwrap();
        let video = offer.sdp.find("m=video").unwrap();
        assert!(audio < video);
        assert!(offer.sdp.contains("msid:mic"));
        assert!(offer.sdp.contains("x-roomcall-pattern/90000"));

        let mic_id = transport.sender_track_id(TrackPurpose::Microphone).unwrap();
        let real_mic = LocalTrack::new(MediaKind::Audio, TrackSource::Device, "default input");
        transport
            .replace_track(TrackPurpose::Microphone, Some(&real_mic))
            .await
            .unwrap();
        assert_eq!(transport.sender_track_id(TrackPurpose::Microphone), Some(mic_id));
        assert!(matches!(
            transport.replace_track(TrackPurpose::Microphone, Some(&cam)).await,
            Err(TransportError::InvalidState(_))
        ));
        assert!(transport.add_track(TrackPurpose::Screen, &mic).await.is_err());
        assert!(transport.replace_track(TrackPurpose::Screen, None).await.is_err());
        transport.close().await;
    }
}
