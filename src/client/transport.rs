//! The seam between negotiation logic and a concrete peer connection.
//!
//! [`PeerTransport`] is implemented by the webrtc-rs backend in `rtc.rs` and
//! by an in-memory fake for tests.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::TransportError;

use super::track::LocalTrack;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    #[serde(default)]
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn rollback() -> Self {
        Self {
            kind: SdpKind::Rollback,
            sdp: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// What an outgoing track carries. Senders are keyed by purpose so a
/// replacement always lands on the same media line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrackPurpose {
    Microphone,
    SystemAudio,
    Camera,
    Screen,
}

impl TrackPurpose {
    /// Attach order. Keeps media-line order stable across renegotiations.
    pub const ATTACH_ORDER: [TrackPurpose; 4] = [
        TrackPurpose::Microphone,
        TrackPurpose::SystemAudio,
        TrackPurpose::Camera,
        TrackPurpose::Screen,
    ];

    pub fn kind(self) -> MediaKind {
        match self {
            TrackPurpose::Microphone | TrackPurpose::SystemAudio => MediaKind::Audio,
            TrackPurpose::Camera | TrackPurpose::Screen => MediaKind::Video,
        }
    }

    /// Stream id used for outgoing tracks of this purpose.
    pub fn marker(self) -> &'static str {
        match self {
            TrackPurpose::Microphone => "mic",
            TrackPurpose::SystemAudio => "system-audio",
            TrackPurpose::Camera => "camera",
            TrackPurpose::Screen => "screen",
        }
    }

    pub fn from_marker(marker: &str) -> Option<Self> {
        Self::ATTACH_ORDER.into_iter().find(|p| p.marker() == marker)
    }

    /// Reject a track whose media kind cannot feed a sender of this purpose.
    pub fn check_track(self, track: &LocalTrack) -> Result<(), TransportError> {
        if track.kind() == self.kind() {
            Ok(())
        } else {
            Err(TransportError::InvalidState(format!(
                "{:?} track cannot feed the {self:?} sender",
                track.kind()
            )))
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteTrackInfo {
    pub id: String,
    pub stream_id: String,
    pub kind: MediaKind,
    pub label: String,
    /// Display-surface hint (`monitor`, `window`, ...) when the sender exposes one.
    pub display_surface: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEventKind {
    LocalCandidate(IceCandidate),
    StateChanged(TransportState),
    RemoteTrack(RemoteTrackInfo),
}

/// Something a transport reported on its own. `generation` identifies which
/// incarnation of the peer connection produced it; events from a replaced
/// connection are stale.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportEvent {
    pub remote: String,
    pub generation: u64,
    pub kind: TransportEventKind,
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    fn signaling_state(&self) -> SignalingState;
    fn connection_state(&self) -> TransportState;
    async fn has_remote_description(&self) -> bool;

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, TransportError>;
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Create the sender for `purpose`, or feed `track` into it if it exists.
    /// Either way the caller must renegotiate.
    async fn add_track(&self, purpose: TrackPurpose, track: &LocalTrack) -> Result<(), TransportError>;

    /// Swap what an existing sender transmits without renegotiation. `None`
    /// leaves the sender in place but silent.
    async fn replace_track(&self, purpose: TrackPurpose, track: Option<&LocalTrack>) -> Result<(), TransportError>;

    /// Id under which the remote side will see the `purpose` sender's track.
    fn sender_track_id(&self, purpose: TrackPurpose) -> Option<String>;

    async fn close(&self);
}

pub struct TransportContext {
    pub remote: String,
    pub generation: u64,
    pub events: mpsc::UnboundedSender<TransportEvent>,
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, ctx: TransportContext) -> Result<Arc<dyn PeerTransport>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn candidate_uses_browser_field_names() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        let value = serde_json::to_value(&candidate).unwrap();
        assert_eq!(value["sdpMLineIndex"], 0);
        assert_eq!(value["sdpMid"], "0");
    }

    #[test]
    fn purposes_round_trip_through_markers() {
        for purpose in TrackPurpose::ATTACH_ORDER {
            assert_eq!(TrackPurpose::from_marker(purpose.marker()), Some(purpose));
        }
        assert_eq!(TrackPurpose::from_marker("webrtc-rs"), None);
        assert_eq!(
            serde_json::to_value(TrackPurpose::SystemAudio).unwrap(),
            json!("system-audio")
        );
    }

    #[test]
    fn senders_only_take_tracks_of_their_kind() {
        use crate::client::track::TrackSource;
        let tone = LocalTrack::new(MediaKind::Audio, TrackSource::Synthetic, "tone");
        let pattern = LocalTrack::new(MediaKind::Video, TrackSource::Synthetic, "pattern");
        assert!(TrackPurpose::Microphone.check_track(&tone).is_ok());
        assert!(TrackPurpose::Screen.check_track(&pattern).is_ok());
        assert!(matches!(
            TrackPurpose::Microphone.check_track(&pattern),
            Err(TransportError::InvalidState(_))
        ));
        assert!(TrackPurpose::Camera.check_track(&tone).is_err());
    }
}
