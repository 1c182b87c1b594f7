//! In-memory peer transport for negotiation tests.
//!
//! Follows the signaling-state rules of a real peer connection closely enough
//! to exercise glare, rollback and stale answers. A connection reports
//! `Connected` once both descriptions are in place and signaling is stable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;

use super::track::LocalTrack;
use super::transport::{
    IceCandidate, PeerTransport, SdpKind, SessionDescription, SignalingState, TrackPurpose,
    TransportContext, TransportEvent, TransportEventKind, TransportFactory, TransportState,
};

struct FakeState {
    signaling: SignalingState,
    connection: TransportState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    senders: Vec<(TrackPurpose, Option<String>)>,
    candidates: Vec<IceCandidate>,
    version: u64,
    offers_created: usize,
    replace_calls: usize,
    fail_replace: bool,
    fail_next_remote: Option<TransportError>,
    closed: bool,
}

pub struct FakeTransport {
    remote: String,
    generation: u64,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: parking_lot::Mutex<FakeState>,
}

impl FakeTransport {
    pub fn new(ctx: TransportContext) -> Self {
        Self {
            remote: ctx.remote,
            generation: ctx.generation,
            events: ctx.events,
            state: parking_lot::Mutex::new(FakeState {
                signaling: SignalingState::Stable,
                connection: TransportState::New,
                local: None,
                remote: None,
                senders: Vec::new(),
                candidates: Vec::new(),
                version: 0,
                offers_created: 0,
                replace_calls: 0,
                fail_replace: false,
                fail_next_remote: None,
                closed: false,
            }),
        }
    }

    /// A transport whose events go nowhere.
    pub fn detached(remote: &str) -> Self {
        let (events, _) = mpsc::unbounded_channel();
        Self::new(TransportContext {
            remote: remote.to_string(),
            generation: 1,
            events,
        })
    }

    fn sdp(&self, state: &mut FakeState) -> String {
        state.version += 1;
        let mut sdp = format!("v=0\no={} {}\n", self.remote, state.version);
        for (purpose, id) in &state.senders {
            let kind = match purpose.kind() {
                super::transport::MediaKind::Audio => "audio",
                super::transport::MediaKind::Video => "video",
            };
            sdp.push_str(&format!(
                "m={kind} {} {}\n",
                purpose.marker(),
                id.as_deref().unwrap_or("-")
            ));
        }
        sdp
    }

    fn maybe_connect(&self, state: &mut FakeState) {
        if state.signaling == SignalingState::Stable
            && state.local.is_some()
            && state.remote.is_some()
            && state.connection != TransportState::Connected
        {
            state.connection = TransportState::Connected;
            self.emit(TransportState::Connected);
        }
    }

    fn emit(&self, state: TransportState) {
        let _ = self.events.send(TransportEvent {
            remote: self.remote.clone(),
            generation: self.generation,
            kind: TransportEventKind::StateChanged(state),
        });
    }

    /// Force a connection state and report it.
    pub fn force_state(&self, state: TransportState) {
        self.state.lock().connection = state;
        self.emit(state);
    }

    pub fn fail_next_remote(&self, error: TransportError) {
        self.state.lock().fail_next_remote = Some(error);
    }

    pub fn set_fail_replace(&self, fail: bool) {
        self.state.lock().fail_replace = fail;
    }

    pub fn local_sdp(&self) -> Option<String> {
        self.state.lock().local.as_ref().map(|d| d.sdp.clone())
    }

    pub fn local_kind(&self) -> Option<SdpKind> {
        self.state.lock().local.as_ref().map(|d| d.kind)
    }

    pub fn remote_sdp(&self) -> Option<String> {
        self.state.lock().remote.as_ref().map(|d| d.sdp.clone())
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().candidates.clone()
    }

    pub fn offers_created(&self) -> usize {
        self.state.lock().offers_created
    }

    pub fn replace_calls(&self) -> usize {
        self.state.lock().replace_calls
    }

    pub fn sender_count(&self) -> usize {
        self.state.lock().senders.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

fn wrong_state(state: SignalingState) -> TransportError {
    TransportError::InvalidState(format!("{state:?}"))
}

#[async_trait]
impl PeerTransport for FakeTransport {
    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    fn connection_state(&self) -> TransportState {
        self.state.lock().connection
    }

    async fn has_remote_description(&self) -> bool {
        self.state.lock().remote.is_some()
    }

    async fn create_offer(&self, _ice_restart: bool) -> Result<SessionDescription, TransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.offers_created += 1;
        Ok(SessionDescription::offer(self.sdp(&mut state)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let mut state = self.state.lock();
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(wrong_state(state.signaling));
        }
        Ok(SessionDescription::answer(self.sdp(&mut state)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        match desc.kind {
            SdpKind::Offer => {
                if !matches!(state.signaling, SignalingState::Stable | SignalingState::HaveLocalOffer) {
                    return Err(wrong_state(state.signaling));
                }
                state.signaling = SignalingState::HaveLocalOffer;
                state.local = Some(desc);
            }
            SdpKind::Answer | SdpKind::Pranswer => {
                if state.signaling != SignalingState::HaveRemoteOffer {
                    return Err(wrong_state(state.signaling));
                }
                state.signaling = SignalingState::Stable;
                state.local = Some(desc);
                self.maybe_connect(&mut state);
            }
            SdpKind::Rollback => {
                if state.signaling != SignalingState::HaveLocalOffer {
                    return Err(wrong_state(state.signaling));
                }
                state.signaling = SignalingState::Stable;
                state.local = None;
            }
        }
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        if let Some(error) = state.fail_next_remote.take() {
            return Err(error);
        }
        match desc.kind {
            SdpKind::Offer => {
                if state.signaling != SignalingState::Stable {
                    return Err(wrong_state(state.signaling));
                }
                state.signaling = SignalingState::HaveRemoteOffer;
                state.remote = Some(desc);
            }
            SdpKind::Answer | SdpKind::Pranswer => {
                if state.signaling != SignalingState::HaveLocalOffer {
                    return Err(wrong_state(state.signaling));
                }
                state.signaling = SignalingState::Stable;
                state.remote = Some(desc);
                self.maybe_connect(&mut state);
            }
            SdpKind::Rollback => return Err(wrong_state(state.signaling)),
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.remote.is_none() {
            return Err(TransportError::InvalidState("no remote description".into()));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    async fn add_track(&self, purpose: TrackPurpose, track: &LocalTrack) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        purpose.check_track(track)?;
        let id = Some(track.id().to_string());
        match state.senders.iter_mut().find(|(p, _)| *p == purpose) {
            Some(sender) => sender.1 = id,
            None => state.senders.push((purpose, id)),
        }
        Ok(())
    }

    async fn replace_track(&self, purpose: TrackPurpose, track: Option<&LocalTrack>) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.replace_calls += 1;
        if state.fail_replace {
            return Err(TransportError::Other("replace refused".into()));
        }
        if let Some(track) = track {
            purpose.check_track(track)?;
        }
        let Some(sender) = state.senders.iter_mut().find(|(p, _)| *p == purpose) else {
            return Err(TransportError::InvalidState(format!("no {purpose:?} sender")));
        };
        sender.1 = track.map(|t| t.id().to_string());
        Ok(())
    }

    fn sender_track_id(&self, purpose: TrackPurpose) -> Option<String> {
        self.state
            .lock()
            .senders
            .iter()
            .find(|(p, _)| *p == purpose)
            .and_then(|(_, id)| id.clone())
    }

    async fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.signaling = SignalingState::Closed;
        state.connection = TransportState::Closed;
    }
}

/// Hands out [`FakeTransport`]s and remembers them per remote.
#[derive(Default)]
pub struct FakeFactory {
    created: parking_lot::Mutex<HashMap<String, Vec<Arc<FakeTransport>>>>,
    failures: AtomicUsize,
}

impl FakeFactory {
    /// Make the next `n` creations fail.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::Relaxed);
    }

    pub fn latest(&self, remote: &str) -> Option<Arc<FakeTransport>> {
        self.created.lock().get(remote).and_then(|all| all.last().cloned())
    }

    pub fn created(&self, remote: &str) -> usize {
        self.created.lock().get(remote).map_or(0, Vec::len)
    }
}

#[async_trait]
impl TransportFactory for FakeFactory {
    async fn create(&self, ctx: TransportContext) -> Result<Arc<dyn PeerTransport>, TransportError> {
        if self
            .failures
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TransportError::Other("creation refused".into()));
        }
        let remote = ctx.remote.clone();
        let transport = Arc::new(FakeTransport::new(ctx));
        self.created
            .lock()
            .entry(remote)
            .or_default()
            .push(Arc::clone(&transport));
        Ok(transport)
    }
}
