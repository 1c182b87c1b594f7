//! Per-peer negotiation.
//!
//! Each remote identity gets a [`PeerRecord`] whose negotiation operations
//! are serialized by an async mutex. Glare is resolved by politeness: the
//! impolite side keeps its own offer, the polite side rolls back and answers.
//! When a description cannot be applied in place (role conflict, unusable
//! signaling state) the transport is rebuilt from scratch.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CallTimings;
use crate::error::TransportError;
use crate::protocol::{ClientMessage, PeerSignal};

use super::classify::classify;
use super::connection::{PeerHealth, PeerMonitor};
use super::media::MediaFoundation;
use super::state::{NegotiationInput, NegotiationState, Role};
use super::transport::{
    IceCandidate, PeerTransport, SdpKind, SessionDescription, SignalingState, TrackPurpose,
    TransportContext, TransportEvent, TransportEventKind, TransportFactory, TransportState,
};
use super::CallEvent;

/// Offer/answer payload: the description plus which local track id carries
/// which purpose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptionPayload {
    #[serde(flatten)]
    pub description: SessionDescription,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tracks: HashMap<String, TrackPurpose>,
}

/// Outcome of applying a remote description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteApply {
    Applied,
    Ignored,
    /// The connection must be closed, rebuilt and renegotiated.
    Recreate,
}

struct Negotiation {
    state: NegotiationState,
    offer_received: bool,
    pending_candidates: Vec<IceCandidate>,
}

pub struct PeerRecord {
    remote: String,
    role: Role,
    listener: AtomicBool,
    monitor: PeerMonitor,
    timers: CancellationToken,
    current: parking_lot::Mutex<(u64, Arc<dyn PeerTransport>)>,
    epoch: parking_lot::Mutex<Instant>,
    declared: parking_lot::Mutex<HashMap<String, TrackPurpose>>,
    recovery_attempts: AtomicU32,
    gave_up: AtomicBool,
    negotiation: tokio::sync::Mutex<Negotiation>,
}

impl PeerRecord {
    fn new(
        remote: &str,
        role: Role,
        listener: bool,
        generation: u64,
        transport: Arc<dyn PeerTransport>,
        timers: CancellationToken,
    ) -> Self {
        Self {
            remote: remote.to_string(),
            role,
            listener: AtomicBool::new(listener),
            monitor: PeerMonitor::new(),
            timers,
            current: parking_lot::Mutex::new((generation, transport)),
            epoch: parking_lot::Mutex::new(Instant::now()),
            declared: parking_lot::Mutex::new(HashMap::new()),
            recovery_attempts: AtomicU32::new(0),
            gave_up: AtomicBool::new(false),
            negotiation: tokio::sync::Mutex::new(Negotiation {
                state: NegotiationState::Idle,
                offer_received: false,
                pending_candidates: Vec::new(),
            }),
        }
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_listener(&self) -> bool {
        self.listener.load(Ordering::Relaxed)
    }

    pub fn monitor(&self) -> &PeerMonitor {
        &self.monitor
    }

    pub fn transport(&self) -> Arc<dyn PeerTransport> {
        Arc::clone(&self.current.lock().1)
    }

    pub fn generation(&self) -> u64 {
        self.current.lock().0
    }

    /// Time since this connection was created, rebuilt or restarted.
    pub fn age(&self) -> Duration {
        self.epoch.lock().elapsed()
    }

    pub fn recovery_attempts(&self) -> u32 {
        self.recovery_attempts.load(Ordering::Relaxed)
    }

    pub fn timers(&self) -> &CancellationToken {
        &self.timers
    }

    fn touch(&self) {
        *self.epoch.lock() = Instant::now();
    }
}

pub struct NegotiatorConfig {
    pub room_id: String,
    pub local: String,
    pub timings: CallTimings,
}

pub struct Negotiator {
    room_id: String,
    local: String,
    timings: CallTimings,
    factory: Arc<dyn TransportFactory>,
    media: Arc<MediaFoundation>,
    outbox: mpsc::UnboundedSender<ClientMessage>,
    events: mpsc::UnboundedSender<CallEvent>,
    transport_events: mpsc::UnboundedSender<TransportEvent>,
    peers: parking_lot::Mutex<HashMap<String, Arc<PeerRecord>>>,
    participants: parking_lot::Mutex<BTreeSet<String>>,
    creation: tokio::sync::Mutex<()>,
    next_generation: AtomicU64,
    shutdown: CancellationToken,
}

impl Negotiator {
    pub fn new(
        config: NegotiatorConfig,
        factory: Arc<dyn TransportFactory>,
        media: Arc<MediaFoundation>,
        outbox: mpsc::UnboundedSender<ClientMessage>,
        events: mpsc::UnboundedSender<CallEvent>,
        shutdown: CancellationToken,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (transport_events, transport_rx) = mpsc::unbounded_channel();
        let negotiator = Arc::new(Self {
            room_id: config.room_id,
            local: config.local,
            timings: config.timings,
            factory,
            media,
            outbox,
            events,
            transport_events,
            peers: parking_lot::Mutex::new(HashMap::new()),
            participants: parking_lot::Mutex::new(BTreeSet::new()),
            creation: tokio::sync::Mutex::new(()),
            next_generation: AtomicU64::new(0),
            shutdown,
        });
        (negotiator, transport_rx)
    }

    pub fn local(&self) -> &str {
        &self.local
    }

    pub fn timings(&self) -> &CallTimings {
        &self.timings
    }

    pub fn peer(&self, remote: &str) -> Option<Arc<PeerRecord>> {
        self.peers.lock().get(remote).cloned()
    }

    pub fn peers(&self) -> Vec<Arc<PeerRecord>> {
        self.peers.lock().values().cloned().collect()
    }

    pub fn transports(&self) -> Vec<(String, Arc<dyn PeerTransport>)> {
        self.peers
            .lock()
            .values()
            .map(|r| (r.remote.clone(), r.transport()))
            .collect()
    }

    /// Call participants that have no connection record.
    pub fn missing_participants(&self) -> Vec<String> {
        let peers = self.peers.lock();
        self.participants
            .lock()
            .iter()
            .filter(|name| !peers.contains_key(*name))
            .cloned()
            .collect()
    }

    fn note_participant(&self, remote: &str) {
        self.participants.lock().insert(remote.to_string());
    }

    /// Return the record for `remote`, creating the connection if needed.
    pub async fn ensure_peer(
        self: &Arc<Self>,
        remote: &str,
        listener: bool,
    ) -> Result<Arc<PeerRecord>, TransportError> {
        if let Some(record) = self.peer(remote) {
            return Ok(record);
        }
        let _creating = self.creation.lock().await;
        if let Some(record) = self.peer(remote) {
            return Ok(record);
        }
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Closed);
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let transport = self.build_transport(remote, generation).await?;
        let role = Role::for_pair(&self.local, remote);
        let record = Arc::new(PeerRecord::new(
            remote,
            role,
            listener,
            generation,
            transport,
            self.shutdown.child_token(),
        ));
        self.peers.lock().insert(remote.to_string(), Arc::clone(&record));
        info!(peer = %remote, ?role, generation, "Peer connection created");

        let _ = self.events.send(CallEvent::PeerJoined {
            username: remote.to_string(),
            listener,
        });
        self.arm_connect_timeout(&record);
        Ok(record)
    }

    async fn build_transport(
        &self,
        remote: &str,
        generation: u64,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let transport = self
            .factory
            .create(TransportContext {
                remote: remote.to_string(),
                generation,
                events: self.transport_events.clone(),
            })
            .await?;
        for (purpose, track) in self.media.attachments() {
            if let Err(e) = transport.add_track(purpose, &track).await {
                warn!(peer = %remote, ?purpose, error = %e, "Failed to attach track");
            }
        }
        Ok(transport)
    }

    /// A participant announced by the server (`call-new-peer`).
    pub async fn on_peer_discovered(self: &Arc<Self>, remote: &str, listener: bool) {
        if remote == self.local {
            return;
        }
        self.note_participant(remote);
        // A re-announced peer rejoined with a fresh connection; ours is stale.
        if self.peer(remote).is_some() {
            debug!(peer = %remote, "Peer re-announced, discarding old connection");
            self.discard(remote).await;
        }
        match self.ensure_peer(remote, listener).await {
            Ok(record) => self.schedule_initial_offer(&record),
            Err(e) => {
                warn!(peer = %remote, error = %e, "Could not create peer connection");
                let _ = self.events.send(CallEvent::Error {
                    username: Some(remote.to_string()),
                    message: e.to_string(),
                });
            }
        }
    }

    fn schedule_initial_offer(self: &Arc<Self>, record: &Arc<PeerRecord>) {
        let this = Arc::clone(self);
        let record = Arc::clone(record);
        let (delay, backup) = match record.role {
            Role::Impolite => (self.timings.initial_offer, false),
            Role::Polite => (self.timings.backup_offer, true),
        };
        tokio::spawn(async move {
            tokio::select! {
                _ = record.timers.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let mut negotiation = record.negotiation.lock().await;
            let transport = record.transport();
            let due = negotiation.state == NegotiationState::Idle
                && transport.signaling_state() == SignalingState::Stable
                && !(backup && negotiation.offer_received);
            if !due {
                debug!(peer = %record.remote, backup, state = %negotiation.state, "Initial offer not needed");
                return;
            }
            if backup {
                debug!(peer = %record.remote, "No offer arrived, sending backup offer");
            }
            if let Err(e) = this.offer_locked(&record, &mut negotiation, false).await {
                warn!(peer = %record.remote, error = %e, "Initial offer failed");
            }
        });
    }

    fn arm_connect_timeout(self: &Arc<Self>, record: &Arc<PeerRecord>) {
        let this = Arc::clone(self);
        let record = Arc::clone(record);
        let timeout = self.timings.connect_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = record.timers.cancelled() => return,
                _ = tokio::time::sleep(timeout) => {}
            }
            if record.transport().connection_state() != TransportState::Connected {
                info!(peer = %record.remote, "Not connected before timeout, renegotiating");
                this.restart_ice(&record.remote).await;
            }
        });
    }

    /// Create and send an offer if the connection is idle or stable.
    pub async fn offer(&self, remote: &str, ice_restart: bool) -> Result<(), TransportError> {
        let Some(record) = self.peer(remote) else {
            return Ok(());
        };
        let mut negotiation = record.negotiation.lock().await;
        self.offer_locked(&record, &mut negotiation, ice_restart).await
    }

    async fn offer_locked(
        &self,
        record: &PeerRecord,
        negotiation: &mut Negotiation,
        ice_restart: bool,
    ) -> Result<(), TransportError> {
        let transport = record.transport();
        if transport.signaling_state() != SignalingState::Stable || !negotiation.state.can_offer() {
            debug!(peer = %record.remote, state = %negotiation.state, "Offer skipped, negotiation in progress");
            return Ok(());
        }
        let offer = transport.create_offer(ice_restart).await?;
        transport.set_local_description(offer.clone()).await?;
        self.transition(record, negotiation, NegotiationInput::LocalOffer);
        self.send_description(&record.remote, &offer, transport.as_ref());
        debug!(peer = %record.remote, ice_restart, "Offer sent");
        Ok(())
    }

    async fn answer_locked(&self, record: &PeerRecord, negotiation: &mut Negotiation) -> Result<(), TransportError> {
        let transport = record.transport();
        let answer = transport.create_answer().await?;
        transport.set_local_description(answer.clone()).await?;
        self.transition(record, negotiation, NegotiationInput::LocalAnswer);
        self.send_description(&record.remote, &answer, transport.as_ref());
        debug!(peer = %record.remote, "Answer sent");
        self.flush_candidates(record, negotiation).await;
        Ok(())
    }

    pub async fn handle_offer(self: &Arc<Self>, from: &str, payload: Value) {
        let Some(payload) = parse_description(from, payload, &[SdpKind::Offer]) else {
            return;
        };
        self.note_participant(from);
        let record = match self.ensure_peer(from, false).await {
            Ok(record) => record,
            Err(e) => {
                warn!(peer = %from, error = %e, "Could not create peer connection for offer");
                return;
            }
        };
        record.declared.lock().extend(payload.tracks);
        record.gave_up.store(false, Ordering::Relaxed);

        let mut negotiation = record.negotiation.lock().await;
        negotiation.offer_received = true;
        let offer = payload.description;
        let result = match self
            .safe_set_remote_description(&record, &mut negotiation, offer.clone())
            .await
        {
            Ok(RemoteApply::Applied) => self.answer_locked(&record, &mut negotiation).await,
            Ok(RemoteApply::Ignored) => Ok(()),
            Ok(RemoteApply::Recreate) => self.recreate_locked(&record, &mut negotiation, Some(offer)).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(peer = %from, error = %e, "Failed to handle offer");
        }
    }

    pub async fn handle_answer(&self, from: &str, payload: Value) {
        let Some(payload) = parse_description(from, payload, &[SdpKind::Answer, SdpKind::Pranswer]) else {
            return;
        };
        let Some(record) = self.peer(from) else {
            debug!(peer = %from, "Answer from unknown peer ignored");
            return;
        };
        record.declared.lock().extend(payload.tracks);

        let mut negotiation = record.negotiation.lock().await;
        let result = match self
            .safe_set_remote_description(&record, &mut negotiation, payload.description)
            .await
        {
            Ok(RemoteApply::Applied) => {
                self.flush_candidates(&record, &mut negotiation).await;
                Ok(())
            }
            Ok(RemoteApply::Ignored) => Ok(()),
            Ok(RemoteApply::Recreate) => self.recreate_locked(&record, &mut negotiation, None).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(peer = %from, error = %e, "Failed to handle answer");
        }
    }

    pub async fn handle_candidate(&self, from: &str, payload: Value) {
        let candidate: IceCandidate = match serde_json::from_value(payload) {
            Ok(candidate) => candidate,
            Err(e) => {
                debug!(peer = %from, error = %e, "Malformed ICE candidate");
                return;
            }
        };
        let Some(record) = self.peer(from) else {
            return;
        };
        let mut negotiation = record.negotiation.lock().await;
        let transport = record.transport();
        if !transport.has_remote_description().await {
            negotiation.pending_candidates.push(candidate);
            return;
        }
        if let Err(e) = transport.add_ice_candidate(candidate).await {
            debug!(peer = %from, error = %e, "ICE candidate rejected");
        }
    }

    async fn flush_candidates(&self, record: &PeerRecord, negotiation: &mut Negotiation) {
        if negotiation.pending_candidates.is_empty() {
            return;
        }
        let transport = record.transport();
        for candidate in negotiation.pending_candidates.drain(..) {
            if let Err(e) = transport.add_ice_candidate(candidate).await {
                debug!(peer = %record.remote, error = %e, "Buffered ICE candidate rejected");
            }
        }
    }

    /// Apply a remote description, resolving glare and stale answers.
    pub async fn safe_set_remote_description(
        &self,
        record: &PeerRecord,
        negotiation: &mut Negotiation,
        desc: SessionDescription,
    ) -> Result<RemoteApply, TransportError> {
        let transport = record.transport();
        match desc.kind {
            SdpKind::Offer => {
                if transport.signaling_state() == SignalingState::HaveLocalOffer {
                    match record.role {
                        Role::Impolite => {
                            debug!(peer = %record.remote, "Glare: keeping our offer");
                            return Ok(RemoteApply::Ignored);
                        }
                        Role::Polite => {
                            debug!(peer = %record.remote, "Glare: rolling back our offer");
                            if let Err(e) = transport.set_local_description(SessionDescription::rollback()).await {
                                warn!(peer = %record.remote, error = %e, "Rollback failed");
                                return Ok(RemoteApply::Recreate);
                            }
                            self.transition(record, negotiation, NegotiationInput::Rollback);
                        }
                    }
                }
                match transport.set_remote_description(desc).await {
                    Ok(()) => {
                        self.transition(record, negotiation, NegotiationInput::RemoteOffer);
                        Ok(RemoteApply::Applied)
                    }
                    Err(TransportError::RoleConflict(_) | TransportError::InvalidState(_)) => {
                        Ok(RemoteApply::Recreate)
                    }
                    Err(e) => Err(e),
                }
            }
            SdpKind::Answer | SdpKind::Pranswer => {
                if transport.signaling_state() != SignalingState::HaveLocalOffer {
                    debug!(peer = %record.remote, "Stale answer ignored");
                    return Ok(RemoteApply::Ignored);
                }
                match transport.set_remote_description(desc).await {
                    Ok(()) => {
                        self.transition(record, negotiation, NegotiationInput::RemoteAnswer);
                        Ok(RemoteApply::Applied)
                    }
                    Err(TransportError::RoleConflict(_)) => Ok(RemoteApply::Recreate),
                    Err(e) => Err(e),
                }
            }
            SdpKind::Rollback => Ok(RemoteApply::Ignored),
        }
    }

    /// Count a recovery attempt. Returns false once the limit is exhausted;
    /// the peer then stays as is until something external happens.
    fn begin_recovery(&self, record: &PeerRecord) -> bool {
        if record.gave_up.load(Ordering::Relaxed) {
            return false;
        }
        let attempt = record.recovery_attempts.fetch_add(1, Ordering::Relaxed) + 1;
        if attempt > self.timings.max_recreate_attempts {
            record.gave_up.store(true, Ordering::Relaxed);
            let message = format!(
                "Could not reconnect to {} after {} attempts",
                record.remote, self.timings.max_recreate_attempts
            );
            warn!(peer = %record.remote, "{message}");
            record.monitor.set_error(message.clone());
            let _ = self.events.send(CallEvent::Error {
                username: Some(record.remote.clone()),
                message,
            });
            return false;
        }
        if record.monitor.update_health(PeerHealth::Reconnecting) {
            self.emit_health(record);
        }
        true
    }

    /// Close and rebuild the peer connection, then renegotiate. A pending
    /// remote offer is applied to the fresh connection and answered; without
    /// one we offer.
    async fn recreate_locked(
        &self,
        record: &PeerRecord,
        negotiation: &mut Negotiation,
        pending_offer: Option<SessionDescription>,
    ) -> Result<(), TransportError> {
        if !self.begin_recovery(record) {
            return Ok(());
        }
        self.transition(record, negotiation, NegotiationInput::Recover);

        // The old connection stays in place until its replacement exists.
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let fresh = self.build_transport(&record.remote, generation).await?;
        let old = std::mem::replace(&mut *record.current.lock(), (generation, fresh)).1;
        old.close().await;
        record.touch();
        negotiation.pending_candidates.clear();
        info!(peer = %record.remote, generation, "Peer connection rebuilt");

        if let Some(offer) = pending_offer {
            if record.transport().set_remote_description(offer).await.is_ok() {
                self.transition(record, negotiation, NegotiationInput::RemoteOffer);
                return self.answer_locked(record, negotiation).await;
            }
        }
        self.offer_locked(record, negotiation, false).await
    }

    /// Rebuild the connection for `remote` and offer.
    pub async fn recreate(&self, remote: &str) {
        let Some(record) = self.peer(remote) else {
            return;
        };
        let mut negotiation = record.negotiation.lock().await;
        if let Err(e) = self.recreate_locked(&record, &mut negotiation, None).await {
            warn!(peer = %remote, error = %e, "Recreate failed");
        }
    }

    /// ICE-restart offer on the existing connection. A connection whose
    /// signaling is stuck mid-negotiation is rebuilt instead.
    pub async fn restart_ice(&self, remote: &str) {
        let Some(record) = self.peer(remote) else {
            return;
        };
        let mut negotiation = record.negotiation.lock().await;
        if record.transport().signaling_state() != SignalingState::Stable {
            if let Err(e) = self.recreate_locked(&record, &mut negotiation, None).await {
                warn!(peer = %remote, error = %e, "Recreate failed");
            }
            return;
        }
        if !self.begin_recovery(&record) {
            return;
        }
        self.transition(&record, &mut negotiation, NegotiationInput::Recover);
        record.touch();
        if let Err(e) = self.offer_locked(&record, &mut negotiation, true).await {
            warn!(peer = %remote, error = %e, "ICE restart failed");
        }
    }

    /// Record a transport state report. Returns the record if the report came
    /// from its current connection.
    pub fn note_transport_state(&self, remote: &str, generation: u64, state: TransportState) -> Option<Arc<PeerRecord>> {
        let record = self.peer(remote)?;
        if record.generation() != generation {
            debug!(peer = %remote, generation, "State change from replaced connection ignored");
            return None;
        }
        if state == TransportState::Connected {
            record.recovery_attempts.store(0, Ordering::Relaxed);
            record.gave_up.store(false, Ordering::Relaxed);
        }
        record
            .monitor
            .update_signaling_state(record.transport().signaling_state());
        if record.monitor.update_transport_state(state) {
            info!(peer = %remote, health = %record.monitor.status().health, "Peer health changed");
            self.emit_health(&record);
        }
        Some(record)
    }

    pub async fn on_transport_event(&self, event: TransportEvent) {
        let Some(record) = self.peer(&event.remote) else {
            return;
        };
        if record.generation() != event.generation {
            return;
        }
        match event.kind {
            TransportEventKind::LocalCandidate(candidate) => match serde_json::to_value(&candidate) {
                Ok(payload) => {
                    let _ = self.outbox.send(ClientMessage::CallIce(self.signal(&event.remote, payload)));
                }
                Err(e) => debug!(error = %e, "Could not encode ICE candidate"),
            },
            TransportEventKind::RemoteTrack(track) => {
                let purpose = classify(&track, &record.declared.lock());
                info!(peer = %event.remote, ?purpose, kind = ?track.kind, "Remote track");
                let _ = self.events.send(CallEvent::RemoteTrack {
                    username: event.remote,
                    purpose,
                    track,
                });
            }
            TransportEventKind::StateChanged(state) => {
                self.note_transport_state(&event.remote, event.generation, state);
            }
        }
    }

    /// `call-peer-left`: close and forget the peer.
    pub async fn remove_peer(&self, remote: &str) {
        self.participants.lock().remove(remote);
        if self.discard(remote).await {
            info!(peer = %remote, "Peer left");
            let _ = self.events.send(CallEvent::PeerLeft {
                username: remote.to_string(),
            });
        }
    }

    async fn discard(&self, remote: &str) -> bool {
        let Some(record) = self.peers.lock().remove(remote) else {
            return false;
        };
        record.timers.cancel();
        {
            let mut negotiation = record.negotiation.lock().await;
            self.transition(&record, &mut negotiation, NegotiationInput::Close);
        }
        record.transport().close().await;
        true
    }

    /// Tear down every connection and stop all timers.
    pub async fn leave(&self) {
        self.shutdown.cancel();
        let records: Vec<Arc<PeerRecord>> = self.peers.lock().drain().map(|(_, r)| r).collect();
        self.participants.lock().clear();
        for record in records {
            record.transport().close().await;
        }
        info!(room = %self.room_id, "Left call");
    }

    fn transition(&self, record: &PeerRecord, negotiation: &mut Negotiation, input: NegotiationInput) {
        match negotiation.state.apply(input) {
            Ok(next) => {
                negotiation.state = next;
                record.monitor.update_negotiation(next);
                record
                    .monitor
                    .update_signaling_state(record.transport().signaling_state());
            }
            Err(e) => warn!(peer = %record.remote, error = %e, "Negotiation state out of step"),
        }
    }

    fn emit_health(&self, record: &PeerRecord) {
        let _ = self.events.send(CallEvent::Health {
            username: record.remote.clone(),
            health: record.monitor.status().health,
        });
    }

    fn signal(&self, to: &str, payload: Value) -> PeerSignal {
        PeerSignal {
            room_id: self.room_id.clone(),
            from: self.local.clone(),
            to: to.to_string(),
            payload,
        }
    }

    fn send_description(&self, remote: &str, desc: &SessionDescription, transport: &dyn PeerTransport) {
        let tracks = TrackPurpose::ATTACH_ORDER
            .into_iter()
            .filter_map(|purpose| transport.sender_track_id(purpose).map(|id| (id, purpose)))
            .collect();
        let payload = DescriptionPayload {
            description: desc.clone(),
            tracks,
        };
        let payload = match serde_json::to_value(&payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(peer = %remote, error = %e, "Could not encode description");
                return;
            }
        };
        let signal = self.signal(remote, payload);
        let message = match desc.kind {
            SdpKind::Offer => ClientMessage::CallOffer(signal),
            _ => ClientMessage::CallAnswer(signal),
        };
        let _ = self.outbox.send(message);
    }
}

fn parse_description(from: &str, payload: Value, expected: &[SdpKind]) -> Option<DescriptionPayload> {
    match serde_json::from_value::<DescriptionPayload>(payload) {
        Ok(payload) if expected.contains(&payload.description.kind) => Some(payload),
        Ok(payload) => {
            warn!(peer = %from, kind = ?payload.description.kind, "Unexpected description type");
            None
        }
        Err(e) => {
            warn!(peer = %from, error = %e, "Malformed description");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::media::{MediaOptions, NoDevices};
    use crate::client::testing::FakeFactory;

    struct Side {
        negotiator: Arc<Negotiator>,
        factory: Arc<FakeFactory>,
        outbox: mpsc::UnboundedReceiver<ClientMessage>,
        events: mpsc::UnboundedReceiver<CallEvent>,
        transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    }

    impl Side {
        async fn new(local: &str) -> Self {
            let factory = Arc::new(FakeFactory::default());
            let (media, _) = MediaFoundation::establish(Arc::new(NoDevices), MediaOptions::default()).await;
            let (out_tx, outbox) = mpsc::unbounded_channel();
            let (ev_tx, events) = mpsc::unbounded_channel();
            let (negotiator, transport_rx) = Negotiator::new(
                NegotiatorConfig {
                    room_id: "r1".into(),
                    local: local.into(),
                    timings: CallTimings::default(),
                },
                factory.clone(),
                Arc::new(media),
                out_tx,
                ev_tx,
                CancellationToken::new(),
            );
            Self {
                negotiator,
                factory,
                outbox,
                events,
                transport_rx,
            }
        }

        fn sent(&mut self) -> Vec<ClientMessage> {
            std::iter::from_fn(|| self.outbox.try_recv().ok()).collect()
        }

        fn offers(&mut self) -> Vec<PeerSignal> {
            self.sent()
                .into_iter()
                .filter_map(|m| match m {
                    ClientMessage::CallOffer(s) => Some(s),
                    _ => None,
                })
                .collect()
        }
    }

    async fn deliver(message: ClientMessage, to: &Side) {
        match message {
            ClientMessage::CallOffer(s) => to.negotiator.handle_offer(&s.from, s.payload).await,
            ClientMessage::CallAnswer(s) => to.negotiator.handle_answer(&s.from, s.payload).await,
            ClientMessage::CallIce(s) => to.negotiator.handle_candidate(&s.from, s.payload).await,
            _ => {}
        }
    }

    /// Deliver queued signaling both ways until both sides go quiet.
    async fn pump(a: &mut Side, b: &mut Side) {
        loop {
            let from_a = a.sent();
            let from_b = b.sent();
            if from_a.is_empty() && from_b.is_empty() {
                break;
            }
            for m in from_a {
                deliver(m, b).await;
            }
            for m in from_b {
                deliver(m, a).await;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn glare_converges_on_the_impolite_offer() {
        let mut a = Side::new("A").await;
        let mut b = Side::new("B").await;
        a.negotiator.ensure_peer("B", false).await.unwrap();
        b.negotiator.ensure_peer("A", false).await.unwrap();

        // Both offer before seeing the other's offer.
        a.negotiator.offer("B", false).await.unwrap();
        b.negotiator.offer("A", false).await.unwrap();
        let a_offer = a.offers().remove(0);
        let b_offer = b.offers().remove(0);
        deliver(ClientMessage::CallOffer(a_offer), &b).await;
        deliver(ClientMessage::CallOffer(b_offer.clone()), &a).await;
        pump(&mut a, &mut b).await;

        let ta = a.factory.latest("B").unwrap();
        let tb = b.factory.latest("A").unwrap();
        assert_eq!(ta.signaling_state(), SignalingState::Stable);
        assert_eq!(tb.signaling_state(), SignalingState::Stable);

        // A answered B's offer; A's own offer was discarded.
        let b_sdp = b_offer.payload["sdp"].as_str().unwrap().to_string();
        assert_eq!(ta.remote_sdp().as_deref(), Some(b_sdp.as_str()));
        assert_eq!(ta.local_kind(), Some(SdpKind::Answer));
        let sections = ta.local_sdp().unwrap().lines().filter(|l| l.starts_with("m=")).count();
        assert_eq!(sections, 2);

        assert_eq!(a.factory.created("B"), 1);
        assert_eq!(b.factory.created("A"), 1);
        let ra = a.negotiator.peer("B").unwrap();
        assert_eq!(ra.monitor().status().negotiation, NegotiationState::Stable);
    }

    #[tokio::test(start_paused = true)]
    async fn impolite_offers_first_and_polite_holds_back() {
        let mut impolite = Side::new("B").await;
        let mut polite = Side::new("A").await;

        impolite.negotiator.on_peer_discovered("A", false).await;
        polite.negotiator.on_peer_discovered("B", false).await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        let offers = impolite.offers();
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].to, "A");
        assert!(polite.offers().is_empty());

        deliver(ClientMessage::CallOffer(offers[0].clone()), &polite).await;
        pump(&mut impolite, &mut polite).await;
        tokio::time::sleep(Duration::from_millis(600)).await;
        // The offer arrived in time, so no backup offer.
        assert!(polite.offers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn initial_offer_waits_for_its_delay() {
        let mut impolite = Side::new("B").await;
        let mut polite = Side::new("A").await;
        impolite.negotiator.on_peer_discovered("A", false).await;
        polite.negotiator.on_peer_discovered("B", false).await;

        tokio::time::sleep(Duration::from_millis(99)).await;
        assert!(impolite.offers().is_empty());
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(impolite.offers().len(), 1);

        tokio::time::sleep(Duration::from_millis(397)).await;
        assert!(polite.offers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn polite_backup_offer_fires_when_nothing_arrives() {
        let mut polite = Side::new("A").await;
        polite.negotiator.on_peer_discovered("B", false).await;
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(polite.offers().is_empty());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(polite.offers().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_answer_is_ignored() {
        let mut a = Side::new("A").await;
        let mut b = Side::new("B").await;
        a.negotiator.ensure_peer("B", false).await.unwrap();
        b.negotiator.ensure_peer("A", false).await.unwrap();
        b.negotiator.offer("A", false).await.unwrap();
        pump(&mut b, &mut a).await;

        let answer = DescriptionPayload {
            description: SessionDescription::answer("v=0 stale"),
            tracks: HashMap::new(),
        };
        b.negotiator
            .handle_answer("A", serde_json::to_value(answer).unwrap())
            .await;
        let tb = b.factory.latest("A").unwrap();
        assert_eq!(tb.signaling_state(), SignalingState::Stable);
        assert_eq!(b.factory.created("A"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn role_conflict_rebuilds_and_reoffers() {
        let mut a = Side::new("A").await;
        let mut b = Side::new("B").await;
        a.negotiator.ensure_peer("B", false).await.unwrap();
        b.negotiator.ensure_peer("A", false).await.unwrap();
        b.negotiator.offer("A", false).await.unwrap();
        let offer = b.offers().remove(0);

        a.factory
            .latest("B")
            .unwrap()
            .fail_next_remote(TransportError::RoleConflict("dtls role".into()));
        deliver(ClientMessage::CallOffer(offer), &a).await;

        assert_eq!(a.factory.created("B"), 2);
        let sent = a.sent();
        assert!(sent.iter().any(|m| matches!(m, ClientMessage::CallAnswer(_))));
        let record = a.negotiator.peer("B").unwrap();
        assert_eq!(record.generation(), 2);
        assert_eq!(record.recovery_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn candidates_wait_for_remote_description() {
        let mut a = Side::new("A").await;
        let mut b = Side::new("B").await;
        a.negotiator.ensure_peer("B", false).await.unwrap();
        b.negotiator.ensure_peer("A", false).await.unwrap();

        let candidate = serde_json::to_value(IceCandidate {
            candidate: "candidate:1".into(),
            ..Default::default()
        })
        .unwrap();
        a.negotiator.handle_candidate("B", candidate).await;
        let ta = a.factory.latest("B").unwrap();
        assert!(ta.candidates().is_empty());

        b.negotiator.offer("A", false).await.unwrap();
        pump(&mut b, &mut a).await;
        assert_eq!(ta.candidates().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_gives_up_after_limit() {
        let mut a = Side::new("A").await;
        a.negotiator.ensure_peer("B", false).await.unwrap();
        for _ in 0..3 {
            a.negotiator.recreate("B").await;
        }
        assert_eq!(a.factory.created("B"), 4);
        a.negotiator.recreate("B").await;
        assert_eq!(a.factory.created("B"), 4);

        let errors: Vec<CallEvent> = std::iter::from_fn(|| a.events.try_recv().ok())
            .filter(|e| matches!(e, CallEvent::Error { .. }))
            .collect();
        assert_eq!(errors.len(), 1);
        let record = a.negotiator.peer("B").unwrap();
        assert_eq!(record.monitor().status().health, PeerHealth::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_rebuild_keeps_the_old_connection() {
        let a = Side::new("A").await;
        a.negotiator.ensure_peer("B", false).await.unwrap();
        let first = a.factory.latest("B").unwrap();

        a.factory.fail_next(1);
        a.negotiator.recreate("B").await;
        assert!(!first.is_closed());
        let record = a.negotiator.peer("B").unwrap();
        assert_eq!(record.generation(), 1);

        a.negotiator.recreate("B").await;
        assert!(first.is_closed());
        assert_eq!(a.factory.created("B"), 2);
        assert_ne!(record.generation(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn offers_declare_track_purposes() {
        let mut a = Side::new("A").await;
        a.negotiator.ensure_peer("B", false).await.unwrap();
        a.negotiator.offer("B", false).await.unwrap();
        let offer = a.offers().remove(0);
        let payload: DescriptionPayload = serde_json::from_value(offer.payload).unwrap();
        let mut purposes: Vec<TrackPurpose> = payload.tracks.values().copied().collect();
        purposes.sort_by_key(|p| TrackPurpose::ATTACH_ORDER.iter().position(|q| q == p));
        assert_eq!(purposes, vec![TrackPurpose::Microphone, TrackPurpose::Camera]);
    }

    #[tokio::test(start_paused = true)]
    async fn departure_closes_and_stops_timers() {
        let mut a = Side::new("B").await;
        a.negotiator.on_peer_discovered("A", false).await;
        let transport = a.factory.latest("A").unwrap();
        a.negotiator.remove_peer("A").await;
        assert!(transport.is_closed());
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(a.offers().is_empty());
        assert!(a.negotiator.peer("A").is_none());
        let left = std::iter::from_fn(|| a.events.try_recv().ok())
            .any(|e| matches!(e, CallEvent::PeerLeft { .. }));
        assert!(left);
        let _ = a.transport_rx.try_recv();
    }
}
