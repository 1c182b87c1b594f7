use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::state::NegotiationState;
use super::transport::{SignalingState, TransportState};

/// Health label shown for a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerHealth {
    Disconnected,
    Connecting,
    Connected,
    Failed,
    Reconnecting,
}

impl fmt::Display for PeerHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerHealth::Disconnected => write!(f, "Disconnected"),
            PeerHealth::Connecting => write!(f, "Connecting"),
            PeerHealth::Connected => write!(f, "Connected"),
            PeerHealth::Failed => write!(f, "Failed"),
            PeerHealth::Reconnecting => write!(f, "Reconnecting"),
        }
    }
}

impl PeerHealth {
    /// Label implied by a transport state alone.
    pub fn from_transport(state: TransportState) -> Self {
        match state {
            TransportState::New | TransportState::Connecting => PeerHealth::Connecting,
            TransportState::Connected => PeerHealth::Connected,
            TransportState::Disconnected => PeerHealth::Disconnected,
            TransportState::Failed => PeerHealth::Failed,
            TransportState::Closed => PeerHealth::Disconnected,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PeerStatus {
    pub health: PeerHealth,
    pub signaling_state: SignalingState,
    pub transport_state: TransportState,
    pub negotiation: NegotiationState,
    pub last_error: Option<String>,
}

impl Default for PeerStatus {
    fn default() -> Self {
        Self {
            health: PeerHealth::Connecting,
            signaling_state: SignalingState::Stable,
            transport_state: TransportState::New,
            negotiation: NegotiationState::Idle,
            last_error: None,
        }
    }
}

/// Observable status of one peer connection.
#[derive(Clone)]
pub struct PeerMonitor {
    status: Arc<watch::Sender<PeerStatus>>,
    receiver: watch::Receiver<PeerStatus>,
}

impl Default for PeerMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerMonitor {
    pub fn new() -> Self {
        let (status, receiver) = watch::channel(PeerStatus::default());
        Self {
            status: Arc::new(status),
            receiver,
        }
    }

    /// Set the health label. Returns true if it changed.
    pub fn update_health(&self, health: PeerHealth) -> bool {
        self.status.send_if_modified(|status| {
            let changed = status.health != health;
            status.health = health;
            changed
        })
    }

    pub fn update_signaling_state(&self, state: SignalingState) {
        self.status.send_modify(|status| {
            status.signaling_state = state;
        });
    }

    /// Record a transport state and derive the label from it. Returns true
    /// if the label changed.
    pub fn update_transport_state(&self, state: TransportState) -> bool {
        self.status.send_if_modified(|status| {
            status.transport_state = state;
            let health = PeerHealth::from_transport(state);
            let changed = status.health != health;
            status.health = health;
            if health == PeerHealth::Connected {
                status.last_error = None;
            }
            changed
        })
    }

    pub fn update_negotiation(&self, state: NegotiationState) {
        self.status.send_modify(|status| {
            status.negotiation = state;
        });
    }

    pub fn set_error(&self, error: String) {
        self.status.send_modify(|status| {
            status.last_error = Some(error);
            status.health = PeerHealth::Failed;
        });
    }

    pub fn status(&self) -> PeerStatus {
        self.receiver.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PeerStatus> {
        self.receiver.clone()
    }
}
