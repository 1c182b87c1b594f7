//! Call participant: a full-mesh of peer connections negotiated over the
//! room server's signaling relay.

pub mod capture;
pub mod classify;
pub mod connection;
pub mod g711;
pub mod health;
pub mod media;
pub mod mixer;
pub mod negotiator;
pub mod rtc;
pub mod session;
pub mod signaling;
pub mod state;
pub mod synthetic;
pub mod track;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

use crate::protocol::ChatMessage;

use self::connection::PeerHealth;
use self::transport::{RemoteTrackInfo, TrackPurpose};

/// What the call reports to whoever drives the UI.
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    PeerJoined {
        username: String,
        listener: bool,
    },
    PeerLeft {
        username: String,
    },
    RemoteTrack {
        username: String,
        purpose: TrackPurpose,
        track: RemoteTrackInfo,
    },
    Health {
        username: String,
        health: PeerHealth,
    },
    Chat(ChatMessage),
    /// A non-fatal fallback the user should know about.
    Notice(String),
    Error {
        username: Option<String>,
        message: String,
    },
}
