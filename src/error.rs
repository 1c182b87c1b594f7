use anyhow::Error as AnyhowError;
use tokio_tungstenite::tungstenite::Error as WsError;
use webrtc::Error as WebRTCError;

/// Rejections produced by the room registry. Always answered to the
/// requesting connection only, never broadcast.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Auth(String),

    #[error("Username \"{username}\" is already taken in this room")]
    DuplicateIdentity { username: String },

    #[error("Room is full ({capacity} participants max)")]
    RoomFull { capacity: usize },

    #[error("{0}")]
    InvalidOperation(String),

    #[error("Room \"{room_id}\" no longer exists")]
    NotFound { room_id: String },
}

impl RoomError {
    /// Path the client should navigate to, if the error means the room is gone.
    pub fn redirect(&self) -> Option<&'static str> {
        match self {
            RoomError::NotFound { .. } => Some("/"),
            _ => None,
        }
    }
}

/// Failures reported by a peer transport. The variant decides the recovery
/// path taken by the negotiator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("invalid signaling state: {0}")]
    InvalidState(String),

    #[error("transport role conflict: {0}")]
    RoleConflict(String),

    #[error("peer connection closed")]
    Closed,

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediaError {
    #[error("permission denied for {0}")]
    PermissionDenied(&'static str),

    #[error("no {0} device available")]
    Unavailable(&'static str),

    #[error("{0} device did not respond in time")]
    Timeout(&'static str),

    #[error("device error: {0}")]
    Device(String),
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("WebRTC error: {0}")]
    WebRTC(#[from] WebRTCError),

    #[error("WebSocket error: {0}")]
    Ws(#[from] WsError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Room(#[from] RoomError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error("signaling error: {0}")]
    Signaling(String),

    #[error("Other error: {0}")]
    Other(#[from] AnyhowError),
}

pub type Result<T> = std::result::Result<T, AppError>;
