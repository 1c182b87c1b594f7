//! Wire protocol shared by the server and the call client.
//!
//! Every frame is a JSON object discriminated by its `type` field. Field
//! names are camelCase on the wire.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RoomError;
use crate::room::{RoomInfo, RoomSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Public,
    Private,
}

/// Point-to-point call signaling envelope. `payload` is opaque to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSignal {
    pub room_id: String,
    pub from: String,
    pub to: String,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    #[serde(rename = "getRooms")]
    GetRooms,

    #[serde(rename = "joinRoom")]
    JoinRoom {
        room_id: String,
        username: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        visibility: Option<Visibility>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_participants: Option<usize>,
    },

    #[serde(rename = "leaveRoom")]
    LeaveRoom { room_id: String, username: String },

    #[serde(rename = "updateRoomSettings")]
    UpdateRoomSettings {
        room_id: String,
        username: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        update_id: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_participants: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        locked: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        visibility: Option<Visibility>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },

    #[serde(rename = "sendMessage")]
    SendMessage {
        room_id: String,
        username: String,
        text: String,
    },

    #[serde(rename = "sendFile")]
    SendFile {
        room_id: String,
        username: String,
        file_name: String,
        file_type: String,
        file_data: String,
        #[serde(default)]
        timestamp: i64,
        #[serde(default)]
        as_audio: bool,
    },

    #[serde(rename = "call-join")]
    CallJoin {
        room_id: String,
        username: String,
        #[serde(default)]
        is_listener: bool,
    },

    #[serde(rename = "call-offer")]
    CallOffer(PeerSignal),

    #[serde(rename = "call-answer")]
    CallAnswer(PeerSignal),

    #[serde(rename = "call-ice")]
    CallIce(PeerSignal),

    #[serde(rename = "call-peer-left")]
    CallPeerLeft { room_id: String, username: String },
}

impl ClientMessage {
    /// Short variant name for logging. Payloads (SDP, file data) stay out of logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::GetRooms => "getRooms",
            ClientMessage::JoinRoom { .. } => "joinRoom",
            ClientMessage::LeaveRoom { .. } => "leaveRoom",
            ClientMessage::UpdateRoomSettings { .. } => "updateRoomSettings",
            ClientMessage::SendMessage { .. } => "sendMessage",
            ClientMessage::SendFile { .. } => "sendFile",
            ClientMessage::CallJoin { .. } => "call-join",
            ClientMessage::CallOffer(_) => "call-offer",
            ClientMessage::CallAnswer(_) => "call-answer",
            ClientMessage::CallIce(_) => "call-ice",
            ClientMessage::CallPeerLeft { .. } => "call-peer-left",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileAttachment {
    pub file_name: String,
    pub file_type: String,
    pub file_data: String,
    #[serde(default)]
    pub as_audio: bool,
}

/// A chat line as delivered in `newMessage`. System notices (join/leave,
/// failed transfers) set `system`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub username: String,
    pub text: String,
    pub timestamp: i64,
    #[serde(default)]
    pub system: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileAttachment>,
}

impl ChatMessage {
    pub fn user(username: &str, text: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            username: username.to_string(),
            text: text.to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            system: false,
            file: None,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            username: "system".to_string(),
            text: text.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            system: true,
            file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    #[serde(rename = "rooms")]
    Rooms { rooms: Vec<RoomSummary> },

    #[serde(rename = "roomInfo")]
    RoomInfo {
        room: RoomInfo,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        update_id: Option<Value>,
    },

    #[serde(rename = "newMessage")]
    NewMessage { message: ChatMessage },

    #[serde(rename = "error")]
    Error {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        redirect_to: Option<String>,
    },

    #[serde(rename = "call-new-peer")]
    CallNewPeer {
        room_id: String,
        username: String,
        #[serde(default)]
        is_listener: bool,
    },

    #[serde(rename = "call-offer")]
    CallOffer(PeerSignal),

    #[serde(rename = "call-answer")]
    CallAnswer(PeerSignal),

    #[serde(rename = "call-ice")]
    CallIce(PeerSignal),

    #[serde(rename = "call-peer-left")]
    CallPeerLeft { room_id: String, username: String },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            error: message.into(),
            redirect_to: None,
        }
    }

    pub fn to_json(&self) -> String {
        // Serializing these types cannot fail: no maps with non-string keys.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

impl From<&RoomError> for ServerMessage {
    fn from(err: &RoomError) -> Self {
        ServerMessage::Error {
            error: err.to_string(),
            redirect_to: err.redirect().map(str::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn join_room_accepts_minimal_payload() {
        let msg: ClientMessage =
            serde_json::from_value(json!({"type": "joinRoom", "roomId": "r1", "username": "A"}))
                .unwrap();
        assert_eq!(
            msg,
            ClientMessage::JoinRoom {
                room_id: "r1".into(),
                username: "A".into(),
                password: None,
                display_name: None,
                visibility: None,
                max_participants: None,
            }
        );
    }

    #[test]
    fn call_signals_use_hyphenated_tags() {
        let msg = ClientMessage::CallOffer(PeerSignal {
            room_id: "r1".into(),
            from: "B".into(),
            to: "A".into(),
            payload: json!({"type": "offer", "sdp": "v=0"}),
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "call-offer");
        assert_eq!(value["roomId"], "r1");
        assert_eq!(value["payload"]["sdp"], "v=0");
    }

    #[test]
    fn room_errors_carry_redirects() {
        let msg = ServerMessage::from(&RoomError::NotFound {
            room_id: "gone".into(),
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["redirectTo"], "/");

        let plain = serde_json::to_value(ServerMessage::error("nope")).unwrap();
        assert!(plain.get("redirectTo").is_none());
    }

    #[test]
    fn new_peer_round_trips_listener_flag() {
        let text = ServerMessage::CallNewPeer {
            room_id: "r1".into(),
            username: "B".into(),
            is_listener: true,
        }
        .to_json();
        assert!(text.contains("\"isListener\":true"));
        let back: ServerMessage = serde_json::from_str(&text).unwrap();
        assert!(matches!(back, ServerMessage::CallNewPeer { is_listener: true, .. }));
    }
}
