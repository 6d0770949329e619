use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::{ConnId, PeerInfo, RoomKey};

/// One discovered network path endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

/// Structured chat payload carried opaquely by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatPayload {
    pub kind: String,
    pub text: String,
    #[serde(rename = "displayName")]
    pub display_name: String,
}

impl ChatPayload {
    pub const KIND: &'static str = "chat";

    pub fn new(display_name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            kind: Self::KIND.to_string(),
            text: text.into(),
            display_name: display_name.into(),
        }
    }

    pub fn is_chat(&self) -> bool {
        self.kind == Self::KIND
    }
}

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join (or create) a room under a display name
    Join { room: RoomKey, name: String },

    /// Leave the current room
    Leave,

    Offer { sdp: String, to: ConnId, from: ConnId },

    Answer { sdp: String, to: ConnId, from: ConnId },

    IceCandidate {
        candidate: IceCandidate,
        to: ConnId,
        from: ConnId,
    },

    /// Ask `to` to open a link toward `from`
    ConnectRequest { to: ConnId, from: ConnId },

    /// Broadcast to the whole room, sender included
    Chat { room: RoomKey, payload: Value },
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Join { .. } => "join",
            ClientMessage::Leave => "leave",
            ClientMessage::Offer { .. } => "offer",
            ClientMessage::Answer { .. } => "answer",
            ClientMessage::IceCandidate { .. } => "ice_candidate",
            ClientMessage::ConnectRequest { .. } => "connect_request",
            ClientMessage::Chat { .. } => "chat",
        }
    }
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent to the joiner only: its own id and the members already present
    Joined {
        conn_id: ConnId,
        room: RoomKey,
        peers: Vec<PeerInfo>,
    },

    /// Current display names of the room
    Roster { names: Vec<String> },

    /// A new member appeared; existing members open a link toward it
    PeerJoined { notice: String, conn_id: ConnId },

    PeerLeft { notice: String, conn_id: ConnId },

    ConnectRequest { from: ConnId },

    Offer { sdp: String, to: ConnId, from: ConnId },

    Answer { sdp: String, to: ConnId, from: ConnId },

    IceCandidate {
        candidate: IceCandidate,
        to: ConnId,
        from: ConnId,
    },

    Chat { room: RoomKey, payload: Value },

    /// Error response
    Error { message: String },
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Joined { .. } => "joined",
            ServerMessage::Roster { .. } => "roster",
            ServerMessage::PeerJoined { .. } => "peer_joined",
            ServerMessage::PeerLeft { .. } => "peer_left",
            ServerMessage::ConnectRequest { .. } => "connect_request",
            ServerMessage::Offer { .. } => "offer",
            ServerMessage::Answer { .. } => "answer",
            ServerMessage::IceCandidate { .. } => "ice_candidate",
            ServerMessage::Chat { .. } => "chat",
            ServerMessage::Error { .. } => "error",
        }
    }
}
