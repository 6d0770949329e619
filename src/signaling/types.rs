use std::collections::HashSet;
use std::fmt;

use rand::Rng;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Utf8Bytes;

/// Signaling server errors
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("join a room first")]
    NotJoined,

    #[error("room is shutting down: {0}")]
    RoomRetired(RoomKey),

    #[error("internal error: {0}")]
    Internal(String),
}

const CONN_ID_PREFIX: &[u8] = b"conn_";
const CONN_ID_LEN: usize = 21;
const HEX_CHARS: &[u8] = b"0123456789abcdef";

/// Room key as supplied by the joining client
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomKey(String);

impl RoomKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RoomKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Connection ID: 21-byte fixed array ("conn_" + 16 hex)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId {
    bytes: [u8; CONN_ID_LEN],
    len: u8,
}

impl ConnId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; CONN_ID_LEN];
        bytes[..CONN_ID_PREFIX.len()].copy_from_slice(CONN_ID_PREFIX);

        let mut rng = rand::rng();
        let value: u64 = rng.random();

        for i in 0..16 {
            let nibble = ((value >> (60 - i * 4)) & 0xF) as usize;
            bytes[CONN_ID_PREFIX.len() + i] = HEX_CHARS[nibble];
        }
        Self {
            bytes,
            len: CONN_ID_LEN as u8,
        }
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected connection id text
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid connection id {0:?}")]
pub struct InvalidConnId(String);

impl TryFrom<&str> for ConnId {
    type Error = InvalidConnId;

    /// Accepts 1 to 21 ASCII bytes. Longer text is rejected rather than
    /// truncated, so it can never name a different live session.
    fn try_from(s: &str) -> Result<Self, Self::Error> {
        let src = s.as_bytes();
        if src.is_empty() || src.len() > CONN_ID_LEN || !s.is_ascii() {
            return Err(InvalidConnId(s.to_string()));
        }
        let mut bytes = [0u8; CONN_ID_LEN];
        bytes[..src.len()].copy_from_slice(src);
        Ok(Self {
            bytes,
            len: src.len() as u8,
        })
    }
}

impl Serialize for ConnId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ConnId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ConnId::try_from(s.as_str()).map_err(D::Error::custom)
    }
}

/// A room member as announced to a newcomer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub conn_id: ConnId,
    pub name: String,
}

/// Point-in-time view of a room, for inspection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSnapshot {
    pub key: RoomKey,
    /// Display names in join order, duplicates kept
    pub names: Vec<String>,
    pub conn_ids: Vec<ConnId>,
}

/// Wrapper for outbound WebSocket messages using tungstenite's Utf8Bytes.
#[derive(Debug, Clone)]
pub struct OutboundMessage(Utf8Bytes);

impl OutboundMessage {
    /// Create a new outbound message from any string type
    pub fn new(s: impl Into<Utf8Bytes>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Get the inner Utf8Bytes for tungstenite Message::Text
    pub fn into_inner(self) -> Utf8Bytes {
        self.0
    }
}

impl From<String> for OutboundMessage {
    fn from(s: String) -> Self {
        Self(Utf8Bytes::from(s))
    }
}

pub type OutboundSender = mpsc::UnboundedSender<OutboundMessage>;

#[derive(Debug)]
pub(crate) struct Member {
    pub conn_id: ConnId,
    pub name: String,
    /// Channel for outbound messages to this member.
    /// Uses OutboundMessage (Utf8Bytes) for O(1) broadcast cloning.
    pub tx: OutboundSender,
}

#[derive(Debug)]
pub(crate) struct Room {
    pub key: RoomKey,
    pub members: Vec<Member>,
}

impl Room {
    pub fn new(key: RoomKey) -> Self {
        Self {
            key,
            members: Vec::new(),
        }
    }

    pub fn roster(&self) -> Vec<String> {
        self.members.iter().map(|m| m.name.clone()).collect()
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.members
            .iter()
            .map(|m| PeerInfo {
                conn_id: m.conn_id,
                name: m.name.clone(),
            })
            .collect()
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            key: self.key.clone(),
            names: self.roster(),
            conn_ids: self.members.iter().map(|m| m.conn_id).collect(),
        }
    }

    pub fn broadcast(&self, msg: &OutboundMessage, exclude: Option<ConnId>) {
        for member in &self.members {
            if Some(member.conn_id) == exclude {
                continue;
            }
            let _ = member.tx.send(msg.clone());
        }
    }
}

#[derive(Debug)]
pub(crate) struct Session {
    pub room: RoomKey,
    pub name: String,
    pub tx: OutboundSender,
    /// Remote connections this session has exchanged offers with
    pub signaled: HashSet<ConnId>,
}
