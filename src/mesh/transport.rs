use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::TransportConfig;
use crate::signaling::{ConnId, IceCandidate};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{op} not allowed in signaling state {state:?}")]
    InvalidState {
        op: &'static str,
        state: SignalingState,
    },

    #[error("malformed session description: {0}")]
    Malformed(String),

    #[error("transport closed")]
    Closed,

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
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
}

/// Offer/answer position of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

impl FromStr for TrackKind {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "audio" => Ok(TrackKind::Audio),
            "video" => Ok(TrackKind::Video),
            other => Err(TransportError::Malformed(format!("unknown track kind {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackId(String);

impl TrackId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TrackId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TrackId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A media track; `stream_id` groups tracks captured together
/// (camera+microphone, or a screen share).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaTrack {
    pub id: TrackId,
    pub kind: TrackKind,
    pub stream_id: String,
}

impl MediaTrack {
    pub fn new(id: impl Into<TrackId>, kind: TrackKind, stream_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            stream_id: stream_id.into(),
        }
    }
}

/// Notifications a transport raises on its own
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    CandidateGathered(IceCandidate),
    NegotiationNeeded,
    TrackAdded(MediaTrack),
    TrackRemoved(TrackId),
    ConnectionState(ConnectionState),
    /// ICE lost connectivity; recoverable by an ICE restart
    IceFailed,
}

pub type TransportEvents = mpsc::UnboundedSender<TransportEvent>;

/// One peer connection toward one remote participant.
#[async_trait]
pub trait PeerTransport: Send {
    async fn create_offer(&mut self, ice_restart: bool)
    -> Result<SessionDescription, TransportError>;

    async fn create_answer(&mut self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(
        &mut self,
        desc: SessionDescription,
    ) -> Result<(), TransportError>;

    async fn set_remote_description(
        &mut self,
        desc: SessionDescription,
    ) -> Result<(), TransportError>;

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), TransportError>;

    fn add_track(&mut self, track: &MediaTrack) -> Result<(), TransportError>;

    fn remove_track(&mut self, id: &TrackId) -> Result<(), TransportError>;

    fn restart_ice(&mut self);

    fn signaling_state(&self) -> SignalingState;

    fn has_remote_description(&self) -> bool;

    async fn close(&mut self);
}

/// Builds the transport for a new link; events go to `events`.
pub trait TransportFactory: Send + Sync + 'static {
    fn create(
        &self,
        remote: ConnId,
        config: &TransportConfig,
        events: TransportEvents,
    ) -> Result<Box<dyn PeerTransport>, TransportError>;
}
