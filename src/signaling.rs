//! WebSocket signaling server: room directory and message relay

mod actor;
mod messages;
mod relay;
mod server;
mod types;

pub use actor::{DEFAULT_ROOM_QUEUE_DEPTH, SessionDirectory};
pub use messages::{ChatPayload, ClientMessage, IceCandidate, ServerMessage};
pub use relay::{Delivery, RelayStats, SignalingRelay};
pub use server::{ClientConnection, SignalingServer};
pub use types::{
    ConnId, InvalidConnId, OutboundMessage, OutboundSender, PeerInfo, RoomKey, RoomSnapshot,
    SignalingError,
};
