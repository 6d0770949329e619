//! Client side of a full-mesh room: one peer link per remote participant

mod client;
mod coordinator;
mod engine;
mod link;
pub mod sim;
mod transport;

pub use client::{ClientError, MeshClient};
pub use coordinator::{MeshCommand, MeshCoordinator, MeshEvent, MeshView, RemoteMedia};
pub use engine::NegotiationEngine;
pub use link::{LinkEvent, LinkState, NegotiationError};
pub use transport::{
    ConnectionState, MediaTrack, PeerTransport, SdpKind, SessionDescription, SignalingState,
    TrackId, TrackKind, TransportError, TransportEvent, TransportEvents, TransportFactory,
};
