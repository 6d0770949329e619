//! Runtime configuration for the signaling server and the mesh client

use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::signaling::DEFAULT_ROOM_QUEUE_DEPTH;

pub const DEFAULT_SIGNALING_PORT: u16 = 5000;

#[derive(Debug, Clone, Parser)]
#[command(name = "huddle", about = "Signaling server for small full-mesh call rooms")]
pub struct ServerConfig {
    /// Interface to listen on
    #[arg(long, env = "HUDDLE_HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "PORT", default_value_t = DEFAULT_SIGNALING_PORT)]
    pub port: u16,

    /// Seconds between WebSocket pings
    #[arg(long, default_value_t = 30)]
    pub ping_interval_secs: u64,

    /// Seconds to wait for a pong before dropping the connection
    #[arg(long, default_value_t = 10)]
    pub pong_timeout_secs: u64,

    /// Pending commands per room before joiners wait
    #[arg(long, default_value_t = DEFAULT_ROOM_QUEUE_DEPTH)]
    pub room_queue_depth: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_SIGNALING_PORT,
            ping_interval_secs: 30,
            pong_timeout_secs: 10,
            room_queue_depth: DEFAULT_ROOM_QUEUE_DEPTH,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_secs.max(1))
    }
}

/// What to do with a remote ICE candidate that arrives before the remote
/// description it belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CandidatePolicy {
    /// Discard it. Matches the deployed browser client; can lose paths on
    /// fast networks.
    #[default]
    DropEarly,
    /// Queue it and apply once the remote description is set.
    BufferEarly,
}

/// ICE server configuration (STUN/TURN).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    /// Public STUN servers used when nothing else is configured.
    pub fn default_stun() -> Vec<Self> {
        [
            "stun:stun.l.google.com:19302",
            "stun:stun1.l.google.com:19302",
            "stun:stun2.l.google.com:19302",
            "stun:stun3.l.google.com:19302",
            "stun:stun4.l.google.com:19302",
        ]
        .into_iter()
        .map(Self::stun)
        .collect()
    }
}

/// Handed to the transport factory for every new link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub ice_servers: Vec<IceServer>,
    pub ice_candidate_pool_size: u8,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ice_servers: IceServer::default_stun(),
            ice_candidate_pool_size: 10,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MeshConfig {
    pub candidate_policy: CandidatePolicy,
    pub transport: TransportConfig,
}
