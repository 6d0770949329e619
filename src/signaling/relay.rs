use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use super::actor::SessionDirectory;
use super::messages::{ClientMessage, ServerMessage};
use super::types::{ConnId, OutboundMessage, RoomKey};

/// Outcome of a relay attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    Dropped,
}

#[derive(Debug, Default)]
pub struct RelayStats {
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl RelayStats {
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Best-effort forwarding between live sessions.
///
/// Delivery is at most once: a message for a connection that is not live at
/// the instant of forwarding is dropped and counted, never queued.
#[derive(Clone)]
pub struct SignalingRelay {
    directory: SessionDirectory,
    stats: Arc<RelayStats>,
}

impl SignalingRelay {
    pub fn new(directory: SessionDirectory) -> Self {
        Self {
            directory,
            stats: Arc::new(RelayStats::default()),
        }
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    /// Relay a message received from `from`.
    ///
    /// The `from` field of point-to-point messages is stamped with the
    /// sender's actual connection id.
    pub async fn relay(&self, from: ConnId, message: ClientMessage) -> Delivery {
        if let Some(claimed) = claimed_sender(&message)
            && claimed != from
        {
            warn!(
                "{} from {} claims sender {}, using actual sender",
                message.kind(),
                from,
                claimed
            );
        }

        match message {
            ClientMessage::Offer { sdp, to, .. } => {
                let delivery = self.forward(to, &ServerMessage::Offer { sdp, to, from });
                if delivery == Delivery::Delivered {
                    self.directory.record_signaling(from, to);
                }
                delivery
            }
            ClientMessage::Answer { sdp, to, .. } => {
                self.forward(to, &ServerMessage::Answer { sdp, to, from })
            }
            ClientMessage::IceCandidate { candidate, to, .. } => self.forward(
                to,
                &ServerMessage::IceCandidate {
                    candidate,
                    to,
                    from,
                },
            ),
            ClientMessage::ConnectRequest { to, .. } => {
                self.forward(to, &ServerMessage::ConnectRequest { from })
            }
            ClientMessage::Chat { room, payload } => {
                if self.directory.room_of(&from).as_ref() != Some(&room) {
                    warn!("Dropping chat from {}: not a member of room {}", from, room);
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    return Delivery::Dropped;
                }
                let message = ServerMessage::Chat {
                    room: room.clone(),
                    payload,
                };
                self.broadcast(&room, &message, None).await
            }
            ClientMessage::Join { .. } | ClientMessage::Leave => {
                debug!("{} from {} is not relayed", message.kind(), from);
                Delivery::Dropped
            }
        }
    }

    /// Forward to a single live session.
    pub fn forward(&self, to: ConnId, message: &ServerMessage) -> Delivery {
        let Some(tx) = self.directory.sender_for(&to) else {
            warn!("Dropping {} for {}: no live session", message.kind(), to);
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return Delivery::Dropped;
        };

        let json = match serde_json::to_string(message) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize {}: {}", message.kind(), e);
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                return Delivery::Dropped;
            }
        };

        if tx.send(OutboundMessage::from(json)).is_err() {
            warn!("Dropping {} for {}: connection closing", message.kind(), to);
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return Delivery::Dropped;
        }

        self.stats.delivered.fetch_add(1, Ordering::Relaxed);
        Delivery::Delivered
    }

    /// Forward to every live session of `room` except `exclude`.
    pub async fn broadcast(
        &self,
        room: &RoomKey,
        message: &ServerMessage,
        exclude: Option<ConnId>,
    ) -> Delivery {
        if self.directory.broadcast(room, message, exclude).await {
            self.stats.delivered.fetch_add(1, Ordering::Relaxed);
            Delivery::Delivered
        } else {
            warn!("Dropping {} for room {}: no such room", message.kind(), room);
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            Delivery::Dropped
        }
    }
}

fn claimed_sender(message: &ClientMessage) -> Option<ConnId> {
    match message {
        ClientMessage::Offer { from, .. }
        | ClientMessage::Answer { from, .. }
        | ClientMessage::IceCandidate { from, .. }
        | ClientMessage::ConnectRequest { from, .. } => Some(*from),
        _ => None,
    }
}
