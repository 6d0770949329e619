use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use super::messages::ServerMessage;
use super::types::{
    ConnId, Member, OutboundMessage, OutboundSender, PeerInfo, Room, RoomKey, RoomSnapshot,
    Session, SignalingError,
};

pub const DEFAULT_ROOM_QUEUE_DEPTH: usize = 1024;

/// Commands sent to a room actor
pub(crate) enum RoomCommand {
    Join {
        conn_id: ConnId,
        name: String,
        tx: OutboundSender,
        reply: oneshot::Sender<Result<Vec<PeerInfo>, SignalingError>>,
    },
    Leave {
        conn_id: ConnId,
        reply: oneshot::Sender<()>,
    },
    Broadcast {
        message: OutboundMessage,
        exclude: Option<ConnId>,
    },
    Snapshot {
        reply: oneshot::Sender<RoomSnapshot>,
    },
}

#[derive(Clone)]
pub(crate) struct RoomHandle {
    instance: u64,
    tx: mpsc::Sender<RoomCommand>,
}

type RoomRegistry = Arc<DashMap<RoomKey, RoomHandle>>;
type SessionTable = Arc<DashMap<ConnId, Session>>;

/// Owns one room. Every mutation of the room goes through this task, so
/// join/leave for a room are applied strictly in arrival order while other
/// rooms progress on their own actors.
struct RoomActor {
    instance: u64,
    room: Room,
    rooms: RoomRegistry,
    sessions: SessionTable,
}

impl RoomActor {
    fn join(&mut self, conn_id: ConnId, name: String, tx: OutboundSender) -> Vec<PeerInfo> {
        let existing = self.room.peers();

        self.sessions.insert(
            conn_id,
            Session {
                room: self.room.key.clone(),
                name: name.clone(),
                tx: tx.clone(),
                signaled: HashSet::new(),
            },
        );
        self.room.members.push(Member {
            conn_id,
            name: name.clone(),
            tx: tx.clone(),
        });

        let joined = ServerMessage::Joined {
            conn_id,
            room: self.room.key.clone(),
            peers: existing,
        };
        if let Some(msg) = encode(&joined) {
            let _ = tx.send(msg);
        }

        self.broadcast_roster();

        let notice = ServerMessage::PeerJoined {
            notice: format!("{} joined the room", name),
            conn_id,
        };
        if let Some(msg) = encode(&notice) {
            self.room.broadcast(&msg, Some(conn_id));
        }

        info!("Peer {} ({}) joined room {}", conn_id, name, self.room.key);
        self.room.peers()
    }

    fn leave(&mut self, conn_id: ConnId) {
        let Some(pos) = self.room.members.iter().position(|m| m.conn_id == conn_id) else {
            return;
        };
        let member = self.room.members.remove(pos);
        info!("Peer {} ({}) left room {}", conn_id, member.name, self.room.key);

        if self.room.members.is_empty() {
            return;
        }

        self.broadcast_roster();
        let notice = ServerMessage::PeerLeft {
            notice: format!("{} left the room", member.name),
            conn_id,
        };
        if let Some(msg) = encode(&notice) {
            self.room.broadcast(&msg, None);
        }
    }

    fn broadcast_roster(&self) {
        let roster = ServerMessage::Roster {
            names: self.room.roster(),
        };
        if let Some(msg) = encode(&roster) {
            self.room.broadcast(&msg, None);
        }
    }

    /// Unregister from the directory so the next join for this key builds a
    /// fresh room.
    fn retire(&self) {
        self.rooms
            .remove_if(&self.room.key, |_, handle| handle.instance == self.instance);
        info!("Room {} removed (empty)", self.room.key);
    }
}

async fn room_actor(mut actor: RoomActor, mut rx: mpsc::Receiver<RoomCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            RoomCommand::Join {
                conn_id,
                name,
                tx,
                reply,
            } => {
                let peers = actor.join(conn_id, name, tx);
                let _ = reply.send(Ok(peers));
            }

            RoomCommand::Leave { conn_id, reply } => {
                actor.leave(conn_id);
                if actor.room.members.is_empty() {
                    actor.retire();
                    let _ = reply.send(());
                    break;
                }
                let _ = reply.send(());
            }

            RoomCommand::Broadcast { message, exclude } => {
                actor.room.broadcast(&message, exclude);
            }

            RoomCommand::Snapshot { reply } => {
                let _ = reply.send(actor.room.snapshot());
            }
        }
    }

    // Bounce anything that raced with retirement; joiners retry on a new room.
    rx.close();
    while let Some(cmd) = rx.recv().await {
        match cmd {
            RoomCommand::Join { reply, .. } => {
                let _ = reply.send(Err(SignalingError::RoomRetired(actor.room.key.clone())));
            }
            RoomCommand::Leave { reply, .. } => {
                let _ = reply.send(());
            }
            RoomCommand::Broadcast { .. } | RoomCommand::Snapshot { .. } => {}
        }
    }
}

fn encode(message: &ServerMessage) -> Option<OutboundMessage> {
    match serde_json::to_string(message) {
        Ok(json) => Some(OutboundMessage::from(json)),
        Err(e) => {
            warn!("Failed to serialize {} message: {}", message.kind(), e);
            None
        }
    }
}

/// Authoritative room and session bookkeeping.
///
/// Cheap to clone; all clones share the same rooms.
#[derive(Clone)]
pub struct SessionDirectory {
    rooms: RoomRegistry,
    sessions: SessionTable,
    instances: Arc<AtomicU64>,
    queue_depth: usize,
}

impl Default for SessionDirectory {
    fn default() -> Self {
        Self::new(DEFAULT_ROOM_QUEUE_DEPTH)
    }
}

impl SessionDirectory {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            rooms: Arc::new(DashMap::new()),
            sessions: Arc::new(DashMap::new()),
            instances: Arc::new(AtomicU64::new(0)),
            queue_depth: queue_depth.max(1),
        }
    }

    fn room_handle(&self, key: &RoomKey) -> RoomHandle {
        self.rooms
            .entry(key.clone())
            .or_insert_with(|| {
                let instance = self.instances.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = mpsc::channel(self.queue_depth);
                let actor = RoomActor {
                    instance,
                    room: Room::new(key.clone()),
                    rooms: self.rooms.clone(),
                    sessions: self.sessions.clone(),
                };
                tokio::spawn(room_actor(actor, rx));
                info!("Room created: {}", key);
                RoomHandle { instance, tx }
            })
            .clone()
    }

    /// Register `conn_id` in `room`, creating the room if needed.
    ///
    /// Returns the members of the room after the join, newcomer last.
    pub async fn join(
        &self,
        conn_id: ConnId,
        room: RoomKey,
        name: String,
        tx: OutboundSender,
    ) -> Result<Vec<PeerInfo>, SignalingError> {
        loop {
            let handle = self.room_handle(&room);
            let (reply_tx, reply_rx) = oneshot::channel();
            let cmd = RoomCommand::Join {
                conn_id,
                name: name.clone(),
                tx: tx.clone(),
                reply: reply_tx,
            };
            if handle.tx.send(cmd).await.is_err() {
                continue;
            }
            match reply_rx.await {
                Ok(Err(SignalingError::RoomRetired(_))) | Err(_) => continue,
                Ok(result) => return result,
            }
        }
    }

    /// Remove `conn_id` from its room. Unknown ids are a no-op.
    pub async fn leave(&self, conn_id: ConnId) -> bool {
        let Some((_, session)) = self.sessions.remove(&conn_id) else {
            return false;
        };

        for peer in &session.signaled {
            if let Some(mut other) = self.sessions.get_mut(peer) {
                other.signaled.remove(&conn_id);
            }
        }

        let handle = self.rooms.get(&session.room).map(|h| h.clone());
        match handle {
            Some(handle) => {
                let (reply_tx, reply_rx) = oneshot::channel();
                let cmd = RoomCommand::Leave {
                    conn_id,
                    reply: reply_tx,
                };
                if handle.tx.send(cmd).await.is_ok() {
                    let _ = reply_rx.await;
                }
            }
            None => warn!("Session {} referenced missing room {}", conn_id, session.room),
        }
        true
    }

    /// Deliver `message` to every member of `room` except `exclude`.
    ///
    /// Returns `false` when the room does not exist.
    pub async fn broadcast(
        &self,
        room: &RoomKey,
        message: &ServerMessage,
        exclude: Option<ConnId>,
    ) -> bool {
        let Some(handle) = self.rooms.get(room).map(|h| h.clone()) else {
            return false;
        };
        let Some(message) = encode(message) else {
            return false;
        };
        handle
            .tx
            .send(RoomCommand::Broadcast { message, exclude })
            .await
            .is_ok()
    }

    pub async fn room(&self, key: &RoomKey) -> Option<RoomSnapshot> {
        let handle = self.rooms.get(key).map(|h| h.clone())?;
        let (reply_tx, reply_rx) = oneshot::channel();
        handle
            .tx
            .send(RoomCommand::Snapshot { reply: reply_tx })
            .await
            .ok()?;
        reply_rx.await.ok()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_live(&self, conn_id: &ConnId) -> bool {
        self.sessions.contains_key(conn_id)
    }

    pub fn room_of(&self, conn_id: &ConnId) -> Option<RoomKey> {
        self.sessions.get(conn_id).map(|s| s.room.clone())
    }

    pub fn signaled_peers(&self, conn_id: &ConnId) -> Vec<ConnId> {
        self.sessions
            .get(conn_id)
            .map(|s| s.signaled.iter().copied().collect())
            .unwrap_or_default()
    }

    pub(crate) fn sender_for(&self, conn_id: &ConnId) -> Option<OutboundSender> {
        self.sessions.get(conn_id).map(|s| s.tx.clone())
    }

    pub(crate) fn record_signaling(&self, a: ConnId, b: ConnId) {
        if let Some(mut session) = self.sessions.get_mut(&a) {
            session.signaled.insert(b);
        }
        if let Some(mut session) = self.sessions.get_mut(&b) {
            session.signaled.insert(a);
        }
    }
}
