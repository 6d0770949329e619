use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::engine::NegotiationEngine;
use super::link::{LinkEvent, LinkState, generation_watermark};
use super::transport::{MediaTrack, TrackId, TransportFactory};
use crate::config::MeshConfig;
use crate::signaling::{ChatPayload, ClientMessage, ConnId, RoomKey, ServerMessage};

/// Requests from the local user
#[derive(Debug, Clone)]
pub enum MeshCommand {
    AddTrack(MediaTrack),
    RemoveTrack(TrackId),
    Renegotiate(ConnId),
    SendChat(String),
    Leave,
}

/// Things the local user should hear about
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    Joined { conn_id: ConnId },
    Notice(String),
    Chat { display_name: String, text: String },
    LinkState { remote: ConnId, state: LinkState },
    Error(String),
}

/// Media received from one remote participant
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteMedia {
    pub tracks: Vec<MediaTrack>,
    /// Generation of the link that delivered these tracks
    pub generation: u64,
}

/// Read side of a running coordinator.
#[derive(Clone)]
pub struct MeshView {
    pub roster: watch::Receiver<Vec<String>>,
    pub media: watch::Receiver<BTreeMap<ConnId, RemoteMedia>>,
    pub links: watch::Receiver<BTreeMap<ConnId, LinkState>>,
    pub local_id: watch::Receiver<Option<ConnId>>,
    pub events: async_channel::Receiver<MeshEvent>,
}

impl MeshView {
    pub fn roster(&self) -> Vec<String> {
        self.roster.borrow().clone()
    }

    pub fn remote_media(&self) -> BTreeMap<ConnId, RemoteMedia> {
        self.media.borrow().clone()
    }

    pub fn link_states(&self) -> BTreeMap<ConnId, LinkState> {
        self.links.borrow().clone()
    }

    pub fn local_id(&self) -> Option<ConnId> {
        *self.local_id.borrow()
    }
}

/// Drives one participant's side of a room: reacts to server messages by
/// opening, feeding and closing links, and publishes what it sees.
pub struct MeshCoordinator {
    room: RoomKey,
    name: String,
    config: MeshConfig,
    factory: Arc<dyn TransportFactory>,
    signals: mpsc::UnboundedSender<ClientMessage>,
    engine: Option<NegotiationEngine>,
    /// Events from links older than this belong to a previous session
    epoch: u64,
    link_events_tx: mpsc::UnboundedSender<LinkEvent>,
    link_events_rx: Option<mpsc::UnboundedReceiver<LinkEvent>>,
    members: HashSet<ConnId>,
    staged_tracks: Vec<MediaTrack>,
    roster_tx: watch::Sender<Vec<String>>,
    media_tx: watch::Sender<BTreeMap<ConnId, RemoteMedia>>,
    links_tx: watch::Sender<BTreeMap<ConnId, LinkState>>,
    local_tx: watch::Sender<Option<ConnId>>,
    events_tx: async_channel::Sender<MeshEvent>,
}

impl MeshCoordinator {
    pub fn new(
        room: RoomKey,
        name: String,
        config: MeshConfig,
        factory: Arc<dyn TransportFactory>,
        signals: mpsc::UnboundedSender<ClientMessage>,
    ) -> (Self, MeshView) {
        let (link_events_tx, link_events_rx) = mpsc::unbounded_channel();
        let (roster_tx, roster) = watch::channel(Vec::new());
        let (media_tx, media) = watch::channel(BTreeMap::new());
        let (links_tx, links) = watch::channel(BTreeMap::new());
        let (local_tx, local_id) = watch::channel(None);
        let (events_tx, events) = async_channel::unbounded();

        let coordinator = Self {
            room,
            name,
            config,
            factory,
            signals,
            engine: None,
            epoch: generation_watermark(),
            link_events_tx,
            link_events_rx: Some(link_events_rx),
            members: HashSet::new(),
            staged_tracks: Vec::new(),
            roster_tx,
            media_tx,
            links_tx,
            local_tx,
            events_tx,
        };
        let view = MeshView {
            roster,
            media,
            links,
            local_id,
            events,
        };
        (coordinator, view)
    }

    /// Join the room and run until told to leave or until the server side
    /// goes away.
    pub async fn run(
        mut self,
        mut server: mpsc::UnboundedReceiver<ServerMessage>,
        mut commands: mpsc::UnboundedReceiver<MeshCommand>,
    ) {
        let Some(mut link_events) = self.link_events_rx.take() else {
            warn!("Coordinator for {} started twice", self.name);
            return;
        };

        self.signal(ClientMessage::Join {
            room: self.room.clone(),
            name: self.name.clone(),
        });

        loop {
            tokio::select! {
                msg = server.recv() => match msg {
                    Some(msg) => self.handle_server(msg),
                    None => {
                        info!("Signaling connection for {} closed", self.name);
                        break;
                    }
                },

                cmd = commands.recv() => match cmd {
                    Some(MeshCommand::Leave) | None => {
                        self.signal(ClientMessage::Leave);
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd),
                },

                Some(event) = link_events.recv() => self.handle_link_event(event),
            }
        }

        self.teardown();
    }

    fn signal(&self, msg: ClientMessage) {
        if self.signals.send(msg).is_err() {
            debug!("Signaling channel gone for {}", self.name);
        }
    }

    fn emit(&self, event: MeshEvent) {
        let _ = self.events_tx.try_send(event);
    }

    fn handle_server(&mut self, msg: ServerMessage) {
        debug!("{} <- {}", self.name, msg.kind());
        match msg {
            ServerMessage::Joined {
                conn_id,
                room,
                peers,
            } => {
                if let Some(old) = self.engine.take() {
                    old.close_all();
                }
                self.clear_views();
                self.epoch = generation_watermark();

                let engine = NegotiationEngine::new(
                    conn_id,
                    self.config.clone(),
                    self.factory.clone(),
                    self.signals.clone(),
                    self.link_events_tx.clone(),
                );
                for track in &self.staged_tracks {
                    engine.add_local_track(track.clone());
                }
                self.engine = Some(engine);
                self.members = peers.iter().map(|p| p.conn_id).collect();
                self.local_tx.send_replace(Some(conn_id));

                info!("{} joined {} as {} with {} peers", self.name, room, conn_id, peers.len());
                self.emit(MeshEvent::Joined { conn_id });
            }

            ServerMessage::Roster { names } => {
                self.roster_tx.send_replace(names);
            }

            ServerMessage::PeerJoined { notice, conn_id } => {
                self.emit(MeshEvent::Notice(notice));
                if *self.local_tx.borrow() == Some(conn_id) {
                    return;
                }
                self.members.insert(conn_id);
                self.open_link(conn_id);
            }

            ServerMessage::ConnectRequest { from } => {
                if self.members.contains(&from) {
                    self.open_link(from);
                } else {
                    debug!("Ignoring connect request from unknown {}", from);
                }
            }

            ServerMessage::Offer { sdp, from, .. } => {
                if !self.members.contains(&from) {
                    warn!("Dropping offer from unknown {}", from);
                    return;
                }
                if let Some(engine) = &self.engine
                    && let Err(e) = engine.accept_offer(from, sdp)
                {
                    warn!("Cannot accept offer from {}: {}", from, e);
                }
            }

            ServerMessage::Answer { sdp, from, .. } => {
                let delivered = self
                    .engine
                    .as_ref()
                    .is_some_and(|e| e.accept_answer(&from, sdp));
                if !delivered {
                    debug!("No link for answer from {}", from);
                }
            }

            ServerMessage::IceCandidate {
                candidate, from, ..
            } => {
                let delivered = self
                    .engine
                    .as_ref()
                    .is_some_and(|e| e.add_remote_candidate(&from, candidate));
                if !delivered {
                    debug!("No link for candidate from {}", from);
                }
            }

            ServerMessage::PeerLeft { notice, conn_id } => {
                self.members.remove(&conn_id);
                if let Some(engine) = &self.engine {
                    engine.close_link(&conn_id);
                }
                self.forget(&conn_id);
                self.emit(MeshEvent::Notice(notice));
            }

            ServerMessage::Chat { payload, .. } => {
                match serde_json::from_value::<ChatPayload>(payload) {
                    Ok(chat) if chat.is_chat() => self.emit(MeshEvent::Chat {
                        display_name: chat.display_name,
                        text: chat.text,
                    }),
                    Ok(other) => debug!("Ignoring payload of kind {}", other.kind),
                    Err(e) => {
                        warn!("Bad chat payload: {}", e);
                        self.emit(MeshEvent::Error("Error processing message".into()));
                    }
                }
            }

            ServerMessage::Error { message } => {
                warn!("Server error for {}: {}", self.name, message);
                self.emit(MeshEvent::Error(message));
            }
        }
    }

    fn open_link(&mut self, remote: ConnId) {
        let Some(engine) = &self.engine else {
            return;
        };
        match engine.create_link(remote) {
            Ok(_) => {
                engine.initiate_offer(&remote);
            }
            Err(e) => warn!("Cannot open link to {}: {}", remote, e),
        }
    }

    fn handle_command(&mut self, cmd: MeshCommand) {
        match cmd {
            MeshCommand::AddTrack(track) => {
                if self.staged_tracks.iter().any(|t| t.id == track.id) {
                    return;
                }
                self.staged_tracks.push(track.clone());
                if let Some(engine) = &self.engine {
                    engine.add_local_track(track);
                }
            }
            MeshCommand::RemoveTrack(id) => {
                self.staged_tracks.retain(|t| t.id != id);
                if let Some(engine) = &self.engine {
                    engine.remove_local_track(&id);
                }
            }
            MeshCommand::Renegotiate(remote) => {
                if let Some(engine) = &self.engine {
                    engine.renegotiate(&remote);
                }
            }
            MeshCommand::SendChat(text) => {
                match serde_json::to_value(ChatPayload::new(self.name.clone(), text)) {
                    Ok(payload) => self.signal(ClientMessage::Chat {
                        room: self.room.clone(),
                        payload,
                    }),
                    Err(e) => warn!("Failed to encode chat: {}", e),
                }
            }
            MeshCommand::Leave => {}
        }
    }

    /// True if the event comes from a link that has since been replaced, or
    /// from a previous session.
    fn is_stale(&self, remote: &ConnId, generation: u64) -> bool {
        if generation < self.epoch {
            return true;
        }
        self.engine
            .as_ref()
            .and_then(|e| e.generation(remote))
            .is_some_and(|current| current > generation)
    }

    fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::StateChanged {
                remote,
                generation,
                state,
            } => {
                if self.is_stale(&remote, generation) {
                    return;
                }
                if state.is_terminal() {
                    self.forget(&remote);
                } else {
                    self.links_tx.send_modify(|links| {
                        links.insert(remote, state);
                    });
                }
                self.emit(MeshEvent::LinkState { remote, state });
            }

            LinkEvent::TrackAdded {
                remote,
                generation,
                track,
            } => {
                if self.is_stale(&remote, generation) {
                    return;
                }
                self.media_tx.send_modify(|media| {
                    let entry = media.entry(remote).or_insert_with(|| RemoteMedia {
                        tracks: Vec::new(),
                        generation,
                    });
                    if entry.generation > generation {
                        return;
                    }
                    if entry.generation < generation {
                        entry.tracks.clear();
                        entry.generation = generation;
                    }
                    match entry.tracks.iter_mut().find(|t| t.id == track.id) {
                        Some(existing) => *existing = track,
                        None => entry.tracks.push(track),
                    }
                });
            }

            LinkEvent::TrackRemoved {
                remote,
                generation,
                track,
            } => {
                if self.is_stale(&remote, generation) {
                    return;
                }
                self.media_tx.send_if_modified(|media| {
                    let Some(entry) = media.get_mut(&remote) else {
                        return false;
                    };
                    if entry.generation != generation {
                        return false;
                    }
                    let before = entry.tracks.len();
                    entry.tracks.retain(|t| t.id != track);
                    entry.tracks.len() != before
                });
            }

            LinkEvent::Closed { remote, generation } => {
                if !self.is_stale(&remote, generation) {
                    self.forget(&remote);
                }
            }
        }
    }

    fn forget(&self, remote: &ConnId) {
        self.media_tx.send_if_modified(|media| media.remove(remote).is_some());
        self.links_tx.send_if_modified(|links| links.remove(remote).is_some());
    }

    fn clear_views(&self) {
        self.media_tx.send_replace(BTreeMap::new());
        self.links_tx.send_replace(BTreeMap::new());
    }

    fn teardown(&mut self) {
        if let Some(engine) = self.engine.take() {
            engine.close_all();
        }
        self.members.clear();
        self.clear_views();
        self.roster_tx.send_replace(Vec::new());
        self.local_tx.send_replace(None);
        self.events_tx.close();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::config::TransportConfig;
    use crate::mesh::sim::{SimFactory, SimTransport};
    use crate::mesh::transport::{PeerTransport, SessionDescription};
    use crate::signaling::PeerInfo;

    struct Harness {
        view: MeshView,
        signals: mpsc::UnboundedReceiver<ClientMessage>,
        server: mpsc::UnboundedSender<ServerMessage>,
        commands: mpsc::UnboundedSender<MeshCommand>,
        task: tokio::task::JoinHandle<()>,
    }

    fn me() -> ConnId {
        ConnId::try_from("conn_me").unwrap()
    }

    fn harness() -> Harness {
        let (signal_tx, signals) = mpsc::unbounded_channel();
        let (server, server_rx) = mpsc::unbounded_channel();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (coordinator, view) = MeshCoordinator::new(
            RoomKey::from("r1"),
            "ana".into(),
            MeshConfig::default(),
            Arc::new(SimFactory::new()),
            signal_tx,
        );
        let task = tokio::spawn(coordinator.run(server_rx, command_rx));
        Harness {
            view,
            signals,
            server,
            commands,
            task,
        }
    }

    async fn joined(h: &mut Harness, peers: Vec<PeerInfo>) {
        assert_eq!(
            h.signals.recv().await.unwrap(),
            ClientMessage::Join {
                room: RoomKey::from("r1"),
                name: "ana".into()
            }
        );
        h.server
            .send(ServerMessage::Joined {
                conn_id: me(),
                room: RoomKey::from("r1"),
                peers,
            })
            .unwrap();
        assert_eq!(
            h.view.events.recv().await.unwrap(),
            MeshEvent::Joined { conn_id: me() }
        );
        assert_eq!(h.view.local_id(), Some(me()));
    }

    /// Skips candidates until the next offer toward `remote`.
    async fn next_offer(h: &mut Harness, remote: ConnId) -> String {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(2), h.signals.recv())
                .await
                .unwrap()
                .unwrap();
            if let ClientMessage::Offer { sdp, to, .. } = msg
                && to == remote
            {
                return sdp;
            }
        }
    }

    #[tokio::test]
    async fn chat_payloads_are_decoded() {
        let mut h = harness();
        joined(&mut h, vec![]).await;

        h.server
            .send(ServerMessage::Chat {
                room: RoomKey::from("r1"),
                payload: json!({"kind": "chat"}),
            })
            .unwrap();
        assert_eq!(
            h.view.events.recv().await.unwrap(),
            MeshEvent::Error("Error processing message".into())
        );

        h.server
            .send(ServerMessage::Chat {
                room: RoomKey::from("r1"),
                payload: json!({"kind": "chat", "text": "hi", "displayName": "bo"}),
            })
            .unwrap();
        assert_eq!(
            h.view.events.recv().await.unwrap(),
            MeshEvent::Chat {
                display_name: "bo".into(),
                text: "hi".into()
            }
        );
    }

    #[tokio::test]
    async fn send_chat_wraps_payload_for_room() {
        let mut h = harness();
        joined(&mut h, vec![]).await;

        h.commands
            .send(MeshCommand::SendChat("hello".into()))
            .unwrap();
        match h.signals.recv().await.unwrap() {
            ClientMessage::Chat { room, payload } => {
                assert_eq!(room, RoomKey::from("r1"));
                assert_eq!(payload["displayName"], "ana");
                assert_eq!(payload["text"], "hello");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn offers_are_answered_only_for_members() {
        let mut h = harness();
        let known = ConnId::try_from("conn_known").unwrap();
        joined(
            &mut h,
            vec![PeerInfo {
                conn_id: known,
                name: "bo".into(),
            }],
        )
        .await;

        let offer = "v=0\no=- 1 1 IN IP4 127.0.0.1\ns=-\na=ice-ufrag:abcd\n".to_string();
        h.server
            .send(ServerMessage::Offer {
                sdp: offer.clone(),
                to: me(),
                from: ConnId::try_from("conn_stranger").unwrap(),
            })
            .unwrap();
        h.server
            .send(ServerMessage::Offer {
                sdp: offer,
                to: me(),
                from: known,
            })
            .unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(2), h.signals.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(reply, ClientMessage::Answer { to, .. } if to == known));
    }

    #[tokio::test]
    async fn peer_joined_opens_a_link_with_an_offer() {
        let mut h = harness();
        joined(&mut h, vec![]).await;
        let newcomer = ConnId::try_from("conn_new").unwrap();

        h.server
            .send(ServerMessage::PeerJoined {
                notice: "bo joined the room".into(),
                conn_id: newcomer,
            })
            .unwrap();

        assert_eq!(
            h.view.events.recv().await.unwrap(),
            MeshEvent::Notice("bo joined the room".into())
        );
        let offer = h.signals.recv().await.unwrap();
        assert!(matches!(
            offer,
            ClientMessage::Offer { to, from, .. } if to == newcomer && from == me()
        ));
    }

    #[tokio::test]
    async fn renegotiate_command_sends_a_fresh_offer() {
        let mut h = harness();
        joined(&mut h, vec![]).await;
        let newcomer = ConnId::try_from("conn_new").unwrap();
        h.server
            .send(ServerMessage::PeerJoined {
                notice: "bo joined the room".into(),
                conn_id: newcomer,
            })
            .unwrap();

        let sdp = next_offer(&mut h, newcomer).await;
        let (remote_tx, _remote_rx) = mpsc::unbounded_channel();
        let mut remote = SimTransport::new(me(), TransportConfig::default(), remote_tx);
        remote
            .set_remote_description(SessionDescription::offer(sdp))
            .await
            .unwrap();
        let answer = remote.create_answer().await.unwrap();
        remote.set_local_description(answer.clone()).await.unwrap();
        h.server
            .send(ServerMessage::Answer {
                sdp: answer.sdp,
                to: me(),
                from: newcomer,
            })
            .unwrap();

        for _ in 0..200 {
            if h.view.link_states().get(&newcomer) == Some(&LinkState::Connected) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.view.link_states().get(&newcomer), Some(&LinkState::Connected));

        h.commands.send(MeshCommand::Renegotiate(newcomer)).unwrap();
        let again = next_offer(&mut h, newcomer).await;
        assert!(again.starts_with("v=0"));
    }

    #[tokio::test]
    async fn leave_announces_and_clears_views() {
        let mut h = harness();
        joined(&mut h, vec![]).await;
        h.server
            .send(ServerMessage::Roster {
                names: vec!["ana".into()],
            })
            .unwrap();

        h.commands.send(MeshCommand::Leave).unwrap();
        assert_eq!(h.signals.recv().await.unwrap(), ClientMessage::Leave);
        h.task.await.unwrap();

        assert!(h.view.roster().is_empty());
        assert!(h.view.local_id().is_none());
        assert!(h.view.events.is_closed());
    }
}
