use std::sync::{Arc, PoisonError, RwLock};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use super::link::{
    LinkCommand, LinkEvent, LinkHandle, LinkState, NegotiationError, PeerLink, next_generation,
};
use super::transport::{MediaTrack, TrackId, TransportFactory};
use crate::config::MeshConfig;
use crate::signaling::{ClientMessage, ConnId, IceCandidate};

/// Client-side owner of every peer link. Holds at most one live link per
/// remote participant and keeps the local track set applied to all of them.
pub struct NegotiationEngine {
    local_id: ConnId,
    config: MeshConfig,
    factory: Arc<dyn TransportFactory>,
    links: Arc<DashMap<ConnId, LinkHandle>>,
    local_tracks: RwLock<Vec<MediaTrack>>,
    signals: mpsc::UnboundedSender<ClientMessage>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl NegotiationEngine {
    pub fn new(
        local_id: ConnId,
        config: MeshConfig,
        factory: Arc<dyn TransportFactory>,
        signals: mpsc::UnboundedSender<ClientMessage>,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self {
        Self {
            local_id,
            config,
            factory,
            links: Arc::new(DashMap::new()),
            local_tracks: RwLock::new(Vec::new()),
            signals,
            events,
        }
    }

    pub fn local_id(&self) -> ConnId {
        self.local_id
    }

    /// Build a fresh link toward `remote` carrying every local track. An
    /// existing link to the same remote is replaced and closed.
    ///
    /// Returns the generation of the new link.
    pub fn create_link(&self, remote: ConnId) -> Result<u64, NegotiationError> {
        let generation = next_generation();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let mut transport = self
            .factory
            .create(remote, &self.config.transport, transport_tx)
            .map_err(NegotiationError::at("create transport"))?;

        // Held until the link is registered, so a concurrent track change
        // either lands in `attached` or reaches the link as a command.
        let tracks = self
            .local_tracks
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        for track in tracks.iter() {
            transport
                .add_track(track)
                .map_err(NegotiationError::at("add track"))?;
        }
        let attached = tracks.clone();

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(LinkState::New);
        let handle = LinkHandle {
            generation,
            commands: cmd_tx,
            state: state_rx,
        };

        match self.links.entry(remote) {
            Entry::Occupied(mut entry) => {
                let old = entry.insert(handle);
                debug!(
                    "Replacing link {} -> {} (gen {} -> {})",
                    self.local_id, remote, old.generation, generation
                );
                let _ = old.commands.send(LinkCommand::Close);
            }
            Entry::Vacant(entry) => {
                entry.insert(handle);
            }
        }
        drop(tracks);

        let link = PeerLink::new(
            self.local_id,
            remote,
            generation,
            transport,
            self.config.candidate_policy,
            attached,
            state_tx,
            self.signals.clone(),
            self.events.clone(),
            self.links.clone(),
        );
        tokio::spawn(link.run(cmd_rx, transport_rx));

        Ok(generation)
    }

    fn send(&self, remote: &ConnId, cmd: LinkCommand) -> bool {
        match self.links.get(remote) {
            Some(handle) => handle.commands.send(cmd).is_ok(),
            None => false,
        }
    }

    pub fn initiate_offer(&self, remote: &ConnId) -> bool {
        self.send(remote, LinkCommand::InitiateOffer)
    }

    /// Apply a remote offer, creating the link first if there is none.
    pub fn accept_offer(&self, remote: ConnId, sdp: String) -> Result<(), NegotiationError> {
        if !self.links.contains_key(&remote) {
            self.create_link(remote)?;
        }
        if !self.send(&remote, LinkCommand::AcceptOffer(sdp.clone())) {
            // The old link died between lookup and send.
            self.create_link(remote)?;
            self.send(&remote, LinkCommand::AcceptOffer(sdp));
        }
        Ok(())
    }

    pub fn accept_answer(&self, remote: &ConnId, sdp: String) -> bool {
        self.send(remote, LinkCommand::AcceptAnswer(sdp))
    }

    pub fn add_remote_candidate(&self, remote: &ConnId, candidate: IceCandidate) -> bool {
        self.send(remote, LinkCommand::RemoteCandidate(candidate))
    }

    /// Add a track to the local set and to every live link. Returns false if
    /// a track with the same id is already present.
    pub fn add_local_track(&self, track: MediaTrack) -> bool {
        let mut tracks = self
            .local_tracks
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if tracks.iter().any(|t| t.id == track.id) {
            return false;
        }
        tracks.push(track.clone());
        for link in self.links.iter() {
            let _ = link.commands.send(LinkCommand::AttachTrack(track.clone()));
        }
        true
    }

    pub fn remove_local_track(&self, id: &TrackId) -> Option<MediaTrack> {
        let mut tracks = self
            .local_tracks
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let pos = tracks.iter().position(|t| &t.id == id)?;
        let removed = tracks.remove(pos);
        for link in self.links.iter() {
            let _ = link.commands.send(LinkCommand::DetachTrack(id.clone()));
        }
        Some(removed)
    }

    pub fn renegotiate(&self, remote: &ConnId) -> bool {
        self.send(remote, LinkCommand::Renegotiate)
    }

    pub fn close_link(&self, remote: &ConnId) -> bool {
        match self.links.remove(remote) {
            Some((_, handle)) => {
                let _ = handle.commands.send(LinkCommand::Close);
                true
            }
            None => false,
        }
    }

    pub fn close_all(&self) {
        let remotes = self.remotes();
        if !remotes.is_empty() {
            info!("Closing {} links from {}", remotes.len(), self.local_id);
        }
        for remote in remotes {
            self.close_link(&remote);
        }
    }

    pub fn link_state(&self, remote: &ConnId) -> Option<LinkState> {
        self.links.get(remote).map(|h| *h.state.borrow())
    }

    pub fn generation(&self, remote: &ConnId) -> Option<u64> {
        self.links.get(remote).map(|h| h.generation)
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Remotes with a live link, sorted
    pub fn remotes(&self) -> Vec<ConnId> {
        let mut remotes: Vec<ConnId> = self.links.iter().map(|e| *e.key()).collect();
        remotes.sort();
        remotes
    }

    pub fn local_tracks(&self) -> Vec<MediaTrack> {
        self.local_tracks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::CandidatePolicy;
    use crate::mesh::sim::SimFactory;
    use crate::mesh::transport::{SignalingState, TrackKind};

    struct Peer {
        engine: Arc<NegotiationEngine>,
        factory: SimFactory,
        events: mpsc::UnboundedReceiver<LinkEvent>,
    }

    fn peer(
        id: &str,
        policy: CandidatePolicy,
    ) -> (Peer, mpsc::UnboundedReceiver<ClientMessage>) {
        let factory = SimFactory::recording();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let config = MeshConfig {
            candidate_policy: policy,
            ..MeshConfig::default()
        };
        let engine = NegotiationEngine::new(
            ConnId::try_from(id).unwrap(),
            config,
            Arc::new(factory.clone()),
            signal_tx,
            event_tx,
        );
        (
            Peer {
                engine: Arc::new(engine),
                factory,
                events: event_rx,
            },
            signal_rx,
        )
    }

    /// Delivers one engine's outgoing signals straight into another.
    fn pump(mut rx: mpsc::UnboundedReceiver<ClientMessage>, target: Arc<NegotiationEngine>) {
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match msg {
                    ClientMessage::Offer { sdp, from, .. } => {
                        let _ = target.accept_offer(from, sdp);
                    }
                    ClientMessage::Answer { sdp, from, .. } => {
                        target.accept_answer(&from, sdp);
                    }
                    ClientMessage::IceCandidate {
                        candidate, from, ..
                    } => {
                        target.add_remote_candidate(&from, candidate);
                    }
                    _ => {}
                }
            }
        });
    }

    fn pair(policy: CandidatePolicy) -> (Peer, Peer) {
        let (a, a_rx) = peer("conn_a", policy);
        let (b, b_rx) = peer("conn_b", policy);
        pump(a_rx, b.engine.clone());
        pump(b_rx, a.engine.clone());
        (a, b)
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..300 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    fn a_id() -> ConnId {
        ConnId::try_from("conn_a").unwrap()
    }

    fn b_id() -> ConnId {
        ConnId::try_from("conn_b").unwrap()
    }

    fn camera() -> MediaTrack {
        MediaTrack::new("cam-video", TrackKind::Video, "camera")
    }

    async fn connect(a: &Peer, b: &Peer) {
        a.engine.create_link(b_id()).unwrap();
        assert!(a.engine.initiate_offer(&b_id()));
        eventually(|| {
            a.engine.link_state(&b_id()) == Some(LinkState::Connected)
                && b.engine.link_state(&a_id()) == Some(LinkState::Connected)
        })
        .await;
    }

    #[tokio::test]
    async fn offer_answer_connects_both_sides() {
        let (a, b) = pair(CandidatePolicy::DropEarly);
        a.engine.add_local_track(camera());

        connect(&a, &b).await;

        let toward_a = b.factory.latest(&a_id()).unwrap();
        assert_eq!(toward_a.remote_tracks(), vec![TrackId::from("cam-video")]);
        assert_eq!(toward_a.remote(), a_id());
        assert_eq!(toward_a.config().ice_candidate_pool_size, 10);
        assert_eq!(a.engine.link_count(), 1);
        assert_eq!(b.engine.remotes(), vec![a_id()]);
    }

    #[tokio::test]
    async fn creating_a_link_twice_replaces_the_first() {
        let (a, _b) = pair(CandidatePolicy::DropEarly);
        a.engine.add_local_track(camera());

        let first = a.engine.create_link(b_id()).unwrap();
        let second = a.engine.create_link(b_id()).unwrap();
        assert!(second > first);
        assert_eq!(a.engine.link_count(), 1);
        assert_eq!(a.engine.generation(&b_id()), Some(second));

        let handles = a.factory.handles_for(&b_id());
        assert_eq!(handles.len(), 2);
        eventually(|| handles[0].is_closed()).await;
        assert!(!handles[1].is_closed());
        assert_eq!(handles[1].local_tracks(), vec![TrackId::from("cam-video")]);
        // The retired link must not take its successor out of the registry.
        assert_eq!(a.engine.link_count(), 1);
    }

    #[tokio::test]
    async fn early_candidate_is_dropped_by_default() {
        let (a, b) = pair(CandidatePolicy::DropEarly);
        b.engine.create_link(a_id()).unwrap();
        assert!(
            b.engine
                .add_remote_candidate(&a_id(), IceCandidate::new("candidate:early"))
        );

        connect(&a, &b).await;

        let toward_a = b.factory.latest(&a_id()).unwrap();
        eventually(|| toward_a.applied_candidates() == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(toward_a.applied_candidates(), 1);
    }

    #[tokio::test]
    async fn early_candidate_is_applied_when_buffering() {
        let (a, b) = pair(CandidatePolicy::BufferEarly);
        b.engine.create_link(a_id()).unwrap();
        b.engine
            .add_remote_candidate(&a_id(), IceCandidate::new("candidate:early"));

        connect(&a, &b).await;

        let toward_a = b.factory.latest(&a_id()).unwrap();
        eventually(|| toward_a.applied_candidates() == 2).await;
    }

    #[tokio::test]
    async fn stale_answer_is_ignored() {
        let (a, _b) = pair(CandidatePolicy::DropEarly);
        a.engine.create_link(b_id()).unwrap();

        assert!(a.engine.accept_answer(&b_id(), "v=0\n".into()));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(a.engine.link_state(&b_id()), Some(LinkState::New));
        assert!(!a.factory.latest(&b_id()).unwrap().is_closed());
    }

    #[tokio::test]
    async fn malformed_offer_tears_the_link_down() {
        let (a, _b) = pair(CandidatePolicy::DropEarly);
        a.engine.accept_offer(b_id(), "garbage".into()).unwrap();

        eventually(|| a.engine.link_count() == 0).await;
        assert!(a.factory.latest(&b_id()).unwrap().is_closed());
    }

    #[tokio::test]
    async fn ice_failure_restarts_without_teardown() {
        let (a, b) = pair(CandidatePolicy::DropEarly);
        connect(&a, &b).await;

        let toward_b = a.factory.latest(&b_id()).unwrap();
        toward_b.fail_ice();

        eventually(|| {
            toward_b.ice_restarts() == 1
                && toward_b.is_connected()
                && a.engine.link_state(&b_id()) == Some(LinkState::Connected)
        })
        .await;
        assert_eq!(a.factory.handles_for(&b_id()).len(), 1);
        assert_eq!(b.factory.handles_for(&a_id()).len(), 1);
    }

    #[tokio::test]
    async fn connection_failure_releases_the_link() {
        let (a, b) = pair(CandidatePolicy::DropEarly);
        a.engine.add_local_track(camera());
        connect(&a, &b).await;

        let toward_b = a.factory.latest(&b_id()).unwrap();
        toward_b.fail_connection();

        eventually(|| a.engine.link_count() == 0).await;
        assert!(toward_b.is_closed());
        assert!(toward_b.local_tracks().is_empty());
        // The local track set itself survives.
        assert_eq!(a.engine.local_tracks().len(), 1);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (a, b) = pair(CandidatePolicy::DropEarly);
        connect(&a, &b).await;

        assert!(a.engine.close_link(&b_id()));
        assert!(!a.engine.close_link(&b_id()));
        a.engine.close_all();
        assert_eq!(a.engine.link_count(), 0);
        eventually(|| a.factory.latest(&b_id()).unwrap().is_closed()).await;
    }

    #[tokio::test]
    async fn track_changes_reach_established_links() {
        let (a, b) = pair(CandidatePolicy::DropEarly);
        connect(&a, &b).await;

        let screen = MediaTrack::new("screen-video", TrackKind::Video, "screen");
        assert!(a.engine.add_local_track(screen.clone()));
        assert!(!a.engine.add_local_track(screen));

        let toward_a = b.factory.latest(&a_id()).unwrap();
        eventually(|| toward_a.remote_tracks() == vec![TrackId::from("screen-video")]).await;

        assert!(
            a.engine
                .remove_local_track(&TrackId::from("screen-video"))
                .is_some()
        );
        eventually(|| toward_a.remote_tracks().is_empty()).await;
        eventually(|| a.engine.link_state(&b_id()) == Some(LinkState::Connected)).await;
    }

    #[tokio::test]
    async fn manual_renegotiation_alongside_track_change_is_harmless() {
        let (a, b) = pair(CandidatePolicy::DropEarly);
        connect(&a, &b).await;

        assert!(a.engine.add_local_track(camera()));
        assert!(a.engine.renegotiate(&b_id()));
        assert!(a.engine.renegotiate(&b_id()));

        let toward_a = b.factory.latest(&a_id()).unwrap();
        let toward_b = a.factory.latest(&b_id()).unwrap();
        eventually(|| {
            toward_a.remote_tracks() == vec![TrackId::from("cam-video")]
                && toward_b.signaling_state() == SignalingState::Stable
                && toward_a.signaling_state() == SignalingState::Stable
                && a.engine.link_state(&b_id()) == Some(LinkState::Connected)
                && b.engine.link_state(&a_id()) == Some(LinkState::Connected)
        })
        .await;
        assert_eq!(a.factory.handles_for(&b_id()).len(), 1);
        assert_eq!(b.factory.handles_for(&a_id()).len(), 1);
        assert!(!a.engine.renegotiate(&ConnId::try_from("conn_none").unwrap()));
    }

    #[tokio::test]
    async fn interruption_keeps_the_link_and_ended_tracks_are_reported() {
        let (mut a, b) = pair(CandidatePolicy::DropEarly);
        b.engine.add_local_track(camera());
        connect(&a, &b).await;

        let toward_b = a.factory.latest(&b_id()).unwrap();
        toward_b.interrupt();
        toward_b.end_remote_track(&TrackId::from("cam-video"));

        let removed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match a.events.recv().await {
                    Some(LinkEvent::TrackRemoved { remote, track, .. }) => break (remote, track),
                    Some(_) => continue,
                    None => panic!("link events closed"),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(removed, (b_id(), TrackId::from("cam-video")));
        assert_eq!(a.engine.link_state(&b_id()), Some(LinkState::Connected));
        assert_eq!(a.factory.handles_for(&b_id()).len(), 1);
    }
}
