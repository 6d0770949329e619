use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::transport::{
    ConnectionState, MediaTrack, PeerTransport, SessionDescription, SignalingState, TrackId,
    TransportError, TransportEvent,
};
use crate::config::CandidatePolicy;
use crate::signaling::{ClientMessage, ConnId, IceCandidate};

/// Link generations are unique for the whole process, so an event from a
/// replaced link can never be mistaken for one from its successor.
static GENERATIONS: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_generation() -> u64 {
    GENERATIONS.fetch_add(1, Ordering::Relaxed)
}

/// Lowest generation any link created from now on can carry.
pub(crate) fn generation_watermark() -> u64 {
    GENERATIONS.load(Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LinkState {
    New,
    Negotiating,
    Connected,
    Failed,
    Closed,
}

impl LinkState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LinkState::Failed | LinkState::Closed)
    }
}

#[derive(Debug, Error)]
#[error("{step} failed: {source}")]
pub struct NegotiationError {
    pub step: &'static str,
    #[source]
    pub source: TransportError,
}

impl NegotiationError {
    pub(crate) fn at(step: &'static str) -> impl FnOnce(TransportError) -> Self {
        move |source| Self { step, source }
    }
}

#[derive(Debug)]
pub(crate) enum LinkCommand {
    InitiateOffer,
    AcceptOffer(String),
    AcceptAnswer(String),
    RemoteCandidate(IceCandidate),
    AttachTrack(MediaTrack),
    DetachTrack(TrackId),
    Renegotiate,
    Close,
}

/// Reported by links to whoever owns the engine
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    StateChanged {
        remote: ConnId,
        generation: u64,
        state: LinkState,
    },
    TrackAdded {
        remote: ConnId,
        generation: u64,
        track: MediaTrack,
    },
    TrackRemoved {
        remote: ConnId,
        generation: u64,
        track: TrackId,
    },
    Closed {
        remote: ConnId,
        generation: u64,
    },
}

pub(crate) struct LinkHandle {
    pub generation: u64,
    pub commands: mpsc::UnboundedSender<LinkCommand>,
    pub state: watch::Receiver<LinkState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Initiator,
    Responder,
}

/// Owns one transport toward one remote participant. Runs as its own task
/// and is driven through [`LinkCommand`]s.
pub(crate) struct PeerLink {
    pub local_id: ConnId,
    pub remote: ConnId,
    pub generation: u64,
    pub transport: Box<dyn PeerTransport>,
    pub policy: CandidatePolicy,
    pub attached: Vec<MediaTrack>,
    pub state_tx: watch::Sender<LinkState>,
    pub signals: mpsc::UnboundedSender<ClientMessage>,
    pub events: mpsc::UnboundedSender<LinkEvent>,
    pub registry: Arc<DashMap<ConnId, LinkHandle>>,
    pending_candidates: Vec<IceCandidate>,
    role: Option<Role>,
    transport_connected: bool,
    established: bool,
    renegotiation_pending: bool,
}

impl PeerLink {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_id: ConnId,
        remote: ConnId,
        generation: u64,
        transport: Box<dyn PeerTransport>,
        policy: CandidatePolicy,
        attached: Vec<MediaTrack>,
        state_tx: watch::Sender<LinkState>,
        signals: mpsc::UnboundedSender<ClientMessage>,
        events: mpsc::UnboundedSender<LinkEvent>,
        registry: Arc<DashMap<ConnId, LinkHandle>>,
    ) -> Self {
        Self {
            local_id,
            remote,
            generation,
            transport,
            policy,
            attached,
            state_tx,
            signals,
            events,
            registry,
            pending_candidates: Vec::new(),
            role: None,
            transport_connected: false,
            established: false,
            renegotiation_pending: false,
        }
    }

    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<LinkCommand>,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        debug!("Link {} -> {} (gen {}) started", self.local_id, self.remote, self.generation);

        loop {
            // Transport events go first: anything a command caused the
            // transport to raise is seen before the next command.
            let result = tokio::select! {
                biased;

                Some(event) = transport_events.recv() => self.handle_transport(event).await,

                cmd = commands.recv() => match cmd {
                    Some(LinkCommand::Close) | None => {
                        self.shutdown(LinkState::Closed).await;
                        Ok(())
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                },
            };

            if let Err(e) = result {
                warn!("Link {} -> {}: {}", self.local_id, self.remote, e);
                self.shutdown(LinkState::Failed).await;
            }
            if self.state().is_terminal() {
                break;
            }
        }

        let _ = self.events.send(LinkEvent::Closed {
            remote: self.remote,
            generation: self.generation,
        });
        debug!("Link {} -> {} (gen {}) stopped", self.local_id, self.remote, self.generation);
    }

    fn state(&self) -> LinkState {
        *self.state_tx.borrow()
    }

    fn set_state(&mut self, state: LinkState) {
        let prev = self.state_tx.send_replace(state);
        if prev != state {
            debug!("Link {} -> {}: {:?} -> {:?}", self.local_id, self.remote, prev, state);
            let _ = self.events.send(LinkEvent::StateChanged {
                remote: self.remote,
                generation: self.generation,
                state,
            });
        }
    }

    fn signal(&self, msg: ClientMessage) {
        if self.signals.send(msg).is_err() {
            debug!("Signaling channel gone, dropping message for {}", self.remote);
        }
    }

    async fn handle_command(&mut self, cmd: LinkCommand) -> Result<(), NegotiationError> {
        match cmd {
            LinkCommand::InitiateOffer => {
                if self.transport.signaling_state() == SignalingState::HaveRemoteOffer {
                    self.renegotiation_pending = true;
                    return Ok(());
                }
                self.send_offer(false).await
            }
            LinkCommand::AcceptOffer(sdp) => self.accept_offer(sdp).await,
            LinkCommand::AcceptAnswer(sdp) => self.accept_answer(sdp).await,
            LinkCommand::RemoteCandidate(candidate) => {
                self.remote_candidate(candidate).await;
                Ok(())
            }
            LinkCommand::AttachTrack(track) => {
                if self.attached.iter().any(|t| t.id == track.id) {
                    return Ok(());
                }
                self.transport
                    .add_track(&track)
                    .map_err(NegotiationError::at("add track"))?;
                self.attached.push(track);
                self.request_renegotiation().await
            }
            LinkCommand::DetachTrack(id) => {
                if !self.attached.iter().any(|t| t.id == id) {
                    return Ok(());
                }
                self.transport
                    .remove_track(&id)
                    .map_err(NegotiationError::at("remove track"))?;
                self.attached.retain(|t| t.id != id);
                self.request_renegotiation().await
            }
            LinkCommand::Renegotiate => self.request_renegotiation().await,
            LinkCommand::Close => {
                self.shutdown(LinkState::Closed).await;
                Ok(())
            }
        }
    }

    async fn send_offer(&mut self, ice_restart: bool) -> Result<(), NegotiationError> {
        let offer = self
            .transport
            .create_offer(ice_restart)
            .await
            .map_err(NegotiationError::at("create offer"))?;
        self.transport
            .set_local_description(offer.clone())
            .await
            .map_err(NegotiationError::at("set local offer"))?;

        self.role.get_or_insert(Role::Initiator);
        self.renegotiation_pending = false;
        self.set_state(LinkState::Negotiating);
        self.signal(ClientMessage::Offer {
            sdp: offer.sdp,
            to: self.remote,
            from: self.local_id,
        });
        Ok(())
    }

    async fn accept_offer(&mut self, sdp: String) -> Result<(), NegotiationError> {
        // Our own outstanding offer is rolled back by the remote one, so
        // whatever it carried has to go out again afterwards.
        if self.transport.signaling_state() == SignalingState::HaveLocalOffer {
            debug!("Offer collision with {}, yielding", self.remote);
            self.renegotiation_pending = true;
        }

        self.transport
            .set_remote_description(SessionDescription::offer(sdp))
            .await
            .map_err(NegotiationError::at("set remote offer"))?;
        self.role.get_or_insert(Role::Responder);
        self.flush_candidates().await;

        let answer = self
            .transport
            .create_answer()
            .await
            .map_err(NegotiationError::at("create answer"))?;
        self.transport
            .set_local_description(answer.clone())
            .await
            .map_err(NegotiationError::at("set local answer"))?;

        self.set_state(LinkState::Negotiating);
        self.signal(ClientMessage::Answer {
            sdp: answer.sdp,
            to: self.remote,
            from: self.local_id,
        });
        self.settle().await
    }

    async fn accept_answer(&mut self, sdp: String) -> Result<(), NegotiationError> {
        let state = self.transport.signaling_state();
        if state != SignalingState::HaveLocalOffer {
            debug!("Ignoring stale answer from {} in {:?}", self.remote, state);
            return Ok(());
        }

        self.transport
            .set_remote_description(SessionDescription::answer(sdp))
            .await
            .map_err(NegotiationError::at("set remote answer"))?;
        self.flush_candidates().await;
        self.settle().await
    }

    async fn remote_candidate(&mut self, candidate: IceCandidate) {
        if !self.transport.has_remote_description() {
            match self.policy {
                CandidatePolicy::DropEarly => {
                    debug!("Dropping early candidate from {}", self.remote);
                }
                CandidatePolicy::BufferEarly => self.pending_candidates.push(candidate),
            }
            return;
        }
        if let Err(e) = self.transport.add_ice_candidate(candidate).await {
            warn!("Failed to add candidate from {}: {}", self.remote, e);
        }
    }

    async fn flush_candidates(&mut self) {
        for candidate in std::mem::take(&mut self.pending_candidates) {
            if let Err(e) = self.transport.add_ice_candidate(candidate).await {
                warn!("Failed to add buffered candidate from {}: {}", self.remote, e);
            }
        }
    }

    /// Promote to Connected once negotiation is stable and the transport is
    /// up, then send any renegotiation that had to wait.
    async fn settle(&mut self) -> Result<(), NegotiationError> {
        if self.transport.signaling_state() != SignalingState::Stable || !self.transport_connected
        {
            return Ok(());
        }
        self.established = true;
        self.set_state(LinkState::Connected);

        if self.renegotiation_pending {
            self.send_offer(false).await?;
        }
        Ok(())
    }

    async fn request_renegotiation(&mut self) -> Result<(), NegotiationError> {
        if self.state().is_terminal() {
            return Ok(());
        }
        if self.established && self.transport.signaling_state() == SignalingState::Stable {
            return self.send_offer(false).await;
        }
        // Nothing negotiated yet: the first exchange picks the change up.
        if self.state() != LinkState::New {
            self.renegotiation_pending = true;
        }
        Ok(())
    }

    async fn handle_transport(&mut self, event: TransportEvent) -> Result<(), NegotiationError> {
        match event {
            TransportEvent::CandidateGathered(candidate) => {
                self.signal(ClientMessage::IceCandidate {
                    candidate,
                    to: self.remote,
                    from: self.local_id,
                });
            }

            TransportEvent::NegotiationNeeded => {
                if self.established
                    && self.transport.signaling_state() == SignalingState::Stable
                    && !self.state().is_terminal()
                {
                    self.send_offer(false).await?;
                }
            }

            TransportEvent::TrackAdded(track) => {
                let _ = self.events.send(LinkEvent::TrackAdded {
                    remote: self.remote,
                    generation: self.generation,
                    track,
                });
            }

            TransportEvent::TrackRemoved(track) => {
                let _ = self.events.send(LinkEvent::TrackRemoved {
                    remote: self.remote,
                    generation: self.generation,
                    track,
                });
            }

            TransportEvent::ConnectionState(state) => match state {
                ConnectionState::Connected => {
                    self.transport_connected = true;
                    self.settle().await?;
                }
                ConnectionState::Disconnected => {
                    debug!("Link {} -> {} interrupted", self.local_id, self.remote);
                }
                ConnectionState::Failed => {
                    info!("Link {} -> {} failed", self.local_id, self.remote);
                    self.shutdown(LinkState::Failed).await;
                }
                ConnectionState::Closed => self.shutdown(LinkState::Closed).await,
                ConnectionState::New | ConnectionState::Connecting => {}
            },

            TransportEvent::IceFailed => {
                info!("ICE failed on {} -> {}, restarting", self.local_id, self.remote);
                self.transport.restart_ice();
                self.transport_connected = false;
                if self.role == Some(Role::Initiator) {
                    self.send_offer(true).await?;
                }
            }
        }
        Ok(())
    }

    async fn shutdown(&mut self, state: LinkState) {
        if self.state().is_terminal() {
            return;
        }
        self.transport.close().await;
        self.attached.clear();
        self.pending_candidates.clear();
        self.set_state(state);

        let generation = self.generation;
        self.registry
            .remove_if(&self.remote, |_, handle| handle.generation == generation);
    }
}
