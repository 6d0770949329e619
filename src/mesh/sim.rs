//! In-process peer transport that follows the offer/answer state machine
//! without moving any media. Used by the command-line client and the tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use rand::Rng;

use super::transport::{
    ConnectionState, MediaTrack, PeerTransport, SdpKind, SessionDescription, SignalingState,
    TrackId, TransportError, TransportEvent, TransportEvents, TransportFactory,
};
use crate::config::TransportConfig;
use crate::signaling::{ConnId, IceCandidate};

#[derive(Debug)]
struct SimState {
    remote: ConnId,
    config: TransportConfig,
    signaling: SignalingState,
    local: Option<SessionDescription>,
    remote_desc: Option<SessionDescription>,
    tracks: Vec<MediaTrack>,
    remote_tracks: Vec<MediaTrack>,
    candidates: Vec<IceCandidate>,
    session_id: u64,
    version: u64,
    ufrag: String,
    remote_ufrag: Option<String>,
    gathered: bool,
    connected: bool,
    closed: bool,
    ice_restarts: u32,
}

struct ParsedSdp {
    ufrag: Option<String>,
    tracks: Vec<MediaTrack>,
}

fn random_ufrag() -> String {
    let value: u32 = rand::rng().random();
    format!("{:08x}", value)
}

fn parse_sdp(sdp: &str) -> Result<ParsedSdp, TransportError> {
    let mut lines = sdp.lines();
    if lines.next() != Some("v=0") {
        return Err(TransportError::Malformed("missing v=0".into()));
    }

    let mut parsed = ParsedSdp {
        ufrag: None,
        tracks: Vec::new(),
    };
    for line in lines {
        if let Some(ufrag) = line.strip_prefix("a=ice-ufrag:") {
            parsed.ufrag = Some(ufrag.to_string());
        } else if let Some(track) = line.strip_prefix("a=track:") {
            let mut parts = track.split_whitespace();
            let (Some(kind), Some(stream), Some(id)) = (parts.next(), parts.next(), parts.next())
            else {
                return Err(TransportError::Malformed(format!("bad track line {}", line)));
            };
            parsed
                .tracks
                .push(MediaTrack::new(id, kind.parse()?, stream));
        }
    }
    Ok(parsed)
}

impl SimState {
    fn render(&mut self) -> String {
        self.version += 1;
        let mut sdp = format!(
            "v=0\no=- {} {} IN IP4 127.0.0.1\ns=-\na=ice-ufrag:{}\n",
            self.session_id, self.version, self.ufrag
        );
        for track in &self.tracks {
            sdp.push_str(&format!(
                "a=track:{} {} {}\n",
                track.kind, track.stream_id, track.id
            ));
        }
        sdp
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    fn invalid(&self, op: &'static str) -> TransportError {
        TransportError::InvalidState {
            op,
            state: self.signaling,
        }
    }

    fn gather(&mut self, events: &TransportEvents) {
        if self.gathered {
            return;
        }
        self.gathered = true;
        let port = 40000 + (self.session_id % 20000);
        let _ = events.send(TransportEvent::CandidateGathered(IceCandidate {
            candidate: format!(
                "candidate:1 1 udp 2130706431 127.0.0.1 {} typ host ufrag {}",
                port, self.ufrag
            ),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        }));
    }

    fn check_connected(&mut self, events: &TransportEvents) {
        if self.signaling == SignalingState::Stable
            && self.local.is_some()
            && self.remote_desc.is_some()
            && !self.connected
            && !self.closed
        {
            self.connected = true;
            let _ = events.send(TransportEvent::ConnectionState(ConnectionState::Connected));
        }
    }

    fn apply_remote_tracks(&mut self, tracks: Vec<MediaTrack>, events: &TransportEvents) {
        for old in &self.remote_tracks {
            if !tracks.iter().any(|t| t.id == old.id) {
                let _ = events.send(TransportEvent::TrackRemoved(old.id.clone()));
            }
        }
        for new in &tracks {
            if !self.remote_tracks.iter().any(|t| t.id == new.id) {
                let _ = events.send(TransportEvent::TrackAdded(new.clone()));
            }
        }
        self.remote_tracks = tracks;
    }

    fn negotiation_needed(&self, events: &TransportEvents) {
        if self.signaling == SignalingState::Stable {
            let _ = events.send(TransportEvent::NegotiationNeeded);
        }
    }
}

/// Simulated peer connection
pub struct SimTransport {
    state: Arc<Mutex<SimState>>,
    events: TransportEvents,
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimTransport {
    pub fn new(remote: ConnId, config: TransportConfig, events: TransportEvents) -> Self {
        let state = SimState {
            remote,
            config,
            signaling: SignalingState::Stable,
            local: None,
            remote_desc: None,
            tracks: Vec::new(),
            remote_tracks: Vec::new(),
            candidates: Vec::new(),
            session_id: rand::rng().random_range(1..u32::MAX as u64),
            version: 0,
            ufrag: random_ufrag(),
            remote_ufrag: None,
            gathered: false,
            connected: false,
            closed: false,
            ice_restarts: 0,
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            events,
        }
    }

    pub fn handle(&self) -> SimHandle {
        SimHandle {
            state: self.state.clone(),
            events: self.events.clone(),
        }
    }
}

#[async_trait]
impl PeerTransport for SimTransport {
    async fn create_offer(
        &mut self,
        ice_restart: bool,
    ) -> Result<SessionDescription, TransportError> {
        let mut state = lock(&self.state);
        state.ensure_open()?;
        if ice_restart {
            state.ufrag = random_ufrag();
            state.gathered = false;
        }
        Ok(SessionDescription::offer(state.render()))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, TransportError> {
        let mut state = lock(&self.state);
        state.ensure_open()?;
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(state.invalid("create answer"));
        }
        Ok(SessionDescription::answer(state.render()))
    }

    async fn set_local_description(
        &mut self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.ensure_open()?;
        state.signaling = match (desc.kind, state.signaling) {
            (SdpKind::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                SignalingState::HaveLocalOffer
            }
            (SdpKind::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
            _ => return Err(state.invalid("set local description")),
        };
        state.local = Some(desc);
        state.gather(&self.events);
        state.check_connected(&self.events);
        Ok(())
    }

    async fn set_remote_description(
        &mut self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.ensure_open()?;
        let parsed = parse_sdp(&desc.sdp)?;

        // A remote offer during our own offer rolls ours back.
        state.signaling = match (desc.kind, state.signaling) {
            (
                SdpKind::Offer,
                SignalingState::Stable
                | SignalingState::HaveRemoteOffer
                | SignalingState::HaveLocalOffer,
            ) => SignalingState::HaveRemoteOffer,
            (SdpKind::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
            _ => return Err(state.invalid("set remote description")),
        };

        if let (Some(prev), Some(next)) = (&state.remote_ufrag, &parsed.ufrag)
            && prev != next
        {
            state.connected = false;
        }
        state.remote_ufrag = parsed.ufrag;
        state.remote_desc = Some(desc);
        state.apply_remote_tracks(parsed.tracks, &self.events);
        state.check_connected(&self.events);
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.ensure_open()?;
        if state.remote_desc.is_none() {
            return Err(state.invalid("add ice candidate"));
        }
        if !candidate.candidate.starts_with("candidate:") {
            return Err(TransportError::Malformed(candidate.candidate));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    fn add_track(&mut self, track: &MediaTrack) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.ensure_open()?;
        if !state.tracks.iter().any(|t| t.id == track.id) {
            state.tracks.push(track.clone());
            state.negotiation_needed(&self.events);
        }
        Ok(())
    }

    fn remove_track(&mut self, id: &TrackId) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.ensure_open()?;
        let before = state.tracks.len();
        state.tracks.retain(|t| &t.id != id);
        if state.tracks.len() != before {
            state.negotiation_needed(&self.events);
        }
        Ok(())
    }

    fn restart_ice(&mut self) {
        let mut state = lock(&self.state);
        state.ice_restarts += 1;
        state.connected = false;
    }

    fn signaling_state(&self) -> SignalingState {
        lock(&self.state).signaling
    }

    fn has_remote_description(&self) -> bool {
        lock(&self.state).remote_desc.is_some()
    }

    async fn close(&mut self) {
        let mut state = lock(&self.state);
        state.closed = true;
        state.connected = false;
        state.signaling = SignalingState::Closed;
        state.tracks.clear();
    }
}

/// Observation and fault-injection handle for a [`SimTransport`]
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
    events: TransportEvents,
}

impl SimHandle {
    pub fn remote(&self) -> ConnId {
        lock(&self.state).remote
    }

    pub fn config(&self) -> TransportConfig {
        lock(&self.state).config.clone()
    }

    pub fn signaling_state(&self) -> SignalingState {
        lock(&self.state).signaling
    }

    pub fn local_tracks(&self) -> Vec<TrackId> {
        lock(&self.state).tracks.iter().map(|t| t.id.clone()).collect()
    }

    pub fn remote_tracks(&self) -> Vec<TrackId> {
        lock(&self.state)
            .remote_tracks
            .iter()
            .map(|t| t.id.clone())
            .collect()
    }

    pub fn applied_candidates(&self) -> usize {
        lock(&self.state).candidates.len()
    }

    pub fn ice_restarts(&self) -> u32 {
        lock(&self.state).ice_restarts
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    /// Report a transient ICE failure.
    pub fn fail_ice(&self) {
        lock(&self.state).connected = false;
        let _ = self.events.send(TransportEvent::IceFailed);
    }

    /// Report a terminal connection failure.
    pub fn fail_connection(&self) {
        lock(&self.state).connected = false;
        let _ = self
            .events
            .send(TransportEvent::ConnectionState(ConnectionState::Failed));
    }

    /// Report a temporary loss of connectivity.
    pub fn interrupt(&self) {
        let _ = self
            .events
            .send(TransportEvent::ConnectionState(ConnectionState::Disconnected));
    }

    /// The remote side stopped sending `id`.
    pub fn end_remote_track(&self, id: &TrackId) {
        let mut state = lock(&self.state);
        let before = state.remote_tracks.len();
        state.remote_tracks.retain(|t| &t.id != id);
        if state.remote_tracks.len() != before {
            let _ = self.events.send(TransportEvent::TrackRemoved(id.clone()));
        }
    }
}

/// Factory for [`SimTransport`]s.
///
/// A plain factory only tracks transports that are still open. A recording
/// factory keeps every transport it ever built, closed ones included.
#[derive(Clone, Default)]
pub struct SimFactory {
    created: Arc<Mutex<HashMap<ConnId, Vec<SimHandle>>>>,
    keep_history: bool,
}

impl SimFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recording() -> Self {
        Self {
            keep_history: true,
            ..Self::default()
        }
    }

    /// Transports built toward `remote`, oldest first.
    pub fn handles_for(&self, remote: &ConnId) -> Vec<SimHandle> {
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(remote)
            .cloned()
            .unwrap_or_default()
    }

    pub fn latest(&self, remote: &ConnId) -> Option<SimHandle> {
        self.handles_for(remote).pop()
    }
}

impl TransportFactory for SimFactory {
    fn create(
        &self,
        remote: ConnId,
        config: &TransportConfig,
        events: TransportEvents,
    ) -> Result<Box<dyn PeerTransport>, TransportError> {
        let transport = SimTransport::new(remote, config.clone(), events);
        let mut created = self.created.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.keep_history {
            created.retain(|_, handles| {
                handles.retain(|h| !h.is_closed());
                !handles.is_empty()
            });
        }
        created.entry(remote).or_default().push(transport.handle());
        Ok(Box::new(transport))
    }
}
