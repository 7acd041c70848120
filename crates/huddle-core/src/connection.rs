//! Connection Manager: one negotiation state machine per remote peer.
//!
//! The manager owns the only registry of live peer connections. Every input
//! (presence, offer, answer, candidate, transport callback) is an explicit
//! transition on the addressed [`PeerSession`]; inputs for peers or
//! connections that no longer exist are no-ops, which is what makes
//! teardown idempotent against late transport callbacks.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::audio_sink::AudioSink;
use crate::election::{Role, role_for};
use crate::errors::HuddleError;
use crate::events::{EventEmitter, HuddleEvent, PeerInfo};
use crate::media::{
    ConnectionSpec, LocalAudioTrack, MediaConnection, MediaEngine, SessionDescription,
    TransportEvent, TransportEventKind, TransportSink, TransportState,
};
use crate::signaling::{IceCandidate, PeerId, SignalPayload, SignalingMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Negotiating,
    Connected,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Left,
    Kicked,
    TransportFailed,
    CallEnded,
}

/// State of the connection to a single remote peer.
pub struct PeerSession {
    peer_id: PeerId,
    display_name: String,
    role: Role,
    connection_id: Uuid,
    state: PeerState,
    connection: Box<dyn MediaConnection>,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
    seen_candidates: HashSet<IceCandidate>,
    is_muted: bool,
    is_muted_by_host: bool,
    sink: AudioSink,
}

impl PeerSession {
    fn new(
        peer_id: PeerId,
        display_name: String,
        role: Role,
        connection_id: Uuid,
        connection: Box<dyn MediaConnection>,
    ) -> Self {
        Self {
            peer_id,
            display_name,
            role,
            connection_id,
            state: PeerState::New,
            connection,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            seen_candidates: HashSet::new(),
            is_muted: false,
            is_muted_by_host: false,
            sink: AudioSink::new(),
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn sink(&self) -> &AudioSink {
        &self.sink
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            peer_id: self.peer_id.clone(),
            peer_name: self.display_name.clone(),
            state: self.state,
            is_muted: self.is_muted,
            is_muted_by_host: self.is_muted_by_host,
            is_speaking: self.sink.is_speaking(),
        }
    }

    /// Moves forward only: `Closed` is absorbing and `Connected` never
    /// falls back to `Negotiating`.
    fn transition(&mut self, next: PeerState) -> bool {
        let allowed = match (self.state, next) {
            (PeerState::Closed, _) => false,
            (_, PeerState::Closed) => true,
            (PeerState::New, PeerState::Negotiating | PeerState::Connected) => true,
            (PeerState::Negotiating, PeerState::Connected) => true,
            _ => false,
        };
        if allowed {
            tracing::debug!("peer {}: {:?} -> {next:?}", self.peer_id, self.state);
            self.state = next;
        }
        allowed
    }

    async fn start_offer(&mut self) -> Result<Option<SessionDescription>, HuddleError> {
        if self.role != Role::Initiator || self.state != PeerState::New {
            return Ok(None);
        }
        let offer = self.connection.create_offer().await?;
        self.connection.set_local_description(&offer).await?;
        self.transition(PeerState::Negotiating);
        Ok(Some(offer))
    }

    async fn accept_offer(&mut self, sdp: String) -> Result<Option<SessionDescription>, HuddleError> {
        if self.role != Role::Responder || self.remote_description_set {
            return Ok(None);
        }
        self.connection
            .set_remote_description(&SessionDescription::offer(sdp))
            .await?;
        self.remote_description_set = true;
        self.flush_candidates().await;

        let answer = self.connection.create_answer().await?;
        self.connection.set_local_description(&answer).await?;
        self.transition(PeerState::Negotiating);
        Ok(Some(answer))
    }

    async fn accept_answer(&mut self, sdp: String) -> Result<bool, HuddleError> {
        if self.role != Role::Initiator
            || self.state != PeerState::Negotiating
            || self.remote_description_set
        {
            return Ok(false);
        }
        self.connection
            .set_remote_description(&SessionDescription::answer(sdp))
            .await?;
        self.remote_description_set = true;
        self.flush_candidates().await;
        Ok(true)
    }

    async fn add_candidate(&mut self, candidate: IceCandidate) {
        if !self.seen_candidates.insert(candidate.clone()) {
            return;
        }
        if self.remote_description_set {
            self.apply_candidate(&candidate).await;
        } else {
            self.pending_candidates.push(candidate);
        }
    }

    async fn flush_candidates(&mut self) {
        let pending = std::mem::take(&mut self.pending_candidates);
        if !pending.is_empty() {
            tracing::debug!("peer {}: replaying {} buffered candidates", self.peer_id, pending.len());
        }
        for candidate in &pending {
            self.apply_candidate(candidate).await;
        }
    }

    async fn apply_candidate(&self, candidate: &IceCandidate) {
        // A rejected candidate only loses one network path.
        if let Err(e) = self.connection.add_ice_candidate(candidate).await {
            tracing::debug!("peer {}: candidate rejected: {e}", self.peer_id);
        }
    }

    fn close(&mut self) {
        if self.transition(PeerState::Closed) {
            self.connection.close();
            self.sink.release();
            self.pending_candidates.clear();
        }
    }
}

/// Registry of live peer sessions for one call.
pub struct ConnectionManager {
    local_id: PeerId,
    engine: Arc<dyn MediaEngine>,
    ice_servers: Vec<String>,
    local_track: LocalAudioTrack,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    emitter: EventEmitter,
    sessions: HashMap<PeerId, PeerSession>,
    speaking: BTreeSet<PeerId>,
    /// Peers removed by the host. They stay out for the rest of the call.
    kicked: HashSet<PeerId>,
}

impl ConnectionManager {
    pub fn new(
        local_id: PeerId,
        engine: Arc<dyn MediaEngine>,
        ice_servers: Vec<String>,
        local_track: LocalAudioTrack,
        transport_tx: mpsc::UnboundedSender<TransportEvent>,
        emitter: EventEmitter,
    ) -> Self {
        Self {
            local_id,
            engine,
            ice_servers,
            local_track,
            transport_tx,
            emitter,
            sessions: HashMap::new(),
            speaking: BTreeSet::new(),
            kicked: HashSet::new(),
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.sessions.contains_key(peer_id)
    }

    pub fn session(&self, peer_id: &PeerId) -> Option<&PeerSession> {
        self.sessions.get(peer_id)
    }

    pub fn is_kicked(&self, peer_id: &PeerId) -> bool {
        self.kicked.contains(peer_id)
    }

    pub fn state(&self, peer_id: &PeerId) -> Option<PeerState> {
        self.sessions.get(peer_id).map(PeerSession::state)
    }

    /// Snapshot of every live peer, ordered by id.
    pub fn peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self.sessions.values().map(PeerSession::info).collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        peers
    }

    /// A peer announced itself. Opens a connection and, if we are the
    /// initiator for this pair, returns the offer to publish.
    pub async fn on_presence_join(
        &mut self,
        peer_id: PeerId,
        display_name: String,
    ) -> Option<SignalingMessage> {
        let role = role_for(&self.local_id, &peer_id)?;
        if self.kicked.contains(&peer_id) {
            tracing::debug!("presence of kicked peer {peer_id} ignored");
            return None;
        }

        if let Some(session) = self.sessions.get_mut(&peer_id) {
            session.display_name = display_name;
            return None;
        }
        if !self.open_session(peer_id.clone(), display_name, role).await {
            return None;
        }

        let result = match self.sessions.get_mut(&peer_id) {
            Some(session) => session.start_offer().await,
            None => return None,
        };
        match result {
            Ok(Some(offer)) => {
                self.emit_state(&peer_id);
                tracing::info!("sending offer to {peer_id}");
                Some(SignalingMessage::addressed(
                    self.local_id.clone(),
                    peer_id,
                    SignalPayload::Offer { sdp: offer.sdp },
                ))
            }
            Ok(None) => None,
            Err(e) => {
                self.fail(&peer_id, &e);
                None
            }
        }
    }

    /// Inbound offer addressed to us. Returns the answer to publish.
    pub async fn on_offer(&mut self, from: PeerId, sdp: String) -> Option<SignalingMessage> {
        if self.kicked.contains(&from) {
            tracing::debug!("offer from kicked peer {from} dropped");
            return None;
        }
        match self.sessions.get(&from) {
            Some(session) if session.role() == Role::Initiator => {
                tracing::warn!("dropping offer from {from}: we initiate this pair");
                return None;
            }
            Some(_) => {}
            None => match role_for(&self.local_id, &from) {
                Some(Role::Responder) => {
                    let name = from.to_string();
                    if !self.open_session(from.clone(), name, Role::Responder).await {
                        return None;
                    }
                }
                _ => {
                    tracing::warn!("dropping offer from {from}: we initiate this pair");
                    return None;
                }
            },
        }

        let result = match self.sessions.get_mut(&from) {
            Some(session) => session.accept_offer(sdp).await,
            None => return None,
        };
        match result {
            Ok(Some(answer)) => {
                self.emit_state(&from);
                tracing::info!("sending answer to {from}");
                Some(SignalingMessage::addressed(
                    self.local_id.clone(),
                    from,
                    SignalPayload::Answer { sdp: answer.sdp },
                ))
            }
            Ok(None) => {
                tracing::debug!("duplicate offer from {from} ignored");
                None
            }
            Err(e) => {
                self.fail(&from, &e);
                None
            }
        }
    }

    pub async fn on_answer(&mut self, from: PeerId, sdp: String) {
        let result = match self.sessions.get_mut(&from) {
            Some(session) => session.accept_answer(sdp).await,
            None => {
                tracing::debug!("answer from unknown peer {from} ignored");
                return;
            }
        };
        match result {
            Ok(true) => tracing::info!("answer from {from} applied"),
            Ok(false) => tracing::debug!("unexpected answer from {from} ignored"),
            Err(e) => self.fail(&from, &e),
        }
    }

    /// Applies or buffers a remote candidate. Repeats are no-ops.
    pub async fn on_candidate(&mut self, from: PeerId, candidate: IceCandidate) {
        if self.kicked.contains(&from) {
            return;
        }
        match self.sessions.get_mut(&from) {
            Some(session) => session.add_candidate(candidate).await,
            None => tracing::debug!("candidate from unknown peer {from} dropped"),
        }
    }

    /// Transport callback. Returns a candidate message to publish when the
    /// transport gathered a local candidate.
    pub fn on_transport_event(&mut self, event: TransportEvent) -> Option<SignalingMessage> {
        let TransportEvent { connection_id, peer_id, kind } = event;
        let session = match self.sessions.get_mut(&peer_id) {
            Some(session) if session.connection_id == connection_id => session,
            _ => {
                tracing::debug!("stale transport event for {peer_id} ignored");
                return None;
            }
        };

        match kind {
            TransportEventKind::LocalCandidate(candidate) => Some(SignalingMessage::addressed(
                self.local_id.clone(),
                peer_id,
                SignalPayload::IceCandidate { candidate },
            )),
            TransportEventKind::StateChanged(state) if state.is_fatal() => {
                tracing::warn!("connection to {peer_id} ended: {state:?}");
                self.remove(&peer_id, CloseReason::TransportFailed);
                None
            }
            TransportEventKind::StateChanged(TransportState::Connected) => {
                if session.transition(PeerState::Connected) {
                    tracing::info!("connected to {peer_id}");
                    self.emit_state(&peer_id);
                }
                None
            }
            TransportEventKind::StateChanged(_) => None,
            TransportEventKind::RemoteAudio(samples) => {
                if let Some(speaking) = session.sink.push_samples(&samples) {
                    let changed = if speaking {
                        self.speaking.insert(peer_id)
                    } else {
                        self.speaking.remove(&peer_id)
                    };
                    if changed {
                        self.emit_speakers();
                    }
                }
                None
            }
        }
    }

    /// Mirrors a peer's self-mute broadcast. Display only.
    pub fn set_peer_muted(&mut self, peer_id: &PeerId, muted: bool) {
        if let Some(session) = self.sessions.get_mut(peer_id) {
            session.is_muted = muted;
            self.emit_mute(peer_id);
        }
    }

    /// Mirrors a host mute/unmute of another peer. Display only.
    pub fn set_peer_host_muted(&mut self, peer_id: &PeerId, muted: bool) {
        if let Some(session) = self.sessions.get_mut(peer_id) {
            session.is_muted_by_host = muted;
            session.is_muted = muted;
            self.emit_mute(peer_id);
        }
    }

    /// Closes and discards one peer. Returns false if it was not live.
    pub fn remove(&mut self, peer_id: &PeerId, reason: CloseReason) -> bool {
        if reason == CloseReason::Kicked {
            self.kicked.insert(peer_id.clone());
        }
        let Some(mut session) = self.sessions.remove(peer_id) else {
            return false;
        };
        session.close();
        tracing::info!("peer {peer_id} closed: {reason:?}");
        if self.speaking.remove(peer_id) {
            self.emit_speakers();
        }
        self.emitter.emit(HuddleEvent::PeerLeft {
            peer_id: peer_id.clone(),
            reason,
        });
        true
    }

    /// Closes every peer. Returns how many were live.
    pub fn close_all(&mut self, reason: CloseReason) -> usize {
        let ids: Vec<PeerId> = self.sessions.keys().cloned().collect();
        ids.iter().filter(|id| self.remove(id, reason)).count()
    }

    async fn open_session(&mut self, peer_id: PeerId, display_name: String, role: Role) -> bool {
        let connection_id = Uuid::new_v4();
        let spec = ConnectionSpec {
            connection_id,
            peer_id: peer_id.clone(),
            ice_servers: self.ice_servers.clone(),
            local_track: self.local_track.clone(),
        };
        let sink = TransportSink::new(connection_id, peer_id.clone(), self.transport_tx.clone());

        match self.engine.open(spec, sink).await {
            Ok(connection) => {
                tracing::info!("opened connection to {peer_id} as {role:?}");
                let session = PeerSession::new(peer_id.clone(), display_name, role, connection_id, connection);
                self.emitter.emit(HuddleEvent::PeerJoined(session.info()));
                self.sessions.insert(peer_id, session);
                true
            }
            Err(e) => {
                tracing::warn!("could not open connection to {peer_id}: {e}");
                false
            }
        }
    }

    fn fail(&mut self, peer_id: &PeerId, error: &HuddleError) {
        tracing::warn!("negotiation with {peer_id} failed: {error}");
        self.remove(peer_id, CloseReason::TransportFailed);
    }

    fn emit_state(&self, peer_id: &PeerId) {
        if let Some(session) = self.sessions.get(peer_id) {
            self.emitter.emit(HuddleEvent::PeerStateChanged {
                peer_id: peer_id.clone(),
                state: session.state,
            });
        }
    }

    fn emit_mute(&self, peer_id: &PeerId) {
        if let Some(session) = self.sessions.get(peer_id) {
            self.emitter.emit(HuddleEvent::PeerMuteChanged {
                peer_id: peer_id.clone(),
                is_muted: session.is_muted,
                is_muted_by_host: session.is_muted_by_host,
            });
        }
    }

    fn emit_speakers(&self) {
        self.emitter
            .emit(HuddleEvent::ActiveSpeakersChanged(self.speaking.iter().cloned().collect()));
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        for session in self.sessions.values_mut() {
            session.close();
        }
    }
}
