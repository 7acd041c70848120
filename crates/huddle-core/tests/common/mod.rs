//! Shared harness for multi-client call tests: an in-memory "network" of
//! paired fake peer connections, a fake microphone, and polling helpers.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Duration as TtlDuration;
use huddle_core::{
    AudioCapture, CallClient, CallConfig, CallDeps, CallSnapshot, ConnectionSpec, HuddleError,
    HuddleEvent, HuddleEventListener, IceCandidate, LocalAudioTrack, MediaConnection, MediaEngine,
    MemoryRoster, PeerId, Room, RoomMode, SessionDescription, TransportSink, TransportState,
    loopback::LoopbackHub,
};
use uuid::Uuid;

struct Endpoint {
    owner: PeerId,
    remote: PeerId,
    sink: TransportSink,
    local_set: bool,
    remote_sets: usize,
    candidates_applied: usize,
    closed: bool,
}

/// Every fake connection opened by any client in a test.
#[derive(Clone, Default)]
pub struct FakeNet {
    endpoints: Arc<Mutex<HashMap<Uuid, Endpoint>>>,
}

impl FakeNet {
    pub fn engine(&self, owner: &str) -> Arc<FakeEngine> {
        Arc::new(FakeEngine {
            owner: PeerId::from(owner),
            net: self.clone(),
        })
    }

    fn with_latest<T>(&self, owner: &str, remote: &str, f: impl FnOnce(&Endpoint) -> T) -> Option<T> {
        let endpoints = self.endpoints.lock().unwrap();
        endpoints
            .values()
            .find(|e| e.owner.as_str() == owner && e.remote.as_str() == remote && !e.closed)
            .map(f)
    }

    pub fn remote_sets(&self, owner: &str, remote: &str) -> Option<usize> {
        self.with_latest(owner, remote, |e| e.remote_sets)
    }

    pub fn candidates_applied(&self, owner: &str, remote: &str) -> Option<usize> {
        self.with_latest(owner, remote, |e| e.candidates_applied)
    }

    /// Number of connections opened by `owner` that were never closed.
    pub fn open_connections(&self, owner: &str) -> usize {
        self.endpoints
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.owner.as_str() == owner && !e.closed)
            .count()
    }

    /// Reports a transport failure on `owner`'s connection to `remote`.
    pub fn fail(&self, owner: &str, remote: &str) {
        let sink = self.with_latest(owner, remote, |e| e.sink.clone());
        if let Some(sink) = sink {
            sink.state(TransportState::Failed);
        }
    }

    fn update(&self, id: Uuid, f: impl FnOnce(&mut Endpoint)) {
        if let Some(endpoint) = self.endpoints.lock().unwrap().get_mut(&id) {
            f(endpoint);
        }
    }

    fn report_if_connected(&self, id: Uuid) {
        let sink = {
            let endpoints = self.endpoints.lock().unwrap();
            endpoints
                .get(&id)
                .filter(|e| e.local_set && e.remote_sets > 0 && !e.closed)
                .map(|e| e.sink.clone())
        };
        if let Some(sink) = sink {
            sink.state(TransportState::Connected);
        }
    }
}

pub struct FakeEngine {
    owner: PeerId,
    net: FakeNet,
}

#[async_trait]
impl MediaEngine for FakeEngine {
    async fn open(
        &self,
        spec: ConnectionSpec,
        events: TransportSink,
    ) -> Result<Box<dyn MediaConnection>, HuddleError> {
        self.net.endpoints.lock().unwrap().insert(
            spec.connection_id,
            Endpoint {
                owner: self.owner.clone(),
                remote: spec.peer_id.clone(),
                sink: events,
                local_set: false,
                remote_sets: 0,
                candidates_applied: 0,
                closed: false,
            },
        );
        Ok(Box::new(FakeConnection {
            id: spec.connection_id,
            owner: self.owner.clone(),
            remote: spec.peer_id,
            net: self.net.clone(),
        }))
    }
}

struct FakeConnection {
    id: Uuid,
    owner: PeerId,
    remote: PeerId,
    net: FakeNet,
}

#[async_trait]
impl MediaConnection for FakeConnection {
    async fn create_offer(&self) -> Result<SessionDescription, HuddleError> {
        Ok(SessionDescription::offer(format!("offer {}->{}", self.owner, self.remote)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, HuddleError> {
        Ok(SessionDescription::answer(format!("answer {}->{}", self.owner, self.remote)))
    }

    async fn set_local_description(&self, _desc: &SessionDescription) -> Result<(), HuddleError> {
        let mut sink = None;
        self.net.update(self.id, |e| {
            e.local_set = true;
            sink = Some(e.sink.clone());
        });
        if let Some(sink) = sink {
            sink.candidate(IceCandidate {
                candidate: format!("candidate:{} 1 udp 2122260223 10.0.0.1 5000 typ host", self.owner),
                sdp_mid: Some("0".into()),
                sdp_m_line_index: Some(0),
            });
        }
        self.net.report_if_connected(self.id);
        Ok(())
    }

    async fn set_remote_description(&self, _desc: &SessionDescription) -> Result<(), HuddleError> {
        self.net.update(self.id, |e| e.remote_sets += 1);
        self.net.report_if_connected(self.id);
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: &IceCandidate) -> Result<(), HuddleError> {
        self.net.update(self.id, |e| e.candidates_applied += 1);
        Ok(())
    }

    fn close(&self) {
        self.net.update(self.id, |e| e.closed = true);
    }
}

/// Microphone that hands out tracks (or refuses) and remembers them.
pub struct FakeMic {
    allow: bool,
    tracks: Mutex<Vec<LocalAudioTrack>>,
}

impl FakeMic {
    pub fn new(allow: bool) -> Arc<Self> {
        Arc::new(Self {
            allow,
            tracks: Mutex::new(Vec::new()),
        })
    }

    pub fn live_tracks(&self) -> usize {
        self.tracks.lock().unwrap().iter().filter(|t| t.is_live()).count()
    }
}

#[async_trait]
impl AudioCapture for FakeMic {
    async fn acquire(&self) -> Result<LocalAudioTrack, HuddleError> {
        if !self.allow {
            return Err(HuddleError::PermissionDenied("blocked in settings".into()));
        }
        let track = LocalAudioTrack::new();
        self.tracks.lock().unwrap().push(track.clone());
        Ok(track)
    }
}

#[derive(Default)]
pub struct EventLog {
    events: Mutex<Vec<HuddleEvent>>,
}

impl EventLog {
    pub fn all(&self) -> Vec<HuddleEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl HuddleEventListener for EventLog {
    fn on_event(&self, event: HuddleEvent) {
        self.events.lock().unwrap().push(event);
    }
}

pub struct Peer {
    pub id: PeerId,
    pub client: CallClient,
    pub mic: Arc<FakeMic>,
    pub events: Arc<EventLog>,
}

/// One room on one loopback hub, shared by every peer of a test.
pub struct World {
    pub hub: LoopbackHub,
    pub net: FakeNet,
    pub roster: Arc<MemoryRoster>,
    pub room: Room,
}

impl World {
    pub async fn new(host: &str) -> Self {
        Self::with_hub(host, LoopbackHub::new()).await
    }

    pub async fn with_hub(host: &str, hub: LoopbackHub) -> Self {
        let roster = Arc::new(MemoryRoster::new());
        let room = roster
            .create_room(PeerId::from(host), RoomMode::Call, TtlDuration::hours(3))
            .await;
        Self {
            hub,
            net: FakeNet::default(),
            roster,
            room,
        }
    }

    pub fn peer(&self, id: &str) -> Peer {
        self.peer_with_mic(id, true)
    }

    pub fn peer_with_mic(&self, id: &str, allow_mic: bool) -> Peer {
        let mic = FakeMic::new(allow_mic);
        let events = Arc::new(EventLog::default());
        let deps = CallDeps {
            signaling: Arc::new(self.hub.channel()),
            media: self.net.engine(id),
            capture: mic.clone(),
            roster: self.roster.clone(),
        };
        let config = CallConfig::new(self.room.id.clone(), PeerId::from(id), id.to_uppercase());
        let client = CallClient::new(config, deps);
        client.add_listener(events.clone());
        Peer {
            id: PeerId::from(id),
            client,
            mic,
            events,
        }
    }

    /// Starts every peer in order, then waits for the full mesh.
    pub async fn start_all(&self, peers: &[&Peer]) {
        for peer in peers {
            peer.client.start_call().await.unwrap();
        }
        for peer in peers {
            wait_for(peer, |s| {
                s.peers.len() == peers.len() - 1
                    && s.peers.iter().all(|p| p.state == huddle_core::PeerState::Connected)
            })
            .await;
        }
    }
}

const WAIT_LIMIT: Duration = Duration::from_secs(5);

/// Polls the peer's snapshot until `check` holds.
pub async fn wait_for(peer: &Peer, check: impl Fn(&CallSnapshot) -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    loop {
        let snapshot = peer.client.snapshot().await;
        if check(&snapshot) {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("{}: condition not met, last snapshot {snapshot:?}", peer.id);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Gives every event loop time to drain.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

pub fn peer_ids(snapshot: &CallSnapshot) -> Vec<String> {
    snapshot.peers.iter().map(|p| p.peer_id.to_string()).collect()
}
