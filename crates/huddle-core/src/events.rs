use std::sync::{Arc, PoisonError, RwLock};

use crate::connection::{CloseReason, PeerState};
use crate::signaling::PeerId;

/// Events emitted by the core to native UI listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum HuddleEvent {
    CallStateChanged(CallPhase),
    LocalMuteChanged { muted: bool, by_host: bool },
    PeerJoined(PeerInfo),
    PeerLeft { peer_id: PeerId, reason: CloseReason },
    PeerStateChanged { peer_id: PeerId, state: PeerState },
    PeerMuteChanged { peer_id: PeerId, is_muted: bool, is_muted_by_host: bool },
    ActiveSpeakersChanged(Vec<PeerId>),
    /// The host removed us from the room. The call has already ended.
    Kicked { by: PeerId },
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Idle,
    Starting,
    Active,
}

/// UI view of one remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub peer_name: String,
    pub state: PeerState,
    pub is_muted: bool,
    pub is_muted_by_host: bool,
    pub is_speaking: bool,
}

/// Observable call state for the UI boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSnapshot {
    pub is_call_active: bool,
    pub is_muted: bool,
    pub peers: Vec<PeerInfo>,
    pub error: Option<String>,
}

/// Trait for receiving events from the core.
/// Implementations must be Send + Sync (called from tokio tasks).
pub trait HuddleEventListener: Send + Sync {
    fn on_event(&self, event: HuddleEvent);
}

/// Dispatches events to every registered listener.
#[derive(Clone, Default)]
pub struct EventEmitter {
    listeners: Arc<RwLock<Vec<Arc<dyn HuddleEventListener>>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn HuddleEventListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub fn emit(&self, event: HuddleEvent) {
        let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
        for listener in listeners.iter() {
            listener.on_event(event.clone());
        }
    }
}
