//! Media transport boundary.
//!
//! The core never touches codecs or NAT traversal. It drives a generic
//! peer-to-peer media connection through [`MediaConnection`] and receives
//! the transport's asynchronous callbacks as [`TransportEvent`]s on the
//! client's single event queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::errors::HuddleError;
use crate::signaling::{IceCandidate, PeerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Answer, sdp: sdp.into() }
    }
}

/// Connection state as reported by the underlying transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    /// States after which the connection is discarded.
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

/// Change notifications for a [`LocalAudioTrack`], for native capture
/// pipelines that need to follow the core's decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSignal {
    Enabled(bool),
    Stopped,
}

type TrackObserver = Arc<dyn Fn(TrackSignal) + Send + Sync>;

/// The outgoing microphone track.
///
/// Clones share the same flags: Local Media State owns the capture and is
/// the only writer, every connection holds a clone to send from.
#[derive(Clone)]
pub struct LocalAudioTrack {
    id: Uuid,
    enabled: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    observer: Option<TrackObserver>,
}

impl LocalAudioTrack {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            enabled: Arc::new(AtomicBool::new(true)),
            stopped: Arc::new(AtomicBool::new(false)),
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: impl Fn(TrackSignal) + Send + Sync + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        if self.is_stopped() {
            return;
        }
        let previous = self.enabled.swap(enabled, Ordering::SeqCst);
        if previous != enabled {
            self.notify(TrackSignal::Enabled(enabled));
        }
    }

    /// Stops capture. Idempotent.
    pub fn stop(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.notify(TrackSignal::Stopped);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn is_live(&self) -> bool {
        !self.is_stopped()
    }

    fn notify(&self, signal: TrackSignal) {
        if let Some(observer) = &self.observer {
            observer(signal);
        }
    }
}

impl Default for LocalAudioTrack {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LocalAudioTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalAudioTrack")
            .field("id", &self.id)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEventKind {
    LocalCandidate(IceCandidate),
    StateChanged(TransportState),
    /// Decoded mono PCM from the remote peer.
    RemoteAudio(Vec<i16>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportEvent {
    pub connection_id: Uuid,
    pub peer_id: PeerId,
    pub kind: TransportEventKind,
}

/// Handle given to a transport so it can report back into the client's
/// event queue. Every event is stamped with the connection it belongs to.
#[derive(Debug, Clone)]
pub struct TransportSink {
    connection_id: Uuid,
    peer_id: PeerId,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportSink {
    pub fn new(connection_id: Uuid, peer_id: PeerId, tx: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self { connection_id, peer_id, tx }
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Returns false once the client has stopped listening.
    pub fn send(&self, kind: TransportEventKind) -> bool {
        self.tx
            .send(TransportEvent {
                connection_id: self.connection_id,
                peer_id: self.peer_id.clone(),
                kind,
            })
            .is_ok()
    }

    pub fn candidate(&self, candidate: IceCandidate) -> bool {
        self.send(TransportEventKind::LocalCandidate(candidate))
    }

    pub fn state(&self, state: TransportState) -> bool {
        self.send(TransportEventKind::StateChanged(state))
    }

    pub fn audio(&self, samples: Vec<i16>) -> bool {
        self.send(TransportEventKind::RemoteAudio(samples))
    }
}

/// Parameters for opening one peer connection.
#[derive(Debug, Clone)]
pub struct ConnectionSpec {
    pub connection_id: Uuid,
    pub peer_id: PeerId,
    pub ice_servers: Vec<String>,
    pub local_track: LocalAudioTrack,
}

/// One direct media connection to a remote peer.
#[async_trait]
pub trait MediaConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, HuddleError>;
    async fn create_answer(&self) -> Result<SessionDescription, HuddleError>;
    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), HuddleError>;
    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), HuddleError>;
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), HuddleError>;
    /// Must be safe to call more than once.
    fn close(&self);
}

/// Factory for peer connections.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn open(
        &self,
        spec: ConnectionSpec,
        events: TransportSink,
    ) -> Result<Box<dyn MediaConnection>, HuddleError>;
}

/// Microphone access. Fails with [`HuddleError::PermissionDenied`] when the
/// user refuses.
#[async_trait]
pub trait AudioCapture: Send + Sync {
    async fn acquire(&self) -> Result<LocalAudioTrack, HuddleError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn clones_share_flags() {
        let track = LocalAudioTrack::new();
        let shared = track.clone();
        track.set_enabled(false);
        assert!(!shared.is_enabled());
        assert_eq!(track.id(), shared.id());
    }

    #[test]
    fn stop_is_idempotent_and_final() {
        let signals = Arc::new(Mutex::new(Vec::new()));
        let captured = signals.clone();
        let track = LocalAudioTrack::new().with_observer(move |s| captured.lock().unwrap().push(s));

        track.set_enabled(false);
        track.stop();
        track.stop();
        track.set_enabled(true);

        assert!(track.is_stopped());
        assert!(!track.is_enabled());
        assert_eq!(
            *signals.lock().unwrap(),
            vec![TrackSignal::Enabled(false), TrackSignal::Stopped]
        );
    }

    #[test]
    fn sink_stamps_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        let sink = TransportSink::new(id, PeerId::from("p"), tx);
        assert!(sink.state(TransportState::Connected));
        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.connection_id, id);
        assert_eq!(ev.peer_id, PeerId::from("p"));
        assert_eq!(ev.kind, TransportEventKind::StateChanged(TransportState::Connected));

        drop(rx);
        assert!(!sink.state(TransportState::Failed));
    }

    #[test]
    fn fatal_states() {
        assert!(TransportState::Failed.is_fatal());
        assert!(TransportState::Disconnected.is_fatal());
        assert!(TransportState::Closed.is_fatal());
        assert!(!TransportState::Connecting.is_fatal());
        assert!(!TransportState::Connected.is_fatal());
    }
}
