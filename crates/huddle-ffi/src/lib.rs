//! UniFFI bindings for huddle-core.
//!
//! Provides a HuddleClient object that wraps a CallClient, the settings
//! store and the REST roster into a single FFI-safe interface. Signaling
//! and media are host services: the native shell implements the
//! `SignalingBridge` and `MediaBridge` callback interfaces and feeds
//! inbound traffic back through the `deliver_*` methods.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use huddle_core::{
    self, CallClient, CallConfig, CallDeps, ChannelEvent, ConnectionSpec, LocalAudioTrack,
    MediaConnection, MediaEngine, PeerId, PresenceMeta, SdpKind, SessionDescription,
    SignalingChannel, SignalingMessage, TransportSink,
    events::{
        CallPhase as CoreCallPhase, CallSnapshot as CoreCallSnapshot, HuddleEvent as CoreHuddleEvent,
        PeerInfo as CorePeerInfo,
    },
    media::{AudioCapture, TrackSignal, TransportState as CoreTransportState},
    signaling::IceCandidate as CoreIceCandidate,
    CloseReason as CoreCloseReason, PeerState as CorePeerState,
};
use tokio::sync::mpsc;

uniffi::include_scaffolding!("huddle");

// ── Namespace functions ──────────────────────────────────────────────

const DEFAULT_LOG_FILTER: &str = "huddle_core=debug,huddle_ffi=debug";

/// Initialize tracing/logging. Call once from the host before using HuddleClient.
fn init_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)),
            )
            .with_ansi(false)
            .try_init();
    });
}

// ── FFI-safe type conversions ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Idle,
    Starting,
    Active,
}

impl From<CoreCallPhase> for CallPhase {
    fn from(p: CoreCallPhase) -> Self {
        match p {
            CoreCallPhase::Idle => Self::Idle,
            CoreCallPhase::Starting => Self::Starting,
            CoreCallPhase::Active => Self::Active,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Negotiating,
    Connected,
    Closed,
}

impl From<CorePeerState> for PeerState {
    fn from(s: CorePeerState) -> Self {
        match s {
            CorePeerState::New => Self::New,
            CorePeerState::Negotiating => Self::Negotiating,
            CorePeerState::Connected => Self::Connected,
            CorePeerState::Closed => Self::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Left,
    Kicked,
    TransportFailed,
    CallEnded,
}

impl From<CoreCloseReason> for CloseReason {
    fn from(r: CoreCloseReason) -> Self {
        match r {
            CoreCloseReason::Left => Self::Left,
            CoreCloseReason::Kicked => Self::Kicked,
            CoreCloseReason::TransportFailed => Self::TransportFailed,
            CoreCloseReason::CallEnded => Self::CallEnded,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl From<TransportState> for CoreTransportState {
    fn from(s: TransportState) -> Self {
        match s {
            TransportState::New => Self::New,
            TransportState::Connecting => Self::Connecting,
            TransportState::Connected => Self::Connected,
            TransportState::Disconnected => Self::Disconnected,
            TransportState::Failed => Self::Failed,
            TransportState::Closed => Self::Closed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: String,
    pub peer_name: String,
    pub state: PeerState,
    pub is_muted: bool,
    pub is_muted_by_host: bool,
    pub is_speaking: bool,
}

impl From<CorePeerInfo> for PeerInfo {
    fn from(p: CorePeerInfo) -> Self {
        Self {
            peer_id: p.peer_id.to_string(),
            peer_name: p.peer_name,
            state: p.state.into(),
            is_muted: p.is_muted,
            is_muted_by_host: p.is_muted_by_host,
            is_speaking: p.is_speaking,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallSnapshot {
    pub is_call_active: bool,
    pub is_muted: bool,
    pub peers: Vec<PeerInfo>,
    pub error: Option<String>,
}

impl From<CoreCallSnapshot> for CallSnapshot {
    fn from(s: CoreCallSnapshot) -> Self {
        Self {
            is_call_active: s.is_call_active,
            is_muted: s.is_muted,
            peers: s.peers.into_iter().map(PeerInfo::from).collect(),
            error: s.error,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub display_name: Option<String>,
    pub ice_servers: Vec<String>,
    pub start_muted: bool,
}

impl From<huddle_core::Settings> for Settings {
    fn from(s: huddle_core::Settings) -> Self {
        Self {
            display_name: s.display_name,
            ice_servers: s.ice_servers,
            start_muted: s.start_muted,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_m_line_index: Option<u16>,
}

impl From<IceCandidate> for CoreIceCandidate {
    fn from(c: IceCandidate) -> Self {
        Self {
            candidate: c.candidate,
            sdp_mid: c.sdp_mid,
            sdp_m_line_index: c.sdp_m_line_index,
        }
    }
}

impl From<&CoreIceCandidate> for IceCandidate {
    fn from(c: &CoreIceCandidate) -> Self {
        Self {
            candidate: c.candidate.clone(),
            sdp_mid: c.sdp_mid.clone(),
            sdp_m_line_index: c.sdp_m_line_index,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HuddleEvent {
    CallStateChanged { phase: CallPhase },
    LocalMuteChanged { muted: bool, by_host: bool },
    PeerJoined { info: PeerInfo },
    PeerLeft { peer_id: String, reason: CloseReason },
    PeerStateChanged { peer_id: String, state: PeerState },
    PeerMuteChanged { peer_id: String, is_muted: bool, is_muted_by_host: bool },
    ActiveSpeakersChanged { peer_ids: Vec<String> },
    Kicked { host_id: String },
    Error { message: String },
}

impl From<CoreHuddleEvent> for HuddleEvent {
    fn from(e: CoreHuddleEvent) -> Self {
        match e {
            CoreHuddleEvent::CallStateChanged(phase) => Self::CallStateChanged { phase: phase.into() },
            CoreHuddleEvent::LocalMuteChanged { muted, by_host } => {
                Self::LocalMuteChanged { muted, by_host }
            }
            CoreHuddleEvent::PeerJoined(info) => Self::PeerJoined { info: info.into() },
            CoreHuddleEvent::PeerLeft { peer_id, reason } => Self::PeerLeft {
                peer_id: peer_id.to_string(),
                reason: reason.into(),
            },
            CoreHuddleEvent::PeerStateChanged { peer_id, state } => Self::PeerStateChanged {
                peer_id: peer_id.to_string(),
                state: state.into(),
            },
            CoreHuddleEvent::PeerMuteChanged { peer_id, is_muted, is_muted_by_host } => {
                Self::PeerMuteChanged {
                    peer_id: peer_id.to_string(),
                    is_muted,
                    is_muted_by_host,
                }
            }
            CoreHuddleEvent::ActiveSpeakersChanged(ids) => Self::ActiveSpeakersChanged {
                peer_ids: ids.into_iter().map(|id| id.to_string()).collect(),
            },
            CoreHuddleEvent::Kicked { by } => Self::Kicked { host_id: by.to_string() },
            CoreHuddleEvent::Error(message) => Self::Error { message },
        }
    }
}

// ── Error conversion ──────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum HuddleError {
    #[error("{msg}")]
    PermissionDenied { msg: String },
    #[error("{msg}")]
    Signaling { msg: String },
    #[error("{msg}")]
    Connection { msg: String },
    #[error("{msg}")]
    Room { msg: String },
    #[error("{msg}")]
    RoomFull { msg: String },
    #[error("{msg}")]
    RoomExpired { msg: String },
    #[error("{msg}")]
    NotHost { msg: String },
    #[error("{msg}")]
    NotInCall { msg: String },
    #[error("{msg}")]
    Roster { msg: String },
    #[error("{msg}")]
    Http { msg: String },
    #[error("{msg}")]
    Decode { msg: String },
    #[error("Runtime error: {msg}")]
    Runtime { msg: String },
}

impl From<huddle_core::HuddleError> for HuddleError {
    fn from(e: huddle_core::HuddleError) -> Self {
        tracing::error!("HuddleError: {e}");
        let msg = e.to_string();
        match e {
            huddle_core::HuddleError::PermissionDenied(_) => Self::PermissionDenied { msg },
            huddle_core::HuddleError::Signaling(_) => Self::Signaling { msg },
            huddle_core::HuddleError::Connection(_) => Self::Connection { msg },
            huddle_core::HuddleError::Room(_) => Self::Room { msg },
            huddle_core::HuddleError::RoomFull(_) => Self::RoomFull { msg },
            huddle_core::HuddleError::RoomExpired => Self::RoomExpired { msg },
            huddle_core::HuddleError::NotHost => Self::NotHost { msg },
            huddle_core::HuddleError::NotInCall => Self::NotInCall { msg },
            huddle_core::HuddleError::Roster(_) => Self::Roster { msg },
            huddle_core::HuddleError::Http(_) => Self::Http { msg },
            huddle_core::HuddleError::Decode(_) => Self::Decode { msg },
        }
    }
}

// ── Callback interfaces ───────────────────────────────────────────────

pub trait HuddleEventListener: Send + Sync {
    fn on_event(&self, event: HuddleEvent);
}

/// Room channel provided by the host (e.g. a realtime broadcast socket).
pub trait SignalingBridge: Send + Sync {
    fn join(&self, room_id: String, self_id: String, display_name: String) -> bool;
    fn publish(&self, envelope_json: String) -> bool;
    fn leave(&self);
}

/// Microphone and peer connections provided by the platform WebRTC stack.
/// Connections are addressed by the id the core assigns in `open_connection`.
pub trait MediaBridge: Send + Sync {
    fn request_microphone(&self) -> bool;
    fn set_microphone_enabled(&self, enabled: bool);
    fn stop_microphone(&self);
    fn open_connection(&self, connection_id: String, peer_id: String, ice_servers: Vec<String>) -> bool;
    fn create_offer(&self, connection_id: String) -> Option<String>;
    fn create_answer(&self, connection_id: String) -> Option<String>;
    fn set_local_description(&self, connection_id: String, sdp_type: String, sdp: String) -> bool;
    fn set_remote_description(&self, connection_id: String, sdp_type: String, sdp: String) -> bool;
    fn add_ice_candidate(&self, connection_id: String, candidate: IceCandidate) -> bool;
    fn close_connection(&self, connection_id: String);
}

// ── Bridge listener: FFI callback → core listener ─────────────────────

struct BridgeListener {
    ffi_listener: Arc<dyn HuddleEventListener>,
}

impl huddle_core::HuddleEventListener for BridgeListener {
    fn on_event(&self, event: CoreHuddleEvent) {
        self.ffi_listener.on_event(event.into());
    }
}

/// Forwards a call's events to the client-wide emitter, so listeners
/// survive across calls.
struct Relay {
    emitter: huddle_core::EventEmitter,
}

impl huddle_core::HuddleEventListener for Relay {
    fn on_event(&self, event: CoreHuddleEvent) {
        self.emitter.emit(event);
    }
}

// ── Bridge signaling: host channel → core SignalingChannel ────────────

struct BridgeSignaling {
    bridge: Arc<dyn SignalingBridge>,
    inbound: StdMutex<Option<mpsc::UnboundedSender<ChannelEvent>>>,
}

impl BridgeSignaling {
    fn new(bridge: Arc<dyn SignalingBridge>) -> Self {
        Self {
            bridge,
            inbound: StdMutex::new(None),
        }
    }

    fn inbound(&self) -> std::sync::MutexGuard<'_, Option<mpsc::UnboundedSender<ChannelEvent>>> {
        self.inbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns false when no subscription is open.
    fn deliver(&self, event: ChannelEvent) -> bool {
        match self.inbound().as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => {
                tracing::debug!("dropping inbound {event:?}: not joined");
                false
            }
        }
    }
}

#[async_trait]
impl SignalingChannel for BridgeSignaling {
    async fn join(
        &self,
        room_id: &str,
        self_id: &PeerId,
        meta: PresenceMeta,
    ) -> Result<mpsc::UnboundedReceiver<ChannelEvent>, huddle_core::HuddleError> {
        let (tx, rx) = mpsc::unbounded_channel();
        // Installed first: hosts may deliver presence from inside join().
        *self.inbound() = Some(tx);
        if !self
            .bridge
            .join(room_id.to_string(), self_id.to_string(), meta.display_name)
        {
            *self.inbound() = None;
            return Err(huddle_core::HuddleError::Signaling(format!(
                "host could not join channel for room {room_id}"
            )));
        }
        Ok(rx)
    }

    async fn publish(&self, message: SignalingMessage) -> Result<(), huddle_core::HuddleError> {
        let json = message.to_json()?;
        if self.bridge.publish(json) {
            Ok(())
        } else {
            Err(huddle_core::HuddleError::Signaling(format!(
                "host dropped {}",
                message.payload.kind()
            )))
        }
    }

    async fn leave(&self) -> Result<(), huddle_core::HuddleError> {
        if self.inbound().take().is_some() {
            self.bridge.leave();
        }
        Ok(())
    }
}

// ── Bridge media: platform WebRTC → core MediaEngine ──────────────────

type SinkRegistry = Arc<StdMutex<HashMap<String, TransportSink>>>;

fn sdp_type(kind: SdpKind) -> String {
    match kind {
        SdpKind::Offer => "offer".to_string(),
        SdpKind::Answer => "answer".to_string(),
    }
}

struct BridgeMedia {
    bridge: Arc<dyn MediaBridge>,
    sinks: SinkRegistry,
}

impl BridgeMedia {
    fn new(bridge: Arc<dyn MediaBridge>) -> Self {
        Self {
            bridge,
            sinks: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    fn sink(&self, connection_id: &str) -> Option<TransportSink> {
        let sinks = self.sinks.lock().unwrap_or_else(PoisonError::into_inner);
        let sink = sinks.get(connection_id).cloned();
        if sink.is_none() {
            tracing::debug!("transport event for unknown connection {connection_id}");
        }
        sink
    }
}

#[async_trait]
impl MediaEngine for BridgeMedia {
    async fn open(
        &self,
        spec: ConnectionSpec,
        events: TransportSink,
    ) -> Result<Box<dyn MediaConnection>, huddle_core::HuddleError> {
        let id = spec.connection_id.to_string();
        self.sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), events);

        if !self
            .bridge
            .open_connection(id.clone(), spec.peer_id.to_string(), spec.ice_servers)
        {
            self.sinks.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
            return Err(huddle_core::HuddleError::Connection(format!(
                "host could not open a connection to {}",
                spec.peer_id
            )));
        }
        Ok(Box::new(BridgeConnection {
            id,
            bridge: self.bridge.clone(),
            sinks: self.sinks.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

#[async_trait]
impl AudioCapture for BridgeMedia {
    async fn acquire(&self) -> Result<LocalAudioTrack, huddle_core::HuddleError> {
        if !self.bridge.request_microphone() {
            return Err(huddle_core::HuddleError::PermissionDenied(
                "microphone access refused".into(),
            ));
        }
        let bridge = self.bridge.clone();
        Ok(LocalAudioTrack::new().with_observer(move |signal| match signal {
            TrackSignal::Enabled(enabled) => bridge.set_microphone_enabled(enabled),
            TrackSignal::Stopped => bridge.stop_microphone(),
        }))
    }
}

struct BridgeConnection {
    id: String,
    bridge: Arc<dyn MediaBridge>,
    sinks: SinkRegistry,
    closed: AtomicBool,
}

impl BridgeConnection {
    fn check(&self, ok: bool, what: &str) -> Result<(), huddle_core::HuddleError> {
        if ok {
            Ok(())
        } else {
            Err(huddle_core::HuddleError::Connection(format!("{what} failed on {}", self.id)))
        }
    }
}

#[async_trait]
impl MediaConnection for BridgeConnection {
    async fn create_offer(&self) -> Result<SessionDescription, huddle_core::HuddleError> {
        self.bridge
            .create_offer(self.id.clone())
            .map(SessionDescription::offer)
            .ok_or_else(|| huddle_core::HuddleError::Connection(format!("no offer for {}", self.id)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, huddle_core::HuddleError> {
        self.bridge
            .create_answer(self.id.clone())
            .map(SessionDescription::answer)
            .ok_or_else(|| huddle_core::HuddleError::Connection(format!("no answer for {}", self.id)))
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), huddle_core::HuddleError> {
        let ok = self
            .bridge
            .set_local_description(self.id.clone(), sdp_type(desc.kind), desc.sdp.clone());
        self.check(ok, "set_local_description")
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), huddle_core::HuddleError> {
        let ok = self
            .bridge
            .set_remote_description(self.id.clone(), sdp_type(desc.kind), desc.sdp.clone());
        self.check(ok, "set_remote_description")
    }

    async fn add_ice_candidate(&self, candidate: &CoreIceCandidate) -> Result<(), huddle_core::HuddleError> {
        let ok = self.bridge.add_ice_candidate(self.id.clone(), candidate.into());
        self.check(ok, "add_ice_candidate")
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
        self.bridge.close_connection(self.id.clone());
    }
}

// ── HuddleClient: main FFI object ─────────────────────────────────────

pub struct HuddleClient {
    room_id: String,
    self_id: PeerId,
    deps: CallDeps,
    signaling: Arc<BridgeSignaling>,
    media: Arc<BridgeMedia>,
    settings: huddle_core::SettingsStore,
    emitter: huddle_core::EventEmitter,
    call: StdMutex<Option<Arc<CallClient>>>,
    rt: tokio::runtime::Runtime,
}

impl HuddleClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        data_dir: String,
        room_id: String,
        self_id: String,
        roster_url: String,
        roster_api_key: String,
        access_token: Option<String>,
        signaling: Box<dyn SignalingBridge>,
        media: Box<dyn MediaBridge>,
    ) -> Result<Self, HuddleError> {
        let rt = tokio::runtime::Runtime::new().map_err(|e| HuddleError::Runtime { msg: e.to_string() })?;

        let mut roster = huddle_core::RestRosterStore::new(&roster_url, &roster_api_key);
        if let Some(token) = access_token {
            roster = roster.with_access_token(token);
        }
        let signaling = Arc::new(BridgeSignaling::new(Arc::from(signaling)));
        let media = Arc::new(BridgeMedia::new(Arc::from(media)));
        let deps = CallDeps {
            signaling: signaling.clone(),
            media: media.clone(),
            capture: media.clone(),
            roster: Arc::new(roster),
        };
        tracing::info!("huddle client created for room {room_id}");

        Ok(Self {
            room_id,
            self_id: PeerId::new(self_id),
            deps,
            signaling,
            media,
            settings: huddle_core::SettingsStore::new(&data_dir),
            emitter: huddle_core::EventEmitter::new(),
            call: StdMutex::new(None),
            rt,
        })
    }

    fn call_slot(&self) -> std::sync::MutexGuard<'_, Option<Arc<CallClient>>> {
        self.call.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_call(&self) -> Option<Arc<CallClient>> {
        self.call_slot().clone()
    }

    /// Reuses a running call; otherwise builds a fresh one so that the
    /// latest settings apply.
    fn call_for_start(&self) -> Arc<CallClient> {
        let mut slot = self.call_slot();
        if let Some(call) = slot.as_ref() {
            if self.rt.block_on(call.phase()) != CoreCallPhase::Idle {
                return call.clone();
            }
        }
        let config = CallConfig::from_settings(self.room_id.clone(), self.self_id.clone(), &self.settings.get());
        let call = Arc::new(CallClient::new(config, self.deps.clone()));
        call.add_listener(Arc::new(Relay {
            emitter: self.emitter.clone(),
        }));
        *slot = Some(call.clone());
        call
    }

    pub fn start_call(&self) -> Result<(), HuddleError> {
        let call = self.call_for_start();
        self.rt.block_on(call.start_call()).map_err(HuddleError::from)
    }

    pub fn end_call(&self) {
        if let Some(call) = self.current_call() {
            self.rt.block_on(call.end_call());
        }
    }

    pub fn toggle_mute(&self) -> Result<bool, HuddleError> {
        let call = self.current_call().ok_or(huddle_core::HuddleError::NotInCall)?;
        self.rt.block_on(call.toggle_mute()).map_err(HuddleError::from)
    }

    pub fn host_mute(&self, peer_id: String) -> Result<(), HuddleError> {
        let call = self.current_call().ok_or(huddle_core::HuddleError::NotInCall)?;
        self.rt
            .block_on(call.host_mute(&PeerId::new(peer_id)))
            .map_err(HuddleError::from)
    }

    pub fn host_unmute(&self, peer_id: String) -> Result<(), HuddleError> {
        let call = self.current_call().ok_or(huddle_core::HuddleError::NotInCall)?;
        self.rt
            .block_on(call.host_unmute(&PeerId::new(peer_id)))
            .map_err(HuddleError::from)
    }

    pub fn host_kick(&self, peer_id: String) -> Result<(), HuddleError> {
        let call = self.current_call().ok_or(huddle_core::HuddleError::NotInCall)?;
        self.rt
            .block_on(call.host_kick(&PeerId::new(peer_id)))
            .map_err(HuddleError::from)
    }

    pub fn snapshot(&self) -> CallSnapshot {
        match self.current_call() {
            Some(call) => self.rt.block_on(call.snapshot()).into(),
            None => CallSnapshot::default(),
        }
    }

    pub fn is_host(&self) -> bool {
        self.current_call()
            .is_some_and(|call| self.rt.block_on(call.is_host()))
    }

    pub fn add_listener(&self, listener: Box<dyn HuddleEventListener>) {
        self.emitter.add_listener(Arc::new(BridgeListener {
            ffi_listener: Arc::from(listener),
        }));
    }

    pub fn get_settings(&self) -> Settings {
        self.settings.get().into()
    }

    pub fn set_display_name(&self, name: Option<String>) {
        self.settings.set_display_name(name);
    }

    pub fn set_ice_servers(&self, servers: Vec<String>) {
        self.settings.set_ice_servers(servers);
    }

    pub fn set_start_muted(&self, muted: bool) {
        self.settings.set_start_muted(muted);
    }

    pub fn deliver_presence_join(&self, peer_id: String, display_name: String) {
        self.signaling.deliver(ChannelEvent::PresenceJoin {
            peer_id: PeerId::new(peer_id),
            display_name,
        });
    }

    pub fn deliver_presence_leave(&self, peer_id: String) {
        self.signaling.deliver(ChannelEvent::PresenceLeave {
            peer_id: PeerId::new(peer_id),
        });
    }

    pub fn deliver_message(&self, envelope_json: String) -> Result<(), HuddleError> {
        let message = SignalingMessage::from_json(&envelope_json)?;
        self.signaling.deliver(ChannelEvent::Message(message));
        Ok(())
    }

    pub fn deliver_local_candidate(&self, connection_id: String, candidate: IceCandidate) {
        if let Some(sink) = self.media.sink(&connection_id) {
            sink.candidate(candidate.into());
        }
    }

    pub fn deliver_transport_state(&self, connection_id: String, state: TransportState) {
        if let Some(sink) = self.media.sink(&connection_id) {
            sink.state(state.into());
        }
    }

    pub fn deliver_remote_audio(&self, connection_id: String, samples: Vec<i16>) {
        if let Some(sink) = self.media.sink(&connection_id) {
            sink.audio(samples);
        }
    }

    pub fn pull_peer_audio(&self, peer_id: String, max_samples: u32) -> Vec<i16> {
        let Some(call) = self.current_call() else {
            return Vec::new();
        };
        let mut buf = vec![0i16; max_samples as usize];
        let n = self
            .rt
            .block_on(call.pull_peer_audio(&PeerId::new(peer_id), &mut buf));
        buf.truncate(n);
        buf
    }
}

impl Drop for HuddleClient {
    fn drop(&mut self) {
        if let Some(call) = self.call_slot().take() {
            self.rt.block_on(call.end_call());
        }
    }
}
