//! Call client: one voice call in one room.
//!
//! All mutable state lives behind a single async mutex. UI commands and the
//! spawned event loop both take it for every step, so every input is applied
//! to a consistent state one at a time. The loop consumes the channel
//! subscription and the transport queue; it holds only a weak reference to
//! the client and exits as soon as its call generation is superseded.

use std::sync::{Arc, Weak};

use chrono::Utc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::connection::{CloseReason, ConnectionManager};
use crate::election::{Discovery, discover};
use crate::errors::HuddleError;
use crate::events::{CallPhase, CallSnapshot, EventEmitter, HuddleEvent, HuddleEventListener};
use crate::local_media::{LocalCallState, LocalMedia};
use crate::media::{AudioCapture, LocalAudioTrack, MediaEngine, TransportEvent};
use crate::moderation::{HostCommand, ModerationAction, ModerationController};
use crate::roster::{Room, RoomMode, RosterStore};
use crate::settings::Settings;
use crate::signaling::{ChannelEvent, PeerId, PresenceMeta, SignalPayload, SignalingChannel, SignalingMessage};

/// Per-call parameters, fixed at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct CallConfig {
    pub room_id: String,
    pub self_id: PeerId,
    pub display_name: String,
    pub ice_servers: Vec<String>,
    pub start_muted: bool,
}

impl CallConfig {
    pub fn new(room_id: impl Into<String>, self_id: PeerId, display_name: impl Into<String>) -> Self {
        let defaults = Settings::default();
        Self {
            room_id: room_id.into(),
            self_id,
            display_name: display_name.into(),
            ice_servers: defaults.ice_servers,
            start_muted: defaults.start_muted,
        }
    }

    /// Falls back to the profile id when no display name is configured.
    pub fn from_settings(room_id: impl Into<String>, self_id: PeerId, settings: &Settings) -> Self {
        let display_name = settings
            .display_name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| self_id.to_string());
        Self {
            room_id: room_id.into(),
            self_id,
            display_name,
            ice_servers: settings.ice_servers.clone(),
            start_muted: settings.start_muted,
        }
    }
}

/// Host services the client drives.
#[derive(Clone)]
pub struct CallDeps {
    pub signaling: Arc<dyn SignalingChannel>,
    pub media: Arc<dyn MediaEngine>,
    pub capture: Arc<dyn AudioCapture>,
    pub roster: Arc<dyn RosterStore>,
}

struct Session {
    connections: ConnectionManager,
    moderation: ModerationController,
    loop_handle: Option<JoinHandle<()>>,
}

struct CallInner {
    local: LocalMedia,
    session: Option<Session>,
    generation: u64,
}

struct Shared {
    config: CallConfig,
    deps: CallDeps,
    emitter: EventEmitter,
    inner: Mutex<CallInner>,
}

struct Prepared {
    room: Room,
    track: LocalAudioTrack,
    seat_created: bool,
}

enum LoopInput {
    Channel(ChannelEvent),
    Transport(TransportEvent),
}

enum Step {
    Publish(Vec<SignalingMessage>),
    Kicked(PeerId),
}

pub struct CallClient {
    shared: Arc<Shared>,
}

impl CallClient {
    pub fn new(config: CallConfig, deps: CallDeps) -> Self {
        let local = LocalMedia::new(deps.capture.clone());
        Self {
            shared: Arc::new(Shared {
                config,
                deps,
                emitter: EventEmitter::new(),
                inner: Mutex::new(CallInner {
                    local,
                    session: None,
                    generation: 0,
                }),
            }),
        }
    }

    pub fn config(&self) -> &CallConfig {
        &self.shared.config
    }

    pub fn add_listener(&self, listener: Arc<dyn HuddleEventListener>) {
        self.shared.emitter.add_listener(listener);
    }

    /// Joins the voice call. A no-op while a call is starting or active.
    ///
    /// Any failure leaves the call inactive with `error` set, and is also
    /// returned.
    pub async fn start_call(&self) -> Result<(), HuddleError> {
        let generation = {
            let mut inner = self.shared.inner.lock().await;
            if !inner.local.begin_start() {
                tracing::debug!("start_call ignored: call is {:?}", inner.local.phase());
                return Ok(());
            }
            inner.generation += 1;
            inner.generation
        };
        self.shared.emitter.emit(HuddleEvent::CallStateChanged(CallPhase::Starting));
        tracing::info!("starting call in room {}", self.shared.config.room_id);

        let prepared = self.shared.prepare().await;

        let mut inner = self.shared.inner.lock().await;
        if inner.generation != generation {
            drop(inner);
            tracing::info!("call start cancelled");
            if let Ok(prepared) = prepared {
                prepared.track.stop();
                self.shared.release_seat(prepared.seat_created).await;
            }
            return Ok(());
        }
        let (result, seat_created) = match prepared {
            Ok(Prepared { room, track, seat_created }) => {
                (self.activate(&mut inner, generation, &room, track).await, seat_created)
            }
            Err(e) => (Err(e), false),
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::error!("call start failed: {e}");
                inner.local.fail_start(&e);
                drop(inner);
                self.shared.release_seat(seat_created).await;
                self.shared.emitter.emit(HuddleEvent::Error(e.to_string()));
                self.shared.emitter.emit(HuddleEvent::CallStateChanged(CallPhase::Idle));
                Err(e)
            }
        }
    }

    async fn activate(
        &self,
        inner: &mut CallInner,
        generation: u64,
        room: &Room,
        track: LocalAudioTrack,
    ) -> Result<(), HuddleError> {
        let shared = &self.shared;
        let config = &shared.config;
        if !inner.local.finish_start(track.clone()) {
            return Ok(());
        }

        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let connections = ConnectionManager::new(
            config.self_id.clone(),
            shared.deps.media.clone(),
            config.ice_servers.clone(),
            track,
            transport_tx,
            shared.emitter.clone(),
        );
        let moderation = ModerationController::new(config.self_id.clone(), room, shared.deps.roster.clone());

        let events = shared
            .deps
            .signaling
            .join(
                &config.room_id,
                &config.self_id,
                PresenceMeta {
                    display_name: config.display_name.clone(),
                },
            )
            .await?;

        let weak = Arc::downgrade(shared);
        let loop_handle = tokio::spawn(event_loop(weak, generation, events, transport_rx));
        inner.session = Some(Session {
            connections,
            moderation,
            loop_handle: Some(loop_handle),
        });
        tracing::info!(
            "call active in room {} (host {})",
            config.room_id,
            room.host_id
        );
        shared.emitter.emit(HuddleEvent::CallStateChanged(CallPhase::Active));

        if config.start_muted {
            if let Some(muted) = inner.local.toggle_mute() {
                shared.publish_mute_state(muted).await;
            }
        }
        Ok(())
    }

    /// Leaves the call: closes every connection, stops the microphone and
    /// leaves the channel. Idempotent; cancels a pending start.
    pub async fn end_call(&self) {
        let mut inner = self.shared.inner.lock().await;
        let was_idle = inner.local.phase() == CallPhase::Idle;
        let session = teardown(&mut inner, CloseReason::CallEnded);
        drop(inner);

        if let Some(mut session) = session {
            if let Some(handle) = session.loop_handle.take() {
                handle.abort();
            }
            self.shared.leave_channel().await;
        }
        if !was_idle {
            self.shared.emitter.emit(HuddleEvent::CallStateChanged(CallPhase::Idle));
        }
    }

    /// Flips the self-mute and broadcasts it. While host-muted the toggle is
    /// ignored and the unchanged state is returned.
    pub async fn toggle_mute(&self) -> Result<bool, HuddleError> {
        let mut inner = self.shared.inner.lock().await;
        if inner.local.phase() != CallPhase::Active {
            return Err(HuddleError::NotInCall);
        }
        match inner.local.toggle_mute() {
            Some(muted) => {
                self.shared.publish_mute_state(muted).await;
                Ok(muted)
            }
            None => {
                tracing::debug!("toggle ignored: muted by host");
                Ok(inner.local.mute_state().is_muted())
            }
        }
    }

    pub async fn host_mute(&self, target: &PeerId) -> Result<(), HuddleError> {
        self.moderate(HostCommand::Mute(target.clone())).await
    }

    pub async fn host_unmute(&self, target: &PeerId) -> Result<(), HuddleError> {
        self.moderate(HostCommand::Unmute(target.clone())).await
    }

    pub async fn host_kick(&self, target: &PeerId) -> Result<(), HuddleError> {
        self.moderate(HostCommand::Kick(target.clone())).await
    }

    async fn moderate(&self, command: HostCommand) -> Result<(), HuddleError> {
        let mut inner = self.shared.inner.lock().await;
        let session = inner.session.as_mut().ok_or(HuddleError::NotInCall)?;
        let message = session.moderation.issue(&command)?;
        tracing::info!("host command {command:?}");
        self.shared.publish(message).await;

        match &command {
            HostCommand::Mute(target) => session.connections.set_peer_host_muted(target, true),
            HostCommand::Unmute(target) => session.connections.set_peer_host_muted(target, false),
            HostCommand::Kick(target) => {
                session.connections.remove(target, CloseReason::Kicked);
            }
        }
        let moderation = session.moderation.clone();
        drop(inner);

        moderation.persist(&command).await;
        Ok(())
    }

    pub async fn snapshot(&self) -> CallSnapshot {
        let inner = self.shared.inner.lock().await;
        let state = inner.local.state();
        CallSnapshot {
            is_call_active: state.is_call_active,
            is_muted: state.is_muted,
            peers: inner
                .session
                .as_ref()
                .map(|s| s.connections.peers())
                .unwrap_or_default(),
            error: state.error,
        }
    }

    pub async fn state(&self) -> LocalCallState {
        self.shared.inner.lock().await.local.state()
    }

    pub async fn phase(&self) -> CallPhase {
        self.shared.inner.lock().await.local.phase()
    }

    /// Whether the local participant hosts the room. False outside a call.
    pub async fn is_host(&self) -> bool {
        let inner = self.shared.inner.lock().await;
        inner.session.as_ref().is_some_and(|s| s.moderation.is_host())
    }

    pub async fn connection_count(&self) -> usize {
        let inner = self.shared.inner.lock().await;
        inner.session.as_ref().map_or(0, |s| s.connections.len())
    }

    /// Whether the outgoing microphone track is still capturing.
    pub async fn has_live_track(&self) -> bool {
        let inner = self.shared.inner.lock().await;
        inner.local.track().is_some_and(LocalAudioTrack::is_live)
    }

    /// Pulls buffered remote audio of one peer for playout.
    pub async fn pull_peer_audio(&self, peer_id: &PeerId, out: &mut [i16]) -> usize {
        let inner = self.shared.inner.lock().await;
        inner
            .session
            .as_ref()
            .and_then(|s| s.connections.session(peer_id))
            .map_or(0, |p| p.sink().pull_samples(out))
    }
}

impl Drop for CallClient {
    fn drop(&mut self) {
        let Ok(mut inner) = self.shared.inner.try_lock() else {
            tracing::warn!("call client dropped while busy; skipping teardown");
            return;
        };
        let Some(mut session) = teardown(&mut inner, CloseReason::CallEnded) else {
            return;
        };
        if let Some(handle) = session.loop_handle.take() {
            handle.abort();
        }
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            let signaling = self.shared.deps.signaling.clone();
            rt.spawn(async move {
                if let Err(e) = signaling.leave().await {
                    tracing::debug!("leave on drop failed: {e}");
                }
            });
        }
    }
}

/// Stops everything the current call holds and supersedes its loop.
fn teardown(inner: &mut CallInner, reason: CloseReason) -> Option<Session> {
    inner.generation += 1;
    inner.local.reset();
    let mut session = inner.session.take()?;
    let closed = session.connections.close_all(reason);
    tracing::info!("call ended ({reason:?}), closed {closed} connections");
    Some(session)
}

impl Shared {
    /// Looks the room up, takes a roster seat and opens the microphone. A
    /// seat taken here is released again if the microphone is refused.
    async fn prepare(&self) -> Result<Prepared, HuddleError> {
        let config = &self.config;
        let room = self.deps.roster.room(&config.room_id).await?;
        if room.mode != RoomMode::Call {
            return Err(HuddleError::Room(format!("room {} is not a call room", room.id)));
        }
        if room.is_expired(Utc::now()) {
            return Err(HuddleError::RoomExpired);
        }

        let admission = self.deps.roster.join(&config.room_id, &config.self_id).await?;
        tracing::debug!(
            "roster joined as {:?} (new seat: {})",
            admission.participant.role,
            admission.created
        );

        let capture = self.inner.lock().await.local.capture();
        match capture.acquire().await {
            Ok(track) => Ok(Prepared {
                room,
                track,
                seat_created: admission.created,
            }),
            Err(e) => {
                self.release_seat(admission.created).await;
                Err(e)
            }
        }
    }

    /// Undoes the roster join of a start that did not complete. A seat that
    /// existed before the start is kept.
    async fn release_seat(&self, seat_created: bool) {
        if !seat_created {
            return;
        }
        let config = &self.config;
        match self.deps.roster.remove_participant(&config.room_id, &config.self_id).await {
            Ok(()) => tracing::debug!("released roster seat in {}", config.room_id),
            Err(e) => tracing::warn!("failed to release roster seat in {}: {e}", config.room_id),
        }
    }

    /// Delivery failures are logged and otherwise ignored.
    async fn publish(&self, message: SignalingMessage) {
        let kind = message.payload.kind();
        if let Err(e) = self.deps.signaling.publish(message).await {
            tracing::warn!("failed to publish {kind}: {e}");
        }
    }

    async fn publish_mute_state(&self, muted: bool) {
        self.publish(SignalingMessage::broadcast(
            self.config.self_id.clone(),
            SignalPayload::PeerMuteState { muted, by_host: false },
        ))
        .await;
        self.emitter.emit(HuddleEvent::LocalMuteChanged { muted, by_host: false });
    }

    async fn leave_channel(&self) {
        if let Err(e) = self.deps.signaling.leave().await {
            tracing::warn!("failed to leave channel: {e}");
        }
    }

    /// Applies one loop input. Returns false when the loop must stop.
    async fn handle(&self, generation: u64, input: LoopInput) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation || inner.session.is_none() {
            return false;
        }

        let step = match input {
            LoopInput::Channel(event) => self.dispatch(&mut inner, event).await,
            LoopInput::Transport(event) => {
                let Some(session) = inner.session.as_mut() else {
                    return false;
                };
                Step::Publish(session.connections.on_transport_event(event).into_iter().collect())
            }
        };

        match step {
            Step::Publish(messages) => {
                for message in messages {
                    self.publish(message).await;
                }
                true
            }
            Step::Kicked(by) => {
                tracing::info!("kicked from room {} by {by}", self.config.room_id);
                teardown(&mut inner, CloseReason::Kicked);
                drop(inner);
                self.leave_channel().await;
                self.emitter.emit(HuddleEvent::CallStateChanged(CallPhase::Idle));
                self.emitter.emit(HuddleEvent::Kicked { by });
                false
            }
        }
    }

    async fn dispatch(&self, inner: &mut CallInner, event: ChannelEvent) -> Step {
        let self_id = &self.config.self_id;
        let CallInner { local, session, .. } = inner;
        let Some(session) = session.as_mut() else {
            return Step::Publish(Vec::new());
        };
        let connections = &mut session.connections;
        let mut outgoing = Vec::new();

        let message = match event {
            ChannelEvent::Message(message) => message,
            presence => {
                match discover(self_id, &presence) {
                    Discovery::Connect { peer_id, display_name, .. } => {
                        let is_new = !connections.contains(&peer_id);
                        outgoing.extend(connections.on_presence_join(peer_id.clone(), display_name).await);
                        let mute = local.mute_state();
                        if is_new && connections.contains(&peer_id) && mute.is_muted() {
                            outgoing.push(SignalingMessage::addressed(
                                self_id.clone(),
                                peer_id,
                                SignalPayload::PeerMuteState {
                                    muted: true,
                                    by_host: mute.is_host_locked(),
                                },
                            ));
                        }
                    }
                    Discovery::Teardown { peer_id } => {
                        connections.remove(&peer_id, CloseReason::Left);
                    }
                    Discovery::Ignore => {}
                }
                return Step::Publish(outgoing);
            }
        };

        if &message.from == self_id || !message.is_for(self_id) {
            return Step::Publish(outgoing);
        }
        let from = message.from;
        match message.payload {
            SignalPayload::Offer { sdp } => outgoing.extend(connections.on_offer(from, sdp).await),
            SignalPayload::Answer { sdp } => connections.on_answer(from, sdp).await,
            SignalPayload::IceCandidate { candidate } => connections.on_candidate(from, candidate).await,
            SignalPayload::PeerMuteState { muted: true, by_host: true } => {
                connections.set_peer_host_muted(&from, true)
            }
            SignalPayload::PeerMuteState { muted, .. } => connections.set_peer_muted(&from, muted),
            payload => {
                let Some(command) = HostCommand::from_payload(&payload) else {
                    return Step::Publish(outgoing);
                };
                match session.moderation.inbound(&from, &command) {
                    ModerationAction::MuteSelf => {
                        local.apply_host_mute();
                        tracing::info!("muted by host");
                        self.emitter.emit(HuddleEvent::LocalMuteChanged { muted: true, by_host: true });
                    }
                    ModerationAction::UnmuteSelf => {
                        local.apply_host_unmute();
                        tracing::info!("unmuted by host");
                        self.emitter.emit(HuddleEvent::LocalMuteChanged { muted: false, by_host: true });
                    }
                    ModerationAction::KickSelf => return Step::Kicked(from),
                    ModerationAction::MirrorHostMute { peer_id, muted } => {
                        session.connections.set_peer_host_muted(&peer_id, muted);
                    }
                    ModerationAction::RemovePeer(peer_id) => {
                        session.connections.remove(&peer_id, CloseReason::Kicked);
                    }
                    ModerationAction::Rejected => {}
                }
            }
        }
        Step::Publish(outgoing)
    }
}

async fn event_loop(
    shared: Weak<Shared>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    mut transport: mpsc::UnboundedReceiver<TransportEvent>,
) {
    loop {
        let input = tokio::select! {
            Some(event) = events.recv() => LoopInput::Channel(event),
            Some(event) = transport.recv() => LoopInput::Transport(event),
            else => break,
        };
        let Some(shared) = shared.upgrade() else {
            break;
        };
        if !shared.handle(generation, input).await {
            break;
        }
    }
    tracing::debug!("event loop {generation} stopped");
}
