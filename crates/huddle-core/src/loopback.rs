//! In-process signaling hub.
//!
//! Implements [`SignalingChannel`] for clients living in the same process,
//! such as local demos and tests. Presence is synced on join, broadcasts
//! reach every other member of the room, and an optional duplicate mode
//! delivers every broadcast twice.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::HuddleError;
use crate::signaling::{ChannelEvent, PeerId, PresenceMeta, SignalingChannel, SignalingMessage};

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

struct Member {
    peer_id: PeerId,
    meta: PresenceMeta,
    token: u64,
    tx: mpsc::UnboundedSender<ChannelEvent>,
}

#[derive(Default)]
struct HubState {
    rooms: HashMap<String, Vec<Member>>,
    duplicate_deliveries: bool,
}

impl HubState {
    /// Drops the members matching `gone` and announces `peer_id` leaving to
    /// the rest. A room left empty is forgotten.
    fn remove_member(&mut self, room_id: &str, peer_id: &PeerId, gone: impl Fn(&Member) -> bool) -> bool {
        let Some(members) = self.rooms.get_mut(room_id) else {
            return false;
        };
        let before = members.len();
        members.retain(|m| !gone(m));
        let removed = members.len() != before;
        if removed {
            broadcast_presence_leave(members, peer_id);
        }
        if members.is_empty() {
            self.rooms.remove(room_id);
        }
        removed
    }
}

#[derive(Clone, Default)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every broadcast is delivered twice.
    pub fn with_duplicates() -> Self {
        let hub = Self::new();
        hub.lock().duplicate_deliveries = true;
        hub
    }

    pub fn channel(&self) -> LoopbackChannel {
        LoopbackChannel {
            hub: self.clone(),
            joined: Mutex::new(None),
        }
    }

    pub fn members(&self, room_id: &str) -> Vec<PeerId> {
        self.lock()
            .rooms
            .get(room_id)
            .map(|members| members.iter().map(|m| m.peer_id.clone()).collect())
            .unwrap_or_default()
    }

    /// Drops a member as if its network went away: the others see it
    /// leave and its subscription ends.
    pub fn disconnect(&self, room_id: &str, peer_id: &PeerId) {
        if self.lock().remove_member(room_id, peer_id, |m| &m.peer_id == peer_id) {
            tracing::debug!("loopback: {peer_id} disconnected from {room_id}");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn broadcast_presence_leave(members: &[Member], peer_id: &PeerId) {
    for member in members {
        let _ = member.tx.send(ChannelEvent::PresenceLeave {
            peer_id: peer_id.clone(),
        });
    }
}

struct Joined {
    room_id: String,
    peer_id: PeerId,
    token: u64,
}

/// One client's handle on a [`LoopbackHub`].
pub struct LoopbackChannel {
    hub: LoopbackHub,
    joined: Mutex<Option<Joined>>,
}

impl LoopbackChannel {
    fn joined(&self) -> std::sync::MutexGuard<'_, Option<Joined>> {
        self.joined.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn leave_now(&self) {
        let Some(joined) = self.joined().take() else {
            return;
        };
        self.hub
            .lock()
            .remove_member(&joined.room_id, &joined.peer_id, |m| m.token == joined.token);
    }
}

#[async_trait]
impl SignalingChannel for LoopbackChannel {
    async fn join(
        &self,
        room_id: &str,
        self_id: &PeerId,
        meta: PresenceMeta,
    ) -> Result<mpsc::UnboundedReceiver<ChannelEvent>, HuddleError> {
        self.leave_now();

        let (tx, rx) = mpsc::unbounded_channel();
        let token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.hub.lock();
            let members = state.rooms.entry(room_id.to_string()).or_default();
            members.retain(|m| &m.peer_id != self_id);

            for member in members.iter() {
                let _ = tx.send(ChannelEvent::PresenceJoin {
                    peer_id: member.peer_id.clone(),
                    display_name: member.meta.display_name.clone(),
                });
                let _ = member.tx.send(ChannelEvent::PresenceJoin {
                    peer_id: self_id.clone(),
                    display_name: meta.display_name.clone(),
                });
            }
            members.push(Member {
                peer_id: self_id.clone(),
                meta,
                token,
                tx,
            });
        }

        *self.joined() = Some(Joined {
            room_id: room_id.to_string(),
            peer_id: self_id.clone(),
            token,
        });
        tracing::debug!("loopback: {self_id} joined {room_id}");
        Ok(rx)
    }

    async fn publish(&self, message: SignalingMessage) -> Result<(), HuddleError> {
        let (room_id, token) = match self.joined().as_ref() {
            Some(joined) => (joined.room_id.clone(), joined.token),
            None => return Err(HuddleError::Signaling("publish before join".into())),
        };

        let state = self.hub.lock();
        let copies = if state.duplicate_deliveries { 2 } else { 1 };
        if let Some(members) = state.rooms.get(&room_id) {
            for member in members.iter().filter(|m| m.token != token) {
                for _ in 0..copies {
                    let _ = member.tx.send(ChannelEvent::Message(message.clone()));
                }
            }
        }
        Ok(())
    }

    async fn leave(&self) -> Result<(), HuddleError> {
        self.leave_now();
        Ok(())
    }
}

impl Drop for LoopbackChannel {
    fn drop(&mut self) {
        self.leave_now();
    }
}
