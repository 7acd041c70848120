//! Room roster store boundary.
//!
//! The roster is owned by the hosted backend. The core reads the host id
//! and participant cap from it and issues moderation writes; it assumes no
//! synchronous consistency between the store and live broadcast state.

use std::collections::HashMap;
use std::sync::OnceLock;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::errors::HuddleError;
use crate::signaling::PeerId;

pub const MAX_PARTICIPANTS: usize = 5;
pub const JOIN_CODE_LEN: usize = 6;

/// Ambiguous glyphs (I, O, 0, 1) are left out.
const JOIN_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomMode {
    Chat,
    Call,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Host,
    Viewer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: String,
    pub join_code: String,
    pub mode: RoomMode,
    pub host_id: PeerId,
    pub max_participants: usize,
    pub expires_at: DateTime<Utc>,
}

impl Room {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub profile_id: PeerId,
    pub role: ParticipantRole,
    pub joined_at: DateTime<Utc>,
    pub muted_by_host: bool,
}

/// Result of a roster join. `created` is false for an idempotent rejoin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub participant: Participant,
    pub created: bool,
}

#[async_trait]
pub trait RosterStore: Send + Sync {
    async fn room(&self, room_id: &str) -> Result<Room, HuddleError>;

    async fn participants(&self, room_id: &str) -> Result<Vec<Participant>, HuddleError>;

    /// Adds `profile_id` to the room. Rejoining returns the existing row;
    /// a full room fails with [`HuddleError::RoomFull`].
    async fn join(&self, room_id: &str, profile_id: &PeerId) -> Result<Admission, HuddleError>;

    async fn set_muted_by_host(
        &self,
        room_id: &str,
        profile_id: &PeerId,
        muted: bool,
    ) -> Result<(), HuddleError>;

    async fn remove_participant(&self, room_id: &str, profile_id: &PeerId) -> Result<(), HuddleError>;
}

pub fn generate_join_code() -> String {
    let mut rng = rand::thread_rng();
    (0..JOIN_CODE_LEN)
        .map(|_| char::from(JOIN_CODE_ALPHABET[rng.gen_range(0..JOIN_CODE_ALPHABET.len())]))
        .collect()
}

/// Validates and normalises user input (trimmed, upper-cased).
pub fn parse_join_code(input: &str) -> Result<String, HuddleError> {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = RE.get_or_init(|| regex::Regex::new(r"^[A-HJ-NP-Z2-9]{6}$").expect("static pattern"));
    let candidate = input.trim().to_ascii_uppercase();
    if re.is_match(&candidate) {
        Ok(candidate)
    } else {
        Err(HuddleError::Room(format!("invalid join code: '{}'", input.trim())))
    }
}

struct RoomEntry {
    room: Room,
    participants: Vec<Participant>,
}

/// In-process roster with the same rules as the hosted store.
#[derive(Default)]
pub struct MemoryRoster {
    rooms: Mutex<HashMap<String, RoomEntry>>,
}

impl MemoryRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a room; the host is not joined automatically.
    pub async fn create_room(&self, host_id: PeerId, mode: RoomMode, ttl: Duration) -> Room {
        let room = Room {
            id: Uuid::new_v4().to_string(),
            join_code: generate_join_code(),
            mode,
            host_id,
            max_participants: MAX_PARTICIPANTS,
            expires_at: Utc::now() + ttl,
        };
        self.rooms.lock().await.insert(
            room.id.clone(),
            RoomEntry {
                room: room.clone(),
                participants: Vec::new(),
            },
        );
        tracing::info!("room {} created (code {})", room.id, room.join_code);
        room
    }

    pub async fn find_by_code(&self, code: &str) -> Result<Room, HuddleError> {
        let code = parse_join_code(code)?;
        self.rooms
            .lock()
            .await
            .values()
            .find(|e| e.room.join_code == code)
            .map(|e| e.room.clone())
            .ok_or_else(|| HuddleError::Room(format!("no room with code {code}")))
    }
}

fn not_found(room_id: &str) -> HuddleError {
    HuddleError::Room(format!("room {room_id} not found"))
}

#[async_trait]
impl RosterStore for MemoryRoster {
    async fn room(&self, room_id: &str) -> Result<Room, HuddleError> {
        self.rooms
            .lock()
            .await
            .get(room_id)
            .map(|e| e.room.clone())
            .ok_or_else(|| not_found(room_id))
    }

    async fn participants(&self, room_id: &str) -> Result<Vec<Participant>, HuddleError> {
        self.rooms
            .lock()
            .await
            .get(room_id)
            .map(|e| e.participants.clone())
            .ok_or_else(|| not_found(room_id))
    }

    async fn join(&self, room_id: &str, profile_id: &PeerId) -> Result<Admission, HuddleError> {
        let mut rooms = self.rooms.lock().await;
        let entry = rooms.get_mut(room_id).ok_or_else(|| not_found(room_id))?;

        if entry.room.is_expired(Utc::now()) {
            return Err(HuddleError::RoomExpired);
        }
        if let Some(existing) = entry.participants.iter().find(|p| &p.profile_id == profile_id) {
            return Ok(Admission {
                participant: existing.clone(),
                created: false,
            });
        }
        if entry.participants.len() >= entry.room.max_participants {
            tracing::warn!("room {room_id} full, rejecting {profile_id}");
            return Err(HuddleError::RoomFull(entry.room.max_participants));
        }

        let role = if &entry.room.host_id == profile_id {
            ParticipantRole::Host
        } else {
            ParticipantRole::Viewer
        };
        let participant = Participant {
            profile_id: profile_id.clone(),
            role,
            joined_at: Utc::now(),
            muted_by_host: false,
        };
        entry.participants.push(participant.clone());
        Ok(Admission {
            participant,
            created: true,
        })
    }

    async fn set_muted_by_host(
        &self,
        room_id: &str,
        profile_id: &PeerId,
        muted: bool,
    ) -> Result<(), HuddleError> {
        let mut rooms = self.rooms.lock().await;
        let entry = rooms.get_mut(room_id).ok_or_else(|| not_found(room_id))?;
        let participant = entry
            .participants
            .iter_mut()
            .find(|p| &p.profile_id == profile_id)
            .ok_or_else(|| HuddleError::Roster(format!("{profile_id} is not in room {room_id}")))?;
        participant.muted_by_host = muted;
        Ok(())
    }

    async fn remove_participant(&self, room_id: &str, profile_id: &PeerId) -> Result<(), HuddleError> {
        let mut rooms = self.rooms.lock().await;
        let entry = rooms.get_mut(room_id).ok_or_else(|| not_found(room_id))?;
        entry.participants.retain(|p| &p.profile_id != profile_id);
        Ok(())
    }
}
