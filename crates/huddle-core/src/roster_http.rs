use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use crate::errors::HuddleError;
use crate::roster::{Admission, Participant, ParticipantRole, Room, RosterStore};
use crate::signaling::PeerId;

const ROOMS_TABLE: &str = "watch_rooms";
const PARTICIPANTS_TABLE: &str = "room_participants";

/// Row shape of the participants table.
#[derive(Debug, Serialize, Deserialize)]
struct ParticipantRow {
    room_id: String,
    profile_id: PeerId,
    role: ParticipantRole,
    #[serde(default = "Utc::now")]
    joined_at: DateTime<Utc>,
    #[serde(default)]
    muted_by_host: bool,
}

impl From<ParticipantRow> for Participant {
    fn from(row: ParticipantRow) -> Self {
        Self {
            profile_id: row.profile_id,
            role: row.role,
            joined_at: row.joined_at,
            muted_by_host: row.muted_by_host,
        }
    }
}

/// Roster store backed by the hosted backend's REST interface
/// (PostgREST-style filters, `apikey` plus bearer token).
pub struct RestRosterStore {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    access_token: Option<String>,
}

impl RestRosterStore {
    /// `base_url` is the project URL, e.g. `https://xyz.example.co`.
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            access_token: None,
        }
    }

    /// Use a signed-in user's token instead of the anonymous key.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    fn table_url(&self, table: &str, filters: &[(&str, &str)]) -> String {
        let mut url = format!("{}/rest/v1/{table}", self.base_url);
        let mut sep = '?';
        for (column, value) in filters {
            url.push(sep);
            url.push_str(&format!("{column}=eq.{}", urlencoding::encode(value)));
            sep = '&';
        }
        url
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let token = self.access_token.as_deref().unwrap_or(&self.api_key);
        self.client
            .request(method, url)
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {token}"))
    }

    async fn send<T: DeserializeOwned>(&self, builder: reqwest::RequestBuilder) -> Result<T, HuddleError> {
        let resp = builder.send().await.map_err(|e| HuddleError::Http(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(HuddleError::Roster(format!("roster store returned {status}: {body}")));
        }
        resp.json()
            .await
            .map_err(|e| HuddleError::Roster(format!("invalid roster response: {e}")))
    }

    async fn send_empty(&self, builder: reqwest::RequestBuilder) -> Result<(), HuddleError> {
        let resp = builder.send().await.map_err(|e| HuddleError::Http(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(HuddleError::Roster(format!("roster store returned {status}: {body}")));
        }
        Ok(())
    }
}

#[async_trait]
impl RosterStore for RestRosterStore {
    async fn room(&self, room_id: &str) -> Result<Room, HuddleError> {
        let url = self.table_url(ROOMS_TABLE, &[("id", room_id)]);
        let rooms: Vec<Room> = self.send(self.request(reqwest::Method::GET, &url)).await?;
        rooms
            .into_iter()
            .next()
            .ok_or_else(|| HuddleError::Room(format!("room {room_id} not found")))
    }

    async fn participants(&self, room_id: &str) -> Result<Vec<Participant>, HuddleError> {
        let url = self.table_url(PARTICIPANTS_TABLE, &[("room_id", room_id)]);
        let rows: Vec<ParticipantRow> = self.send(self.request(reqwest::Method::GET, &url)).await?;
        Ok(rows.into_iter().map(Participant::from).collect())
    }

    async fn join(&self, room_id: &str, profile_id: &PeerId) -> Result<Admission, HuddleError> {
        let room = self.room(room_id).await?;
        if room.is_expired(Utc::now()) {
            return Err(HuddleError::RoomExpired);
        }
        let current = self.participants(room_id).await?;
        if let Some(existing) = current.iter().find(|p| &p.profile_id == profile_id) {
            return Ok(Admission {
                participant: existing.clone(),
                created: false,
            });
        }
        // The count check races with other joiners; the store's own
        // constraints have the final word.
        if current.len() >= room.max_participants {
            return Err(HuddleError::RoomFull(room.max_participants));
        }

        let row = ParticipantRow {
            room_id: room_id.to_string(),
            profile_id: profile_id.clone(),
            role: if &room.host_id == profile_id {
                ParticipantRole::Host
            } else {
                ParticipantRole::Viewer
            },
            joined_at: Utc::now(),
            muted_by_host: false,
        };
        let url = self.table_url(PARTICIPANTS_TABLE, &[]);
        let inserted: Vec<ParticipantRow> = self
            .send(
                self.request(reqwest::Method::POST, &url)
                    .header("Prefer", "return=representation")
                    .json(&row),
            )
            .await?;
        tracing::info!("joined room {room_id} as {profile_id}");
        inserted
            .into_iter()
            .next()
            .map(|row| Admission {
                participant: Participant::from(row),
                created: true,
            })
            .ok_or_else(|| HuddleError::Roster("insert returned no row".into()))
    }

    async fn set_muted_by_host(
        &self,
        room_id: &str,
        profile_id: &PeerId,
        muted: bool,
    ) -> Result<(), HuddleError> {
        let url = self.table_url(
            PARTICIPANTS_TABLE,
            &[("room_id", room_id), ("profile_id", profile_id.as_str())],
        );
        self.send_empty(
            self.request(reqwest::Method::PATCH, &url)
                .json(&serde_json::json!({ "muted_by_host": muted })),
        )
        .await
    }

    async fn remove_participant(&self, room_id: &str, profile_id: &PeerId) -> Result<(), HuddleError> {
        let url = self.table_url(
            PARTICIPANTS_TABLE,
            &[("room_id", room_id), ("profile_id", profile_id.as_str())],
        );
        self.send_empty(self.request(reqwest::Method::DELETE, &url)).await
    }
}
