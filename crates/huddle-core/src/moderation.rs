//! Host moderation: mute, unmute and kick across the mesh.
//!
//! Commands are broadcast on the room channel. Enforcement happens only on
//! the targeted peer's own client; every other client just mirrors the
//! result for display. Inbound commands are accepted only from the host id
//! recorded in the roster store, never from a sender's own claim.

use std::sync::Arc;

use crate::errors::HuddleError;
use crate::roster::{Room, RosterStore};
use crate::signaling::{PeerId, SignalPayload, SignalingMessage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCommand {
    Mute(PeerId),
    Unmute(PeerId),
    Kick(PeerId),
}

impl HostCommand {
    pub fn target(&self) -> &PeerId {
        match self {
            Self::Mute(target) | Self::Unmute(target) | Self::Kick(target) => target,
        }
    }

    pub fn to_payload(&self) -> SignalPayload {
        match self {
            Self::Mute(target) => SignalPayload::HostMute { target_id: target.clone(), muted: true },
            Self::Unmute(target) => SignalPayload::HostUnmute { target_id: target.clone(), muted: false },
            Self::Kick(target) => SignalPayload::HostKick { target_id: target.clone() },
        }
    }

    pub fn from_payload(payload: &SignalPayload) -> Option<Self> {
        match payload {
            SignalPayload::HostMute { target_id, .. } => Some(Self::Mute(target_id.clone())),
            SignalPayload::HostUnmute { target_id, .. } => Some(Self::Unmute(target_id.clone())),
            SignalPayload::HostKick { target_id } => Some(Self::Kick(target_id.clone())),
            _ => None,
        }
    }
}

/// What the local client must do with an inbound host command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModerationAction {
    MuteSelf,
    UnmuteSelf,
    /// End the local call.
    KickSelf,
    MirrorHostMute { peer_id: PeerId, muted: bool },
    RemovePeer(PeerId),
    /// Sender is not the recorded host.
    Rejected,
}

#[derive(Clone)]
pub struct ModerationController {
    local_id: PeerId,
    room_id: String,
    host_id: PeerId,
    roster: Arc<dyn RosterStore>,
}

impl ModerationController {
    pub fn new(local_id: PeerId, room: &Room, roster: Arc<dyn RosterStore>) -> Self {
        Self {
            local_id,
            room_id: room.id.clone(),
            host_id: room.host_id.clone(),
            roster,
        }
    }

    pub fn host_id(&self) -> &PeerId {
        &self.host_id
    }

    pub fn is_host(&self) -> bool {
        self.local_id == self.host_id
    }

    /// Builds the broadcast for a command issued by the local client.
    pub fn issue(&self, command: &HostCommand) -> Result<SignalingMessage, HuddleError> {
        if !self.is_host() {
            return Err(HuddleError::NotHost);
        }
        if command.target() == &self.local_id {
            return Err(HuddleError::Room("the host cannot moderate themselves".into()));
        }
        Ok(SignalingMessage::broadcast(self.local_id.clone(), command.to_payload()))
    }

    /// Mirrors an issued command into the roster store. Failures are
    /// logged only: the live broadcast has already taken effect.
    pub async fn persist(&self, command: &HostCommand) {
        let result = match command {
            HostCommand::Mute(target) => self.roster.set_muted_by_host(&self.room_id, target, true).await,
            HostCommand::Unmute(target) => self.roster.set_muted_by_host(&self.room_id, target, false).await,
            HostCommand::Kick(target) => self.roster.remove_participant(&self.room_id, target).await,
        };
        if let Err(e) = result {
            tracing::warn!("roster update for {command:?} failed: {e}");
        }
    }

    pub fn inbound(&self, from: &PeerId, command: &HostCommand) -> ModerationAction {
        if from != &self.host_id {
            tracing::warn!("ignoring {command:?} from {from}: not the room host");
            return ModerationAction::Rejected;
        }
        let for_me = command.target() == &self.local_id;
        match command {
            HostCommand::Mute(_) if for_me => ModerationAction::MuteSelf,
            HostCommand::Unmute(_) if for_me => ModerationAction::UnmuteSelf,
            HostCommand::Kick(_) if for_me => ModerationAction::KickSelf,
            HostCommand::Mute(target) => ModerationAction::MirrorHostMute {
                peer_id: target.clone(),
                muted: true,
            },
            HostCommand::Unmute(target) => ModerationAction::MirrorHostMute {
                peer_id: target.clone(),
                muted: false,
            },
            HostCommand::Kick(target) => ModerationAction::RemovePeer(target.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roster::{MemoryRoster, RoomMode};
    use chrono::Duration;

    async fn setup(local: &str) -> (ModerationController, Arc<MemoryRoster>, Room) {
        let roster = Arc::new(MemoryRoster::new());
        let room = roster
            .create_room(PeerId::from("host"), RoomMode::Call, Duration::hours(1))
            .await;
        for id in ["host", "v1", "v2"] {
            roster.join(&room.id, &PeerId::from(id)).await.unwrap();
        }
        let ctl = ModerationController::new(PeerId::from(local), &room, roster.clone());
        (ctl, roster, room)
    }

    #[tokio::test]
    async fn viewer_cannot_issue() {
        let (ctl, _, _) = setup("v1").await;
        assert!(!ctl.is_host());
        assert!(matches!(
            ctl.issue(&HostCommand::Mute(PeerId::from("v2"))),
            Err(HuddleError::NotHost)
        ));
    }

    #[tokio::test]
    async fn host_issues_broadcast() {
        let (ctl, _, _) = setup("host").await;
        let msg = ctl.issue(&HostCommand::Kick(PeerId::from("v2"))).unwrap();
        assert_eq!(msg.from, PeerId::from("host"));
        assert_eq!(msg.to, None);
        assert_eq!(msg.payload, SignalPayload::HostKick { target_id: PeerId::from("v2") });
        assert!(ctl.issue(&HostCommand::Mute(PeerId::from("host"))).is_err());
    }

    #[tokio::test]
    async fn persist_writes_roster() {
        let (ctl, roster, room) = setup("host").await;
        ctl.persist(&HostCommand::Mute(PeerId::from("v1"))).await;
        let v1 = roster
            .participants(&room.id)
            .await
            .unwrap()
            .into_iter()
            .find(|p| p.profile_id == PeerId::from("v1"))
            .unwrap();
        assert!(v1.muted_by_host);

        ctl.persist(&HostCommand::Kick(PeerId::from("v2"))).await;
        assert_eq!(roster.participants(&room.id).await.unwrap().len(), 2);

        // Unknown participant: logged, not surfaced.
        ctl.persist(&HostCommand::Unmute(PeerId::from("ghost"))).await;
    }

    #[tokio::test]
    async fn inbound_from_host_targets() {
        let (ctl, _, _) = setup("v1").await;
        let host = PeerId::from("host");
        assert_eq!(
            ctl.inbound(&host, &HostCommand::Mute(PeerId::from("v1"))),
            ModerationAction::MuteSelf
        );
        assert_eq!(
            ctl.inbound(&host, &HostCommand::Unmute(PeerId::from("v1"))),
            ModerationAction::UnmuteSelf
        );
        assert_eq!(
            ctl.inbound(&host, &HostCommand::Kick(PeerId::from("v1"))),
            ModerationAction::KickSelf
        );
        assert_eq!(
            ctl.inbound(&host, &HostCommand::Mute(PeerId::from("v2"))),
            ModerationAction::MirrorHostMute { peer_id: PeerId::from("v2"), muted: true }
        );
        assert_eq!(
            ctl.inbound(&host, &HostCommand::Kick(PeerId::from("v2"))),
            ModerationAction::RemovePeer(PeerId::from("v2"))
        );
    }

    #[tokio::test]
    async fn forged_commands_are_rejected() {
        let (ctl, _, _) = setup("v1").await;
        assert_eq!(
            ctl.inbound(&PeerId::from("v2"), &HostCommand::Kick(PeerId::from("v1"))),
            ModerationAction::Rejected
        );
    }

    #[test]
    fn payload_round_trip() {
        let cmd = HostCommand::Unmute(PeerId::from("x"));
        assert_eq!(HostCommand::from_payload(&cmd.to_payload()), Some(cmd));
        assert_eq!(
            HostCommand::from_payload(&SignalPayload::PeerMuteState { muted: true, by_host: false }),
            None
        );
    }
}
