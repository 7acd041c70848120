//! Signaling envelope and the publish/subscribe channel contract.
//!
//! The channel is provided by an external real-time transport. Delivery is
//! at-least-once and ordered per sender only, so every consumer in this
//! crate treats duplicates and reordering across senders as normal.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::errors::HuddleError;

/// Profile id of a room participant. Ordered byte-wise, which is the total
/// order used for initiator election.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A network path descriptor trickled between two peers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

/// Type-specific part of a signaling message.
///
/// Serialized as `"type"` plus `"payload"` next to the envelope's
/// `from`/`to` fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum SignalPayload {
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate { candidate: IceCandidate },
    #[serde(rename_all = "camelCase")]
    HostMute { target_id: PeerId, muted: bool },
    #[serde(rename_all = "camelCase")]
    HostUnmute { target_id: PeerId, muted: bool },
    #[serde(rename_all = "camelCase")]
    HostKick { target_id: PeerId },
    /// `by_host` is only set in the catch-up a host-muted peer sends to
    /// newly discovered peers.
    #[serde(rename_all = "camelCase")]
    PeerMuteState {
        muted: bool,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        by_host: bool,
    },
}

impl SignalPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::HostMute { .. } => "host-mute",
            Self::HostUnmute { .. } => "host-unmute",
            Self::HostKick { .. } => "host-kick",
            Self::PeerMuteState { .. } => "peer-mute-state",
        }
    }
}

/// A transient message on the room channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingMessage {
    pub from: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<PeerId>,
    #[serde(flatten)]
    pub payload: SignalPayload,
}

impl SignalingMessage {
    pub fn broadcast(from: PeerId, payload: SignalPayload) -> Self {
        Self { from, to: None, payload }
    }

    pub fn addressed(from: PeerId, to: PeerId, payload: SignalPayload) -> Self {
        Self { from, to: Some(to), payload }
    }

    /// True when the message is a broadcast or is addressed to `local`.
    pub fn is_for(&self, local: &PeerId) -> bool {
        self.to.as_ref().is_none_or(|to| to == local)
    }

    pub fn to_json(&self) -> Result<String, HuddleError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, HuddleError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Metadata announced with presence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceMeta {
    pub display_name: String,
}

/// Everything a subscription can yield.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    PresenceJoin { peer_id: PeerId, display_name: String },
    PresenceLeave { peer_id: PeerId },
    Message(SignalingMessage),
}

/// Per-room publish/subscribe primitive with presence.
///
/// One instance belongs to one client. `join` returns the subscription;
/// the subscription ends (yields `None`) after `leave`.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn join(
        &self,
        room_id: &str,
        self_id: &PeerId,
        meta: PresenceMeta,
    ) -> Result<mpsc::UnboundedReceiver<ChannelEvent>, HuddleError>;

    async fn publish(&self, message: SignalingMessage) -> Result<(), HuddleError>;

    async fn leave(&self) -> Result<(), HuddleError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_envelope_wire_format() {
        let msg = SignalingMessage::addressed(
            PeerId::from("alice"),
            PeerId::from("bob"),
            SignalPayload::Offer { sdp: "v=0".into() },
        );
        let value: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "type": "offer",
                "from": "alice",
                "to": "bob",
                "payload": { "sdp": "v=0" }
            })
        );
    }

    #[test]
    fn broadcast_omits_to() {
        let msg = SignalingMessage::broadcast(
            PeerId::from("alice"),
            SignalPayload::PeerMuteState { muted: true, by_host: false },
        );
        let json = msg.to_json().unwrap();
        assert!(!json.contains("\"to\""));
        assert!(!json.contains("byHost"));
        assert!(json.contains("\"peer-mute-state\""));
    }

    #[test]
    fn mute_state_by_host_flag() {
        let plain = SignalingMessage::from_json(
            r#"{"type":"peer-mute-state","from":"a","payload":{"muted":true}}"#,
        )
        .unwrap();
        assert_eq!(plain.payload, SignalPayload::PeerMuteState { muted: true, by_host: false });

        let msg = SignalingMessage::addressed(
            PeerId::from("a"),
            PeerId::from("b"),
            SignalPayload::PeerMuteState { muted: true, by_host: true },
        );
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["payload"], serde_json::json!({ "muted": true, "byHost": true }));
    }

    #[test]
    fn host_mute_parses_from_wire() {
        let json = r#"{"type":"host-mute","from":"host","payload":{"targetId":"v1","muted":true}}"#;
        let msg = SignalingMessage::from_json(json).unwrap();
        assert_eq!(msg.from, PeerId::from("host"));
        assert_eq!(msg.to, None);
        assert_eq!(
            msg.payload,
            SignalPayload::HostMute { target_id: PeerId::from("v1"), muted: true }
        );
        assert_eq!(msg.payload.kind(), "host-mute");
    }

    #[test]
    fn candidate_parses_without_optional_fields() {
        let json = r#"{"type":"ice-candidate","from":"a","to":"b","payload":{"candidate":{"candidate":"candidate:1 1 udp 1 10.0.0.1 5000 typ host"}}}"#;
        let msg = SignalingMessage::from_json(json).unwrap();
        match msg.payload {
            SignalPayload::IceCandidate { candidate } => {
                assert!(candidate.sdp_mid.is_none());
                assert!(candidate.sdp_m_line_index.is_none());
            }
            other => panic!("expected ice-candidate, got {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        let json = r#"{"type":"renegotiate","from":"a","payload":{}}"#;
        assert!(matches!(
            SignalingMessage::from_json(json),
            Err(HuddleError::Decode(_))
        ));
    }

    #[test]
    fn addressing() {
        let me = PeerId::from("me");
        let broadcast = SignalingMessage::broadcast(
            PeerId::from("x"),
            SignalPayload::PeerMuteState { muted: false, by_host: false },
        );
        let to_me = SignalingMessage::addressed(
            PeerId::from("x"),
            me.clone(),
            SignalPayload::Answer { sdp: String::new() },
        );
        let to_other = SignalingMessage::addressed(
            PeerId::from("x"),
            PeerId::from("other"),
            SignalPayload::Answer { sdp: String::new() },
        );
        assert!(broadcast.is_for(&me));
        assert!(to_me.is_for(&me));
        assert!(!to_other.is_for(&me));
    }
}
