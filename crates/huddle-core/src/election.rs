//! Peer discovery and initiator election.
//!
//! Each pair of peers independently computes the same answer from the two
//! identifiers alone: the smaller id sends the offer. No coordinator is
//! involved, so N simultaneous joins still yield exactly one offer per pair.

use crate::signaling::{ChannelEvent, PeerId};

/// Which side of a pair creates the offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Role of `local` towards `remote`, or `None` when both are the same peer.
pub fn role_for(local: &PeerId, remote: &PeerId) -> Option<Role> {
    if local < remote {
        Some(Role::Initiator)
    } else if local > remote {
        Some(Role::Responder)
    } else {
        None
    }
}

/// What a presence event means for the local connection set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discovery {
    Connect {
        peer_id: PeerId,
        display_name: String,
        role: Role,
    },
    Teardown {
        peer_id: PeerId,
    },
    Ignore,
}

pub fn discover(local: &PeerId, event: &ChannelEvent) -> Discovery {
    match event {
        ChannelEvent::PresenceJoin { peer_id, display_name } => match role_for(local, peer_id) {
            Some(role) => Discovery::Connect {
                peer_id: peer_id.clone(),
                display_name: display_name.clone(),
                role,
            },
            None => Discovery::Ignore,
        },
        ChannelEvent::PresenceLeave { peer_id } if peer_id != local => Discovery::Teardown {
            peer_id: peer_id.clone(),
        },
        _ => Discovery::Ignore,
    }
}
