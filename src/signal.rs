use serde::{Deserialize, Serialize};
use uuid::Uuid;
use webrtc::{
    ice_transport::ice_candidate::RTCIceCandidateInit,
    peer_connection::sdp::session_description::RTCSessionDescription,
};

/// Tab-scoped participant id, unique for the process lifetime.
pub(crate) type TabId = Uuid;

/// One signaling message as it travels over a room channel.
///
/// `to` is present only on the peer-addressed types; announcements and
/// leaves are broadcasts. Every message names the room it belongs to so
/// receivers can discard traffic that leaked in from elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub(crate) enum Signal {
    JoinAnnouncement {
        from: TabId,
        room_id: String,
        username: String,
    },
    Offer {
        from: TabId,
        to: TabId,
        room_id: String,
        username: String,
        offer: RTCSessionDescription,
    },
    Answer {
        from: TabId,
        to: TabId,
        room_id: String,
        answer: RTCSessionDescription,
    },
    Candidate {
        from: TabId,
        to: TabId,
        room_id: String,
        candidate: RTCIceCandidateInit,
    },
    Leave {
        from: TabId,
        room_id: String,
    },
}

impl Signal {
    pub(crate) fn from_id(&self) -> TabId {
        match self {
            Signal::JoinAnnouncement { from, .. }
            | Signal::Offer { from, .. }
            | Signal::Answer { from, .. }
            | Signal::Candidate { from, .. }
            | Signal::Leave { from, .. } => *from,
        }
    }

    pub(crate) fn room_id(&self) -> &str {
        match self {
            Signal::JoinAnnouncement { room_id, .. }
            | Signal::Offer { room_id, .. }
            | Signal::Answer { room_id, .. }
            | Signal::Candidate { room_id, .. }
            | Signal::Leave { room_id, .. } => room_id,
        }
    }

    /// Addressee, for the unicast types.
    pub(crate) fn to(&self) -> Option<TabId> {
        match self {
            Signal::Offer { to, .. } | Signal::Answer { to, .. } | Signal::Candidate { to, .. } => {
                Some(*to)
            }
            Signal::JoinAnnouncement { .. } | Signal::Leave { .. } => None,
        }
    }
}
