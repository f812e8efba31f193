//! Gateway session and plugin handle identities

use std::fmt;
use std::ops::Deref;

use serde::{Deserialize, Serialize};

/// Gateway-assigned session id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl Deref for SessionId {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Gateway-assigned plugin handle id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandleId(pub u64);

impl Deref for HandleId {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// What a plugin handle is used for. There is at most one handle per role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Publishes the local feed into the video room
    Publisher,
    /// Subscribes to a room feed through the videoroom plugin
    Subscriber,
    /// Watches a mountpoint of the streaming plugin
    Watcher,
}

impl Role {
    /// The Janus plugin package this role attaches to.
    pub fn plugin(&self) -> &'static str {
        match self {
            Role::Publisher | Role::Subscriber => "janus.plugin.videoroom",
            Role::Watcher => "janus.plugin.streaming",
        }
    }

    /// The display surface tracks of this role are rendered into.
    pub fn surface(&self) -> SurfaceId {
        match self {
            Role::Publisher => SurfaceId::Local,
            Role::Subscriber | Role::Watcher => SurfaceId::Remote,
        }
    }

    /// True for roles that receive media from the gateway.
    pub fn is_receiving(&self) -> bool {
        !matches!(self, Role::Publisher)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::Publisher => "publisher",
            Role::Subscriber => "subscriber",
            Role::Watcher => "watcher",
        };
        f.write_str(s)
    }
}

/// Display surfaces media is rendered into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SurfaceId {
    Local,
    Remote,
}

/// An attached plugin handle and how far its SDP negotiation has come.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginHandle {
    pub id: HandleId,
    pub role: Role,
    pub negotiation: Negotiation,
}

impl PluginHandle {
    pub fn new(id: HandleId, role: Role) -> Self {
        Self {
            id,
            role,
            negotiation: Negotiation::None,
        }
    }

    pub fn is_negotiated(&self) -> bool {
        self.negotiation == Negotiation::Complete
    }
}

/// Offer/answer progress of a single handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiation {
    /// Nothing exchanged yet
    None,
    /// We asked our media stack for a local offer
    OfferRequested,
    /// Local offer sent to the gateway, waiting for its answer
    OfferSent,
    /// Remote offer received, our answer is being produced
    RemoteOffer,
    /// Local answer sent to the gateway
    AnswerSent,
    /// Both descriptions applied
    Complete,
}

/// Membership of this client in a video room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomMembership {
    pub room: u64,
    pub participant_id: u64,
    pub role: Role,
}
