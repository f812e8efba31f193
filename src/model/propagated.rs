//! Events surfaced by polling a media connection
//!
//! The driver turns these into orchestrator notifications or hands media
//! data to display surfaces.

use std::time::Instant;

use str0m::media::{MediaData, MediaKind, Mid};

use crate::model::handle::Role;

#[allow(clippy::large_enum_variant)]
pub enum Propagated {
    /// When we have nothing to propagate.
    Noop,

    /// A poll operation has reached its timeout.
    Timeout(Instant),

    /// ICE and DTLS are up on the connection.
    Connected(Role),

    /// A new incoming media track has been opened.
    TrackOpen(Role, Mid, MediaKind),

    /// A frame arrived on an incoming track.
    MediaData(Role, MediaData),

    /// The gateway asked for a keyframe on our published track.
    KeyframeRequest(Role),

    /// The connection is gone.
    Disconnected(Role),
}
