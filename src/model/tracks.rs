//! Media track bookkeeping
//!
//! A connection owns at most one outgoing track (the published feed) and any
//! number of incoming tracks (the processed feed coming back).

use std::time::Instant;

use str0m::media::{MediaKind, Mid};

/// An incoming media track on one of our connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackIn {
    /// The media ID (Mid) assigned to this track
    pub(crate) mid: Mid,
    /// The kind of media (audio or video)
    pub(crate) kind: MediaKind,
}

/// An entry in the incoming track registry.
///
/// Tracks when keyframe requests were last sent to avoid excessive requests.
#[derive(Debug)]
pub struct TrackInEntry {
    pub(crate) track: TrackIn,
    /// Timestamp of the last keyframe request for this track
    pub(crate) last_keyframe_request: Option<Instant>,
}

/// The outgoing (published) track.
#[derive(Debug)]
pub struct TrackOut {
    pub(crate) state: TrackOutState,
}

/// The negotiation state of an outgoing track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackOutState {
    /// Track needs to be opened in the next SDP negotiation
    ToOpen,
    /// Track negotiation is in progress with the given Mid
    Negotiating(Mid),
    /// Track is fully negotiated and open for media transmission
    Open(Mid),
}

impl TrackOut {
    pub fn new() -> Self {
        Self {
            state: TrackOutState::ToOpen,
        }
    }

    /// Gets the media ID (Mid) for this track, if assigned.
    pub fn mid(&self) -> Option<Mid> {
        match self.state {
            TrackOutState::ToOpen => None,
            TrackOutState::Negotiating(m) | TrackOutState::Open(m) => Some(m),
        }
    }

    /// The Mid to write media on, once negotiation has finished.
    pub fn open_mid(&self) -> Option<Mid> {
        match self.state {
            TrackOutState::Open(m) => Some(m),
            _ => None,
        }
    }
}

impl Default for TrackOut {
    fn default() -> Self {
        Self::new()
    }
}
