//! Error types for the relay client
//!
//! Every failure is terminal for the branch of the flow it happens in. The
//! orchestrator turns them into status lines; nothing is retried.

use thiserror::Error;

use crate::model::handle::Role;

/// Result type used across the crate.
pub type RelayResult<T> = Result<T, RelayError>;

/// Errors that can occur while talking to the gateway or handling media.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The local video feed could not be acquired
    #[error("media acquisition failed: {0}")]
    Media(String),

    /// Session creation or a session-level request failed
    #[error("gateway session error: {0}")]
    Session(String),

    /// Attaching a plugin handle failed
    #[error("attach failed for {role}: {reason}")]
    Attach { role: Role, reason: String },

    /// Offer/answer generation or application failed
    #[error("SDP negotiation failed for {role}: {reason}")]
    Negotiation { role: Role, reason: String },

    /// The plugin answered a request with an error
    #[error("plugin error {code}: {reason}")]
    Plugin { code: i64, reason: String },

    /// An operation was skipped because something it needs is not known yet
    #[error("missing precondition: {0}")]
    Precondition(String),

    /// A step did not complete before its deadline
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// The gateway replied with something that is not a valid message
    #[error("malformed gateway message: {0}")]
    Protocol(String),

    /// Configuration could not be loaded or is invalid
    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Create a negotiation error for the given role
    pub fn negotiation(role: Role, reason: impl ToString) -> Self {
        Self::Negotiation {
            role,
            reason: reason.to_string(),
        }
    }

    /// Create an attach error for the given role
    pub fn attach(role: Role, reason: impl ToString) -> Self {
        Self::Attach {
            role,
            reason: reason.to_string(),
        }
    }
}
