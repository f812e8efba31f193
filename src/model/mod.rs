//! Data models for the relay client
//!
//! This module contains the data structures shared between the orchestrator
//! and the driver: handle identities, forwarding rules, media connections,
//! tracks and status lines.

pub mod codec;
pub mod connection;
pub mod forward;
pub mod handle;
pub mod propagated;
pub mod status;
pub mod tracks;
