//! Janus gateway protocol
//!
//! Request shapes, parsing of responses and events, and the HTTP transport
//! that carries them.

pub mod event;
pub mod message;
pub mod transport;
