#![deny(missing_docs)]
//! Core type definitions for the relay session-transport protocol.
//!
//! This crate groups together the strongly-typed values and message
//! structures shared between the relay server and the relay client. It
//! provides:
//!
//! * The framed wire protocol messages exchanged once a connection is
//!   established (see [`api`] module).
//! * Persisted data shapes: stored sessions kept by the server after a
//!   successful SRP handshake, and saved hosts kept by the client across
//!   restarts (see [`model`] module).
//! * The close-code table used by both peers (see [`close`] module).

use serde::{Deserialize, Serialize};

pub mod api;
pub mod close;
pub mod model;

/// Opaque connection identifier, unique per accepted socket on the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(uuid::Uuid);

impl ConnectionId {
    /// Generates a fresh, random connection id.
    pub fn new_random() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<uuid::Uuid> for ConnectionId {
    fn from(value: uuid::Uuid) -> Self {
        Self(value)
    }
}
