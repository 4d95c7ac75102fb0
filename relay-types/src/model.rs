//! Persisted data shapes: sessions the server stores after a successful SRP
//! handshake, and hosts the client remembers across restarts.

use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch. Kept as a plain newtype so this crate
/// does not need to pick a calendar library on behalf of its consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Wraps a raw millisecond count.
    pub fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the wrapped millisecond count.
    pub fn as_millis(self) -> u64 {
        self.0
    }
}

/// A session the server persists once SRP authentication succeeds, so that a
/// later connection can [resume](crate::api::handshake::Resume) it instead of
/// running a full SRP exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSession {
    /// Identifies this session for the resume handshake.
    pub session_id: uuid::Uuid,
    /// The identity the session was established for.
    pub username: String,
    /// The derived secretbox key, base64-encoded.
    pub session_key: String,
    /// Browser-profile hint supplied at hello time, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser_profile_id: Option<String>,
    /// Origin header observed at connection time, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    /// User-Agent header observed at connection time, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// When this session was first created.
    pub created_at: Timestamp,
    /// When this session was last successfully connected (SRP or resume).
    pub last_connected_at: Timestamp,
}

/// Transport mode a saved host is reached through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostMode {
    /// A relay broker pairs this client with the host.
    Relay,
    /// The client connects to the host directly.
    Direct,
}

/// A host the client remembers across process restarts, so the user does not
/// have to re-enter connection details every session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedHost {
    /// Client-chosen identifier for this saved host.
    pub id: uuid::Uuid,
    /// User-facing label.
    pub display_name: String,
    /// How this host is reached.
    pub mode: HostMode,
    /// Endpoint: a relay pairing code for [`HostMode::Relay`], or a URL for
    /// [`HostMode::Direct`].
    pub endpoint: String,
    /// The identity to authenticate as.
    pub identity: String,
    /// The most recently stored session for this host, if any live one exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stored_session: Option<StoredSession>,
    /// When this host was first saved.
    pub created_at: Timestamp,
    /// When this host was last successfully connected to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_connected: Option<Timestamp>,
}
