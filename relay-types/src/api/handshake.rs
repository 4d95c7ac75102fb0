//! SRP-6a handshake and session-resume messages.
//!
//! These are the only message types accepted before a connection reaches
//! `authenticated`. They are always sent in plaintext, even on connections
//! that will require encryption once authenticated.

use serde::{Deserialize, Serialize};

/// Client → server: starts a fresh SRP-6a exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    /// The identity (username) authenticating.
    pub username: String,
    /// The client's ephemeral public value `A`, hex-encoded.
    pub a_pub: String,
}

/// Server → client: the salt and the server's ephemeral public value `B`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Challenge {
    /// Salt stored for this identity, hex-encoded.
    pub salt: String,
    /// The server's ephemeral public value `B`, hex-encoded.
    pub b_pub: String,
}

/// Client → server: the client's proof of the shared secret, `M1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proof {
    /// `M1`, hex-encoded.
    pub m1: String,
}

/// Server → client: the server's proof of the shared secret, `M2`. Sent only
/// after the client's `M1` has verified; receiving this message means the
/// connection is now authenticated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verify {
    /// `M2`, hex-encoded.
    pub m2: String,
    /// Session id assigned to the freshly authenticated connection.
    pub session_id: uuid::Uuid,
}

/// Client → server: requests a resume challenge for a previously stored
/// session, instead of running a full SRP exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeInit {
    /// The stored session to resume.
    pub session_id: uuid::Uuid,
    /// The identity the session was stored under.
    pub username: String,
}

/// Server → client: a one-time nonce bound to `(session_id, username)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeChallenge {
    /// The nonce, hex-encoded. Valid for 60 seconds.
    pub nonce: String,
}

/// Client → server: proves knowledge of the stored session key by encrypting
/// a recent timestamp under it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resume {
    /// The session id from [`ResumeInit`].
    pub session_id: uuid::Uuid,
    /// Base64-encoded secretbox ciphertext of a timestamp recent enough for
    /// the stored-session store to accept.
    pub proof: String,
    /// The nonce used for the secretbox above, base64-encoded.
    pub proof_nonce: String,
}

/// Server → client: the resume succeeded; the connection is now authenticated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resumed {
    /// The session id that was resumed.
    pub session_id: uuid::Uuid,
}

/// Server → client: the handshake or resume attempt was rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invalid {
    /// Machine-readable reason, e.g. `"invalid_proof"`, `"unknown_session"`.
    pub reason: String,
}

/// Server → client: a handshake-phase error unrelated to credentials
/// (malformed message, rate limited, etc).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeError {
    /// Human-readable message.
    pub message: String,
}

/// Any message legal during the handshake phase, in either direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
#[allow(missing_docs)]
pub enum HandshakeMessage {
    #[serde(rename = "hello")]
    Hello(Hello),
    #[serde(rename = "challenge")]
    Challenge(Challenge),
    #[serde(rename = "proof")]
    Proof(Proof),
    #[serde(rename = "verify")]
    Verify(Verify),
    #[serde(rename = "resume-init")]
    ResumeInit(ResumeInit),
    #[serde(rename = "resume-challenge")]
    ResumeChallenge(ResumeChallenge),
    #[serde(rename = "resume")]
    Resume(Resume),
    #[serde(rename = "resumed")]
    Resumed(Resumed),
    #[serde(rename = "invalid")]
    Invalid(Invalid),
    #[serde(rename = "error")]
    Error(HandshakeError),
}
