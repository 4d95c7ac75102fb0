#![deny(missing_docs)]
//! This crate provides the client half of the relay session-transport
//! protocol.
//!
//! The main entry point is [`Connection`] (§4.J): it owns exactly one live
//! transport to a host, drives the SRP-6a handshake or session resume, and
//! exposes `fetch`/`subscribe*`/`upload` on top of it. [`connection_manager`]
//! implements the reconnect/backoff/stale-detection state machine (§4.H)
//! that decides when `Connection` should rebuild its transport.
//!
//! Two transports are available, selected at compile time by target:
//! native (`tokio-tungstenite`) and WASM (`gloo-net`), both behind the
//! [`transport`] module.

mod connection_manager;
mod orchestrator;
mod runtime;
mod subscription;
mod transport;
mod tunnel;
mod upload;

pub mod config;

pub use connection_manager::{ConnectionManagerState, StateChange};
pub use orchestrator::{ClientIdentity, Connection};
pub use subscription::{Subscription, SubscriptionEvent};
pub use upload::UploadHandle;

/// Errors returned by the relay client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The underlying transport closed or failed to send/receive a frame.
    /// Always retryable by the connection manager.
    #[error("transport error: {0}")]
    Transport(String),
    /// The peer closed the connection with an application-defined close
    /// code (§6).
    #[error("connection closed by peer: {code} {reason}")]
    ClosedByPeer {
        /// The websocket close code the peer sent.
        code: u16,
        /// The close reason string the peer sent.
        reason: String,
    },
    /// The handshake did not complete within the configured timeout.
    #[error("handshake timed out")]
    HandshakeTimeout,
    /// The server rejected the identity outright (unknown username).
    #[error("unknown identity")]
    UnknownIdentity,
    /// The server rejected the SRP proof or the resume proof.
    #[error("invalid proof")]
    InvalidProof,
    /// The server is rate-limiting this identity or connection.
    #[error("rate limited")]
    RateLimited,
    /// No stored session or credentials were available to authenticate with.
    #[error("missing configuration: {0}")]
    MissingConfig(String),
    /// A `fetch` did not receive a `response` within the request timeout.
    #[error("request timed out")]
    RequestTimeout,
    /// A `subscribe` was rejected by the server.
    #[error("subscription rejected: {status} {message}")]
    SubscriptionRejected {
        /// HTTP-shaped status the server reported.
        status: u16,
        /// Human-readable reason.
        message: String,
    },
    /// An upload failed server-side.
    #[error("upload failed: {0}")]
    UploadFailed(String),
    /// A received frame could not be decoded.
    #[error(transparent)]
    Codec(#[from] relay_crypto::codec::CodecError),
    /// An encrypted frame failed to decrypt.
    #[error(transparent)]
    Decryption(#[from] relay_crypto::secretbox::SecretboxError),
    /// The SRP exchange failed.
    #[error(transparent)]
    Srp(#[from] relay_crypto::srp::SrpSessionError),
    /// A handshake message arrived out of sequence or of the wrong kind.
    #[error("unexpected message for the current connection phase")]
    UnexpectedMessage,
}

impl Error {
    /// Whether the connection manager (§4.H) should schedule a reconnect
    /// after this error, as opposed to giving up and surfacing it to the
    /// caller directly.
    ///
    /// `auth required`, `forbidden`, `unknown identity`, and `missing
    /// config` are the non-retryable causes named in §4.H; everything else
    /// is assumed to be a transient transport condition.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::UnknownIdentity | Error::InvalidProof | Error::MissingConfig(_) | Error::ClosedByPeer { code: relay_types::close::FORBIDDEN_ORIGIN, .. }
        )
    }
}
