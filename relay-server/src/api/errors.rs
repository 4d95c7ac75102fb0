//! This module defines the [`Error`] a relay connection may encounter while
//! driving the handshake or dispatching application frames. It further
//! provides a method to transform the encountered errors into a close frame
//! if necessary.

use std::io::ErrorKind;

use axum::extract::ws::CloseFrame;
use relay_crypto::{codec::CodecError, secretbox::SecretboxError, srp::SrpSessionError};
use relay_types::close;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tracing::instrument;

/// All errors that may occur over the lifetime of a relay connection.
#[derive(Debug, thiserror::Error)]
pub(crate) enum Error {
    /// The peer disconnected without a websocket close handshake; not worth
    /// logging above trace level.
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error(transparent)]
    Axum(#[from] axum::Error),
    #[error("handshake did not complete within the allotted time")]
    HandshakeTimeout,
    #[error("message received before the handshake completed")]
    EncryptedMessageRequired,
    #[error("connection rate limited")]
    RateLimited,
    #[error("origin not permitted")]
    ForbiddenOrigin,
    #[error(transparent)]
    Srp(#[from] SrpSessionError),
    #[error(transparent)]
    Decryption(#[from] SecretboxError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("unexpected message for the current connection phase")]
    UnexpectedMessage,
    #[error("send failed: {0}")]
    SendFailure(String),
}

impl Error {
    /// Transforms the error into a [`CloseFrame`] if the connection should be
    /// closed with one. Errors caused by the peer simply going away produce
    /// `None`: there's no point telling a closed socket why it was closed.
    #[instrument(level = "debug", skip_all)]
    pub(crate) fn into_close_frame(self) -> Option<CloseFrame> {
        tracing::debug!("{self:?}");
        match self {
            Error::ConnectionClosed => None,
            Error::Axum(axum_error) => {
                let inner = axum_error.into_inner();
                if let Some(tokio_tungstenite::tungstenite::Error::Protocol(
                    ProtocolError::ResetWithoutClosingHandshake,
                )) = inner.downcast_ref()
                {
                    tracing::trace!("client closed without a closing handshake");
                    None
                } else if let Some(io_err) = inner.downcast_ref::<std::io::Error>()
                    && io_err.kind() == ErrorKind::ConnectionReset
                {
                    tracing::trace!("client reset the connection");
                    None
                } else {
                    Some(CloseFrame {
                        code: close::SEND_FAILURE,
                        reason: "unexpected error".into(),
                    })
                }
            }
            Error::HandshakeTimeout | Error::RateLimited => Some(CloseFrame {
                code: close::HANDSHAKE_TIMEOUT_OR_RATE_LIMITED,
                reason: "handshake timed out or connection rate limited".into(),
            }),
            Error::ForbiddenOrigin => Some(CloseFrame {
                code: close::FORBIDDEN_ORIGIN,
                reason: "origin not permitted".into(),
            }),
            Error::Srp(err) => Some(CloseFrame {
                code: close::AUTH_REQUIRED_OR_INVALID_PROOF,
                reason: err.to_string().into(),
            }),
            Error::Decryption(err) => Some(CloseFrame {
                code: close::DECRYPTION_FAILED,
                reason: err.to_string().into(),
            }),
            Error::EncryptedMessageRequired => Some(CloseFrame {
                code: close::ENCRYPTED_MESSAGE_REQUIRED,
                reason: "plaintext message sent after handshake completed".into(),
            }),
            Error::Codec(err) => Some(CloseFrame {
                code: close::UNKNOWN_FORMAT_OR_VERSION,
                reason: err.to_string().into(),
            }),
            Error::UnexpectedMessage => Some(CloseFrame {
                code: close::UNKNOWN_FORMAT_OR_VERSION,
                reason: "unexpected message".into(),
            }),
            Error::SendFailure(reason) => Some(CloseFrame {
                code: close::SEND_FAILURE,
                reason: reason.into(),
            }),
        }
    }
}
