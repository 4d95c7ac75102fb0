//! # API module
//!
//! Entry point for the wire-protocol message types exchanged over a relay
//! connection.
//!
//! * [`handshake`] — SRP-6a authentication and session-resume messages,
//!   exchanged before a connection is admitted.
//! * [`message`] — application messages exchanged once the connection is
//!   authenticated: request/response tunneling, subscriptions, uploads,
//!   liveness.

pub mod handshake;
pub mod message;

/// Format byte carried by unencrypted binary frames and by the plaintext
/// payload inside an encrypted envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameFormat {
    /// JSON-encoded application message.
    Json = 0x01,
    /// Raw binary upload-chunk payload (see [`message::UploadChunkHeader`]).
    BinaryUploadChunk = 0x02,
    /// Gzip-compressed JSON application message.
    CompressedJson = 0x03,
}

impl FrameFormat {
    /// Maps a raw format byte back to a [`FrameFormat`], if known.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Json),
            0x02 => Some(Self::BinaryUploadChunk),
            0x03 => Some(Self::CompressedJson),
            _ => None,
        }
    }

    /// Returns the raw format byte.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Version byte identifying the binary encrypted-envelope layout.
pub const ENVELOPE_VERSION: u8 = 0x01;
