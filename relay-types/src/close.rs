//! Close codes used to end a relay connection.
//!
//! These mirror the application-defined range of the websocket close-code
//! space (4000-4999 is reserved for application use; 1011 is the standard
//! "internal error" code we reuse for send failures).

/// Sending a frame to the peer failed at the transport level.
pub const SEND_FAILURE: u16 = 1011;
/// The connection requires authentication, or the proof it offered was invalid.
pub const AUTH_REQUIRED_OR_INVALID_PROOF: u16 = 4001;
/// The frame carried an unknown format byte or envelope version.
pub const UNKNOWN_FORMAT_OR_VERSION: u16 = 4002;
/// The connecting origin is not on the allow-list.
pub const FORBIDDEN_ORIGIN: u16 = 4003;
/// An encrypted envelope failed to decrypt.
pub const DECRYPTION_FAILED: u16 = 4004;
/// An application frame arrived in plaintext on a connection that requires encryption.
pub const ENCRYPTED_MESSAGE_REQUIRED: u16 = 4005;
/// The handshake did not complete in time, or the connection was rate limited.
pub const HANDSHAKE_TIMEOUT_OR_RATE_LIMITED: u16 = 4008;
