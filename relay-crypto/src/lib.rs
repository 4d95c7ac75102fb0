#![deny(missing_docs)]
//! Frame codec and cryptographic primitives for the relay session-transport
//! protocol.
//!
//! This crate is deliberately free of any notion of a connection or a
//! socket; it only knows how to turn bytes into typed frames and back, and
//! how to run the SRP-6a handshake and the secretbox encryption layer on top
//! of the shared secret it produces. The server and client crates own the
//! stateful parts.
//!
//! * [`codec`] — wire-frame encode/decode (text, binary, encrypted envelope,
//!   legacy JSON envelope, binary-upload-chunk layout, gzip).
//! * [`srp`] — SRP-6a client and server session wrappers.
//! * [`secretbox`] — authenticated encryption and the labeled key-derivation
//!   function used to turn an SRP shared secret into a secretbox key.

pub mod codec;
pub mod secretbox;
pub mod srp;
