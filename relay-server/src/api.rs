//! API module for the relay server.
//!
//! This module defines all HTTP endpoints the relay server exposes and
//! organizes them into submodules:
//!
//! - [`errors`] – Defines API error types and their mapping to websocket
//!   close frames.
//! - [`health`] – Provides the health endpoint (`/health`).
//! - [`info`] – Info about the service (`/version`).
//! - [`ws`] – The implementation of the relay websocket endpoint (`/relay`).

pub(crate) mod errors;
pub(crate) mod health;
pub(crate) mod info;
pub(crate) mod ws;
