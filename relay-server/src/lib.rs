#![deny(missing_docs)]
//! This crate provides the server half of the relay session-transport
//! protocol.
//!
//! The main entry point is [`RelayServerBuilder`]. It wires together the
//! collaborator traits defined in [`collaborators`] (the tunneled HTTP
//! application, the session supervisor, the activity bus, the upload
//! staging area, the credential store, and the stored-session store) into a
//! single `axum::Router` exposing one websocket endpoint plus a small set of
//! informational HTTP endpoints.
//!
//! Every accepted connection runs through the same life-cycle:
//! 1. [`connection::admission`] decides whether to accept the upgrade at all
//!    (Origin check) and which authentication mode the connection gets.
//! 2. [`api::ws`] drives the SRP-6a handshake or session resume.
//! 3. Once authenticated, [`router`] dispatches application frames to
//!    [`tunnel`], [`subscriptions`], or [`uploads`].

use std::sync::Arc;

use axum::Router;
use tower_http::trace::TraceLayer;

pub mod api;
pub mod collaborators;
pub mod config;
pub mod connection;
pub mod metrics;
pub mod router;
pub mod subscriptions;
pub mod tunnel;
pub mod uploads;

use crate::collaborators::Collaborators;
use crate::config::RelayServerConfig;
use crate::connection::admission::Admission;

/// Builds a relay server from its collaborators and configuration.
///
/// Mirrors a service builder that performs setup and then assembles a
/// `Router`: call [`RelayServerBuilder::init`], then
/// [`RelayServerBuilder::build`].
pub struct RelayServerBuilder {
    config: RelayServerConfig,
    admission: Admission,
    collaborators: Arc<Collaborators>,
}

impl RelayServerBuilder {
    /// Initializes the relay server: sets up rate limiting and admission
    /// state from `config`, and registers the provided collaborators.
    pub fn init(config: RelayServerConfig, collaborators: Collaborators) -> Self {
        metrics::describe_metrics();
        let admission = Admission::new(&config);
        Self {
            config,
            admission,
            collaborators: Arc::new(collaborators),
        }
    }

    /// Builds the `axum::Router` serving the relay websocket endpoint at
    /// `/relay` plus `/version` and `/health`.
    pub fn build(self) -> Router {
        Router::new()
            .merge(api::health::routes())
            .merge(api::info::routes())
            .merge(api::ws::routes(
                self.config,
                self.admission,
                self.collaborators,
            ))
            .layer(TraceLayer::new_for_http())
    }
}
