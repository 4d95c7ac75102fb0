//! The relay websocket endpoint (`/relay`).
//!
//! Mirrors the teacher's single-socket upgrade pattern: the upgrade itself
//! only checks admission (Origin, rate limits), then [`router::Connection`]
//! drives the handshake and the authenticated frame loop directly against
//! `&mut WebSocket` for the rest of the connection's life. Whatever the
//! connection returns, we translate it into a best-effort close frame — we
//! never wait for the peer's own close frame back.

use std::{sync::Arc, time::Duration};

use axum::{
    Router,
    extract::{
        WebSocketUpgrade,
        ws::{self, CloseFrame, close_code},
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::any,
};
use http::StatusCode;
use tracing::instrument;

use crate::collaborators::Collaborators;
use crate::config::RelayServerConfig;
use crate::connection::admission::{Admission, AdmissionMode};
use crate::metrics::{METRICS_ID_CONNECTIONS_OPEN, METRICS_ID_CONNECTIONS_REJECTED};
use crate::router::Connection;

struct WebSocketArgs {
    ws: WebSocketUpgrade,
    origin: Option<String>,
    admission: Arc<Admission>,
    collaborators: Arc<Collaborators>,
    ws_max_message_size: usize,
    handshake_timeout: Duration,
    request_timeout: Duration,
    heartbeat_interval: Duration,
}

/// Web-socket handler.
///
/// Rejects the upgrade outright if the `Origin` header is not on the
/// allowlist (§4.I); otherwise upgrades and hands the socket to a freshly
/// admitted [`Connection`]. The connection always requires a full SRP-6a
/// handshake or session resume — `/relay` never admits a trusted-local
/// connection.
#[instrument(level = "debug", skip_all)]
async fn ws(args: WebSocketArgs) -> axum::response::Response {
    if !args.admission.origin_allowed(args.origin.as_deref()) {
        metrics::counter!(METRICS_ID_CONNECTIONS_REJECTED).increment(1);
        tracing::debug!(origin = ?args.origin, "rejected websocket upgrade: origin not permitted");
        return (StatusCode::FORBIDDEN, "origin not permitted").into_response();
    }

    args.ws
        .max_message_size(args.ws_max_message_size)
        .on_failed_upgrade(|err| {
            tracing::warn!("could not establish websocket connection: {err:?}");
        })
        .on_upgrade(move |mut socket| async move {
            metrics::gauge!(METRICS_ID_CONNECTIONS_OPEN).increment(1);

            let state = args.admission.new_connection(AdmissionMode::SrpRequired);
            let connection = Connection::new(
                state,
                Arc::clone(&args.collaborators),
                Arc::clone(&args.admission),
                args.heartbeat_interval,
                args.request_timeout,
            );

            let close_frame = match connection.run(&mut socket, args.handshake_timeout).await {
                Ok(()) => Some(CloseFrame {
                    code: close_code::NORMAL,
                    reason: "closed".into(),
                }),
                Err(err) => err.into_close_frame(),
            };

            metrics::gauge!(METRICS_ID_CONNECTIONS_OPEN).decrement(1);

            if let Some(close_frame) = close_frame {
                // Best effort, same as the teacher: if the peer is already
                // gone, sending the close frame fails and we just drop it.
                let _ = socket.send(ws::Message::Close(Some(close_frame))).await;
            }
        })
}

/// Creates a `Router` with the single `/relay` route.
pub(crate) fn routes(config: RelayServerConfig, admission: Admission, collaborators: Arc<Collaborators>) -> Router {
    let admission = Arc::new(admission);
    let ws_max_message_size = config.ws_max_message_size;
    let handshake_timeout = config.handshake_timeout;
    let request_timeout = config.request_timeout;
    let heartbeat_interval = config.subscription_heartbeat_interval;

    Router::new().route(
        "/relay",
        any(move |headers: HeaderMap, upgrade: WebSocketUpgrade| {
            let origin = headers.get(http::header::ORIGIN).and_then(|v| v.to_str().ok()).map(str::to_string);
            ws(WebSocketArgs {
                ws: upgrade,
                origin,
                admission: Arc::clone(&admission),
                collaborators: Arc::clone(&collaborators),
                ws_max_message_size,
                handshake_timeout,
                request_timeout,
                heartbeat_interval,
            })
        }),
    )
}
