//! Metrics definitions for the relay server.
//!
//! This module defines all metrics keys used by the service and provides a
//! helper [`describe_metrics`] to set metadata for each metric using the
//! `metrics` crate.

/// Metrics key for the number of currently open websocket connections.
pub const METRICS_ID_CONNECTIONS_OPEN: &str = "relay.connections.open";
/// Metrics key for connections rejected during admission (origin, rate limit).
pub const METRICS_ID_CONNECTIONS_REJECTED: &str = "relay.connections.rejected";
/// Metrics key for completed SRP-6a handshakes.
pub const METRICS_ID_HANDSHAKE_SUCCESS: &str = "relay.handshake.success";
/// Metrics key for SRP-6a handshakes whose proof failed to verify.
pub const METRICS_ID_HANDSHAKE_FAILURE: &str = "relay.handshake.failure";
/// Metrics key for handshakes that did not complete before the timeout.
pub const METRICS_ID_HANDSHAKE_TIMEOUT: &str = "relay.handshake.timeout";
/// Metrics key for successful session resumes.
pub const METRICS_ID_RESUME_SUCCESS: &str = "relay.resume.success";
/// Metrics key for rejected session resumes.
pub const METRICS_ID_RESUME_FAILURE: &str = "relay.resume.failure";
/// Metrics key for the number of currently open subscriptions.
pub const METRICS_ID_SUBSCRIPTIONS_OPEN: &str = "relay.subscriptions.open";
/// Metrics key for events delivered to subscribers.
pub const METRICS_ID_SUBSCRIPTIONS_EVENTS_SENT: &str = "relay.subscriptions.events_sent";
/// Metrics key for the number of currently in-flight tunneled requests.
pub const METRICS_ID_TUNNEL_REQUESTS_IN_FLIGHT: &str = "relay.tunnel.requests.in_flight";
/// Metrics key for tunneled requests that timed out waiting for a response.
pub const METRICS_ID_TUNNEL_REQUESTS_TIMEOUT: &str = "relay.tunnel.requests.timeout";
/// Metrics key for the duration of a tunneled request round trip.
pub const METRICS_ID_TUNNEL_REQUEST_DURATION: &str = "relay.tunnel.request.duration";
/// Metrics key for the number of currently in-progress uploads.
pub const METRICS_ID_UPLOADS_IN_PROGRESS: &str = "relay.uploads.in_progress";
/// Metrics key for uploads that completed successfully.
pub const METRICS_ID_UPLOADS_COMPLETED: &str = "relay.uploads.completed";
/// Metrics key for uploads aborted because of an offset mismatch or error.
pub const METRICS_ID_UPLOADS_FAILED: &str = "relay.uploads.failed";
/// Metrics key for bytes received across all uploads.
pub const METRICS_ID_UPLOADS_BYTES_RECEIVED: &str = "relay.uploads.bytes_received";

/// Describe all metrics used by the service.
///
/// This calls the `describe_*` functions from the `metrics` crate to set
/// metadata on the different metrics.
pub fn describe_metrics() {
    metrics::describe_gauge!(
        METRICS_ID_CONNECTIONS_OPEN,
        metrics::Unit::Count,
        "Number of currently open websocket connections"
    );

    metrics::describe_counter!(
        METRICS_ID_CONNECTIONS_REJECTED,
        metrics::Unit::Count,
        "Number of connections rejected during admission"
    );

    metrics::describe_counter!(
        METRICS_ID_HANDSHAKE_SUCCESS,
        metrics::Unit::Count,
        "Number of SRP-6a handshakes that completed successfully"
    );

    metrics::describe_counter!(
        METRICS_ID_HANDSHAKE_FAILURE,
        metrics::Unit::Count,
        "Number of SRP-6a handshakes whose proof failed to verify"
    );

    metrics::describe_counter!(
        METRICS_ID_HANDSHAKE_TIMEOUT,
        metrics::Unit::Count,
        "Number of handshakes that did not complete before the timeout"
    );

    metrics::describe_counter!(
        METRICS_ID_RESUME_SUCCESS,
        metrics::Unit::Count,
        "Number of successful session resumes"
    );

    metrics::describe_counter!(
        METRICS_ID_RESUME_FAILURE,
        metrics::Unit::Count,
        "Number of rejected session resumes"
    );

    metrics::describe_gauge!(
        METRICS_ID_SUBSCRIPTIONS_OPEN,
        metrics::Unit::Count,
        "Number of currently open subscriptions"
    );

    metrics::describe_counter!(
        METRICS_ID_SUBSCRIPTIONS_EVENTS_SENT,
        metrics::Unit::Count,
        "Number of events delivered to subscribers"
    );

    metrics::describe_gauge!(
        METRICS_ID_TUNNEL_REQUESTS_IN_FLIGHT,
        metrics::Unit::Count,
        "Number of tunneled requests currently awaiting a response"
    );

    metrics::describe_counter!(
        METRICS_ID_TUNNEL_REQUESTS_TIMEOUT,
        metrics::Unit::Count,
        "Number of tunneled requests that timed out waiting for a response"
    );

    metrics::describe_histogram!(
        METRICS_ID_TUNNEL_REQUEST_DURATION,
        metrics::Unit::Milliseconds,
        "Duration of a tunneled request round trip"
    );

    metrics::describe_gauge!(
        METRICS_ID_UPLOADS_IN_PROGRESS,
        metrics::Unit::Count,
        "Number of uploads currently in progress"
    );

    metrics::describe_counter!(
        METRICS_ID_UPLOADS_COMPLETED,
        metrics::Unit::Count,
        "Number of uploads that completed successfully"
    );

    metrics::describe_counter!(
        METRICS_ID_UPLOADS_FAILED,
        metrics::Unit::Count,
        "Number of uploads aborted because of an offset mismatch or error"
    );

    metrics::describe_counter!(
        METRICS_ID_UPLOADS_BYTES_RECEIVED,
        metrics::Unit::Bytes,
        "Total bytes received across all uploads"
    );
}
