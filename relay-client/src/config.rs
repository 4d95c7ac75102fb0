//! Client-side configuration.
//!
//! On native targets this is a `clap::Parser`, env-overridable and parsed
//! the same way [`relay_server::config::RelayServerConfig`] is; on `wasm32`
//! there is no process environment or argv to parse from (`clap` is not
//! even a dependency there, see the crate's `Cargo.toml`), so the struct is
//! still available but only constructible via [`RelayClientConfig::default`]
//! or by setting fields directly — the embedding application is expected to
//! source its own values from whatever the browser environment offers.

use std::time::Duration;

/// Client-side timeouts and tunables, matching the authoritative timeout
/// table.
#[derive(Debug, Clone)]
#[cfg_attr(not(target_arch = "wasm32"), derive(clap::Parser))]
pub struct RelayClientConfig {
    /// Time allowed for the SRP handshake or session resume to complete.
    #[cfg_attr(
        not(target_arch = "wasm32"),
        clap(long, env = "RELAY_CLIENT_HANDSHAKE_TIMEOUT", default_value = "10s", value_parser = humantime::parse_duration)
    )]
    pub handshake_timeout: Duration,

    /// How long a `fetch` waits for its matching `response` before failing.
    #[cfg_attr(
        not(target_arch = "wasm32"),
        clap(long, env = "RELAY_CLIENT_REQUEST_TIMEOUT", default_value = "30s", value_parser = humantime::parse_duration)
    )]
    pub request_timeout: Duration,

    /// How long without any inbound event (including heartbeats) before the
    /// connection is considered stale and a reconnect is forced.
    #[cfg_attr(
        not(target_arch = "wasm32"),
        clap(long, env = "RELAY_CLIENT_STALE_THRESHOLD", default_value = "45s", value_parser = humantime::parse_duration)
    )]
    pub stale_threshold: Duration,

    /// How often the stale check runs once at least one heartbeat has been
    /// observed.
    #[cfg_attr(
        not(target_arch = "wasm32"),
        clap(long, env = "RELAY_CLIENT_STALE_CHECK_INTERVAL", default_value = "10s", value_parser = humantime::parse_duration)
    )]
    pub stale_check_interval: Duration,

    /// How long the application must have been hidden before a visibility
    /// return triggers a liveness ping.
    #[cfg_attr(
        not(target_arch = "wasm32"),
        clap(long, env = "RELAY_CLIENT_VISIBILITY_HIDDEN_THRESHOLD", default_value = "5s", value_parser = humantime::parse_duration)
    )]
    pub visibility_hidden_threshold: Duration,

    /// How long the visibility-return ping waits for its pong before forcing
    /// a reconnect.
    #[cfg_attr(
        not(target_arch = "wasm32"),
        clap(long, env = "RELAY_CLIENT_PONG_TIMEOUT", default_value = "2s", value_parser = humantime::parse_duration)
    )]
    pub pong_timeout: Duration,

    /// Base delay for the reconnect backoff formula (§4.H).
    #[cfg_attr(
        not(target_arch = "wasm32"),
        clap(long, env = "RELAY_CLIENT_RECONNECT_BASE_DELAY", default_value = "1s", value_parser = humantime::parse_duration)
    )]
    pub reconnect_base_delay: Duration,

    /// Cap on the reconnect backoff delay, however many attempts have
    /// elapsed.
    #[cfg_attr(
        not(target_arch = "wasm32"),
        clap(long, env = "RELAY_CLIENT_RECONNECT_MAX_DELAY", default_value = "30s", value_parser = humantime::parse_duration)
    )]
    pub reconnect_max_delay: Duration,

    /// Proportion of jitter applied on top of the exponential delay, in
    /// `[0, 1]`.
    #[cfg_attr(not(target_arch = "wasm32"), clap(long, env = "RELAY_CLIENT_RECONNECT_JITTER", default_value = "0.3"))]
    pub reconnect_jitter: f64,

    /// Maximum consecutive reconnect attempts before giving up.
    #[cfg_attr(not(target_arch = "wasm32"), clap(long, env = "RELAY_CLIENT_RECONNECT_MAX_ATTEMPTS", default_value = "10"))]
    pub reconnect_max_attempts: u32,

    /// Size of each chunk an upload is split into.
    #[cfg_attr(not(target_arch = "wasm32"), clap(long, env = "RELAY_CLIENT_UPLOAD_CHUNK_SIZE", default_value = "65536"))]
    pub upload_chunk_size: usize,
}

impl Default for RelayClientConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(45),
            stale_check_interval: Duration::from_secs(10),
            visibility_hidden_threshold: Duration::from_secs(5),
            pong_timeout: Duration::from_secs(2),
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            reconnect_jitter: 0.3,
            reconnect_max_attempts: 10,
            upload_chunk_size: 65536,
        }
    }
}
