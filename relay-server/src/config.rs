//! Configuration types and CLI/environment parsing for the relay server.
//!
//! Concrete deployments may have a more detailed config and can flatten
//! [`RelayServerConfig`] into it with `#[clap(flatten)]`.

use std::{net::SocketAddr, time::Duration};

use clap::Parser;

/// The configuration for the relay server's core functionality.
///
/// Configurable via environment variables or command line arguments using
/// `clap`.
#[derive(Parser, Debug, Clone)]
pub struct RelayServerConfig {
    /// Address to bind the HTTP/websocket listener to.
    #[clap(long, env = "RELAY_BIND_ADDR", default_value = "0.0.0.0:8787")]
    pub bind_addr: SocketAddr,

    /// Origins allowed to open a websocket connection. `"*"` allows any
    /// origin and should only be used behind a loopback-only bind address.
    #[clap(
        long,
        env = "RELAY_ALLOWED_ORIGINS",
        value_delimiter = ',',
        default_value = "http://localhost,http://127.0.0.1"
    )]
    pub allowed_origins: Vec<String>,

    /// Max message size the websocket connection accepts.
    #[clap(long, env = "RELAY_WS_MAX_MESSAGE_SIZE", default_value = "8388608")]
    pub ws_max_message_size: usize,

    /// Time allowed to complete the SRP handshake or session resume before
    /// the connection is closed.
    #[clap(
        long,
        env = "RELAY_HANDSHAKE_TIMEOUT",
        default_value = "10s",
        value_parser = humantime::parse_duration
    )]
    pub handshake_timeout: Duration,

    /// How long a pending tunneled request may remain unanswered.
    #[clap(
        long,
        env = "RELAY_REQUEST_TIMEOUT",
        default_value = "30s",
        value_parser = humantime::parse_duration
    )]
    pub request_timeout: Duration,

    /// How often idle subscriptions receive a heartbeat frame.
    #[clap(
        long,
        env = "RELAY_SUBSCRIPTION_HEARTBEAT_INTERVAL",
        default_value = "30s",
        value_parser = humantime::parse_duration
    )]
    pub subscription_heartbeat_interval: Duration,

    /// How long a resume nonce remains valid after being issued.
    #[clap(
        long,
        env = "RELAY_RESUME_CHALLENGE_VALIDITY",
        default_value = "60s",
        value_parser = humantime::parse_duration
    )]
    pub resume_challenge_validity: Duration,

    /// Capacity of the per-connection `hello` rate-limit bucket.
    #[clap(long, env = "RELAY_HELLO_BUCKET_CAPACITY", default_value = "6")]
    pub hello_bucket_capacity: u32,

    /// Refill period for the per-connection `hello` rate-limit bucket (the
    /// bucket refills fully once per this period).
    #[clap(
        long,
        env = "RELAY_HELLO_BUCKET_REFILL",
        default_value = "6min",
        value_parser = humantime::parse_duration
    )]
    pub hello_bucket_refill: Duration,

    /// Capacity of the per-identity `hello` rate-limit bucket.
    #[clap(long, env = "RELAY_IDENTITY_BUCKET_CAPACITY", default_value = "30")]
    pub identity_bucket_capacity: u32,

    /// Refill period for the per-identity `hello` rate-limit bucket.
    #[clap(
        long,
        env = "RELAY_IDENTITY_BUCKET_REFILL",
        default_value = "30min",
        value_parser = humantime::parse_duration
    )]
    pub identity_bucket_refill: Duration,

    /// Granularity at which upload progress is reported, in bytes.
    #[clap(long, env = "RELAY_UPLOAD_PROGRESS_GRANULARITY", default_value = "65536")]
    pub upload_progress_granularity: u64,
}
