//! Server admission (§4.I): the Origin allowlist check, the admission mode
//! a freshly upgraded socket gets, and the rate-limit buckets shared across
//! connections.

use std::{collections::HashMap, time::Duration};

use parking_lot::Mutex;

use crate::config::RelayServerConfig;
use crate::connection::rate_limit::{HelloBucket, IdentityBucket};
use crate::connection::state::{ConnectionState, RateBuckets};

/// Which authentication mode a freshly admitted connection gets.
#[derive(Debug, Clone, Copy)]
pub enum AdmissionMode {
    /// Already authenticated, plaintext application frames allowed.
    TrustedLocal,
    /// Unauthenticated; only SRP handshake messages admitted until success.
    SrpRequired,
}

/// Server-side admission policy: Origin allowlist, handshake timeout, and
/// the per-identity rate-limit buckets shared by every connection.
pub struct Admission {
    allowed_origins: Vec<String>,
    handshake_timeout: Duration,
    hello_bucket_capacity: u32,
    hello_bucket_refill: Duration,
    identity_bucket_capacity: u32,
    identity_bucket_refill: Duration,
    identity_buckets: Mutex<HashMap<String, IdentityBucket>>,
}

impl Admission {
    /// Builds admission policy state from `config`.
    pub fn new(config: &RelayServerConfig) -> Self {
        Self {
            allowed_origins: config.allowed_origins.clone(),
            handshake_timeout: config.handshake_timeout,
            hello_bucket_capacity: config.hello_bucket_capacity,
            hello_bucket_refill: config.hello_bucket_refill,
            identity_bucket_capacity: config.identity_bucket_capacity,
            identity_bucket_refill: config.identity_bucket_refill,
            identity_buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Whether `origin` is permitted to open a websocket connection. `"*"`
    /// in the allow list permits any origin (including none, for
    /// non-browser clients).
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        if self.allowed_origins.iter().any(|allowed| allowed == "*") {
            return true;
        }
        match origin {
            Some(origin) => self.allowed_origins.iter().any(|allowed| allowed == origin),
            None => false,
        }
    }

    /// Time allowed to complete the SRP handshake or session resume.
    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    /// Returns the shared per-identity `hello` bucket for `identity`,
    /// creating one on first use.
    pub fn identity_bucket(&self, identity: &str) -> IdentityBucket {
        let mut buckets = self.identity_buckets.lock();
        buckets
            .entry(identity.to_string())
            .or_insert_with(|| IdentityBucket::new(self.identity_bucket_capacity, self.identity_bucket_refill))
            .clone()
    }

    /// Builds a fresh connection record for the given admission mode.
    pub fn new_connection(&self, mode: AdmissionMode) -> ConnectionState {
        let rate_buckets = RateBuckets::new(HelloBucket::new(self.hello_bucket_capacity, self.hello_bucket_refill));
        match mode {
            AdmissionMode::TrustedLocal => ConnectionState::new_trusted_local(rate_buckets),
            AdmissionMode::SrpRequired => ConnectionState::new(true, rate_buckets),
        }
    }
}
