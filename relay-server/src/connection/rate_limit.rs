//! Token-bucket rate limiting for the `hello` handshake message, both
//! per-connection and per-identity (§3 `rateBuckets`).

use std::{num::NonZeroU32, sync::Arc, time::Duration};

use governor::{Quota, RateLimiter, clock::DefaultClock, state::InMemoryState, state::NotKeyed, state::keyed::DefaultKeyedStateStore};

/// A single bucket, e.g. the per-connection `hello` limiter.
pub struct HelloBucket {
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl HelloBucket {
    /// Builds a bucket holding `capacity` tokens that refills to full once
    /// every `refill` period.
    pub fn new(capacity: u32, refill: Duration) -> Self {
        let quota = quota_for(capacity, refill);
        Self {
            limiter: RateLimiter::direct(quota),
        }
    }

    /// Attempts to consume one token. `true` if the `hello` is admitted.
    pub fn check(&self) -> bool {
        self.limiter.check().is_ok()
    }
}

/// Per-identity `hello` limiter, shared across every connection attempting
/// to authenticate as the same identity.
pub struct IdentityBucket {
    limiter: Arc<RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>>,
    capacity: u32,
    refill: Duration,
}

impl IdentityBucket {
    /// Builds a keyed limiter, one logical bucket per identity, each holding
    /// `capacity` tokens and refilling to full once every `refill` period.
    pub fn new(capacity: u32, refill: Duration) -> Self {
        let quota = quota_for(capacity, refill);
        Self {
            limiter: Arc::new(RateLimiter::keyed(quota)),
            capacity,
            refill,
        }
    }

    /// Attempts to consume one token for `identity`.
    pub fn check(&self, identity: &str) -> bool {
        self.limiter.check_key(&identity.to_string()).is_ok()
    }
}

impl Clone for IdentityBucket {
    fn clone(&self) -> Self {
        Self {
            limiter: Arc::clone(&self.limiter),
            capacity: self.capacity,
            refill: self.refill,
        }
    }
}

fn quota_for(capacity: u32, refill: Duration) -> Quota {
    let capacity = NonZeroU32::new(capacity.max(1)).expect("capacity clamped to at least 1");
    let per_token = refill / capacity.get();
    Quota::with_period(per_token)
        .expect("refill period must be nonzero")
        .allow_burst(capacity)
}
