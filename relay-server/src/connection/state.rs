//! The per-connection record (§3 "Connection record") and the handful of
//! operations §4.C exposes on it.
//!
//! Owned exclusively by the task driving that connection's frame loop — no
//! locking, since frames on a single socket are always processed
//! sequentially (§5).

use std::collections::HashSet;

use relay_crypto::secretbox::SessionKey;
use relay_types::api::FrameFormat;
use relay_types::model::Timestamp;

use crate::connection::rate_limit::{HelloBucket, IdentityBucket};

/// Where a connection is in the SRP handshake / resume state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPhase {
    /// No `hello` or `resume-init` has been accepted yet.
    Unauthenticated,
    /// A `challenge` has been sent; awaiting `proof`.
    SrpWaitingProof,
    /// The connection has a session key and may exchange application
    /// frames.
    Authenticated,
}

/// The two binary-frame interpretation modes a connection may have latched.
#[derive(Debug, Default, Clone, Copy)]
pub struct BinaryMode {
    /// The peer has sent at least one unencrypted binary frame.
    pub use_binary_frames: bool,
    /// The peer has sent at least one encrypted binary envelope. Once true,
    /// every subsequent binary frame on this connection is interpreted as
    /// an encrypted envelope.
    pub use_binary_encrypted: bool,
}

/// A one-time nonce challenge issued for `resume-init`, bound to the
/// identity and session it was issued for.
pub struct PendingResumeChallenge {
    /// The 24-byte nonce sent to the client.
    pub nonce: [u8; 24],
    /// The session the resume is for.
    pub session_id: uuid::Uuid,
    /// The username presented in `resume-init`.
    pub username: String,
    /// When the challenge was issued.
    pub issued_at: Timestamp,
}

/// Outcome of [`ConnectionState::ratelimit_hello`].
#[derive(Debug, PartialEq, Eq)]
pub enum HelloRateLimit {
    /// The `hello` is admitted.
    Ok,
    /// The connection (or its identity) is over quota or within a
    /// failed-proof cooldown.
    Cooldown,
}

/// Per-connection rate-limit bookkeeping: a private bucket and the
/// failed-proof cooldown clock. The per-identity bucket lives in
/// [`crate::connection::admission::Admission`] instead, since it is shared
/// across every connection authenticating as the same identity and is only
/// known once a `hello` names that identity.
pub struct RateBuckets {
    hello: HelloBucket,
    blocked_until: Option<Timestamp>,
    failed_proof_count: u32,
}

impl RateBuckets {
    /// Builds fresh rate-limit state around a private `hello` bucket.
    pub fn new(hello: HelloBucket) -> Self {
        Self {
            hello,
            blocked_until: None,
            failed_proof_count: 0,
        }
    }
}

/// The per-socket connection record.
pub struct ConnectionState {
    auth_phase: AuthPhase,
    session_key: Option<SessionKey>,
    requires_encrypted_messages: bool,
    binary_mode: BinaryMode,
    supported_formats: HashSet<FrameFormat>,
    outbound_seq: u64,
    last_inbound_seq: u64,
    pending_resume_challenge: Option<PendingResumeChallenge>,
    rate_buckets: RateBuckets,
}

/// How long a resume challenge remains valid after being issued.
pub const RESUME_CHALLENGE_VALIDITY_SECS: u64 = 60;

/// Base cooldown applied after the first failed proof; doubles per
/// additional failure, capped at [`MAX_FAILED_PROOF_COOLDOWN_SECS`].
const FAILED_PROOF_BASE_COOLDOWN_SECS: u64 = 5;
/// Cap on the failed-proof cooldown.
const MAX_FAILED_PROOF_COOLDOWN_SECS: u64 = 300;

impl ConnectionState {
    /// Builds a fresh, unauthenticated connection record.
    pub fn new(requires_encrypted_messages: bool, rate_buckets: RateBuckets) -> Self {
        Self {
            auth_phase: AuthPhase::Unauthenticated,
            session_key: None,
            requires_encrypted_messages,
            binary_mode: BinaryMode::default(),
            supported_formats: HashSet::from([FrameFormat::Json]),
            outbound_seq: 0,
            last_inbound_seq: 0,
            pending_resume_challenge: None,
            rate_buckets,
        }
    }

    /// Builds a connection record that is already authenticated and does not
    /// require encryption — the trusted-local admission mode (§4.I).
    pub fn new_trusted_local(rate_buckets: RateBuckets) -> Self {
        let mut state = Self::new(false, rate_buckets);
        state.auth_phase = AuthPhase::Authenticated;
        state
    }

    /// The connection's current auth phase.
    pub fn auth_phase(&self) -> AuthPhase {
        self.auth_phase
    }

    /// Whether plaintext application frames must be rejected.
    pub fn requires_encrypted_messages(&self) -> bool {
        self.requires_encrypted_messages
    }

    /// The connection's session key, if authenticated.
    pub fn session_key(&self) -> Option<&SessionKey> {
        self.session_key.as_ref()
    }

    /// Marks this connection authenticated with `key`, arming encryption.
    pub fn mark_authenticated(&mut self, key: SessionKey) {
        self.session_key = Some(key);
        self.auth_phase = AuthPhase::Authenticated;
        self.pending_resume_challenge = None;
        self.rate_buckets.blocked_until = None;
        self.rate_buckets.failed_proof_count = 0;
    }

    /// Transitions into `srp-waiting-proof`, called right after sending
    /// `challenge`.
    pub fn mark_waiting_proof(&mut self) {
        self.auth_phase = AuthPhase::SrpWaitingProof;
    }

    /// Latches that the peer has sent an unencrypted binary frame.
    pub fn note_binary_frame(&mut self) {
        self.binary_mode.use_binary_frames = true;
    }

    /// Latches that the peer has sent an encrypted binary envelope.
    pub fn note_binary_encrypted(&mut self) {
        self.binary_mode.use_binary_encrypted = true;
    }

    /// Whether binary frames on this connection should be interpreted as
    /// encrypted envelopes.
    pub fn binary_mode(&self) -> BinaryMode {
        self.binary_mode
    }

    /// Records the peer's supported formats from an opening `capabilities`
    /// message.
    pub fn set_supported_formats(&mut self, formats: HashSet<FrameFormat>) {
        self.supported_formats = formats;
    }

    /// The next sequence number to embed in an outbound encrypted payload.
    pub fn next_outbound_seq(&mut self) -> u64 {
        self.outbound_seq += 1;
        self.outbound_seq
    }

    /// Enforces `seq > lastInboundSeq`, then advances it. Returns `false` on
    /// a replayed or reordered sequence number.
    pub fn accept_inbound_seq(&mut self, seq: u64) -> bool {
        if seq <= self.last_inbound_seq {
            return false;
        }
        self.last_inbound_seq = seq;
        true
    }

    /// Issues a fresh resume challenge bound to `session_id`/`username`,
    /// replacing any previous pending challenge.
    pub fn issue_resume_challenge(&mut self, session_id: uuid::Uuid, username: String, now: Timestamp) -> [u8; 24] {
        use rand::RngCore as _;
        let mut nonce = [0u8; 24];
        rand::thread_rng().fill_bytes(&mut nonce);
        self.pending_resume_challenge = Some(PendingResumeChallenge {
            nonce,
            session_id,
            username,
            issued_at: now,
        });
        nonce
    }

    /// Consumes the pending resume challenge if `session_id`/`username`
    /// match and it is younger than [`RESUME_CHALLENGE_VALIDITY_SECS`].
    /// Single-use: the challenge is cleared regardless of the outcome.
    pub fn consume_resume_challenge(&mut self, session_id: uuid::Uuid, username: &str, now: Timestamp) -> Option<[u8; 24]> {
        let challenge = self.pending_resume_challenge.take()?;
        let age_ok = now.as_millis().saturating_sub(challenge.issued_at.as_millis()) <= RESUME_CHALLENGE_VALIDITY_SECS * 1000;
        if challenge.session_id == session_id && challenge.username == username && age_ok {
            Some(challenge.nonce)
        } else {
            None
        }
    }

    /// Checks this connection's and its identity's `hello` rate-limit
    /// buckets, honoring any outstanding failed-proof cooldown. The
    /// per-identity bucket is passed in by the admission layer, which owns
    /// one such bucket per identity.
    pub fn ratelimit_hello(&self, identity_bucket: &IdentityBucket, identity: &str, now: Timestamp) -> HelloRateLimit {
        if let Some(blocked_until) = self.rate_buckets.blocked_until
            && now.as_millis() < blocked_until.as_millis()
        {
            return HelloRateLimit::Cooldown;
        }
        if self.rate_buckets.hello.check() && identity_bucket.check(identity) {
            HelloRateLimit::Ok
        } else {
            HelloRateLimit::Cooldown
        }
    }

    /// Records a failed proof verification, scheduling an exponential
    /// cooldown: `5s * 2^(failures - 1)`, capped at 5 minutes.
    pub fn record_failed_proof(&mut self, now: Timestamp) {
        self.rate_buckets.failed_proof_count += 1;
        let exponent = self.rate_buckets.failed_proof_count.saturating_sub(1).min(6);
        let cooldown_secs = (FAILED_PROOF_BASE_COOLDOWN_SECS * 2u64.pow(exponent)).min(MAX_FAILED_PROOF_COOLDOWN_SECS);
        self.rate_buckets.blocked_until = Some(Timestamp::from_millis(now.as_millis() + cooldown_secs * 1000));
    }

    /// Drops back to `unauthenticated` after a failed proof, so the peer may
    /// restart the exchange with a fresh `hello` once its cooldown elapses.
    pub fn reset_after_failed_proof(&mut self) {
        self.auth_phase = AuthPhase::Unauthenticated;
    }
}
