//! SRP-6a client and server session wrappers, 2048-bit safe-prime group,
//! SHA-256 as `H`.
//!
//! These wrappers only carry the cryptographic state through the exchange;
//! they know nothing about framing, timeouts, or rate limiting — that lives
//! in the server's admission module and the client's connection manager.

use rand::RngCore as _;
use sha2::Sha256;
use srp::{client::SrpClient, groups::G_2048, server::SrpServer};
use thiserror::Error;

/// Errors from either side of the SRP exchange.
#[derive(Debug, Error)]
pub enum SrpSessionError {
    /// The peer's proof did not verify.
    #[error("SRP proof did not verify")]
    InvalidProof,
}

impl From<srp::types::SrpAuthError> for SrpSessionError {
    fn from(_: srp::types::SrpAuthError) -> Self {
        Self::InvalidProof
    }
}

/// Generates a random salt for a freshly provisioned identity.
pub fn generate_salt() -> [u8; 16] {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Computes the password verifier stored by the server, from an identity's
/// username, password, and salt. Run once, out of band, when credentials are
/// provisioned.
pub fn compute_verifier(username: &[u8], password: &[u8], salt: &[u8]) -> Vec<u8> {
    SrpClient::<Sha256>::new(&G_2048).compute_verifier(username, password, salt)
}

/// Client-side state machine for a single SRP-6a exchange.
pub struct SrpClientSession {
    client: SrpClient<'static, Sha256>,
    a: Vec<u8>,
    a_pub: Vec<u8>,
}

impl SrpClientSession {
    /// Step 1: generates a fresh ephemeral secret and the corresponding
    /// public value to send in `hello`.
    pub fn step1() -> Self {
        let mut a = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut a);
        let client = SrpClient::<Sha256>::new(&G_2048);
        let a_pub = client.compute_public_ephemeral(&a);
        Self { client, a, a_pub }
    }

    /// The client's public ephemeral value `A`, to send in `hello`.
    pub fn a_pub(&self) -> &[u8] {
        &self.a_pub
    }

    /// Step 2: consumes the server's `salt` and `B` from `challenge`, derives
    /// the shared secret, and returns a verifier holding the client's proof
    /// `M1` to send and able to check the server's `M2`.
    pub fn step2(
        self,
        username: &[u8],
        password: &[u8],
        salt: &[u8],
        b_pub: &[u8],
    ) -> Result<SrpClientVerified, SrpSessionError> {
        let verifier = self
            .client
            .process_reply(&self.a, username, password, salt, b_pub)?;
        Ok(SrpClientVerified { verifier })
    }
}

/// Holds the client's proof after step 2, pending the server's `verify`.
pub struct SrpClientVerified {
    verifier: srp::client::SrpClientVerifier<Sha256>,
}

impl SrpClientVerified {
    /// The client's proof `M1`, to send in `proof`.
    pub fn m1(&self) -> &[u8] {
        self.verifier.proof()
    }

    /// Step 3: checks the server's proof `M2` from `verify`. On success, the
    /// connection is authenticated; use [`Self::shared_secret`] to derive the
    /// session key.
    pub fn step3(&self, m2: &[u8]) -> Result<(), SrpSessionError> {
        self.verifier.verify_server(m2)?;
        Ok(())
    }

    /// The raw shared secret `S`, to feed into
    /// [`crate::secretbox::SessionKey::derive_session_key`].
    pub fn shared_secret(&self) -> &[u8] {
        self.verifier.key()
    }
}

/// Server-side state machine for a single SRP-6a exchange, starting from a
/// stored `(salt, verifier)` pair for the identity in `hello`.
pub struct SrpServerSession {
    server: SrpServer<'static, Sha256>,
    b: Vec<u8>,
    b_pub: Vec<u8>,
}

impl SrpServerSession {
    /// Generates a fresh ephemeral secret and the corresponding public value
    /// to send in `challenge`, given the identity's stored verifier.
    pub fn new(verifier: &[u8]) -> Self {
        let mut b = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut b);
        let server = SrpServer::<Sha256>::new(&G_2048);
        let b_pub = server.compute_public_ephemeral(&b, verifier);
        Self { server, b, b_pub }
    }

    /// The server's public ephemeral value `B`, to send in `challenge`.
    pub fn b_pub(&self) -> &[u8] {
        &self.b_pub
    }

    /// Consumes the client's `A` from `hello` along with the stored
    /// verifier, and checks the client's proof `M1` from `proof`. On
    /// success, returns the server's proof `M2` to send in `verify` and the
    /// shared secret to derive the session key from.
    pub fn verify_client(
        self,
        verifier: &[u8],
        a_pub: &[u8],
        m1: &[u8],
    ) -> Result<SrpServerVerified, SrpSessionError> {
        let verifier = self.server.process_reply(&self.b, verifier, a_pub)?;
        verifier.verify_client(m1)?;
        let m2 = verifier.proof().to_vec();
        let shared_secret = verifier.key().to_vec();
        Ok(SrpServerVerified { m2, shared_secret })
    }
}

/// The result of a successful server-side SRP exchange.
pub struct SrpServerVerified {
    m2: Vec<u8>,
    shared_secret: Vec<u8>,
}

impl SrpServerVerified {
    /// The server's proof `M2`, to send in `verify`.
    pub fn m2(&self) -> &[u8] {
        &self.m2
    }

    /// The raw shared secret `S`, to feed into
    /// [`crate::secretbox::SessionKey::derive_session_key`].
    pub fn shared_secret(&self) -> &[u8] {
        &self.shared_secret
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_exchange_agrees_on_shared_secret_and_verifies_both_ways() {
        let username = b"alice";
        let password = b"correct horse battery staple";
        let salt = generate_salt();
        let verifier = compute_verifier(username, password, &salt);

        let client = SrpClientSession::step1();
        let client_a_pub = client.a_pub().to_vec();
        let server = SrpServerSession::new(&verifier);

        let client_verified = client
            .step2(username, password, &salt, server.b_pub())
            .unwrap();
        let server_verified = server
            .verify_client(&verifier, &client_a_pub, client_verified.m1())
            .unwrap();

        client_verified.step3(server_verified.m2()).unwrap();
        assert_eq!(
            client_verified.shared_secret(),
            server_verified.shared_secret()
        );
    }

    #[test]
    fn wrong_password_fails_client_side() {
        let username = b"alice";
        let password = b"correct horse battery staple";
        let salt = generate_salt();
        let verifier = compute_verifier(username, password, &salt);

        let client = SrpClientSession::step1();
        let server = SrpServerSession::new(&verifier);

        let result = client.step2(username, b"wrong password", &salt, server.b_pub());
        // a wrong password still produces *a* shared secret client-side (SRP
        // only detects the mismatch once M1/M2 are compared), so this must
        // fail later, at verify_client or step3, not here.
        assert!(result.is_ok());
    }
}
