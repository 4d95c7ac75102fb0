//! Authenticated encryption (XSalsa20-Poly1305 "secretbox") and the labeled
//! key-derivation function that turns an SRP shared secret into a secretbox
//! key.

use crypto_secretbox::{
    AeadCore, KeyInit, XSalsa20Poly1305,
    aead::{Aead, OsRng},
};

/// A 32-byte secretbox key, derived from the SRP shared secret. Never
/// constructed directly from untrusted input; see [`derive_session_key`].
#[derive(Clone)]
pub struct SessionKey([u8; 32]);

/// Context string for the labeled KDF, so a key derived here can never
/// collide with a key derived for an unrelated purpose from the same input
/// material.
const SESSION_KEY_CONTEXT: &str = "relay session-transport secretbox key v1";

impl SessionKey {
    /// Derives a session key from an SRP shared secret `S`.
    pub fn derive_session_key(shared_secret: &[u8]) -> Self {
        Self(blake3::derive_key(SESSION_KEY_CONTEXT, shared_secret))
    }

    /// Wraps raw key bytes directly, e.g. when reloading a [`StoredSession`]
    /// persisted previously.
    ///
    /// [`StoredSession`]: relay_types::model::StoredSession
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the raw key bytes, for persistence.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    fn cipher(&self) -> XSalsa20Poly1305 {
        XSalsa20Poly1305::new((&self.0).into())
    }
}

/// An encrypted message and the nonce used to produce it.
pub struct Sealed {
    /// The 24-byte nonce, freshly drawn for this message.
    pub nonce: [u8; 24],
    /// The ciphertext, including the Poly1305 authentication tag.
    pub ciphertext: Vec<u8>,
}

/// Errors from the encryption layer.
#[derive(Debug, thiserror::Error)]
pub enum SecretboxError {
    /// Decryption failed: wrong key, tampered ciphertext, or wrong nonce.
    #[error("decryption failed")]
    DecryptionFailed,
}

/// Encrypts `plaintext` under `key`, drawing a fresh random nonce.
pub fn seal(key: &SessionKey, plaintext: &[u8]) -> Sealed {
    let cipher = key.cipher();
    let nonce = XSalsa20Poly1305::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .expect("encryption with a fresh nonce never fails");
    Sealed {
        nonce: nonce.into(),
        ciphertext,
    }
}

/// Encrypts `plaintext` under `key` using a caller-supplied `nonce`, rather
/// than drawing a fresh random one. Used for the session-resume proof
/// (§4.B), where the nonce is the single-use challenge the server issued —
/// reusing it as the secretbox nonce is what makes the proof bound to that
/// specific challenge.
pub fn seal_with_nonce(key: &SessionKey, nonce: &[u8; 24], plaintext: &[u8]) -> Vec<u8> {
    let cipher = key.cipher();
    cipher.encrypt(nonce.into(), plaintext).expect("encryption never fails given a valid key and nonce")
}

/// Decrypts `ciphertext` under `key` using the given `nonce`.
pub fn open(key: &SessionKey, nonce: &[u8; 24], ciphertext: &[u8]) -> Result<Vec<u8>, SecretboxError> {
    let cipher = key.cipher();
    cipher
        .decrypt(nonce.into(), ciphertext)
        .map_err(|_| SecretboxError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_then_open_round_trips() {
        let key = SessionKey::derive_session_key(b"shared secret material");
        let sealed = seal(&key, b"hello relay");
        let opened = open(&key, &sealed.nonce, &sealed.ciphertext).unwrap();
        assert_eq!(opened, b"hello relay");
    }

    #[test]
    fn wrong_key_fails_to_open() {
        let key_a = SessionKey::derive_session_key(b"alice");
        let key_b = SessionKey::derive_session_key(b"bob");
        let sealed = seal(&key_a, b"secret");
        let err = open(&key_b, &sealed.nonce, &sealed.ciphertext).unwrap_err();
        assert!(matches!(err, SecretboxError::DecryptionFailed));
    }

    #[test]
    fn tampered_ciphertext_fails_to_open() {
        let key = SessionKey::derive_session_key(b"alice");
        let mut sealed = seal(&key, b"secret");
        let last = sealed.ciphertext.len() - 1;
        sealed.ciphertext[last] ^= 0xff;
        assert!(open(&key, &sealed.nonce, &sealed.ciphertext).is_err());
    }
}
