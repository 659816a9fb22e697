//! The cryptographic primitive collaborator the core server calls as a
//! black box: signature verification over an already-loaded public key,
//! and cryptographically strong random bytes for id/token generation.
//!
//! The core never inspects key material beyond what it needs to call
//! [`PublicKey::verify`]; algorithm choice and encoding live entirely in
//! this crate.

use ring::signature::{self, UnparsedPublicKey};

/// An asymmetric verification key, opaque to every caller outside this
/// crate except for its raw on-disk encoding.
#[derive(Debug, Clone)]
pub struct PublicKey {
    raw: Vec<u8>,
}

impl PublicKey {
    /// Load a public key from its on-disk byte encoding (Ed25519, raw
    /// 32-byte form). The on-disk loader itself is out of scope here;
    /// this only interprets bytes already read from a user-key file.
    pub fn load(raw: Vec<u8>) -> Self {
        Self { raw }
    }

    /// Raw bytes as persisted to `users/<hex-userid>.pem`.
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// Verify `signature` over `message`. Any malformed key or signature
    /// is simply a verification failure, not a distinguishable error —
    /// the core only ever needs the boolean.
    pub fn verify(&self, signature: &[u8], message: &[u8]) -> bool {
        let key = UnparsedPublicKey::new(&signature::ED25519, &self.raw);
        key.verify(message, signature).is_ok()
    }
}

/// Fill a freshly allocated buffer with cryptographically strong random
/// bytes, for UserId/RegKey/CallId generation.
pub fn random_bytes(len: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut buf = vec![0u8; len];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    buf
}
