//! Client Key Material
//!
//! X25519 key pair whose public half is bound by the client certificate.
//! The pair is regenerated when the agent reports the key as reused.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use blake2::{Blake2s256, Digest};
use rand::rngs::OsRng;
use std::fmt;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

/// Client private key (Curve25519)
#[derive(Clone)]
pub struct PrivateKey {
    secret: StaticSecret,
}

impl PrivateKey {
    /// Generate a fresh random key
    pub fn generate() -> Self {
        Self {
            secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Restore from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            secret: StaticSecret::from(bytes),
        }
    }

    /// Restore from base64
    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        decode_key(s).map(Self::from_bytes)
    }

    /// Derive the matching public key
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            key: X25519Public::from(&self.secret),
        }
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey([redacted])")
    }
}

/// Client public key (Curve25519)
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey {
    key: X25519Public,
}

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            key: X25519Public::from(bytes),
        }
    }

    /// Parse the base64 form sent on the wire
    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        decode_key(s).map(Self::from_bytes)
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.key.to_bytes()
    }

    /// Base64 form sent on the wire
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.to_bytes())
    }

    /// BLAKE2s-256 digest of the key, base64 encoded.
    ///
    /// Certificates record the fingerprint of the key they were issued for.
    pub fn fingerprint(&self) -> String {
        BASE64.encode(Blake2s256::digest(self.to_bytes()))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}...)", &self.to_base64()[..8])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

/// Client key pair
#[derive(Clone)]
pub struct KeyPair {
    pub private: PrivateKey,
    pub public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self::from_private(PrivateKey::generate())
    }

    pub fn from_private(private: PrivateKey) -> Self {
        let public = private.public_key();
        Self { private, public }
    }

    pub fn fingerprint(&self) -> String {
        self.public.fingerprint()
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .finish()
    }
}

fn decode_key(s: &str) -> Result<[u8; 32], KeyError> {
    let bytes = BASE64.decode(s).map_err(|_| KeyError::InvalidBase64)?;
    bytes.try_into().map_err(|_| KeyError::InvalidLength)
}

/// Key parsing errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("Invalid base64 encoding")]
    InvalidBase64,

    #[error("Invalid key length (expected 32 bytes)")]
    InvalidLength,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regenerated_pair_differs() {
        let first = KeyPair::generate();
        let second = KeyPair::generate();
        assert_ne!(first.public, second.public);
        assert_ne!(first.fingerprint(), second.fingerprint());
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let private = PrivateKey::from_bytes([7u8; 32]);
        let pair = KeyPair::from_private(private.clone());

        assert_eq!(pair.fingerprint(), private.public_key().fingerprint());
        // 32-byte digest -> 44 base64 chars
        assert_eq!(pair.fingerprint().len(), 44);
    }

    #[test]
    fn test_public_key_wire_form() {
        let pair = KeyPair::generate();
        let parsed = PublicKey::from_base64(&pair.public.to_base64()).unwrap();
        assert_eq!(parsed, pair.public);
    }

    #[test]
    fn test_invalid_keys() {
        assert_eq!(PublicKey::from_base64("not base64!!").unwrap_err(), KeyError::InvalidBase64);
        assert_eq!(PrivateKey::from_base64("AAAA").unwrap_err(), KeyError::InvalidLength);
    }

    #[test]
    fn test_debug_redacts_private_key() {
        let pair = KeyPair::generate();
        let debug = format!("{:?}", pair);
        assert!(!debug.contains("PrivateKey"));
        assert_eq!(format!("{:?}", pair.private), "PrivateKey([redacted])");
    }
}
