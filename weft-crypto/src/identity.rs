//! Long-term X25519 device identity keys.
//!
//! Every device generates one static keypair at install time. Pairing pins
//! the peer's public key; every later session derives its encryption key
//! from the static-static Diffie-Hellman agreement between the two pinned
//! keys, so possession of the long-term secret is what a session proves.

use crate::error::{CryptoError, CryptoResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of an X25519 public key in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// An X25519 public key, serialized as lowercase hex.
///
/// Hex keeps the key printable in QR payloads, TXT records and SQLite
/// columns without a second encoding step.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKeyBytes([u8; PUBLIC_KEY_SIZE]);

impl PublicKeyBytes {
    /// Wraps raw key bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    /// Lowercase hex form.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses the lowercase hex form.
    pub fn from_hex(s: &str) -> CryptoResult<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| CryptoError::KeyExchange(format!("invalid public key hex: {e}")))?;
        let bytes: [u8; PUBLIC_KEY_SIZE] =
            bytes
                .try_into()
                .map_err(|v: Vec<u8>| CryptoError::InvalidKeyLength {
                    expected: PUBLIC_KEY_SIZE,
                    actual: v.len(),
                })?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for PublicKeyBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for PublicKeyBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKeyBytes({}…)", &self.to_hex()[..8])
    }
}

impl Serialize for PublicKeyBytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKeyBytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// The result of an X25519 agreement; zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; 32]);

impl SharedSecret {
    /// Raw secret bytes, for key derivation only.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedSecret")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// A device's long-term X25519 keypair.
#[derive(Clone)]
pub struct DeviceKeypair {
    secret: StaticSecret,
}

impl DeviceKeypair {
    /// Generates a fresh keypair from the OS entropy source.
    pub fn generate() -> CryptoResult<Self> {
        let mut seed = [0u8; 32];
        getrandom::getrandom(&mut seed)
            .map_err(|e| CryptoError::KeyExchange(format!("entropy source failed: {e}")))?;
        let secret = StaticSecret::from(seed);
        seed.zeroize();
        Ok(Self { secret })
    }

    /// Restores a keypair from persisted secret bytes.
    #[must_use]
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self {
            secret: StaticSecret::from(bytes),
        }
    }

    /// Secret bytes for private persistence.
    #[must_use]
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// The public half of this keypair.
    #[must_use]
    pub fn public_key(&self) -> PublicKeyBytes {
        PublicKeyBytes(*X25519PublicKey::from(&self.secret).as_bytes())
    }

    /// X25519 agreement with a peer's public key.
    ///
    /// Rejects non-contributory results (e.g. a malicious all-zero peer
    /// key), so a degenerate shared secret can never key a session.
    pub fn diffie_hellman(&self, peer_public: &PublicKeyBytes) -> CryptoResult<SharedSecret> {
        let peer = X25519PublicKey::from(*peer_public.as_bytes());
        let shared = self.secret.diffie_hellman(&peer);
        if !shared.was_contributory() {
            return Err(CryptoError::KeyExchange(
                "peer public key produced a non-contributory shared secret".to_string(),
            ));
        }
        Ok(SharedSecret(*shared.as_bytes()))
    }
}

impl fmt::Debug for DeviceKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceKeypair")
            .field("public", &self.public_key())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_sides_derive_the_same_secret() {
        let a = DeviceKeypair::generate().unwrap();
        let b = DeviceKeypair::generate().unwrap();

        let ab = a.diffie_hellman(&b.public_key()).unwrap();
        let ba = b.diffie_hellman(&a.public_key()).unwrap();
        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }

    #[test]
    fn distinct_pairs_disagree() {
        let a = DeviceKeypair::generate().unwrap();
        let b = DeviceKeypair::generate().unwrap();
        let c = DeviceKeypair::generate().unwrap();

        let ab = a.diffie_hellman(&b.public_key()).unwrap();
        let ac = a.diffie_hellman(&c.public_key()).unwrap();
        assert_ne!(ab.as_bytes(), ac.as_bytes());
    }

    #[test]
    fn all_zero_peer_key_is_rejected() {
        let a = DeviceKeypair::generate().unwrap();
        let degenerate = PublicKeyBytes::from_bytes([0u8; PUBLIC_KEY_SIZE]);
        assert!(a.diffie_hellman(&degenerate).is_err());
    }

    #[test]
    fn keypair_roundtrips_through_secret_bytes() {
        let original = DeviceKeypair::generate().unwrap();
        let restored = DeviceKeypair::from_secret_bytes(original.secret_bytes());
        assert_eq!(original.public_key(), restored.public_key());
    }

    #[test]
    fn public_key_hex_roundtrip() {
        let key = DeviceKeypair::generate().unwrap().public_key();
        let parsed = PublicKeyBytes::from_hex(&key.to_hex()).unwrap();
        assert_eq!(key, parsed);
    }

    #[test]
    fn public_key_rejects_wrong_length() {
        let err = PublicKeyBytes::from_hex("abcd").unwrap_err();
        assert!(matches!(err, CryptoError::InvalidKeyLength { .. }));
    }

    #[test]
    fn debug_output_hides_secrets() {
        let keypair = DeviceKeypair::generate().unwrap();
        let shared = keypair
            .diffie_hellman(&DeviceKeypair::generate().unwrap().public_key())
            .unwrap();
        let rendered = format!("{keypair:?} {shared:?}");
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains(&hex::encode(keypair.secret_bytes())));
    }
}
