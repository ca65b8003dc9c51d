//! Session key derivation and framed transport encryption.
//!
//! A session key is derived from the static Diffie-Hellman secret and a
//! per-session nonce, so compromising one session never exposes another.
//! Frames are sealed with deterministic counter nonces; the counter doubles
//! as the replay sequence number checked by the transport layer.

use crate::cipher::{EncryptedData, SessionKey, KEY_SIZE, NONCE_SIZE};
use crate::error::{CryptoError, CryptoResult};
use crate::identity::SharedSecret;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};

/// Size of the per-session nonce carried in the handshake.
pub const SESSION_NONCE_SIZE: usize = 16;

/// Size of the random handshake challenge.
pub const CHALLENGE_SIZE: usize = 32;

/// Domain separation label for session key derivation.
const SESSION_INFO: &[u8] = b"weft session v1";

/// Which way a frame travels; bound into the frame nonce so the two
/// directions can never collide on a counter value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// From the device that opened the connection.
    Initiator,
    /// From the device that accepted the connection.
    Responder,
}

impl Direction {
    /// The opposite direction.
    #[must_use]
    pub fn reverse(self) -> Self {
        match self {
            Self::Initiator => Self::Responder,
            Self::Responder => Self::Initiator,
        }
    }

    fn tag(self) -> u8 {
        match self {
            Self::Initiator => 0x01,
            Self::Responder => 0x02,
        }
    }
}

/// Derives a session key from the long-term shared secret and a fresh
/// per-session nonce via HKDF-SHA256.
pub fn derive_session_key(
    shared: &SharedSecret,
    session_nonce: &[u8; SESSION_NONCE_SIZE],
) -> CryptoResult<SessionKey> {
    let hkdf = Hkdf::<Sha256>::new(Some(session_nonce), shared.as_bytes());
    let mut okm = [0u8; KEY_SIZE];
    hkdf.expand(SESSION_INFO, &mut okm)
        .map_err(|e| CryptoError::KeyDerivation(format!("hkdf expand failed: {e}")))?;
    Ok(SessionKey::from_bytes(okm))
}

/// Commitment proving knowledge of both the shared secret and the pairing
/// PIN, as lowercase hex of SHA-256(secret || pin).
///
/// The PIN itself never crosses the wire; only this digest does.
#[must_use]
pub fn pairing_commitment(shared: &SharedSecret, pin: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(shared.as_bytes());
    hasher.update(pin.as_bytes());
    hex::encode(hasher.finalize())
}

/// Fresh random per-session nonce.
#[must_use]
pub fn random_session_nonce() -> [u8; SESSION_NONCE_SIZE] {
    let mut nonce = [0u8; SESSION_NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Fresh random handshake challenge.
#[must_use]
pub fn random_challenge() -> [u8; CHALLENGE_SIZE] {
    let mut challenge = [0u8; CHALLENGE_SIZE];
    OsRng.fill_bytes(&mut challenge);
    challenge
}

/// Seals and opens transport frames under one session key.
///
/// The nonce is built from the direction tag and the frame counter, never
/// from randomness, so each (direction, counter) pair keys exactly one
/// frame for the lifetime of the session.
#[derive(Clone)]
pub struct FrameCipher {
    key: SessionKey,
}

impl FrameCipher {
    /// Creates a cipher over a derived session key.
    #[must_use]
    pub fn new(key: SessionKey) -> Self {
        Self { key }
    }

    fn nonce_for(direction: Direction, counter: u64) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[0] = direction.tag();
        nonce[4..].copy_from_slice(&counter.to_be_bytes());
        nonce
    }

    /// Encrypts one frame travelling in `direction` with sequence `counter`.
    pub fn seal(
        &self,
        direction: Direction,
        counter: u64,
        plaintext: &[u8],
    ) -> CryptoResult<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(self.key.as_bytes()));
        let nonce = Self::nonce_for(direction, counter);
        cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| CryptoError::Encryption(format!("frame encryption failed: {e}")))
    }

    /// Decrypts one frame; fails if the key, direction or counter does not
    /// match what the sender sealed with.
    pub fn open(
        &self,
        direction: Direction,
        counter: u64,
        ciphertext: &[u8],
    ) -> CryptoResult<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(self.key.as_bytes()));
        let nonce = Self::nonce_for(direction, counter);
        cipher.decrypt(Nonce::from_slice(&nonce), ciphertext).map_err(|_| {
            CryptoError::Decryption("frame decryption failed (wrong key or tampered data)".to_string())
        })
    }

    /// Encrypts an out-of-band payload (such as the handshake challenge)
    /// with a random nonce instead of a counter.
    pub fn seal_detached(&self, plaintext: &[u8]) -> CryptoResult<EncryptedData> {
        crate::cipher::encrypt(&self.key, plaintext)
    }

    /// Decrypts an out-of-band payload sealed by [`Self::seal_detached`].
    pub fn open_detached(&self, data: &EncryptedData) -> CryptoResult<Vec<u8>> {
        crate::cipher::decrypt(&self.key, data)
    }
}

impl std::fmt::Debug for FrameCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCipher").finish_non_exhaustive()
    }
}
