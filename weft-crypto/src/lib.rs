//! Device keys and session encryption for Weft.
//!
//! Three layers, bottom up:
//! - [`DeviceKeypair`] / [`PublicKeyBytes`] — the long-term X25519 identity
//!   of one device and the Diffie-Hellman agreement between two of them
//! - [`SessionKey`] / [`EncryptedData`] — ChaCha20-Poly1305 AEAD with a
//!   random nonce, for one-shot envelopes such as the handshake challenge
//! - [`FrameCipher`] — the per-session frame layer with deterministic
//!   direction-separated counter nonces, used for all sync traffic
//!
//! Key material zeroizes on drop and never appears in `Debug` output.

mod cipher;
mod error;
mod identity;
mod session;

pub use cipher::{decrypt, encrypt, EncryptedData, SessionKey, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
pub use error::{CryptoError, CryptoResult};
pub use identity::{DeviceKeypair, PublicKeyBytes, SharedSecret, PUBLIC_KEY_SIZE};
pub use session::{
    derive_session_key, pairing_commitment, random_challenge, random_session_nonce, Direction,
    FrameCipher, CHALLENGE_SIZE, SESSION_NONCE_SIZE,
};
