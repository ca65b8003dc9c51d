//! Wire protocol messages.
//!
//! Two planes share one TCP connection:
//! 1. A plaintext envelope ([`WireMessage`]) carrying the session
//!    handshake, pairing messages, and opaque encrypted frames.
//! 2. An encrypted plane ([`SyncMessage`]) carried inside
//!    [`FrameMessage`] ciphertext once a session key is established.
//!
//! Sync proceeds per space as rounds of `SyncRequest` → `Delta` →
//! `Delta` → `Ack` until both directions report `is_final`.

use crate::error::PairingError;
use crate::model::SyncableEntity;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use weft_crdt::VectorClock;
use weft_crypto::{EncryptedData, PublicKeyBytes, CHALLENGE_SIZE, SESSION_NONCE_SIZE};
use weft_types::{DeviceId, SpaceId};

/// Protocol version for compatibility checking.
pub const PROTOCOL_VERSION: u32 = 1;

// ── Plaintext plane ─────────────────────────────────────────────────────

/// Top-level message on the plaintext plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireMessage {
    /// Session handshake opener, initiator to listener.
    Hello(HelloMessage),

    /// Handshake response carrying the encrypted challenge.
    HelloAck(HelloAckMessage),

    /// Handshake refusal; the connection closes after this.
    Reject(RejectMessage),

    /// An encrypted frame on an established session.
    Frame(FrameMessage),

    /// A pairing handshake message.
    Pair(PairingMessage),
}

/// Session handshake opener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloMessage {
    /// Protocol version.
    pub version: u32,
    /// Initiator's device id.
    pub device_id: DeviceId,
    /// Fresh per-session salt for key derivation.
    pub session_nonce: [u8; SESSION_NONCE_SIZE],
}

impl HelloMessage {
    /// Creates a Hello with a fresh session nonce.
    #[must_use]
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            device_id,
            session_nonce: weft_crypto::random_session_nonce(),
        }
    }
}

/// Handshake response from the listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloAckMessage {
    /// Protocol version.
    pub version: u32,
    /// Listener's device id.
    pub device_id: DeviceId,
    /// Random challenge sealed under the derived session key.
    pub challenge: EncryptedData,
}

impl HelloAckMessage {
    /// Creates a HelloAck.
    #[must_use]
    pub fn new(device_id: DeviceId, challenge: EncryptedData) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            device_id,
            challenge,
        }
    }
}

/// Why a handshake was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// The initiating device is not in the listener's trust store.
    UntrustedPeer,
    /// Protocol versions do not match.
    VersionMismatch {
        /// Version the listener speaks.
        expected: u32,
        /// Version the initiator offered.
        got: u32,
    },
    /// The listener already has a session with this device.
    Busy,
    /// No pairing invite is armed.
    PairingClosed,
    /// Listener-side failure not attributable to the initiator.
    Internal,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UntrustedPeer => f.write_str("untrusted peer"),
            Self::VersionMismatch { expected, got } => {
                write!(f, "version mismatch (expected {expected}, got {got})")
            }
            Self::Busy => f.write_str("peer busy"),
            Self::PairingClosed => f.write_str("no pairing invite armed"),
            Self::Internal => f.write_str("internal error"),
        }
    }
}

/// Handshake refusal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectMessage {
    /// Refusal reason.
    pub reason: RejectReason,
}

impl RejectMessage {
    /// Creates a Reject.
    #[must_use]
    pub fn new(reason: RejectReason) -> Self {
        Self { reason }
    }
}

/// An encrypted frame. The counter is bound into the AEAD nonce and
/// must strictly increase per direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameMessage {
    /// Per-direction frame counter.
    pub counter: u64,
    /// AEAD ciphertext of a serialized [`SyncMessage`].
    pub ciphertext: Vec<u8>,
}

// ── Encrypted plane ─────────────────────────────────────────────────────

/// A message carried inside frame ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncMessage {
    /// First initiator frame: echo of the listener's challenge.
    Attest(AttestMessage),

    /// Opens sync for one space with the initiator's clock.
    SyncRequest(SyncRequestMessage),

    /// A batch of entities the receiver has not seen.
    Delta(DeltaMessage),

    /// Closes one round after applying the initiator's delta.
    Ack(AckMessage),

    /// Fatal error; the session ends after this.
    Error(ErrorMessage),
}

/// Challenge echo proving the initiator derived the session key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestMessage {
    /// Decrypted challenge bytes from the HelloAck.
    pub challenge: [u8; CHALLENGE_SIZE],
}

/// Opens sync for one space.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequestMessage {
    /// Space to sync.
    pub space_id: SpaceId,
    /// Initiator's current clock for the space.
    pub vector_clock: VectorClock,
}

/// A batch of entities unseen by the receiver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaMessage {
    /// Space the batch belongs to.
    pub space_id: SpaceId,
    /// Entities whose stamps the receiver's clock does not dominate.
    pub entities: Vec<SyncableEntity>,
    /// Sender's space clock; merged by the receiver after applying.
    pub sender_clock: VectorClock,
    /// Round number, starting at 1.
    pub round: u32,
    /// True when the sender has nothing further to ship.
    pub is_final: bool,
}

/// Round acknowledgment from the responder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckMessage {
    /// Space the round covered.
    pub space_id: SpaceId,
    /// Round being acknowledged.
    pub round: u32,
    /// Entities the responder applied this round.
    pub applied: u64,
    /// Responder's space clock after applying.
    pub new_clock: VectorClock,
}

/// Fatal in-session error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Machine-readable code.
    pub code: u32,
    /// Human-readable message.
    pub message: String,
}

impl ErrorMessage {
    /// Listener-side storage or logic failure.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: 1,
            message: message.into(),
        }
    }

    /// The peer sent something the protocol does not allow here.
    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self {
            code: 2,
            message: message.into(),
        }
    }
}

// ── Pairing plane ───────────────────────────────────────────────────────

/// Pairing handshake messages, exchanged in plaintext. The PIN itself
/// never appears here; only the commitment does.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PairingMessage {
    /// Opens a pairing attempt against an armed invite.
    Request {
        /// Requester's device id.
        device_id: DeviceId,
        /// Requester's display name.
        display_name: String,
        /// Requester's long-term public key.
        public_key: PublicKeyBytes,
    },

    /// Proves the requester saw the PIN alongside the QR payload.
    Proof {
        /// `hex(SHA-256(shared_secret || pin))`.
        commitment: String,
    },

    /// Inviter's acceptance; both sides record trust after this.
    Accept {
        /// Inviter's device id.
        device_id: DeviceId,
        /// Inviter's display name.
        display_name: String,
    },

    /// Inviter's refusal; no trust is recorded on either side.
    Reject {
        /// Refusal reason.
        reason: String,
    },
}

// ── Pairing invite ──────────────────────────────────────────────────────

/// Out-of-band pairing invite, rendered as a QR payload.
///
/// The payload carries everything the other device needs to connect;
/// the PIN rides inside it so the QR alone transfers the secret over
/// the out-of-band channel. It never crosses the TCP connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingInvite {
    /// Inviter's long-term public key.
    pub public_key: PublicKeyBytes,
    /// Address the inviter's listener is reachable on.
    pub address: IpAddr,
    /// Listener port.
    pub port: u16,
    /// Six decimal digits shown beside the QR code.
    pub pin: String,
}

impl PairingInvite {
    /// Creates an invite for a listener bound at `addr`.
    #[must_use]
    pub fn new(public_key: PublicKeyBytes, addr: SocketAddr, pin: String) -> Self {
        Self {
            public_key,
            address: addr.ip(),
            port: addr.port(),
            pin,
        }
    }

    /// Socket address the invitee should dial.
    #[must_use]
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// Encodes the invite as `base64(JSON)` for QR rendering.
    #[must_use]
    pub fn qr_payload(&self) -> String {
        // Serialization of a plain struct with string/number fields
        // cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        BASE64.encode(json)
    }

    /// Decodes a QR payload produced by [`PairingInvite::qr_payload`].
    pub fn from_qr_payload(payload: &str) -> Result<Self, PairingError> {
        let bytes = BASE64
            .decode(payload.trim())
            .map_err(|e| PairingError::InvalidInvite(format!("bad base64: {e}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| PairingError::InvalidInvite(format!("bad invite json: {e}")))
    }
}

/// Generates a 6-digit decimal pairing PIN.
#[must_use]
pub fn generate_pin() -> String {
    use rand::Rng;
    let n: u32 = rand::rngs::OsRng.gen_range(0..1_000_000);
    format!("{n:06}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_carries_current_version_and_fresh_nonce() {
        let a = HelloMessage::new(DeviceId::new());
        let b = HelloMessage::new(DeviceId::new());
        assert_eq!(a.version, PROTOCOL_VERSION);
        assert_ne!(a.session_nonce, b.session_nonce);
    }

    #[test]
    fn invite_round_trips_through_qr_payload() {
        let key = PublicKeyBytes::from_bytes([7u8; 32]);
        let invite = PairingInvite::new(key, "192.168.1.20:7465".parse().unwrap(), "042917".into());
        let decoded = PairingInvite::from_qr_payload(&invite.qr_payload()).unwrap();
        assert_eq!(decoded.public_key, key);
        assert_eq!(decoded.socket_addr(), invite.socket_addr());
        assert_eq!(decoded.pin, "042917");
    }

    #[test]
    fn malformed_qr_payload_is_rejected() {
        let err = PairingInvite::from_qr_payload("not base64!!").unwrap_err();
        assert!(matches!(err, PairingError::InvalidInvite(_)));

        let valid_b64_bad_json = BASE64.encode(b"{\"pin\": 3}");
        let err = PairingInvite::from_qr_payload(&valid_b64_bad_json).unwrap_err();
        assert!(matches!(err, PairingError::InvalidInvite(_)));
    }

    #[test]
    fn pin_is_six_decimal_digits() {
        for _ in 0..32 {
            let pin = generate_pin();
            assert_eq!(pin.len(), 6);
            assert!(pin.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn wire_message_serializes_with_variant_tag() {
        let msg = WireMessage::Reject(RejectMessage::new(RejectReason::UntrustedPeer));
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("Reject"));
        let back: WireMessage = serde_json::from_str(&json).unwrap();
        match back {
            WireMessage::Reject(r) => assert_eq!(r.reason, RejectReason::UntrustedPeer),
            other => panic!("Expected Reject, got {other:?}"),
        }
    }
}
