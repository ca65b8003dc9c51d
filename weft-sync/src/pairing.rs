//! QR-plus-PIN pairing handshake.
//!
//! The inviter renders a [`PairingInvite`] (public key, address, PIN)
//! as a QR payload and arms its listener for exactly one attempt. The
//! invitee connects and proves it saw the PIN by sending
//! `hex(SHA-256(shared_secret || pin))`; computing that commitment
//! requires both the X25519 agreement and the out-of-band PIN, so a
//! network observer who scanned neither learns nothing.
//!
//! A wrong commitment is rejected on the wire and neither side records
//! trust. On success both sides pin each other's keys first-use style.

use crate::codec;
use crate::error::{PairingError, SyncError, SyncResult};
use crate::model::TrustedPeer;
use crate::protocol::{PairingInvite, PairingMessage, RejectMessage, WireMessage};
use crate::store::blocking;
use crate::trust::{DeviceIdentity, TrustStore};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, warn};
use weft_crypto::pairing_commitment;

/// Wire reason for a commitment mismatch; the invitee maps it back to
/// [`PairingError::PinMismatch`].
const REJECT_PIN_MISMATCH: &str = "pin mismatch";

/// Runs the inviter side against an already-read opening message.
///
/// Called by the listener when a `Pair` message arrives while an
/// invite is armed. Records trust only after the commitment verifies.
pub(crate) async fn respond<S>(
    io: &mut S,
    identity: &DeviceIdentity,
    trust: &TrustStore,
    invite: &PairingInvite,
    first: PairingMessage,
    timeout: Duration,
) -> SyncResult<TrustedPeer>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let PairingMessage::Request {
        device_id,
        display_name,
        public_key,
    } = first
    else {
        return Err(SyncError::Protocol(
            "pairing must open with a Request".to_string(),
        ));
    };

    let shared = identity.keypair.diffie_hellman(&public_key)?;
    let expected = pairing_commitment(&shared, &invite.pin);

    let proof: WireMessage = codec::read_message_timeout(io, timeout).await?;
    let WireMessage::Pair(PairingMessage::Proof { commitment }) = proof else {
        return Err(SyncError::Protocol("expected pairing Proof".to_string()));
    };

    if commitment != expected {
        warn!(peer = %device_id.short(), "pairing commitment mismatch");
        let reject = PairingMessage::Reject {
            reason: REJECT_PIN_MISMATCH.to_string(),
        };
        codec::write_message(io, &WireMessage::Pair(reject)).await?;
        return Err(SyncError::Pairing(PairingError::PinMismatch));
    }

    let trust_store = trust.clone();
    let peer_name = display_name.clone();
    let trusted = match blocking(move || {
        trust_store.trust_peer(device_id, &peer_name, &public_key)
    })
    .await
    {
        Ok(peer) => peer,
        Err(e) => {
            let reject = PairingMessage::Reject {
                reason: "trust refused".to_string(),
            };
            codec::write_message(io, &WireMessage::Pair(reject)).await?;
            return Err(e);
        }
    };

    let accept = PairingMessage::Accept {
        device_id: identity.device_id,
        display_name: identity.display_name.clone(),
    };
    codec::write_message(io, &WireMessage::Pair(accept)).await?;

    info!(peer = %trusted.device_id.short(), name = %trusted.display_name, "paired new device");
    Ok(trusted)
}

/// Runs the invitee side over a fresh connection to the invite's
/// address.
pub(crate) async fn request<S>(
    io: &mut S,
    identity: &DeviceIdentity,
    trust: &TrustStore,
    invite: &PairingInvite,
    timeout: Duration,
) -> SyncResult<TrustedPeer>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let request = PairingMessage::Request {
        device_id: identity.device_id,
        display_name: identity.display_name.clone(),
        public_key: identity.keypair.public_key(),
    };
    codec::write_message(io, &WireMessage::Pair(request)).await?;

    let shared = identity.keypair.diffie_hellman(&invite.public_key)?;
    let proof = PairingMessage::Proof {
        commitment: pairing_commitment(&shared, &invite.pin),
    };
    codec::write_message(io, &WireMessage::Pair(proof)).await?;

    let reply: WireMessage = codec::read_message_timeout(io, timeout).await?;
    let (peer_device, peer_name) = match reply {
        WireMessage::Pair(PairingMessage::Accept {
            device_id,
            display_name,
        }) => (device_id, display_name),
        WireMessage::Pair(PairingMessage::Reject { reason }) => {
            let err = if reason == REJECT_PIN_MISMATCH {
                PairingError::PinMismatch
            } else {
                PairingError::Rejected(reason)
            };
            return Err(SyncError::Pairing(err));
        }
        WireMessage::Reject(RejectMessage { reason }) => {
            return Err(SyncError::Pairing(PairingError::Rejected(
                reason.to_string(),
            )));
        }
        other => {
            return Err(SyncError::Protocol(format!(
                "unexpected pairing reply: {other:?}"
            )));
        }
    };

    let trust_store = trust.clone();
    let invite_key = invite.public_key;
    let name = peer_name.clone();
    let trusted =
        blocking(move || trust_store.trust_peer(peer_device, &name, &invite_key)).await?;

    info!(peer = %trusted.device_id.short(), name = %trusted.display_name, "paired with inviter");
    Ok(trusted)
}

/// Maps a pairing-flow failure onto the public [`PairingError`] surface.
pub(crate) fn into_pairing_error(err: SyncError) -> PairingError {
    match err {
        SyncError::Pairing(e) => e,
        SyncError::KeyConflict(_) => PairingError::KeyConflict,
        other => PairingError::Failed(other.to_string()),
    }
}
