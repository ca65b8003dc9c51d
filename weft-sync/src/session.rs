//! Encrypted session transport over any async byte stream.
//!
//! The handshake is mutual. The initiator's `Hello` carries a fresh
//! session nonce; both sides derive the session key from their X25519
//! shared secret and that nonce. The listener proves itself by sealing
//! a random challenge under the derived key, and the initiator proves
//! itself by echoing the challenge back as its first encrypted frame.
//! Neither side's long-term secret ever crosses the wire.
//!
//! After the handshake every message travels as an AEAD frame whose
//! counter is bound into the nonce and must strictly increase per
//! direction. A counter at or below one already accepted terminates
//! the session with [`SyncError::ReplayDetected`].

use crate::codec;
use crate::error::{SyncError, SyncResult};
use crate::model::TrustedPeer;
use crate::protocol::{
    AttestMessage, FrameMessage, HelloAckMessage, HelloMessage, RejectMessage, RejectReason,
    SyncMessage, WireMessage, PROTOCOL_VERSION,
};
use crate::store::blocking;
use crate::trust::{DeviceIdentity, TrustStore};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};
use weft_crypto::{derive_session_key, Direction, FrameCipher, CHALLENGE_SIZE};
use weft_types::DeviceId;

/// An authenticated, encrypted message channel with one peer.
pub struct SecureChannel<S> {
    io: S,
    cipher: FrameCipher,
    send_direction: Direction,
    next_send: u64,
    last_recv: Option<u64>,
    peer_device: DeviceId,
}

impl<S> SecureChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Dials the handshake as the initiator.
    ///
    /// `peer` must already be in the trust store; the session key is
    /// derived against its pinned public key, so a listener holding a
    /// different secret cannot produce a readable challenge.
    pub async fn initiate(
        mut io: S,
        identity: &DeviceIdentity,
        peer: &TrustedPeer,
        timeout: Duration,
    ) -> SyncResult<Self> {
        let hello = HelloMessage::new(identity.device_id);
        let session_nonce = hello.session_nonce;
        codec::write_message(&mut io, &WireMessage::Hello(hello)).await?;

        let reply: WireMessage = codec::read_message_timeout(&mut io, timeout).await?;
        let ack = match reply {
            WireMessage::HelloAck(ack) => ack,
            WireMessage::Reject(reject) => return Err(reject_to_error(reject)),
            other => {
                return Err(SyncError::Protocol(format!(
                    "expected HelloAck, got {}",
                    wire_name(&other)
                )));
            }
        };
        if ack.version != PROTOCOL_VERSION {
            return Err(SyncError::Protocol(format!(
                "version mismatch (expected {PROTOCOL_VERSION}, got {})",
                ack.version
            )));
        }
        if ack.device_id != peer.device_id {
            return Err(SyncError::Protocol(format!(
                "responder identified as {} but {} was dialed",
                ack.device_id.short(),
                peer.device_id.short()
            )));
        }

        let shared = identity.keypair.diffie_hellman(&peer.public_key)?;
        let key = derive_session_key(&shared, &session_nonce)?;
        let cipher = FrameCipher::new(key);

        let challenge_bytes = cipher.open_detached(&ack.challenge)?;
        let challenge: [u8; CHALLENGE_SIZE] = challenge_bytes
            .try_into()
            .map_err(|_| SyncError::Protocol("challenge has wrong length".to_string()))?;

        let mut channel = Self {
            io,
            cipher,
            send_direction: Direction::Initiator,
            next_send: 0,
            last_recv: None,
            peer_device: peer.device_id,
        };
        channel
            .send(&SyncMessage::Attest(AttestMessage { challenge }))
            .await?;

        debug!(peer = %peer.device_id.short(), "session established (initiator)");
        Ok(channel)
    }

    /// Answers the handshake as the listener, given the already-read
    /// `Hello`.
    ///
    /// The initiating device must be trusted; an unknown device is
    /// refused on the wire and the error carries its id. The channel
    /// is only returned once the initiator's challenge echo verifies.
    pub async fn accept(
        mut io: S,
        identity: &DeviceIdentity,
        hello: HelloMessage,
        trust: &TrustStore,
        timeout: Duration,
    ) -> SyncResult<Self> {
        if hello.version != PROTOCOL_VERSION {
            let reject = RejectMessage::new(RejectReason::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: hello.version,
            });
            codec::write_message(&mut io, &WireMessage::Reject(reject)).await?;
            return Err(SyncError::Protocol(format!(
                "version mismatch (expected {PROTOCOL_VERSION}, got {})",
                hello.version
            )));
        }

        let trust = trust.clone();
        let device_id = hello.device_id;
        let peer = blocking(move || trust.lookup_peer(&device_id)).await?;
        let Some(peer) = peer else {
            warn!(peer = %device_id.short(), "refusing session from untrusted device");
            let reject = RejectMessage::new(RejectReason::UntrustedPeer);
            codec::write_message(&mut io, &WireMessage::Reject(reject)).await?;
            return Err(SyncError::UntrustedPeer(device_id.to_string()));
        };

        let shared = identity.keypair.diffie_hellman(&peer.public_key)?;
        let key = derive_session_key(&shared, &hello.session_nonce)?;
        let cipher = FrameCipher::new(key);

        let challenge = weft_crypto::random_challenge();
        let sealed = cipher.seal_detached(&challenge)?;
        let ack = HelloAckMessage::new(identity.device_id, sealed);
        codec::write_message(&mut io, &WireMessage::HelloAck(ack)).await?;

        let mut channel = Self {
            io,
            cipher,
            send_direction: Direction::Responder,
            next_send: 0,
            last_recv: None,
            peer_device: peer.device_id,
        };

        match channel.recv_timeout(timeout).await? {
            SyncMessage::Attest(attest) if attest.challenge == challenge => {}
            SyncMessage::Attest(_) => {
                return Err(SyncError::Protocol("challenge echo mismatch".to_string()));
            }
            other => {
                return Err(SyncError::Protocol(format!(
                    "expected Attest, got {}",
                    sync_name(&other)
                )));
            }
        }

        debug!(peer = %peer.device_id.short(), "session established (responder)");
        Ok(channel)
    }

    /// Device id of the authenticated peer.
    #[must_use]
    pub fn peer_device(&self) -> DeviceId {
        self.peer_device
    }

    /// Seals and sends one message.
    pub async fn send(&mut self, msg: &SyncMessage) -> SyncResult<()> {
        let plaintext = serde_json::to_vec(msg)?;
        let ciphertext = self
            .cipher
            .seal(self.send_direction, self.next_send, &plaintext)?;
        let frame = FrameMessage {
            counter: self.next_send,
            ciphertext,
        };
        codec::write_message(&mut self.io, &WireMessage::Frame(frame)).await?;
        self.next_send += 1;
        Ok(())
    }

    /// Receives and opens the next frame.
    ///
    /// Rejects non-frame messages and any counter that does not move
    /// strictly forward.
    pub async fn recv(&mut self) -> SyncResult<SyncMessage> {
        let wire: WireMessage = codec::read_message(&mut self.io).await?;
        let frame = match wire {
            WireMessage::Frame(frame) => frame,
            other => {
                return Err(SyncError::Protocol(format!(
                    "expected Frame, got {}",
                    wire_name(&other)
                )));
            }
        };

        if let Some(last) = self.last_recv {
            if frame.counter <= last {
                warn!(
                    peer = %self.peer_device.short(),
                    last, got = frame.counter, "replayed frame counter"
                );
                return Err(SyncError::ReplayDetected {
                    last,
                    got: frame.counter,
                });
            }
        }

        let plaintext =
            self.cipher
                .open(self.send_direction.reverse(), frame.counter, &frame.ciphertext)?;
        self.last_recv = Some(frame.counter);
        Ok(serde_json::from_slice(&plaintext)?)
    }

    /// Receives with a deadline; see [`SecureChannel::recv`].
    pub async fn recv_timeout(&mut self, dur: Duration) -> SyncResult<SyncMessage> {
        tokio::time::timeout(dur, self.recv())
            .await
            .map_err(|_| SyncError::Timeout)?
    }
}

fn reject_to_error(reject: RejectMessage) -> SyncError {
    match reject.reason {
        RejectReason::UntrustedPeer => {
            SyncError::UntrustedPeer("listener does not trust this device".to_string())
        }
        RejectReason::Busy => SyncError::SyncAlreadyInProgress,
        reason => SyncError::Protocol(format!("handshake rejected: {reason}")),
    }
}

pub(crate) fn wire_name(msg: &WireMessage) -> &'static str {
    match msg {
        WireMessage::Hello(_) => "Hello",
        WireMessage::HelloAck(_) => "HelloAck",
        WireMessage::Reject(_) => "Reject",
        WireMessage::Frame(_) => "Frame",
        WireMessage::Pair(_) => "Pair",
    }
}

pub(crate) fn sync_name(msg: &SyncMessage) -> &'static str {
    match msg {
        SyncMessage::Attest(_) => "Attest",
        SyncMessage::SyncRequest(_) => "SyncRequest",
        SyncMessage::Delta(_) => "Delta",
        SyncMessage::Ack(_) => "Ack",
        SyncMessage::Error(_) => "Error",
    }
}
