//! Error types for the sync layer.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use weft_crypto::CryptoError;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The remote device is not in the trust store.
    #[error("untrusted peer: {0}")]
    UntrustedPeer(String),

    /// A frame arrived with a counter at or below one already accepted.
    #[error("replay detected: frame counter {got} not above {last}")]
    ReplayDetected {
        /// Highest counter accepted so far on this direction.
        last: u64,
        /// Counter carried by the offending frame.
        got: u64,
    },

    /// A known device presented a public key different from the pinned one.
    #[error("key conflict: {0}")]
    KeyConflict(String),

    /// Pairing handshake failure.
    #[error("pairing error: {0}")]
    Pairing(#[from] PairingError),

    /// I/O error on the wire.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the connection mid-session.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// A network wait exceeded the configured timeout.
    #[error("operation timed out")]
    Timeout,

    /// Protocol error (unexpected or invalid message).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Cryptographic failure (key exchange, seal, or open).
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// A sync session with this peer is already running.
    #[error("sync already in progress with this peer")]
    SyncAlreadyInProgress,

    /// The session was cancelled locally.
    #[error("sync cancelled")]
    Cancelled,

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Channel closed.
    #[error("channel closed")]
    ChannelClosed,
}

impl SyncError {
    /// Coarse category for status display and retry decisions.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Io(_) | Self::ConnectionClosed | Self::Timeout => ErrorCategory::Network,
            Self::UntrustedPeer(_)
            | Self::ReplayDetected { .. }
            | Self::KeyConflict(_)
            | Self::Pairing(_)
            | Self::Crypto(_) => ErrorCategory::Trust,
            Self::Protocol(_)
            | Self::Serialization(_)
            | Self::SyncAlreadyInProgress
            | Self::Cancelled
            | Self::Storage(_)
            | Self::ChannelClosed => ErrorCategory::Internal,
        }
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Coarse classification of a [`SyncError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// Transient transport failure; the caller may retry.
    Network,
    /// Authentication or trust failure; never retried automatically.
    Trust,
    /// Local bug, storage fault, or cancelled session.
    Internal,
}

/// Errors specific to the pairing handshake.
#[derive(Debug, Error)]
pub enum PairingError {
    /// The QR payload could not be decoded into an invite.
    #[error("invalid pairing invite: {0}")]
    InvalidInvite(String),

    /// The commitment did not match the expected PIN.
    #[error("pin mismatch")]
    PinMismatch,

    /// The remote side rejected the pairing attempt.
    #[error("pairing rejected by peer: {0}")]
    Rejected(String),

    /// The peer is already trusted with a different public key.
    #[error("peer already trusted with a different key")]
    KeyConflict,

    /// Transport or protocol failure during the handshake.
    #[error("pairing failed: {0}")]
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_cover_the_taxonomy() {
        assert_eq!(SyncError::Timeout.category(), ErrorCategory::Network);
        assert_eq!(
            SyncError::UntrustedPeer("x".into()).category(),
            ErrorCategory::Trust
        );
        assert_eq!(
            SyncError::ReplayDetected { last: 4, got: 4 }.category(),
            ErrorCategory::Trust
        );
        assert_eq!(
            SyncError::SyncAlreadyInProgress.category(),
            ErrorCategory::Internal
        );
        assert_eq!(SyncError::Cancelled.category(), ErrorCategory::Internal);
    }

    #[test]
    fn pairing_errors_are_trust_failures() {
        let err = SyncError::from(PairingError::PinMismatch);
        assert_eq!(err.category(), ErrorCategory::Trust);
    }
}
