//! Encrypted LAN peer-to-peer sync engine for Weft.
//!
//! Devices pair over a QR-code invite with a PIN check, pin each other's
//! public keys on first use, and afterwards sync their spaces over an
//! encrypted TCP session. No server sits in the path and nothing leaves
//! the local network.
//!
//! # Architecture
//!
//! - **Trust**: device identity and trust-on-first-use peer pinning
//!   ([`TrustStore`])
//! - **Discovery**: mDNS advertisement and browsing on the local network
//! - **Pairing**: QR invite plus PIN commitment, ending in mutual trust
//! - **Session**: X25519 agreement and an AEAD frame channel with replay
//!   protection ([`SecureChannel`])
//! - **Delta**: vector-clock comparison picks what each side is missing
//! - **Resolver**: deterministic dispositions; concurrent edits are
//!   quarantined for explicit resolution, never silently merged
//! - **Engine**: orchestrates full sessions space by space
//!   ([`SyncEngine`])
//!
//! # Sync Process
//!
//! 1. **Discovery**: find peers advertising the sync service
//! 2. **Handshake**: exchange device ids, derive a session key, prove
//!    both sides hold it
//! 3. **Clock Exchange**: share vector clocks per space
//! 4. **Delta Rounds**: ship missing entities in bounded batches until
//!    both directions are final
//! 5. **Acknowledge**: record history and converged clocks on both sides
//!
//! # Example
//!
//! ```no_run
//! use weft_sync::{SyncConfig, SyncEngine, SyncStore, TrustStore};
//!
//! # fn main() -> weft_sync::SyncResult<()> {
//! let trust = TrustStore::new("trust.db")?;
//! let store = SyncStore::new("sync.db")?;
//! let engine = SyncEngine::new(SyncConfig::default(), trust, store)?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
mod delta;
mod discovery;
mod engine;
mod error;
mod listener;
mod model;
mod pairing;
pub mod protocol;
mod resolver;
mod session;
mod store;
mod trust;

pub use delta::{needs_send, select_batch, DeltaBatch};
pub use discovery::{advertise, discover, Advertisement, SERVICE_TYPE};
pub use engine::{ApplyObserver, SyncConfig, SyncEngine};
pub use error::{ErrorCategory, PairingError, SyncError, SyncResult};
pub use model::{
    ChangeOp, ConflictResolution, DiscoveredPeer, StatusError, SyncConflict, SyncDirection,
    SyncHistoryEntry, SyncPhase, SyncStatus, SyncSummary, SyncableEntity, TrustedPeer,
};
pub use protocol::{PairingInvite, PROTOCOL_VERSION};
pub use resolver::{
    disposition, merge_payloads, remote_wins, Disposition, FieldPolicy, MergePolicy,
};
pub use session::SecureChannel;
pub use store::{RoundOutcome, SyncStore};
pub use trust::{DeviceIdentity, TrustStore};
