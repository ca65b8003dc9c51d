//! Core data model shared by the sync engine, its stores, and the wire
//! protocol.

use crate::error::ErrorCategory;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;
use weft_crdt::VectorClock;
use weft_crypto::PublicKeyBytes;
use weft_types::{ConflictId, DeviceId, EntityId, HybridTimestamp, SpaceId};

// ── Entities ────────────────────────────────────────────────────────────

/// Kind of change recorded for an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    /// The entity was created.
    Create,
    /// The entity was modified.
    Update,
    /// The entity was deleted; the row survives as a marker.
    Delete,
}

impl ChangeOp {
    /// Storage representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    /// Parses the storage representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// One syncable row: the unit the delta calculator ships and the
/// conflict resolver judges.
///
/// `vector_stamp` is a snapshot of the space clock taken when the write
/// was recorded locally. Deleted entities keep their row with
/// `op = Delete` and `payload = None` so the deletion propagates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncableEntity {
    /// Space this entity belongs to.
    pub space_id: SpaceId,
    /// Stable entity identifier.
    pub entity_id: EntityId,
    /// Application-level type tag ("note", "task", ...).
    pub entity_type: String,
    /// Latest operation recorded for the entity.
    pub op: ChangeOp,
    /// JSON payload; `None` for deletions.
    pub payload: Option<serde_json::Value>,
    /// Hybrid timestamp of the latest write.
    pub updated_at: HybridTimestamp,
    /// Device that performed the latest write.
    pub origin_device: DeviceId,
    /// Space clock snapshot at write time.
    pub vector_stamp: VectorClock,
}

impl SyncableEntity {
    /// True when the entity is a deletion marker.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.op == ChangeOp::Delete
    }
}

// ── Peers ───────────────────────────────────────────────────────────────

/// A device recorded in the trust store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustedPeer {
    /// Peer device id.
    pub device_id: DeviceId,
    /// Display name captured at pairing (refreshed on re-trust).
    pub display_name: String,
    /// Pinned long-term public key.
    pub public_key: PublicKeyBytes,
    /// Wall-clock ms when the peer was first trusted.
    pub first_seen: u64,
    /// Wall-clock ms of the most recent contact.
    pub last_seen: u64,
    /// Completed sync sessions with this peer.
    pub sync_count: u32,
}

/// A device found during an mDNS discovery window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredPeer {
    /// Peer device id from the TXT record.
    pub device_id: DeviceId,
    /// Advertised display name.
    pub display_name: String,
    /// Resolved addresses for the service.
    pub addresses: Vec<IpAddr>,
    /// Advertised sync port.
    pub port: u16,
}

// ── Conflicts ───────────────────────────────────────────────────────────

/// A quarantined concurrent edit awaiting explicit resolution.
///
/// Both payloads are retained verbatim; nothing is lost by quarantine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Conflict row id.
    pub id: ConflictId,
    /// Space the entity belongs to.
    pub space_id: SpaceId,
    /// Entity both sides edited.
    pub entity_id: EntityId,
    /// Application-level type tag.
    pub entity_type: String,
    /// Local payload at detection time; `None` if locally deleted.
    pub local_payload: Option<serde_json::Value>,
    /// Remote payload as received; `None` if remotely deleted.
    pub remote_payload: Option<serde_json::Value>,
    /// Local entity stamp at detection time.
    pub local_stamp: VectorClock,
    /// Remote entity stamp as received.
    pub remote_stamp: VectorClock,
    /// Device the conflicting version came from.
    pub remote_device: DeviceId,
    /// When the conflict was quarantined.
    pub detected_at: HybridTimestamp,
    /// Whether [`ConflictResolution`] has been applied.
    pub resolved: bool,
}

/// Caller's verdict on a quarantined conflict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConflictResolution {
    /// Keep the local payload; the remote version is discarded.
    KeepLocal,
    /// Adopt the remote payload.
    KeepRemote,
    /// Apply a caller-merged payload.
    Merged(serde_json::Value),
}

// ── Session reporting ───────────────────────────────────────────────────

/// Outcome of a completed sync session.
#[derive(Debug, Clone, Serialize)]
pub struct SyncSummary {
    /// Peer the session ran against.
    pub peer_device_id: DeviceId,
    /// Spaces that completed their rounds.
    pub spaces_synced: usize,
    /// Entities shipped to the peer.
    pub entities_sent: usize,
    /// Remote entities applied locally.
    pub entities_applied: usize,
    /// Concurrent edits quarantined locally.
    pub conflicts_detected: usize,
    /// Wall time the session took.
    pub duration: Duration,
}

/// Coarse phase of a sync session, for status display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    /// No session with this peer.
    Idle,
    /// Browsing mDNS for peers.
    Discovering,
    /// Running the encrypted-session handshake.
    Handshaking,
    /// Exchanging vector clocks and computing deltas.
    Exchanging,
    /// Applying delta rounds.
    Applying,
    /// Last session finished cleanly.
    Done,
    /// Last session failed; see [`SyncStatus::error`].
    Failed,
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Discovering => "discovering",
            Self::Handshaking => "handshaking",
            Self::Exchanging => "exchanging",
            Self::Applying => "applying",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Error snapshot carried by [`SyncStatus`] after a failed session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusError {
    /// Coarse failure category.
    pub category: ErrorCategory,
    /// Human-readable message.
    pub message: String,
}

/// Point-in-time view of sync progress with one peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatus {
    /// Current phase.
    pub phase: SyncPhase,
    /// Progress in `[0.0, 1.0]`.
    pub progress: f64,
    /// Present when the last session failed.
    pub error: Option<StatusError>,
}

impl SyncStatus {
    /// Status for a peer with no session on record.
    #[must_use]
    pub fn idle() -> Self {
        Self {
            phase: SyncPhase::Idle,
            progress: 0.0,
            error: None,
        }
    }
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self::idle()
    }
}

/// Direction a recorded sync session ran in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncDirection {
    /// This device dialed the peer.
    Initiated,
    /// This device answered the peer.
    Responded,
}

impl SyncDirection {
    /// Storage representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initiated => "initiated",
            Self::Responded => "responded",
        }
    }

    /// Parses the storage representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initiated" => Some(Self::Initiated),
            "responded" => Some(Self::Responded),
            _ => None,
        }
    }
}

/// Latest successful sync for one `(space, peer)` pair.
///
/// Exactly one row per pair, rewritten at each successful completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncHistoryEntry {
    /// Space the session covered.
    pub space_id: SpaceId,
    /// Peer the session ran against.
    pub peer_device_id: DeviceId,
    /// Wall-clock ms when the session completed.
    pub synced_at: u64,
    /// Which side this device was.
    pub direction: SyncDirection,
    /// Entities shipped in that session.
    pub entities_sent: usize,
    /// Entities applied in that session.
    pub entities_applied: usize,
    /// Conflicts quarantined in that session.
    pub conflicts_detected: usize,
    /// Completed sessions recorded for this pair.
    pub total_syncs: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_op_round_trips_through_storage_form() {
        for op in [ChangeOp::Create, ChangeOp::Update, ChangeOp::Delete] {
            assert_eq!(ChangeOp::parse(op.as_str()), Some(op));
        }
        assert_eq!(ChangeOp::parse("truncate"), None);
    }

    #[test]
    fn deletion_marker_is_detected() {
        let entity = SyncableEntity {
            space_id: SpaceId::new(),
            entity_id: EntityId::new(),
            entity_type: "note".to_string(),
            op: ChangeOp::Delete,
            payload: None,
            updated_at: HybridTimestamp::now(),
            origin_device: DeviceId::new(),
            vector_stamp: VectorClock::new(),
        };
        assert!(entity.is_deleted());
    }

    #[test]
    fn sync_phase_displays_lowercase() {
        assert_eq!(SyncPhase::Handshaking.to_string(), "handshaking");
        assert_eq!(SyncPhase::Idle.to_string(), "idle");
    }
}
