//! Delta selection: which entities a peer has not seen.
//!
//! An entity needs shipping when the peer's space clock does not
//! dominate (or equal) the entity's stamp. Candidates arrive
//! pre-filtered by local write time; the clock test is the correctness
//! layer, the time filter only prunes.
//!
//! Batches ship in ascending `updated_at` order. Hybrid timestamps
//! respect causality, so a truncated batch is always a causal prefix
//! and per-entity stamp merging on the receiving side stays sound.

use crate::model::SyncableEntity;
use weft_crdt::VectorClock;

/// One outgoing batch for a round.
#[derive(Debug, Clone)]
pub struct DeltaBatch {
    /// Entities to ship, ordered by `updated_at`.
    pub entities: Vec<SyncableEntity>,
    /// True when nothing beyond this batch remains.
    pub is_final: bool,
}

impl DeltaBatch {
    /// An empty final batch.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            entities: Vec::new(),
            is_final: true,
        }
    }
}

/// True when `peer_clock` has not seen the write stamped `stamp`.
#[must_use]
pub fn needs_send(stamp: &VectorClock, peer_clock: &VectorClock) -> bool {
    !peer_clock.dominates(stamp)
}

/// Filters, orders, and truncates candidates into one round's batch.
///
/// `limit` bounds the batch; anything cut off ships in a later round,
/// so `is_final` is false whenever truncation happened.
#[must_use]
pub fn select_batch(
    mut candidates: Vec<SyncableEntity>,
    peer_clock: &VectorClock,
    limit: usize,
) -> DeltaBatch {
    candidates.retain(|e| needs_send(&e.vector_stamp, peer_clock));
    candidates.sort_by(|a, b| {
        a.updated_at
            .cmp(&b.updated_at)
            .then_with(|| a.origin_device.cmp(&b.origin_device))
            .then_with(|| a.entity_id.cmp(&b.entity_id))
    });

    let is_final = candidates.len() <= limit;
    candidates.truncate(limit);
    DeltaBatch {
        entities: candidates,
        is_final,
    }
}
