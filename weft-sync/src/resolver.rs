//! Conflict detection and explicit merge helpers.
//!
//! Applying a remote entity compares its stamp against the local row's
//! stamp. Concurrent stamps are never auto-merged: the remote version
//! is quarantined as a [`crate::model::SyncConflict`] and the local row
//! stays untouched until the caller resolves it.
//!
//! [`merge_payloads`] is a helper for building a
//! [`crate::model::ConflictResolution::Merged`] payload. It never runs
//! on the apply path.

use crate::model::SyncableEntity;
use std::collections::HashMap;
use weft_crdt::{ClockOrdering, ORSet};

/// What to do with one incoming remote entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Remote strictly newer, or no local row; apply it.
    ApplyRemote,
    /// Local strictly newer; ignore the remote copy.
    KeepLocal,
    /// Stamps equal; both sides hold the same write.
    Unchanged,
    /// Concurrent edits; quarantine the remote version.
    Conflict,
}

/// Judges an incoming remote entity against the local row.
#[must_use]
pub fn disposition(local: Option<&SyncableEntity>, remote: &SyncableEntity) -> Disposition {
    let Some(local) = local else {
        return Disposition::ApplyRemote;
    };
    match remote.vector_stamp.compare(&local.vector_stamp) {
        ClockOrdering::Dominates => Disposition::ApplyRemote,
        ClockOrdering::Dominated => Disposition::KeepLocal,
        ClockOrdering::Equal => Disposition::Unchanged,
        ClockOrdering::Concurrent => Disposition::Conflict,
    }
}

/// True when the remote side wins a last-write comparison.
///
/// Higher `updated_at` wins; exact ties go to the greater device id so
/// every replica picks the same winner.
#[must_use]
pub fn remote_wins(local: &SyncableEntity, remote: &SyncableEntity) -> bool {
    (remote.updated_at, remote.origin_device) > (local.updated_at, local.origin_device)
}

// ── Merge policy ────────────────────────────────────────────────────────

/// Per-field strategy used by [`merge_payloads`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldPolicy {
    /// Take the value from the last-write winner.
    LastWriteWins,
    /// Treat the field as a set of tags and union both sides.
    TagSet,
}

/// Field-name table mapping payload fields to merge strategies.
#[derive(Debug, Clone)]
pub struct MergePolicy {
    default: FieldPolicy,
    overrides: HashMap<String, FieldPolicy>,
}

impl MergePolicy {
    /// A policy where every field follows `default`.
    #[must_use]
    pub fn new(default: FieldPolicy) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    /// Overrides the strategy for one field.
    #[must_use]
    pub fn with_field(mut self, field: impl Into<String>, policy: FieldPolicy) -> Self {
        self.overrides.insert(field.into(), policy);
        self
    }

    /// Strategy for a field name.
    #[must_use]
    pub fn policy_for(&self, field: &str) -> FieldPolicy {
        self.overrides.get(field).copied().unwrap_or(self.default)
    }
}

impl Default for MergePolicy {
    /// Scalars last-write-win; a `tags` field merges as a set.
    fn default() -> Self {
        Self::new(FieldPolicy::LastWriteWins).with_field("tags", FieldPolicy::TagSet)
    }
}

/// Builds a merged payload from both sides of a conflict.
///
/// Object payloads merge field by field under `policy`; anything else
/// falls back to the last-write winner wholesale. A deletion on one
/// side loses to data on the other, so an explicit merge never drops
/// surviving content.
#[must_use]
pub fn merge_payloads(
    policy: &MergePolicy,
    local: &SyncableEntity,
    remote: &SyncableEntity,
) -> Option<serde_json::Value> {
    match (&local.payload, &remote.payload) {
        (None, None) => None,
        (Some(l), None) => Some(l.clone()),
        (None, Some(r)) => Some(r.clone()),
        (Some(l), Some(r)) => Some(merge_values(policy, local, remote, l, r)),
    }
}

fn merge_values(
    policy: &MergePolicy,
    local: &SyncableEntity,
    remote: &SyncableEntity,
    local_value: &serde_json::Value,
    remote_value: &serde_json::Value,
) -> serde_json::Value {
    let (Some(local_map), Some(remote_map)) = (local_value.as_object(), remote_value.as_object())
    else {
        return winner_value(local, remote, local_value, remote_value).clone();
    };

    let mut merged = serde_json::Map::new();
    let mut keys: Vec<&String> = local_map.keys().chain(remote_map.keys()).collect();
    keys.sort();
    keys.dedup();

    for key in keys {
        let value = match (local_map.get(key), remote_map.get(key)) {
            (Some(lv), Some(rv)) => match policy.policy_for(key) {
                FieldPolicy::TagSet => merge_tag_field(local, remote, lv, rv),
                FieldPolicy::LastWriteWins => winner_value(local, remote, lv, rv).clone(),
            },
            (Some(lv), None) => lv.clone(),
            (None, Some(rv)) => rv.clone(),
            (None, None) => continue,
        };
        merged.insert(key.clone(), value);
    }

    serde_json::Value::Object(merged)
}

/// Merges a tag field: OR-Set state when both sides carry it, plain
/// array union otherwise, last-write winner when shapes disagree.
fn merge_tag_field(
    local: &SyncableEntity,
    remote: &SyncableEntity,
    local_value: &serde_json::Value,
    remote_value: &serde_json::Value,
) -> serde_json::Value {
    let local_set: Option<ORSet<String>> = serde_json::from_value(local_value.clone()).ok();
    let remote_set: Option<ORSet<String>> = serde_json::from_value(remote_value.clone()).ok();
    if let (Some(l), Some(r)) = (local_set, remote_set) {
        if let Ok(v) = serde_json::to_value(l.merged(&r)) {
            return v;
        }
    }

    if let (Some(l), Some(r)) = (local_value.as_array(), remote_value.as_array()) {
        let mut items: Vec<serde_json::Value> = l.iter().chain(r.iter()).cloned().collect();
        items.sort_by_key(|v| v.to_string());
        items.dedup_by_key(|v| v.to_string());
        return serde_json::Value::Array(items);
    }

    winner_value(local, remote, local_value, remote_value).clone()
}

fn winner_value<'a>(
    local: &SyncableEntity,
    remote: &SyncableEntity,
    local_value: &'a serde_json::Value,
    remote_value: &'a serde_json::Value,
) -> &'a serde_json::Value {
    if remote_wins(local, remote) {
        remote_value
    } else {
        local_value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ChangeOp;
    use weft_crdt::VectorClock;
    use weft_types::{DeviceId, EntityId, HybridTimestamp, SpaceId};

    fn make_entity(device: DeviceId, stamp: VectorClock, wall: u64) -> SyncableEntity {
        SyncableEntity {
            space_id: SpaceId::new(),
            entity_id: EntityId::new(),
            entity_type: "note".to_string(),
            op: ChangeOp::Update,
            payload: Some(serde_json::json!({"title": "x"})),
            updated_at: HybridTimestamp::new(wall, 0),
            origin_device: device,
            vector_stamp: stamp,
        }
    }

    #[test]
    fn missing_local_row_applies_remote() {
        let remote = make_entity(DeviceId::new(), VectorClock::new(), 10);
        assert_eq!(disposition(None, &remote), Disposition::ApplyRemote);
    }

    #[test]
    fn dominating_remote_applies_and_dominated_is_kept_local() {
        let dev = DeviceId::new();
        let newer = make_entity(dev, VectorClock::from_iter([(dev, 5)]), 20);
        let older = make_entity(dev, VectorClock::from_iter([(dev, 3)]), 10);

        assert_eq!(disposition(Some(&older), &newer), Disposition::ApplyRemote);
        assert_eq!(disposition(Some(&newer), &older), Disposition::KeepLocal);
    }

    #[test]
    fn equal_stamps_leave_the_row_unchanged() {
        let dev = DeviceId::new();
        let a = make_entity(dev, VectorClock::from_iter([(dev, 4)]), 10);
        let b = make_entity(dev, VectorClock::from_iter([(dev, 4)]), 10);
        assert_eq!(disposition(Some(&a), &b), Disposition::Unchanged);
    }

    #[test]
    fn concurrent_stamps_are_quarantined() {
        let a = DeviceId::new();
        let b = DeviceId::new();
        let local = make_entity(a, VectorClock::from_iter([(a, 6), (b, 3)]), 10);
        let remote = make_entity(b, VectorClock::from_iter([(a, 5), (b, 4)]), 11);
        assert_eq!(disposition(Some(&local), &remote), Disposition::Conflict);
    }

    #[test]
    fn lww_tie_breaks_on_device_id_identically_everywhere() {
        let mut ids = [DeviceId::new(), DeviceId::new()];
        ids.sort();
        let low = make_entity(ids[0], VectorClock::new(), 50);
        let high = make_entity(ids[1], VectorClock::new(), 50);

        // Same timestamps: the greater device id wins from both views.
        assert!(remote_wins(&low, &high));
        assert!(!remote_wins(&high, &low));
    }
}
