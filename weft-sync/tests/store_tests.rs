use serde_json::json;
use weft_crdt::VectorClock;
use weft_sync::{ChangeOp, SyncDirection, SyncHistoryEntry, SyncStore, SyncableEntity};
use weft_types::{DeviceId, EntityId, HybridTimestamp, SpaceId};

fn store() -> SyncStore {
    SyncStore::open_in_memory().unwrap()
}

fn clock(entries: &[(DeviceId, u64)]) -> VectorClock {
    entries.iter().copied().collect()
}

fn remote_entity(
    space: SpaceId,
    entity_id: EntityId,
    origin: DeviceId,
    wall: u64,
    stamp: &[(DeviceId, u64)],
) -> SyncableEntity {
    SyncableEntity {
        space_id: space,
        entity_id,
        entity_type: "task".to_string(),
        op: ChangeOp::Update,
        payload: Some(json!({ "title": "remote" })),
        updated_at: HybridTimestamp::new(wall, 0),
        origin_device: origin,
        vector_stamp: clock(stamp),
    }
}

fn history_entry(
    space: SpaceId,
    peer: DeviceId,
    synced_at: u64,
    direction: SyncDirection,
) -> SyncHistoryEntry {
    SyncHistoryEntry {
        space_id: space,
        peer_device_id: peer,
        synced_at,
        direction,
        entities_sent: 2,
        entities_applied: 1,
        conflicts_detected: 0,
        total_syncs: 1,
    }
}

// ── Local writes ────────────────────────────────────────────────────────

#[test]
fn record_change_stamps_and_increments_the_clock() {
    let store = store();
    let device = DeviceId::new();
    let space = SpaceId::new();
    let entity_id = EntityId::new();

    let entity = store
        .record_change(
            device,
            space,
            "task",
            entity_id,
            ChangeOp::Create,
            Some(json!({ "title": "hello" })),
            HybridTimestamp::new(1_000, 0),
        )
        .unwrap();

    assert_eq!(entity.vector_stamp.get(&device), 1);
    assert_eq!(store.space_clock(&space).unwrap().get(&device), 1);

    let second = store
        .record_change(
            device,
            space,
            "task",
            entity_id,
            ChangeOp::Update,
            Some(json!({ "title": "edited" })),
            HybridTimestamp::new(2_000, 0),
        )
        .unwrap();
    assert_eq!(second.vector_stamp.get(&device), 2);
}

#[test]
fn delete_drops_the_payload() {
    let store = store();
    let device = DeviceId::new();
    let space = SpaceId::new();
    let entity_id = EntityId::new();

    store
        .record_change(
            device,
            space,
            "task",
            entity_id,
            ChangeOp::Create,
            Some(json!({ "title": "doomed" })),
            HybridTimestamp::new(1_000, 0),
        )
        .unwrap();
    store
        .record_change(
            device,
            space,
            "task",
            entity_id,
            ChangeOp::Delete,
            Some(json!({ "ignored": true })),
            HybridTimestamp::new(2_000, 0),
        )
        .unwrap();

    let entity = store.get_entity(&space, &entity_id).unwrap().unwrap();
    assert!(entity.is_deleted());
    assert!(entity.payload.is_none());
}

#[test]
fn spaces_are_listed_in_stable_order() {
    let store = store();
    let device = DeviceId::new();
    let spaces = [SpaceId::new(), SpaceId::new(), SpaceId::new()];
    for space in &spaces {
        store
            .record_change(
                device,
                *space,
                "task",
                EntityId::new(),
                ChangeOp::Create,
                Some(json!({})),
                HybridTimestamp::new(1_000, 0),
            )
            .unwrap();
    }

    let listed = store.list_spaces().unwrap();
    assert_eq!(listed.len(), 3);
    let mut sorted = listed.clone();
    sorted.sort_by_key(|s| s.to_string());
    assert_eq!(listed, sorted);
}

// ── Delta candidates ────────────────────────────────────────────────────

#[test]
fn delta_candidates_filter_on_local_seen_time() {
    let store = store();
    let device = DeviceId::new();
    let space = SpaceId::new();

    store
        .record_change(
            device,
            space,
            "task",
            EntityId::new(),
            ChangeOp::Create,
            Some(json!({})),
            HybridTimestamp::new(5_000, 0),
        )
        .unwrap();

    assert_eq!(store.delta_candidates(&space, 0).unwrap().len(), 1);
    assert_eq!(store.delta_candidates(&space, 4_999).unwrap().len(), 1);
    assert!(store.delta_candidates(&space, 5_000).unwrap().is_empty());
}

#[test]
fn applied_remote_rows_become_candidates_at_receive_time() {
    // A row relayed with an old HLC stamp must still reach peers that
    // synced before it arrived here, so the candidate filter runs on the
    // local receive time rather than the remote edit time.
    let store = store();
    let space = SpaceId::new();
    let remote_device = DeviceId::new();
    let stale_edit = remote_entity(space, EntityId::new(), remote_device, 1_000, &[(remote_device, 1)]);

    let received_at = HybridTimestamp::new(900_000, 0);
    store
        .apply_round(&space, &[stale_edit], &clock(&[(remote_device, 1)]), true, remote_device, received_at)
        .unwrap();

    // Filtering on the remote edit time would miss the row.
    assert_eq!(store.delta_candidates(&space, 800_000).unwrap().len(), 1);
}

// ── Round application ───────────────────────────────────────────────────

#[test]
fn dominating_remote_is_applied() {
    let store = store();
    let space = SpaceId::new();
    let remote_device = DeviceId::new();
    let entity_id = EntityId::new();
    let incoming = remote_entity(space, entity_id, remote_device, 1_000, &[(remote_device, 1)]);

    let outcome = store
        .apply_round(
            &space,
            &[incoming],
            &clock(&[(remote_device, 1)]),
            true,
            remote_device,
            HybridTimestamp::new(1_500, 0),
        )
        .unwrap();

    assert_eq!(outcome.applied.len(), 1);
    assert_eq!(outcome.ignored, 0);
    assert!(outcome.conflicts.is_empty());

    let stored = store.get_entity(&space, &entity_id).unwrap().unwrap();
    assert_eq!(stored.payload, Some(json!({ "title": "remote" })));
    assert_eq!(store.space_clock(&space).unwrap().get(&remote_device), 1);
}

#[test]
fn dominated_remote_is_ignored() {
    let store = store();
    let device = DeviceId::new();
    let remote_device = DeviceId::new();
    let space = SpaceId::new();
    let entity_id = EntityId::new();

    let local = store
        .record_change(
            device,
            space,
            "task",
            entity_id,
            ChangeOp::Create,
            Some(json!({ "title": "local" })),
            HybridTimestamp::new(2_000, 0),
        )
        .unwrap();

    // The remote stamp is a strict prefix of the local one.
    let stale = remote_entity(space, entity_id, remote_device, 1_000, &[]);

    let outcome = store
        .apply_round(
            &space,
            &[stale],
            &local.vector_stamp,
            true,
            remote_device,
            HybridTimestamp::new(3_000, 0),
        )
        .unwrap();

    assert!(outcome.applied.is_empty());
    assert_eq!(outcome.ignored, 1);
    let stored = store.get_entity(&space, &entity_id).unwrap().unwrap();
    assert_eq!(stored.payload, Some(json!({ "title": "local" })));
}

#[test]
fn concurrent_remote_is_quarantined_with_both_payloads() {
    let store = store();
    let device = DeviceId::new();
    let remote_device = DeviceId::new();
    let space = SpaceId::new();
    let entity_id = EntityId::new();

    store
        .record_change(
            device,
            space,
            "task",
            entity_id,
            ChangeOp::Create,
            Some(json!({ "title": "local" })),
            HybridTimestamp::new(2_000, 0),
        )
        .unwrap();

    let concurrent = remote_entity(space, entity_id, remote_device, 2_500, &[(remote_device, 1)]);
    let outcome = store
        .apply_round(
            &space,
            &[concurrent],
            &clock(&[(remote_device, 1)]),
            true,
            remote_device,
            HybridTimestamp::new(3_000, 0),
        )
        .unwrap();

    assert_eq!(outcome.conflicts.len(), 1);
    assert!(outcome.applied.is_empty());

    // The local row is untouched and both payloads survive in the
    // conflict record.
    let stored = store.get_entity(&space, &entity_id).unwrap().unwrap();
    assert_eq!(stored.payload, Some(json!({ "title": "local" })));

    let conflicts = store.list_conflicts(&space).unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].local_payload, Some(json!({ "title": "local" })));
    assert_eq!(conflicts[0].remote_payload, Some(json!({ "title": "remote" })));
    assert!(!conflicts[0].resolved);

    // Causal history still advances, so the next session will not
    // quarantine the same row again.
    assert_eq!(store.space_clock(&space).unwrap().get(&remote_device), 1);
}

#[test]
fn sender_clock_merges_only_on_the_final_round() {
    let store = store();
    let space = SpaceId::new();
    let remote_device = DeviceId::new();
    // The sender claims more history than this truncated batch carries.
    let sender_clock = clock(&[(remote_device, 5)]);
    let partial = remote_entity(space, EntityId::new(), remote_device, 1_000, &[(remote_device, 1)]);

    store
        .apply_round(
            &space,
            &[partial.clone()],
            &sender_clock,
            false,
            remote_device,
            HybridTimestamp::new(1_500, 0),
        )
        .unwrap();
    // Only the entity's own stamp landed; claiming {remote:5} here would
    // stop the sender ever shipping rows 2..=5.
    assert_eq!(store.space_clock(&space).unwrap().get(&remote_device), 1);

    store
        .apply_round(
            &space,
            &[],
            &sender_clock,
            true,
            remote_device,
            HybridTimestamp::new(2_000, 0),
        )
        .unwrap();
    assert_eq!(store.space_clock(&space).unwrap().get(&remote_device), 5);
}

// ── Conflict records ────────────────────────────────────────────────────

#[test]
fn resolving_a_conflict_removes_it_from_the_list() {
    let store = store();
    let device = DeviceId::new();
    let remote_device = DeviceId::new();
    let space = SpaceId::new();
    let entity_id = EntityId::new();

    store
        .record_change(
            device,
            space,
            "task",
            entity_id,
            ChangeOp::Create,
            Some(json!({ "title": "local" })),
            HybridTimestamp::new(2_000, 0),
        )
        .unwrap();
    let concurrent = remote_entity(space, entity_id, remote_device, 2_500, &[(remote_device, 1)]);
    let outcome = store
        .apply_round(
            &space,
            &[concurrent],
            &clock(&[(remote_device, 1)]),
            true,
            remote_device,
            HybridTimestamp::new(3_000, 0),
        )
        .unwrap();
    let conflict_id = outcome.conflicts[0].id;

    store.mark_conflict_resolved(&conflict_id, "kept local").unwrap();
    assert!(store.list_conflicts(&space).unwrap().is_empty());

    let resolved = store.get_conflict(&conflict_id).unwrap().unwrap();
    assert!(resolved.resolved);
}

#[test]
fn resolving_an_unknown_conflict_fails() {
    let store = store();
    let missing = weft_types::ConflictId::new();
    assert!(store.mark_conflict_resolved(&missing, "kept local").is_err());
}

// ── Sync history ────────────────────────────────────────────────────────

#[test]
fn history_upserts_per_space_and_peer() {
    let store = store();
    let space = SpaceId::new();
    let peer = DeviceId::new();

    store
        .record_history(&history_entry(space, peer, 10_000, SyncDirection::Initiated))
        .unwrap();
    store
        .record_history(&history_entry(space, peer, 20_000, SyncDirection::Responded))
        .unwrap();

    let history = store.history_for_peer(&peer).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].synced_at, 20_000);
    assert_eq!(history[0].direction, SyncDirection::Responded);
    assert_eq!(history[0].total_syncs, 2);
}

#[test]
fn last_sync_at_defaults_to_zero() {
    let store = store();
    let space = SpaceId::new();
    let peer = DeviceId::new();
    assert_eq!(store.last_sync_at(&space, &peer).unwrap(), 0);

    store
        .record_history(&history_entry(space, peer, 42_000, SyncDirection::Initiated))
        .unwrap();
    assert_eq!(store.last_sync_at(&space, &peer).unwrap(), 42_000);
}
