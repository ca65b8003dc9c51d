use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use serial_test::serial;
use tokio::time::sleep;

use weft_crypto::DeviceKeypair;
use weft_sync::{
    ApplyObserver, ChangeOp, ConflictResolution, ErrorCategory, SyncConfig, SyncConflict,
    SyncDirection, SyncEngine, SyncError, SyncPhase, SyncStore, SyncableEntity, TrustStore,
};
use weft_types::{DeviceId, EntityId, SpaceId};

fn config(name: &str) -> SyncConfig {
    SyncConfig {
        display_name: name.to_string(),
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        network_timeout: Duration::from_secs(5),
        ..SyncConfig::default()
    }
}

struct Device {
    engine: SyncEngine,
    trust: TrustStore,
    store: SyncStore,
}

fn device(name: &str) -> Device {
    device_with(config(name))
}

fn device_with(config: SyncConfig) -> Device {
    let trust = TrustStore::open_in_memory().unwrap();
    let store = SyncStore::open_in_memory().unwrap();
    let engine = SyncEngine::new(config, trust.clone(), store.clone()).unwrap();
    Device {
        engine,
        trust,
        store,
    }
}

/// Pins each device's key in the other's trust store, as pairing would.
fn cross_trust(a: &Device, b: &Device) {
    let id_a = a
        .trust
        .get_or_create_identity(a.engine.local_display_name())
        .unwrap();
    let id_b = b
        .trust
        .get_or_create_identity(b.engine.local_display_name())
        .unwrap();
    a.trust
        .trust_peer(id_b.device_id, "peer", &id_b.keypair.public_key())
        .unwrap();
    b.trust
        .trust_peer(id_a.device_id, "peer", &id_a.keypair.public_key())
        .unwrap();
}

async fn wait_until<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..100 {
        if check() {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Waits until the responder has closed out `count` sessions with `peer`.
///
/// The responder finishes its bookkeeping after the initiator has already
/// returned, so back-to-back sessions must wait for the previous one to
/// release its in-flight slot.
async fn settled(responder: &Device, peer: DeviceId, count: u32) {
    wait_until("responder to close out the session", || {
        responder
            .trust
            .lookup_peer(&peer)
            .unwrap()
            .map(|p| p.sync_count)
            .unwrap_or(0)
            >= count
    })
    .await;
    sleep(Duration::from_millis(50)).await;
}

// ── Convergence ─────────────────────────────────────────────────────────

#[tokio::test]
#[serial]
async fn first_sync_converges_and_a_repeat_moves_nothing() {
    let a = device("A");
    let b = device("B");
    cross_trust(&a, &b);
    let addr = b.engine.start().await.unwrap();
    let a_id = a.engine.local_device();
    let b_id = b.engine.local_device();

    let space = SpaceId::new();
    let mut queued = Vec::new();
    for title in ["one", "two", "three"] {
        let entity = EntityId::new();
        a.engine
            .queue_change(
                space,
                "task",
                entity,
                ChangeOp::Create,
                Some(json!({ "title": title })),
            )
            .await
            .unwrap();
        queued.push((entity, title));
    }

    let summary = a.engine.initiate_sync(b_id, addr).await.unwrap();
    assert_eq!(summary.peer_device_id, b_id);
    assert_eq!(summary.spaces_synced, 1);
    assert_eq!(summary.entities_sent, 3);
    assert_eq!(summary.entities_applied, 0);
    assert_eq!(summary.conflicts_detected, 0);

    // The responder applied everything before acking the final round.
    for (entity, title) in &queued {
        let row = b.store.get_entity(&space, entity).unwrap().unwrap();
        assert_eq!(row.payload, Some(json!({ "title": title })));
    }
    assert_eq!(
        a.store.space_clock(&space).unwrap(),
        b.store.space_clock(&space).unwrap()
    );

    let status = a.engine.get_sync_status(b_id);
    assert_eq!(status.phase, SyncPhase::Done);
    assert!(status.progress >= 1.0);
    assert!(status.error.is_none());

    let history = a.engine.sync_history(b_id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].direction, SyncDirection::Initiated);
    assert_eq!(history[0].entities_sent, 3);
    assert_eq!(history[0].total_syncs, 1);

    settled(&b, a_id, 1).await;
    let responder_history = b.engine.sync_history(a_id).await.unwrap();
    assert_eq!(responder_history.len(), 1);
    assert_eq!(responder_history[0].direction, SyncDirection::Responded);
    assert_eq!(responder_history[0].entities_applied, 3);
    assert_eq!(b.engine.get_sync_status(a_id).phase, SyncPhase::Done);

    // Nothing is new, so the second session ships nothing.
    let again = a.engine.initiate_sync(b_id, addr).await.unwrap();
    assert_eq!(again.entities_sent, 0);
    assert_eq!(again.entities_applied, 0);
    let history = a.engine.sync_history(b_id).await.unwrap();
    assert_eq!(history[0].total_syncs, 2);
    assert_eq!(history[0].entities_sent, 0);

    b.engine.stop().await;
}

#[tokio::test]
#[serial]
async fn every_local_space_is_covered_in_one_session() {
    let a = device("A");
    let b = device("B");
    cross_trust(&a, &b);
    let addr = b.engine.start().await.unwrap();
    let b_id = b.engine.local_device();

    let notes = SpaceId::new();
    let tasks = SpaceId::new();
    for space in [notes, tasks] {
        a.engine
            .queue_change(
                space,
                "item",
                EntityId::new(),
                ChangeOp::Create,
                Some(json!({ "body": "hello" })),
            )
            .await
            .unwrap();
    }

    let summary = a.engine.initiate_sync(b_id, addr).await.unwrap();
    assert_eq!(summary.spaces_synced, 2);
    assert_eq!(summary.entities_sent, 2);

    for space in [notes, tasks] {
        assert_eq!(
            a.store.space_clock(&space).unwrap(),
            b.store.space_clock(&space).unwrap()
        );
    }
    assert_eq!(a.engine.sync_history(b_id).await.unwrap().len(), 2);

    b.engine.stop().await;
}

#[tokio::test]
#[serial]
async fn small_batches_drive_multiple_rounds_to_completion() {
    let a = device("A");
    // The responder ships at most two entities per round.
    let mut config_b = config("B");
    config_b.max_entities_per_round = 2;
    let b = device_with(config_b);
    cross_trust(&a, &b);

    let space = SpaceId::new();
    a.engine
        .queue_change(
            space,
            "task",
            EntityId::new(),
            ChangeOp::Create,
            Some(json!({ "title": "seed" })),
        )
        .await
        .unwrap();
    let mut expected = Vec::new();
    for n in 0..5 {
        let entity = EntityId::new();
        b.engine
            .queue_change(
                space,
                "task",
                entity,
                ChangeOp::Create,
                Some(json!({ "n": n })),
            )
            .await
            .unwrap();
        expected.push(entity);
    }

    let addr = b.engine.start().await.unwrap();
    let summary = a.engine.initiate_sync(b.engine.local_device(), addr).await.unwrap();

    // Three responder rounds (2 + 2 + 1) all landed in one session.
    assert_eq!(summary.entities_applied, 5);
    assert_eq!(summary.entities_sent, 1);
    for entity in &expected {
        assert!(a.store.get_entity(&space, entity).unwrap().is_some());
    }
    assert_eq!(
        a.store.space_clock(&space).unwrap(),
        b.store.space_clock(&space).unwrap()
    );

    b.engine.stop().await;
}

// ── Failure modes ───────────────────────────────────────────────────────

#[tokio::test]
async fn untrusted_peer_fails_before_any_connection() {
    let a = device("A");
    let stranger = DeviceId::new();
    let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();

    let err = a.engine.initiate_sync(stranger, addr).await.unwrap_err();
    assert!(matches!(err, SyncError::UntrustedPeer(_)), "got {err:?}");

    let status = a.engine.get_sync_status(stranger);
    assert_eq!(status.phase, SyncPhase::Failed);
    assert_eq!(status.error.unwrap().category, ErrorCategory::Trust);
}

#[tokio::test]
#[serial]
async fn a_busy_peer_rejects_the_second_session() {
    let mut config_a = config("A");
    config_a.network_timeout = Duration::from_millis(500);
    let a = device_with(config_a);

    // A trusted peer whose listener accepts and then never answers.
    let gate = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = gate.local_addr().unwrap();
    let hold = tokio::spawn(async move {
        let Ok((stream, _)) = gate.accept().await else {
            return;
        };
        sleep(Duration::from_secs(5)).await;
        drop(stream);
    });

    let ghost = DeviceId::new();
    let ghost_key = DeviceKeypair::generate().unwrap().public_key();
    a.trust.trust_peer(ghost, "Ghost", &ghost_key).unwrap();

    let engine = a.engine.clone();
    let first = tokio::spawn(async move { engine.initiate_sync(ghost, addr).await });
    sleep(Duration::from_millis(100)).await;

    let second = a.engine.initiate_sync(ghost, addr).await;
    assert!(
        matches!(second, Err(SyncError::SyncAlreadyInProgress)),
        "got {second:?}"
    );

    let first = first.await.unwrap();
    assert!(matches!(first, Err(SyncError::Timeout)), "got {first:?}");
    hold.abort();
}

struct SlowApply;

#[async_trait]
impl ApplyObserver for SlowApply {
    async fn entity_applied(&self, _entity: &SyncableEntity) {
        sleep(Duration::from_millis(400)).await;
    }

    async fn conflict_detected(&self, _conflict: &SyncConflict) {}
}

#[tokio::test]
#[serial]
async fn cancellation_between_rounds_leaves_history_untouched() {
    let a = device("A");
    // One entity per round so the session spans several rounds.
    let mut config_b = config("B");
    config_b.max_entities_per_round = 1;
    let b = device_with(config_b);
    cross_trust(&a, &b);
    let a_id = a.engine.local_device();
    let b_id = b.engine.local_device();

    let space = SpaceId::new();
    for n in 0..3 {
        b.engine
            .queue_change(
                space,
                "task",
                EntityId::new(),
                ChangeOp::Create,
                Some(json!({ "n": n })),
            )
            .await
            .unwrap();
    }
    // The initiator also knows the space.
    a.engine
        .queue_change(
            space,
            "task",
            EntityId::new(),
            ChangeOp::Create,
            Some(json!({ "n": "local" })),
        )
        .await
        .unwrap();

    let addr = b.engine.start().await.unwrap();
    a.engine.set_apply_observer(Arc::new(SlowApply));

    let engine = a.engine.clone();
    let session = tokio::spawn(async move { engine.initiate_sync(b_id, addr).await });

    // Round one is stalled inside the observer when the cancel lands.
    sleep(Duration::from_millis(150)).await;
    assert!(a.engine.cancel_sync(b_id));

    let result = session.await.unwrap();
    assert!(matches!(result, Err(SyncError::Cancelled)), "got {result:?}");

    // Neither side records a completed session.
    assert!(a.store.history_for_peer(&b_id).unwrap().is_empty());
    assert!(b.store.history_for_peer(&a_id).unwrap().is_empty());

    let status = a.engine.get_sync_status(b_id);
    assert_eq!(status.phase, SyncPhase::Failed);
    assert_eq!(status.error.unwrap().category, ErrorCategory::Internal);

    b.engine.stop().await;
}

// ── Conflicts end to end ────────────────────────────────────────────────

#[tokio::test]
#[serial]
async fn concurrent_edits_quarantine_and_resolution_propagates() {
    let a = device("A");
    let b = device("B");
    cross_trust(&a, &b);
    let addr = b.engine.start().await.unwrap();
    let a_id = a.engine.local_device();
    let b_id = b.engine.local_device();

    let space = SpaceId::new();
    let entity = EntityId::new();
    a.engine
        .queue_change(
            space,
            "task",
            entity,
            ChangeOp::Create,
            Some(json!({ "title": "shared", "status": "todo" })),
        )
        .await
        .unwrap();
    let first = a.engine.initiate_sync(b_id, addr).await.unwrap();
    assert_eq!(first.entities_sent, 1);
    settled(&b, a_id, 1).await;

    // Both sides edit the same entity while apart.
    a.engine
        .queue_change(
            space,
            "task",
            entity,
            ChangeOp::Update,
            Some(json!({ "title": "A's title" })),
        )
        .await
        .unwrap();
    b.engine
        .queue_change(
            space,
            "task",
            entity,
            ChangeOp::Update,
            Some(json!({ "title": "B's title" })),
        )
        .await
        .unwrap();

    let second = a.engine.initiate_sync(b_id, addr).await.unwrap();
    assert_eq!(second.conflicts_detected, 1);
    assert_eq!(second.entities_applied, 0);
    settled(&b, a_id, 2).await;

    // The losing version is quarantined, not applied.
    let local = a.store.get_entity(&space, &entity).unwrap().unwrap();
    assert_eq!(local.payload, Some(json!({ "title": "A's title" })));

    let conflicts = a.engine.list_conflicts(space).await.unwrap();
    assert_eq!(conflicts.len(), 1);
    let conflict = &conflicts[0];
    assert_eq!(conflict.entity_id, entity);
    assert_eq!(conflict.local_payload, Some(json!({ "title": "A's title" })));
    assert_eq!(conflict.remote_payload, Some(json!({ "title": "B's title" })));
    assert_eq!(conflict.remote_device, b_id);

    // Adopt the remote version; the resolution is a fresh local write.
    a.engine
        .resolve_conflict(conflict.id, ConflictResolution::KeepRemote)
        .await
        .unwrap();
    assert!(a.engine.list_conflicts(space).await.unwrap().is_empty());
    let local = a.store.get_entity(&space, &entity).unwrap().unwrap();
    assert_eq!(local.payload, Some(json!({ "title": "B's title" })));

    // The resolution dominates both branches and propagates cleanly.
    let third = a.engine.initiate_sync(b_id, addr).await.unwrap();
    assert_eq!(third.entities_sent, 1);
    assert_eq!(third.conflicts_detected, 0);
    assert_eq!(
        a.store.space_clock(&space).unwrap(),
        b.store.space_clock(&space).unwrap()
    );
    let remote = b.store.get_entity(&space, &entity).unwrap().unwrap();
    assert_eq!(remote.payload, Some(json!({ "title": "B's title" })));

    // B quarantined its own copy of the race; resolution is per device.
    assert_eq!(b.engine.list_conflicts(space).await.unwrap().len(), 1);

    b.engine.stop().await;
}
