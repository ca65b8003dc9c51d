use weft_crypto::{DeviceKeypair, PublicKeyBytes};
use weft_sync::{SyncError, TrustStore};
use weft_types::DeviceId;

fn fresh_key() -> PublicKeyBytes {
    DeviceKeypair::generate().unwrap().public_key()
}

fn store() -> TrustStore {
    TrustStore::open_in_memory().unwrap()
}

// ── Local identity ──────────────────────────────────────────────────────

#[test]
fn identity_is_generated_once() {
    let trust = store();
    let first = trust.get_or_create_identity("Laptop").unwrap();
    let second = trust.get_or_create_identity("Laptop").unwrap();

    assert_eq!(first.device_id, second.device_id);
    assert_eq!(
        first.keypair.public_key().as_bytes(),
        second.keypair.public_key().as_bytes()
    );
}

#[test]
fn identity_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trust.db");
    let path = path.to_str().unwrap();

    let created = {
        let trust = TrustStore::new(path).unwrap();
        trust.get_or_create_identity("Laptop").unwrap()
    };
    let reloaded = TrustStore::new(path)
        .unwrap()
        .get_or_create_identity("Laptop")
        .unwrap();

    assert_eq!(created.device_id, reloaded.device_id);
    assert_eq!(
        created.keypair.public_key().as_bytes(),
        reloaded.keypair.public_key().as_bytes()
    );
}

#[test]
fn identity_display_name_follows_config() {
    let trust = store();
    trust.get_or_create_identity("Old Name").unwrap();
    let renamed = trust.get_or_create_identity("New Name").unwrap();

    assert_eq!(renamed.display_name, "New Name");
}

// ── Trust on first use ──────────────────────────────────────────────────

#[test]
fn first_contact_pins_the_key() {
    let trust = store();
    let peer_id = DeviceId::new();
    let key = fresh_key();

    let peer = trust.trust_peer(peer_id, "Phone", &key).unwrap();
    assert_eq!(peer.device_id, peer_id);
    assert_eq!(peer.public_key, key);
    assert_eq!(peer.sync_count, 0);

    let looked_up = trust.lookup_peer(&peer_id).unwrap().unwrap();
    assert_eq!(looked_up.public_key, key);
}

#[test]
fn same_key_refreshes_metadata() {
    let trust = store();
    let peer_id = DeviceId::new();
    let key = fresh_key();

    let first = trust.trust_peer(peer_id, "Phone", &key).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(5));
    let again = trust.trust_peer(peer_id, "Renamed Phone", &key).unwrap();

    assert_eq!(again.display_name, "Renamed Phone");
    assert_eq!(again.first_seen, first.first_seen);
    assert!(again.last_seen >= first.last_seen);
}

#[test]
fn changed_key_is_rejected() {
    let trust = store();
    let peer_id = DeviceId::new();
    let pinned = fresh_key();
    trust.trust_peer(peer_id, "Phone", &pinned).unwrap();

    let imposter = fresh_key();
    let err = trust.trust_peer(peer_id, "Phone", &imposter).unwrap_err();
    assert!(matches!(err, SyncError::KeyConflict(_)));

    // The pinned key is untouched.
    let peer = trust.lookup_peer(&peer_id).unwrap().unwrap();
    assert_eq!(peer.public_key, pinned);
}

#[test]
fn retrust_replaces_a_pinned_key() {
    let trust = store();
    let peer_id = DeviceId::new();
    trust.trust_peer(peer_id, "Phone", &fresh_key()).unwrap();

    let replacement = fresh_key();
    trust.retrust_peer(peer_id, "Phone", &replacement).unwrap();

    let peer = trust.lookup_peer(&peer_id).unwrap().unwrap();
    assert_eq!(peer.public_key, replacement);
}

// ── Peer bookkeeping ────────────────────────────────────────────────────

#[test]
fn remove_peer_forgets_the_device() {
    let trust = store();
    let peer_id = DeviceId::new();
    trust.trust_peer(peer_id, "Phone", &fresh_key()).unwrap();

    assert!(trust.remove_peer(&peer_id).unwrap());
    assert!(trust.lookup_peer(&peer_id).unwrap().is_none());
    assert!(!trust.remove_peer(&peer_id).unwrap());
}

#[test]
fn completed_syncs_bump_the_counter() {
    let trust = store();
    let peer_id = DeviceId::new();
    trust.trust_peer(peer_id, "Phone", &fresh_key()).unwrap();

    trust.record_completed_sync(&peer_id).unwrap();
    trust.record_completed_sync(&peer_id).unwrap();

    let peer = trust.lookup_peer(&peer_id).unwrap().unwrap();
    assert_eq!(peer.sync_count, 2);
}

#[test]
fn peers_list_most_recent_first() {
    let trust = store();
    let older = DeviceId::new();
    let newer = DeviceId::new();

    trust.trust_peer(older, "Older", &fresh_key()).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(5));
    trust.trust_peer(newer, "Newer", &fresh_key()).unwrap();

    let peers = trust.list_peers().unwrap();
    assert_eq!(peers.len(), 2);
    assert_eq!(peers[0].device_id, newer);
    assert_eq!(peers[1].device_id, older);
}

#[test]
fn lookup_of_unknown_peer_is_none() {
    let trust = store();
    assert!(trust.lookup_peer(&DeviceId::new()).unwrap().is_none());
}
