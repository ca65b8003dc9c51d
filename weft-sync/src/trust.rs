//! Trust-on-first-use identity and peer store.
//!
//! Backed by SQLite. The local identity (device id, display name,
//! long-term X25519 secret) lives beside the pinned peer keys so one
//! file captures the whole trust state of a device.
//!
//! First contact pins a peer's public key. A later contact presenting a
//! different key is refused with [`SyncError::KeyConflict`] until an
//! operator explicitly calls [`TrustStore::retrust_peer`].

use crate::error::{SyncError, SyncResult};
use crate::model::TrustedPeer;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex};
use weft_crypto::{DeviceKeypair, PublicKeyBytes};
use weft_types::DeviceId;

/// The local device's long-term identity.
#[derive(Debug)]
pub struct DeviceIdentity {
    /// This device's id.
    pub device_id: DeviceId,
    /// Display name advertised to peers.
    pub display_name: String,
    /// Long-term X25519 keypair.
    pub keypair: DeviceKeypair,
}

/// Persistent trust store backed by SQLite.
#[derive(Clone)]
pub struct TrustStore {
    conn: Arc<Mutex<Connection>>,
}

impl TrustStore {
    /// Opens (or creates) a trust store at the given path.
    pub fn new(path: &str) -> SyncResult<Self> {
        let conn = Connection::open(path)
            .map_err(|e| SyncError::Storage(format!("failed to open trust store: {e}")))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Opens an in-memory trust store (for testing).
    pub fn open_in_memory() -> SyncResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| SyncError::Storage(format!("failed to open in-memory trust store: {e}")))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> SyncResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS local_identity (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                device_id TEXT NOT NULL,
                display_name TEXT NOT NULL,
                secret_key TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS trusted_peer (
                device_id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                public_key TEXT NOT NULL,
                first_seen INTEGER NOT NULL,
                last_seen INTEGER NOT NULL,
                sync_count INTEGER NOT NULL DEFAULT 0
            );
            ",
        )
        .map_err(|e| SyncError::Storage(format!("failed to init trust schema: {e}")))?;
        Ok(())
    }

    // ── Local identity ───────────────────────────────────────────

    /// Loads the local identity, creating one on first run.
    ///
    /// The display name always follows the caller's value so a renamed
    /// device advertises its new name after restart.
    pub fn get_or_create_identity(&self, display_name: &str) -> SyncResult<DeviceIdentity> {
        let conn = self.conn.lock().unwrap();
        let existing = conn
            .query_row(
                "SELECT device_id, secret_key FROM local_identity WHERE id = 1",
                [],
                |row| {
                    let device: String = row.get(0)?;
                    let secret: String = row.get(1)?;
                    Ok((device, secret))
                },
            )
            .optional()
            .map_err(|e| SyncError::Storage(format!("failed to load identity: {e}")))?;

        if let Some((device_str, secret_hex)) = existing {
            let device_id = device_str
                .parse()
                .map_err(|e| SyncError::Storage(format!("invalid device_id in identity: {e}")))?;
            let secret = decode_secret(&secret_hex)?;
            conn.execute(
                "UPDATE local_identity SET display_name = ?1 WHERE id = 1",
                params![display_name],
            )
            .map_err(|e| SyncError::Storage(format!("failed to update identity name: {e}")))?;
            return Ok(DeviceIdentity {
                device_id,
                display_name: display_name.to_string(),
                keypair: DeviceKeypair::from_secret_bytes(secret),
            });
        }

        let device_id = DeviceId::new();
        let keypair = DeviceKeypair::generate()?;
        conn.execute(
            "INSERT INTO local_identity (id, device_id, display_name, secret_key) VALUES (1, ?1, ?2, ?3)",
            params![
                device_id.to_string(),
                display_name,
                hex::encode(keypair.secret_bytes()),
            ],
        )
        .map_err(|e| SyncError::Storage(format!("failed to store identity: {e}")))?;

        Ok(DeviceIdentity {
            device_id,
            display_name: display_name.to_string(),
            keypair,
        })
    }

    // ── Peer trust ───────────────────────────────────────────────

    /// Records trust for a peer, first-use style.
    ///
    /// Unknown peers are pinned with the presented key. A known peer
    /// presenting the same key gets its display name and `last_seen`
    /// refreshed. A known peer presenting a different key is refused
    /// with [`SyncError::KeyConflict`] and the stored row is untouched.
    pub fn trust_peer(
        &self,
        device_id: DeviceId,
        display_name: &str,
        public_key: &PublicKeyBytes,
    ) -> SyncResult<TrustedPeer> {
        let conn = self.conn.lock().unwrap();
        let now = now_ms();

        let pinned: Option<String> = conn
            .query_row(
                "SELECT public_key FROM trusted_peer WHERE device_id = ?1",
                params![device_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| SyncError::Storage(format!("failed to load pinned key: {e}")))?;

        match pinned {
            Some(stored) if stored != public_key.to_hex() => {
                return Err(SyncError::KeyConflict(format!(
                    "device {} presented a key different from the pinned one",
                    device_id.short()
                )));
            }
            Some(_) => {
                conn.execute(
                    "UPDATE trusted_peer SET display_name = ?2, last_seen = ?3 WHERE device_id = ?1",
                    params![device_id.to_string(), display_name, now],
                )
                .map_err(|e| SyncError::Storage(format!("failed to refresh peer: {e}")))?;
            }
            None => {
                conn.execute(
                    "INSERT INTO trusted_peer (device_id, display_name, public_key, first_seen, last_seen, sync_count)
                     VALUES (?1, ?2, ?3, ?4, ?4, 0)",
                    params![
                        device_id.to_string(),
                        display_name,
                        public_key.to_hex(),
                        now,
                    ],
                )
                .map_err(|e| SyncError::Storage(format!("failed to pin peer: {e}")))?;
            }
        }

        load_peer(&conn, &device_id)?.ok_or_else(|| {
            SyncError::Storage(format!("peer {} vanished after trust", device_id.short()))
        })
    }

    /// Replaces a peer's pinned key after an explicit operator decision.
    ///
    /// Unknown peers are pinned as if by [`TrustStore::trust_peer`].
    pub fn retrust_peer(
        &self,
        device_id: DeviceId,
        display_name: &str,
        public_key: &PublicKeyBytes,
    ) -> SyncResult<TrustedPeer> {
        let conn = self.conn.lock().unwrap();
        let now = now_ms();
        conn.execute(
            "INSERT INTO trusted_peer (device_id, display_name, public_key, first_seen, last_seen, sync_count)
             VALUES (?1, ?2, ?3, ?4, ?4, 0)
             ON CONFLICT(device_id) DO UPDATE SET
                 display_name = excluded.display_name,
                 public_key = excluded.public_key,
                 last_seen = excluded.last_seen",
            params![
                device_id.to_string(),
                display_name,
                public_key.to_hex(),
                now,
            ],
        )
        .map_err(|e| SyncError::Storage(format!("failed to retrust peer: {e}")))?;

        load_peer(&conn, &device_id)?.ok_or_else(|| {
            SyncError::Storage(format!("peer {} vanished after retrust", device_id.short()))
        })
    }

    /// Looks up a trusted peer by device id.
    pub fn lookup_peer(&self, device_id: &DeviceId) -> SyncResult<Option<TrustedPeer>> {
        let conn = self.conn.lock().unwrap();
        load_peer(&conn, device_id)
    }

    /// Lists all trusted peers, most recently seen first.
    pub fn list_peers(&self) -> SyncResult<Vec<TrustedPeer>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT device_id, display_name, public_key, first_seen, last_seen, sync_count
                 FROM trusted_peer ORDER BY last_seen DESC",
            )
            .map_err(|e| SyncError::Storage(format!("failed to prepare peer query: {e}")))?;

        let rows = stmt
            .query_map([], row_to_tuple)
            .map_err(|e| SyncError::Storage(format!("failed to query peers: {e}")))?;

        let mut peers = Vec::new();
        for row in rows {
            let raw = row.map_err(|e| SyncError::Storage(format!("failed to read peer row: {e}")))?;
            peers.push(peer_from_tuple(raw)?);
        }
        Ok(peers)
    }

    /// Removes a peer from the trust store. Returns whether a row existed.
    pub fn remove_peer(&self, device_id: &DeviceId) -> SyncResult<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                "DELETE FROM trusted_peer WHERE device_id = ?1",
                params![device_id.to_string()],
            )
            .map_err(|e| SyncError::Storage(format!("failed to remove peer: {e}")))?;
        Ok(changed > 0)
    }

    /// Bumps a peer's completed-session counter and `last_seen`.
    pub fn record_completed_sync(&self, device_id: &DeviceId) -> SyncResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE trusted_peer SET sync_count = sync_count + 1, last_seen = ?2 WHERE device_id = ?1",
            params![device_id.to_string(), now_ms()],
        )
        .map_err(|e| SyncError::Storage(format!("failed to record sync: {e}")))?;
        Ok(())
    }
}

type PeerTuple = (String, String, String, i64, i64, i64);

fn row_to_tuple(row: &rusqlite::Row<'_>) -> rusqlite::Result<PeerTuple> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn peer_from_tuple(raw: PeerTuple) -> SyncResult<TrustedPeer> {
    let (device_str, display_name, key_hex, first_seen, last_seen, sync_count) = raw;
    let device_id = device_str
        .parse()
        .map_err(|e| SyncError::Storage(format!("invalid device_id in trust store: {e}")))?;
    let public_key = PublicKeyBytes::from_hex(&key_hex)
        .map_err(|e| SyncError::Storage(format!("invalid public key in trust store: {e}")))?;
    Ok(TrustedPeer {
        device_id,
        display_name,
        public_key,
        first_seen: first_seen as u64,
        last_seen: last_seen as u64,
        sync_count: sync_count as u32,
    })
}

fn load_peer(conn: &Connection, device_id: &DeviceId) -> SyncResult<Option<TrustedPeer>> {
    let raw = conn
        .query_row(
            "SELECT device_id, display_name, public_key, first_seen, last_seen, sync_count
             FROM trusted_peer WHERE device_id = ?1",
            params![device_id.to_string()],
            row_to_tuple,
        )
        .optional()
        .map_err(|e| SyncError::Storage(format!("failed to load peer: {e}")))?;
    raw.map(peer_from_tuple).transpose()
}

fn decode_secret(secret_hex: &str) -> SyncResult<[u8; 32]> {
    let bytes = hex::decode(secret_hex)
        .map_err(|e| SyncError::Storage(format!("invalid secret key in identity: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| SyncError::Storage("identity secret key has wrong length".to_string()))
}

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
