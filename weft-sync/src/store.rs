//! Persistent sync state backed by SQLite.
//!
//! One file holds four tables: `synced_entity` (latest version of every
//! row, deletions included as markers), `space_clock` (one counter per
//! device per space), `sync_conflict` (quarantined concurrent edits),
//! and `sync_history` (latest successful session per space/peer pair).
//!
//! Every round of a sync session applies inside a single transaction;
//! a session that dies mid-round leaves no partial state behind.

use crate::error::{SyncError, SyncResult};
use crate::model::{ChangeOp, SyncConflict, SyncHistoryEntry, SyncableEntity};
use crate::resolver::{self, Disposition};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex};
use weft_crdt::VectorClock;
use weft_types::{ConflictId, DeviceId, EntityId, HybridTimestamp, SpaceId};

/// Runs a blocking store closure off the async runtime.
pub(crate) async fn blocking<T, F>(f: F) -> SyncResult<T>
where
    F: FnOnce() -> SyncResult<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(e) => Err(SyncError::Storage(format!("blocking task panicked: {e}"))),
    }
}

/// Result of applying one delta round.
#[derive(Debug, Default)]
pub struct RoundOutcome {
    /// Entities written locally this round.
    pub applied: Vec<SyncableEntity>,
    /// Conflicts quarantined this round.
    pub conflicts: Vec<SyncConflict>,
    /// Entities skipped as stale or already present.
    pub ignored: usize,
    /// Space clock after the round committed.
    pub new_clock: VectorClock,
}

/// Persistent store for syncable entities and session state.
#[derive(Clone)]
pub struct SyncStore {
    conn: Arc<Mutex<Connection>>,
}

impl SyncStore {
    /// Opens (or creates) a sync store at the given path.
    pub fn new(path: &str) -> SyncResult<Self> {
        let conn = Connection::open(path)
            .map_err(|e| SyncError::Storage(format!("failed to open sync store: {e}")))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Opens an in-memory sync store (for testing).
    pub fn open_in_memory() -> SyncResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| SyncError::Storage(format!("failed to open in-memory sync store: {e}")))?;
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
            CREATE TABLE IF NOT EXISTS synced_entity (
                space_id TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                op TEXT NOT NULL,
                payload TEXT,
                wall_time INTEGER NOT NULL,
                logical INTEGER NOT NULL,
                origin_device TEXT NOT NULL,
                vector_stamp TEXT NOT NULL,
                seen_wall_time INTEGER NOT NULL,
                PRIMARY KEY (space_id, entity_id)
            );
            CREATE INDEX IF NOT EXISTS idx_entity_seen
                ON synced_entity (space_id, seen_wall_time);

            CREATE TABLE IF NOT EXISTS space_clock (
                space_id TEXT NOT NULL,
                device_id TEXT NOT NULL,
                counter INTEGER NOT NULL,
                PRIMARY KEY (space_id, device_id)
            );

            CREATE TABLE IF NOT EXISTS sync_conflict (
                id TEXT PRIMARY KEY,
                space_id TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                local_payload TEXT,
                remote_payload TEXT,
                local_stamp TEXT NOT NULL,
                remote_stamp TEXT NOT NULL,
                remote_device TEXT NOT NULL,
                detected_wall INTEGER NOT NULL,
                detected_logical INTEGER NOT NULL,
                resolved INTEGER NOT NULL DEFAULT 0,
                resolution TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_conflict_space
                ON sync_conflict (space_id, resolved);

            CREATE TABLE IF NOT EXISTS sync_history (
                space_id TEXT NOT NULL,
                peer_device TEXT NOT NULL,
                synced_at INTEGER NOT NULL,
                direction TEXT NOT NULL,
                entities_sent INTEGER NOT NULL,
                entities_applied INTEGER NOT NULL,
                conflicts_detected INTEGER NOT NULL,
                total_syncs INTEGER NOT NULL DEFAULT 1,
                PRIMARY KEY (space_id, peer_device)
            );
            ",
        )
        .map_err(|e| SyncError::Storage(format!("failed to init sync schema: {e}")))?;
        Ok(())
    }

    // ── Local writes ─────────────────────────────────────────────

    /// Records a local change: bumps this device's clock entry, stamps
    /// the entity with the updated space clock, and upserts the row.
    ///
    /// Deletions keep their row with `payload = NULL` so the deletion
    /// propagates to peers.
    pub fn record_change(
        &self,
        device: DeviceId,
        space: SpaceId,
        entity_type: &str,
        entity_id: EntityId,
        op: ChangeOp,
        payload: Option<serde_json::Value>,
        stamp: HybridTimestamp,
    ) -> SyncResult<SyncableEntity> {
        let payload = if op == ChangeOp::Delete { None } else { payload };

        let mut guard = self.conn.lock().unwrap();
        let tx = guard
            .transaction()
            .map_err(|e| SyncError::Storage(format!("failed to begin change tx: {e}")))?;

        let mut clock = read_clock(&tx, &space)?;
        clock.increment(device);
        write_clock(&tx, &space, &clock)?;

        let entity = SyncableEntity {
            space_id: space,
            entity_id,
            entity_type: entity_type.to_string(),
            op,
            payload,
            updated_at: stamp,
            origin_device: device,
            vector_stamp: clock,
        };
        upsert_entity(&tx, &entity, stamp.wall_time())?;

        tx.commit()
            .map_err(|e| SyncError::Storage(format!("failed to commit change: {e}")))?;
        Ok(entity)
    }

    /// Loads one entity row.
    pub fn get_entity(
        &self,
        space: &SpaceId,
        entity_id: &EntityId,
    ) -> SyncResult<Option<SyncableEntity>> {
        let conn = self.conn.lock().unwrap();
        read_entity(&conn, space, entity_id)
    }

    // ── Clocks and spaces ────────────────────────────────────────

    /// Current vector clock for a space.
    pub fn space_clock(&self, space: &SpaceId) -> SyncResult<VectorClock> {
        let conn = self.conn.lock().unwrap();
        read_clock(&conn, space)
    }

    /// All spaces with any recorded state, in stable order.
    pub fn list_spaces(&self) -> SyncResult<Vec<SpaceId>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT space_id FROM synced_entity
                 UNION SELECT space_id FROM space_clock
                 ORDER BY space_id",
            )
            .map_err(|e| SyncError::Storage(format!("failed to prepare space query: {e}")))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| SyncError::Storage(format!("failed to query spaces: {e}")))?;

        let mut spaces = Vec::new();
        for row in rows {
            let raw = row.map_err(|e| SyncError::Storage(format!("failed to read space row: {e}")))?;
            let space = raw
                .parse()
                .map_err(|e| SyncError::Storage(format!("invalid space_id in store: {e}")))?;
            spaces.push(space);
        }
        Ok(spaces)
    }

    // ── Delta support ────────────────────────────────────────────

    /// Entities written locally after `newer_than` wall-clock ms.
    ///
    /// This is the cheap time pre-filter; the caller still runs the
    /// vector clock test before shipping anything.
    pub fn delta_candidates(
        &self,
        space: &SpaceId,
        newer_than: u64,
    ) -> SyncResult<Vec<SyncableEntity>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT entity_id, entity_type, op, payload, wall_time, logical, origin_device, vector_stamp
                 FROM synced_entity
                 WHERE space_id = ?1 AND seen_wall_time > ?2",
            )
            .map_err(|e| SyncError::Storage(format!("failed to prepare delta query: {e}")))?;
        let rows = stmt
            .query_map(params![space.to_string(), newer_than as i64], entity_row)
            .map_err(|e| SyncError::Storage(format!("failed to query delta candidates: {e}")))?;

        let mut entities = Vec::new();
        for row in rows {
            let raw =
                row.map_err(|e| SyncError::Storage(format!("failed to read entity row: {e}")))?;
            entities.push(entity_from_tuple(*space, raw)?);
        }
        Ok(entities)
    }

    // ── Round application ────────────────────────────────────────

    /// Applies one received delta round in a single transaction.
    ///
    /// Each entity is judged against the local row: dominating stamps
    /// are applied, dominated or equal ones ignored, concurrent ones
    /// quarantined as conflicts while the local row stays untouched.
    /// Every received stamp merges into the space clock; the sender's
    /// full clock merges only on its final round, after which both
    /// clocks are aligned.
    pub fn apply_round(
        &self,
        space: &SpaceId,
        entities: &[SyncableEntity],
        sender_clock: &VectorClock,
        final_round: bool,
        remote_device: DeviceId,
        now: HybridTimestamp,
    ) -> SyncResult<RoundOutcome> {
        let mut guard = self.conn.lock().unwrap();
        let tx = guard
            .transaction()
            .map_err(|e| SyncError::Storage(format!("failed to begin apply tx: {e}")))?;

        let mut clock = read_clock(&tx, space)?;
        let mut outcome = RoundOutcome::default();
        let seen_wall = now.wall_time();

        for remote in entities {
            let local = read_entity(&tx, space, &remote.entity_id)?;
            match resolver::disposition(local.as_ref(), remote) {
                Disposition::ApplyRemote => {
                    upsert_entity(&tx, remote, seen_wall)?;
                    outcome.applied.push(remote.clone());
                }
                Disposition::KeepLocal | Disposition::Unchanged => {
                    outcome.ignored += 1;
                }
                Disposition::Conflict => {
                    // disposition only returns Conflict when a local row exists
                    let local = local.ok_or_else(|| {
                        SyncError::Storage("conflict disposition without local row".to_string())
                    })?;
                    let conflict = SyncConflict {
                        id: ConflictId::new(),
                        space_id: *space,
                        entity_id: remote.entity_id,
                        entity_type: remote.entity_type.clone(),
                        local_payload: local.payload.clone(),
                        remote_payload: remote.payload.clone(),
                        local_stamp: local.vector_stamp.clone(),
                        remote_stamp: remote.vector_stamp.clone(),
                        remote_device,
                        detected_at: now,
                        resolved: false,
                    };
                    insert_conflict(&tx, &conflict)?;
                    outcome.conflicts.push(conflict);
                }
            }
            clock.merge(&remote.vector_stamp);
        }

        if final_round {
            clock.merge(sender_clock);
        }
        write_clock(&tx, space, &clock)?;

        tx.commit()
            .map_err(|e| SyncError::Storage(format!("failed to commit round: {e}")))?;
        outcome.new_clock = clock;
        Ok(outcome)
    }

    // ── Conflicts ────────────────────────────────────────────────

    /// Unresolved conflicts in a space, oldest first.
    pub fn list_conflicts(&self, space: &SpaceId) -> SyncResult<Vec<SyncConflict>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, space_id, entity_id, entity_type, local_payload, remote_payload,
                        local_stamp, remote_stamp, remote_device, detected_wall, detected_logical, resolved
                 FROM sync_conflict
                 WHERE space_id = ?1 AND resolved = 0
                 ORDER BY detected_wall, detected_logical",
            )
            .map_err(|e| SyncError::Storage(format!("failed to prepare conflict query: {e}")))?;
        let rows = stmt
            .query_map(params![space.to_string()], conflict_row)
            .map_err(|e| SyncError::Storage(format!("failed to query conflicts: {e}")))?;

        let mut conflicts = Vec::new();
        for row in rows {
            let raw =
                row.map_err(|e| SyncError::Storage(format!("failed to read conflict row: {e}")))?;
            conflicts.push(conflict_from_tuple(raw)?);
        }
        Ok(conflicts)
    }

    /// Loads one conflict by id, resolved or not.
    pub fn get_conflict(&self, id: &ConflictId) -> SyncResult<Option<SyncConflict>> {
        let conn = self.conn.lock().unwrap();
        let raw = conn
            .query_row(
                "SELECT id, space_id, entity_id, entity_type, local_payload, remote_payload,
                        local_stamp, remote_stamp, remote_device, detected_wall, detected_logical, resolved
                 FROM sync_conflict WHERE id = ?1",
                params![id.to_string()],
                conflict_row,
            )
            .optional()
            .map_err(|e| SyncError::Storage(format!("failed to load conflict: {e}")))?;
        raw.map(conflict_from_tuple).transpose()
    }

    /// Marks a conflict resolved with a label describing the verdict.
    pub fn mark_conflict_resolved(&self, id: &ConflictId, resolution: &str) -> SyncResult<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                "UPDATE sync_conflict SET resolved = 1, resolution = ?2 WHERE id = ?1",
                params![id.to_string(), resolution],
            )
            .map_err(|e| SyncError::Storage(format!("failed to resolve conflict: {e}")))?;
        if changed == 0 {
            return Err(SyncError::Storage(format!(
                "conflict {id} not found"
            )));
        }
        Ok(())
    }

    // ── History ──────────────────────────────────────────────────

    /// Rewrites the history row for `(space, peer)` after a successful
    /// session, bumping the pair's completed-session counter.
    pub fn record_history(&self, entry: &SyncHistoryEntry) -> SyncResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sync_history
                 (space_id, peer_device, synced_at, direction, entities_sent,
                  entities_applied, conflicts_detected, total_syncs)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1)
             ON CONFLICT(space_id, peer_device) DO UPDATE SET
                 synced_at = excluded.synced_at,
                 direction = excluded.direction,
                 entities_sent = excluded.entities_sent,
                 entities_applied = excluded.entities_applied,
                 conflicts_detected = excluded.conflicts_detected,
                 total_syncs = sync_history.total_syncs + 1",
            params![
                entry.space_id.to_string(),
                entry.peer_device_id.to_string(),
                entry.synced_at as i64,
                entry.direction.as_str(),
                entry.entities_sent as i64,
                entry.entities_applied as i64,
                entry.conflicts_detected as i64,
            ],
        )
        .map_err(|e| SyncError::Storage(format!("failed to record history: {e}")))?;
        Ok(())
    }

    /// Wall-clock ms of the last successful sync with a peer for a
    /// space; zero when the pair has never completed a session.
    pub fn last_sync_at(&self, space: &SpaceId, peer: &DeviceId) -> SyncResult<u64> {
        let conn = self.conn.lock().unwrap();
        let at: Option<i64> = conn
            .query_row(
                "SELECT synced_at FROM sync_history WHERE space_id = ?1 AND peer_device = ?2",
                params![space.to_string(), peer.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| SyncError::Storage(format!("failed to load last sync time: {e}")))?;
        Ok(at.unwrap_or(0) as u64)
    }

    /// History rows for a peer across all spaces, newest first.
    pub fn history_for_peer(&self, peer: &DeviceId) -> SyncResult<Vec<SyncHistoryEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT space_id, peer_device, synced_at, direction, entities_sent,
                        entities_applied, conflicts_detected, total_syncs
                 FROM sync_history WHERE peer_device = ?1
                 ORDER BY synced_at DESC",
            )
            .map_err(|e| SyncError::Storage(format!("failed to prepare history query: {e}")))?;
        let rows = stmt
            .query_map(params![peer.to_string()], history_row)
            .map_err(|e| SyncError::Storage(format!("failed to query history: {e}")))?;

        let mut entries = Vec::new();
        for row in rows {
            let raw =
                row.map_err(|e| SyncError::Storage(format!("failed to read history row: {e}")))?;
            entries.push(history_from_tuple(raw)?);
        }
        Ok(entries)
    }
}

// ── Row plumbing ────────────────────────────────────────────────────────

type EntityTuple = (
    String,
    String,
    String,
    Option<String>,
    i64,
    i64,
    String,
    String,
);

fn entity_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntityTuple> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn entity_from_tuple(space: SpaceId, raw: EntityTuple) -> SyncResult<SyncableEntity> {
    let (entity_str, entity_type, op_str, payload_str, wall, logical, origin_str, stamp_str) = raw;
    let entity_id = entity_str
        .parse()
        .map_err(|e| SyncError::Storage(format!("invalid entity_id in store: {e}")))?;
    let op = ChangeOp::parse(&op_str)
        .ok_or_else(|| SyncError::Storage(format!("invalid op in store: {op_str}")))?;
    let payload = match payload_str {
        Some(s) => Some(serde_json::from_str(&s)?),
        None => None,
    };
    let origin_device = origin_str
        .parse()
        .map_err(|e| SyncError::Storage(format!("invalid origin device in store: {e}")))?;
    let vector_stamp = serde_json::from_str(&stamp_str)?;
    Ok(SyncableEntity {
        space_id: space,
        entity_id,
        entity_type,
        op,
        payload,
        updated_at: HybridTimestamp::new(wall as u64, logical as u32),
        origin_device,
        vector_stamp,
    })
}

fn read_entity(
    conn: &Connection,
    space: &SpaceId,
    entity_id: &EntityId,
) -> SyncResult<Option<SyncableEntity>> {
    let raw = conn
        .query_row(
            "SELECT entity_id, entity_type, op, payload, wall_time, logical, origin_device, vector_stamp
             FROM synced_entity WHERE space_id = ?1 AND entity_id = ?2",
            params![space.to_string(), entity_id.to_string()],
            entity_row,
        )
        .optional()
        .map_err(|e| SyncError::Storage(format!("failed to load entity: {e}")))?;
    raw.map(|t| entity_from_tuple(*space, t)).transpose()
}

fn upsert_entity(conn: &Connection, entity: &SyncableEntity, seen_wall: u64) -> SyncResult<()> {
    let payload = entity
        .payload
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let stamp = serde_json::to_string(&entity.vector_stamp)?;
    conn.execute(
        "INSERT INTO synced_entity
             (space_id, entity_id, entity_type, op, payload, wall_time, logical,
              origin_device, vector_stamp, seen_wall_time)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(space_id, entity_id) DO UPDATE SET
             entity_type = excluded.entity_type,
             op = excluded.op,
             payload = excluded.payload,
             wall_time = excluded.wall_time,
             logical = excluded.logical,
             origin_device = excluded.origin_device,
             vector_stamp = excluded.vector_stamp,
             seen_wall_time = excluded.seen_wall_time",
        params![
            entity.space_id.to_string(),
            entity.entity_id.to_string(),
            entity.entity_type,
            entity.op.as_str(),
            payload,
            entity.updated_at.wall_time() as i64,
            entity.updated_at.logical() as i64,
            entity.origin_device.to_string(),
            stamp,
            seen_wall as i64,
        ],
    )
    .map_err(|e| SyncError::Storage(format!("failed to upsert entity: {e}")))?;
    Ok(())
}

fn read_clock(conn: &Connection, space: &SpaceId) -> SyncResult<VectorClock> {
    let mut stmt = conn
        .prepare("SELECT device_id, counter FROM space_clock WHERE space_id = ?1")
        .map_err(|e| SyncError::Storage(format!("failed to prepare clock query: {e}")))?;
    let rows = stmt
        .query_map(params![space.to_string()], |row| {
            let device: String = row.get(0)?;
            let counter: i64 = row.get(1)?;
            Ok((device, counter))
        })
        .map_err(|e| SyncError::Storage(format!("failed to query clock: {e}")))?;

    let mut clock = VectorClock::new();
    for row in rows {
        let (device_str, counter) =
            row.map_err(|e| SyncError::Storage(format!("failed to read clock row: {e}")))?;
        let device = device_str
            .parse()
            .map_err(|e| SyncError::Storage(format!("invalid device_id in clock: {e}")))?;
        clock.observe(device, counter as u64);
    }
    Ok(clock)
}

fn write_clock(conn: &Connection, space: &SpaceId, clock: &VectorClock) -> SyncResult<()> {
    for (device, counter) in clock.entries() {
        conn.execute(
            "INSERT OR REPLACE INTO space_clock (space_id, device_id, counter) VALUES (?1, ?2, ?3)",
            params![space.to_string(), device.to_string(), *counter as i64],
        )
        .map_err(|e| SyncError::Storage(format!("failed to write clock entry: {e}")))?;
    }
    Ok(())
}

fn insert_conflict(conn: &Connection, conflict: &SyncConflict) -> SyncResult<()> {
    let local_payload = conflict
        .local_payload
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let remote_payload = conflict
        .remote_payload
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    conn.execute(
        "INSERT INTO sync_conflict
             (id, space_id, entity_id, entity_type, local_payload, remote_payload,
              local_stamp, remote_stamp, remote_device, detected_wall, detected_logical, resolved)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0)",
        params![
            conflict.id.to_string(),
            conflict.space_id.to_string(),
            conflict.entity_id.to_string(),
            conflict.entity_type,
            local_payload,
            remote_payload,
            serde_json::to_string(&conflict.local_stamp)?,
            serde_json::to_string(&conflict.remote_stamp)?,
            conflict.remote_device.to_string(),
            conflict.detected_at.wall_time() as i64,
            conflict.detected_at.logical() as i64,
        ],
    )
    .map_err(|e| SyncError::Storage(format!("failed to insert conflict: {e}")))?;
    Ok(())
}

type ConflictTuple = (
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    String,
    String,
    String,
    i64,
    i64,
    bool,
);

fn conflict_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConflictTuple> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
    ))
}

fn conflict_from_tuple(raw: ConflictTuple) -> SyncResult<SyncConflict> {
    let (
        id_str,
        space_str,
        entity_str,
        entity_type,
        local_payload,
        remote_payload,
        local_stamp,
        remote_stamp,
        device_str,
        wall,
        logical,
        resolved,
    ) = raw;
    Ok(SyncConflict {
        id: id_str
            .parse()
            .map_err(|e| SyncError::Storage(format!("invalid conflict id in store: {e}")))?,
        space_id: space_str
            .parse()
            .map_err(|e| SyncError::Storage(format!("invalid space_id in conflict: {e}")))?,
        entity_id: entity_str
            .parse()
            .map_err(|e| SyncError::Storage(format!("invalid entity_id in conflict: {e}")))?,
        entity_type,
        local_payload: local_payload.map(|s| serde_json::from_str(&s)).transpose()?,
        remote_payload: remote_payload.map(|s| serde_json::from_str(&s)).transpose()?,
        local_stamp: serde_json::from_str(&local_stamp)?,
        remote_stamp: serde_json::from_str(&remote_stamp)?,
        remote_device: device_str
            .parse()
            .map_err(|e| SyncError::Storage(format!("invalid device_id in conflict: {e}")))?,
        detected_at: HybridTimestamp::new(wall as u64, logical as u32),
        resolved,
    })
}

type HistoryTuple = (String, String, i64, String, i64, i64, i64, i64);

fn history_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<HistoryTuple> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn history_from_tuple(raw: HistoryTuple) -> SyncResult<SyncHistoryEntry> {
    let (space_str, peer_str, synced_at, dir_str, sent, applied, conflicts, total) = raw;
    let direction = crate::model::SyncDirection::parse(&dir_str)
        .ok_or_else(|| SyncError::Storage(format!("invalid direction in history: {dir_str}")))?;
    Ok(SyncHistoryEntry {
        space_id: space_str
            .parse()
            .map_err(|e| SyncError::Storage(format!("invalid space_id in history: {e}")))?,
        peer_device_id: peer_str
            .parse()
            .map_err(|e| SyncError::Storage(format!("invalid device_id in history: {e}")))?,
        synced_at: synced_at as u64,
        direction,
        entities_sent: sent as usize,
        entities_applied: applied as usize,
        conflicts_detected: conflicts as usize,
        total_syncs: total as u32,
    })
}
