//! Sync engine: the public entry point that ties trust, discovery,
//! pairing, and delta sessions together.
//!
//! One [`SyncEngine`] owns a device identity, a [`TrustStore`], and a
//! [`SyncStore`]. It can run a listener for inbound sessions
//! ([`SyncEngine::start`]) and drive outbound sessions against a trusted
//! peer ([`SyncEngine::initiate_sync`]). At most one session per peer is
//! in flight at a time, in either direction.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use weft_types::{ConflictId, DeviceId, EntityId, HybridTimestamp, SpaceId};

use crate::delta;
use crate::discovery;
use crate::error::{PairingError, SyncError, SyncResult};
use crate::listener::{self, ListenerHandle};
use crate::model::{
    ChangeOp, ConflictResolution, DiscoveredPeer, StatusError, SyncConflict, SyncDirection,
    SyncHistoryEntry, SyncPhase, SyncStatus, SyncSummary, SyncableEntity, TrustedPeer,
};
use crate::pairing;
use crate::protocol::{
    generate_pin, AckMessage, DeltaMessage, PairingInvite, SyncMessage, SyncRequestMessage,
};
use crate::session::{sync_name, SecureChannel};
use crate::store::{blocking, RoundOutcome, SyncStore};
use crate::trust::{now_ms, DeviceIdentity, TrustStore};

// ── Configuration ───────────────────────────────────────────────────────

/// Tunables for a [`SyncEngine`].
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Human-readable name advertised to peers and shown during pairing.
    pub display_name: String,
    /// Address the listener binds. Port 0 picks an ephemeral port, which
    /// then feeds the mDNS advertisement and pairing invites.
    pub listen_addr: SocketAddr,
    /// How long [`SyncEngine::discover_devices`] browses by default.
    pub discovery_window: Duration,
    /// Upper bound on entities shipped per delta round and direction.
    pub max_entities_per_round: usize,
    /// Timeout applied to every network wait (connect, handshake, frame).
    pub network_timeout: Duration,
    /// Cap on concurrently served inbound connections.
    pub max_connections: usize,
    /// Hard cap on delta rounds per space before the session is aborted.
    pub max_rounds: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            display_name: "Weft Device".to_string(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            discovery_window: Duration::from_secs(3),
            max_entities_per_round: 64,
            network_timeout: Duration::from_secs(10),
            max_connections: 10,
            max_rounds: 32,
        }
    }
}

// ── Apply observer ──────────────────────────────────────────────────────

/// Callbacks fired after each committed delta round.
///
/// The embedder uses this to refresh caches or UI state when remote
/// entities land. Callbacks run on the session task; keep them short.
#[async_trait]
pub trait ApplyObserver: Send + Sync {
    /// A remote entity was applied to the local store.
    async fn entity_applied(&self, entity: &SyncableEntity);

    /// A concurrent edit was quarantined for explicit resolution.
    async fn conflict_detected(&self, conflict: &SyncConflict);
}

// ── Shared engine state ─────────────────────────────────────────────────

pub(crate) struct EngineInner {
    pub(crate) identity: DeviceIdentity,
    pub(crate) config: SyncConfig,
    pub(crate) trust: TrustStore,
    pub(crate) store: SyncStore,
    hlc: Mutex<HybridTimestamp>,
    in_flight: Mutex<HashSet<DeviceId>>,
    status: Mutex<HashMap<DeviceId, SyncStatus>>,
    cancels: Mutex<HashMap<DeviceId, Arc<AtomicBool>>>,
    space_locks: Mutex<HashMap<SpaceId, Arc<AsyncMutex<()>>>>,
    observer: RwLock<Option<Arc<dyn ApplyObserver>>>,
    pub(crate) armed_invite: AsyncMutex<Option<PairingInvite>>,
    listener: AsyncMutex<Option<ListenerHandle>>,
}

impl EngineInner {
    pub(crate) fn set_status(&self, peer: DeviceId, phase: SyncPhase, progress: f64) {
        let mut map = self.status.lock().unwrap();
        map.insert(
            peer,
            SyncStatus {
                phase,
                progress,
                error: None,
            },
        );
    }

    pub(crate) fn fail_status(&self, peer: DeviceId, err: &SyncError) {
        let mut map = self.status.lock().unwrap();
        map.insert(
            peer,
            SyncStatus {
                phase: SyncPhase::Failed,
                progress: 0.0,
                error: Some(StatusError {
                    category: err.category(),
                    message: err.to_string(),
                }),
            },
        );
    }

    /// Advisory lock serializing writes to one space. Round application
    /// and `queue_change` for the same space take it; different spaces
    /// proceed concurrently.
    pub(crate) fn space_lock(&self, space: SpaceId) -> Arc<AsyncMutex<()>> {
        let mut locks = self.space_locks.lock().unwrap();
        Arc::clone(locks.entry(space).or_default())
    }

    /// Ticks the device clock for a fresh local write.
    pub(crate) fn next_stamp(&self) -> HybridTimestamp {
        let mut hlc = self.hlc.lock().unwrap();
        let next = hlc.tick();
        *hlc = next;
        next
    }

    /// Advances the device clock past every stamp in an incoming batch
    /// and returns the resulting local time. Conflicts quarantined during
    /// the apply are stamped with it.
    pub(crate) fn observe_remote_stamps(&self, entities: &[SyncableEntity]) -> HybridTimestamp {
        let mut hlc = self.hlc.lock().unwrap();
        let mut now = hlc.tick();
        for entity in entities {
            now = now.receive(&entity.updated_at);
        }
        *hlc = now;
        now
    }

    pub(crate) async fn notify_round(&self, outcome: &RoundOutcome) {
        let observer = self.observer.read().unwrap().clone();
        let Some(observer) = observer else {
            return;
        };
        for entity in &outcome.applied {
            observer.entity_applied(entity).await;
        }
        for conflict in &outcome.conflicts {
            observer.conflict_detected(conflict).await;
        }
    }
}

// ── Session admission ───────────────────────────────────────────────────

/// Holds the per-peer in-flight slot for the duration of a session, in
/// either direction. Dropping the guard frees the slot and discards the
/// cancellation flag, including on panic or task abort.
pub(crate) struct InFlightGuard {
    inner: Arc<EngineInner>,
    peer: DeviceId,
    cancel: Arc<AtomicBool>,
}

impl InFlightGuard {
    pub(crate) fn try_acquire(inner: Arc<EngineInner>, peer: DeviceId) -> SyncResult<Self> {
        {
            let mut in_flight = inner.in_flight.lock().unwrap();
            if !in_flight.insert(peer) {
                return Err(SyncError::SyncAlreadyInProgress);
            }
        }
        let cancel = Arc::new(AtomicBool::new(false));
        inner
            .cancels
            .lock()
            .unwrap()
            .insert(peer, Arc::clone(&cancel));
        Ok(Self {
            inner,
            peer,
            cancel,
        })
    }

    pub(crate) fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.in_flight.lock().unwrap().remove(&self.peer);
        self.inner.cancels.lock().unwrap().remove(&self.peer);
    }
}

pub(crate) fn check_cancelled(cancel: &AtomicBool) -> SyncResult<()> {
    if cancel.load(Ordering::Relaxed) {
        Err(SyncError::Cancelled)
    } else {
        Ok(())
    }
}

// ── Round message plumbing ──────────────────────────────────────────────

pub(crate) fn expect_delta(msg: SyncMessage, space: SpaceId) -> SyncResult<DeltaMessage> {
    match msg {
        SyncMessage::Delta(delta) if delta.space_id == space => Ok(delta),
        SyncMessage::Delta(delta) => Err(SyncError::Protocol(format!(
            "delta for space {} during a round for space {space}",
            delta.space_id
        ))),
        SyncMessage::Error(err) => Err(SyncError::Protocol(format!(
            "peer reported error {}: {}",
            err.code, err.message
        ))),
        other => Err(SyncError::Protocol(format!(
            "expected Delta, got {}",
            sync_name(&other)
        ))),
    }
}

pub(crate) fn expect_ack(msg: SyncMessage, space: SpaceId, round: u32) -> SyncResult<AckMessage> {
    match msg {
        SyncMessage::Ack(ack) if ack.space_id == space && ack.round == round => Ok(ack),
        SyncMessage::Ack(ack) => Err(SyncError::Protocol(format!(
            "ack for space {} round {} during space {space} round {round}",
            ack.space_id, ack.round
        ))),
        SyncMessage::Error(err) => Err(SyncError::Protocol(format!(
            "peer reported error {}: {}",
            err.code, err.message
        ))),
        other => Err(SyncError::Protocol(format!(
            "expected Ack, got {}",
            sync_name(&other)
        ))),
    }
}

/// Per-space counters accumulated over a session's rounds.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct SpaceStats {
    pub(crate) sent: usize,
    pub(crate) applied: usize,
    pub(crate) conflicts: usize,
}

// ── Engine ──────────────────────────────────────────────────────────────

/// Orchestrates encrypted peer-to-peer sync for one device.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    /// Creates an engine around existing stores, loading the device
    /// identity from the trust store or generating one on first run.
    pub fn new(config: SyncConfig, trust: TrustStore, store: SyncStore) -> SyncResult<Self> {
        let identity = trust.get_or_create_identity(&config.display_name)?;
        info!(
            device = %identity.device_id.short(),
            name = %identity.display_name,
            "sync engine ready"
        );
        Ok(Self {
            inner: Arc::new(EngineInner {
                identity,
                config,
                trust,
                store,
                hlc: Mutex::new(HybridTimestamp::now()),
                in_flight: Mutex::new(HashSet::new()),
                status: Mutex::new(HashMap::new()),
                cancels: Mutex::new(HashMap::new()),
                space_locks: Mutex::new(HashMap::new()),
                observer: RwLock::new(None),
                armed_invite: AsyncMutex::new(None),
                listener: AsyncMutex::new(None),
            }),
        })
    }

    /// This device's stable identifier.
    #[must_use]
    pub fn local_device(&self) -> DeviceId {
        self.inner.identity.device_id
    }

    /// The display name peers see for this device.
    #[must_use]
    pub fn local_display_name(&self) -> &str {
        &self.inner.identity.display_name
    }

    /// Registers the observer notified after each committed round.
    pub fn set_apply_observer(&self, observer: Arc<dyn ApplyObserver>) {
        *self.inner.observer.write().unwrap() = Some(observer);
    }

    // ── Listener lifecycle ──────────────────────────────────────────────

    /// Binds the listener and starts advertising over mDNS. Idempotent;
    /// returns the bound address. The listener serves inbound sync
    /// sessions and pairing attempts until [`SyncEngine::stop`].
    pub async fn start(&self) -> SyncResult<SocketAddr> {
        let mut slot = self.inner.listener.lock().await;
        if let Some(handle) = slot.as_ref() {
            return Ok(handle.local_addr());
        }
        let handle = listener::spawn(Arc::clone(&self.inner)).await?;
        let addr = handle.local_addr();
        *slot = Some(handle);
        Ok(addr)
    }

    /// Stops the listener and withdraws the mDNS advertisement. Sessions
    /// already accepted run to completion.
    pub async fn stop(&self) {
        let handle = self.inner.listener.lock().await.take();
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }

    /// The listener's bound address, if it is running.
    pub async fn listen_addr(&self) -> Option<SocketAddr> {
        self.inner.listener.lock().await.as_ref().map(ListenerHandle::local_addr)
    }

    // ── Discovery and pairing ───────────────────────────────────────────

    /// Browses mDNS for other devices advertising the sync service.
    /// Collects everything seen within `window`; never errors on an
    /// empty network.
    pub async fn discover_devices(&self, window: Duration) -> SyncResult<Vec<DiscoveredPeer>> {
        discovery::discover(self.inner.identity.device_id, window).await
    }

    /// Arms a one-shot pairing invite and returns it for QR display.
    ///
    /// Starts the listener if needed so the invite carries a reachable
    /// address. The invite is consumed by the first inbound pairing
    /// attempt, successful or not; later attempts are rejected until
    /// `begin_pairing` is called again.
    pub async fn begin_pairing(&self) -> SyncResult<PairingInvite> {
        let addr = self.start().await?;
        let ip = discovery::advertised_ip(addr.ip());
        let invite = PairingInvite::new(
            self.inner.identity.keypair.public_key(),
            SocketAddr::new(ip, addr.port()),
            generate_pin(),
        );
        *self.inner.armed_invite.lock().await = Some(invite.clone());
        info!(addr = %invite.socket_addr(), "pairing invite armed");
        Ok(invite)
    }

    /// Dials the device behind a scanned invite and runs the pairing
    /// exchange. On success both sides have pinned each other's keys.
    pub async fn pair_with(&self, qr_payload: &str) -> Result<TrustedPeer, PairingError> {
        let invite = PairingInvite::from_qr_payload(qr_payload)?;
        self.pair_with_invite(invite)
            .await
            .map_err(pairing::into_pairing_error)
    }

    async fn pair_with_invite(&self, invite: PairingInvite) -> SyncResult<TrustedPeer> {
        let timeout = self.inner.config.network_timeout;
        let mut stream = tokio::time::timeout(timeout, TcpStream::connect(invite.socket_addr()))
            .await
            .map_err(|_| SyncError::Timeout)??;
        pairing::request(
            &mut stream,
            &self.inner.identity,
            &self.inner.trust,
            &invite,
            timeout,
        )
        .await
    }

    // ── Local writes and conflicts ──────────────────────────────────────

    /// Records a local change: ticks the device clock, increments this
    /// device's entry in the space clock, and stamps and upserts the
    /// entity so the next session ships it.
    pub async fn queue_change(
        &self,
        space_id: SpaceId,
        entity_type: impl Into<String>,
        entity_id: EntityId,
        op: ChangeOp,
        payload: Option<serde_json::Value>,
    ) -> SyncResult<()> {
        let entity_type = entity_type.into();
        let stamp = self.inner.next_stamp();
        let lock = self.inner.space_lock(space_id);
        let _space_guard = lock.lock().await;
        let store = self.inner.store.clone();
        let device = self.inner.identity.device_id;
        blocking(move || {
            store.record_change(device, space_id, &entity_type, entity_id, op, payload, stamp)
        })
        .await?;
        Ok(())
    }

    /// Unresolved conflicts quarantined in a space, oldest first.
    pub async fn list_conflicts(&self, space_id: SpaceId) -> SyncResult<Vec<SyncConflict>> {
        let store = self.inner.store.clone();
        blocking(move || store.list_conflicts(&space_id)).await
    }

    /// Resolves a quarantined conflict by applying the chosen payload as
    /// a fresh local write. The new stamp dominates both branches, so the
    /// resolution propagates on the next session.
    pub async fn resolve_conflict(
        &self,
        conflict_id: ConflictId,
        resolution: ConflictResolution,
    ) -> SyncResult<()> {
        let store = self.inner.store.clone();
        let conflict = blocking(move || store.get_conflict(&conflict_id))
            .await?
            .ok_or_else(|| SyncError::Storage(format!("conflict {conflict_id} not found")))?;
        if conflict.resolved {
            return Err(SyncError::Storage(format!(
                "conflict {conflict_id} already resolved"
            )));
        }

        let (payload, label) = match resolution {
            ConflictResolution::KeepLocal => (conflict.local_payload.clone(), "kept local"),
            ConflictResolution::KeepRemote => (conflict.remote_payload.clone(), "kept remote"),
            ConflictResolution::Merged(merged) => (Some(merged), "merged"),
        };
        let op = if payload.is_none() {
            ChangeOp::Delete
        } else {
            ChangeOp::Update
        };
        self.queue_change(
            conflict.space_id,
            conflict.entity_type.clone(),
            conflict.entity_id,
            op,
            payload,
        )
        .await?;

        let store = self.inner.store.clone();
        blocking(move || store.mark_conflict_resolved(&conflict_id, label)).await?;
        info!(conflict = %conflict_id, resolution = label, "conflict resolved");
        Ok(())
    }

    // ── Sync sessions ───────────────────────────────────────────────────

    /// Runs a full sync session against a trusted peer: one encrypted
    /// connection, every local space in turn, delta rounds until both
    /// directions are final.
    ///
    /// Fails fast with [`SyncError::SyncAlreadyInProgress`] when a
    /// session with this peer is already in flight in either direction,
    /// and with [`SyncError::UntrustedPeer`] before connecting when the
    /// peer is not in the trust store.
    pub async fn initiate_sync(
        &self,
        peer_device_id: DeviceId,
        address: SocketAddr,
    ) -> SyncResult<SyncSummary> {
        let guard = InFlightGuard::try_acquire(Arc::clone(&self.inner), peer_device_id)?;
        let cancel = guard.cancel_flag();
        let started = Instant::now();

        match self.run_initiator(peer_device_id, address, &cancel).await {
            Ok(mut summary) => {
                summary.duration = started.elapsed();
                self.inner.set_status(peer_device_id, SyncPhase::Done, 1.0);
                let trust = self.inner.trust.clone();
                blocking(move || trust.record_completed_sync(&peer_device_id)).await?;
                info!(
                    peer = %peer_device_id.short(),
                    spaces = summary.spaces_synced,
                    sent = summary.entities_sent,
                    applied = summary.entities_applied,
                    conflicts = summary.conflicts_detected,
                    "sync session complete"
                );
                Ok(summary)
            }
            Err(err) => {
                self.inner.fail_status(peer_device_id, &err);
                warn!(peer = %peer_device_id.short(), error = %err, "sync session failed");
                Err(err)
            }
        }
    }

    /// Requests cancellation of the in-flight session with a peer.
    /// Returns `false` when no session is running. The session aborts
    /// between rounds; the round transaction in flight, if any, rolls
    /// back, and `SyncHistory` is left untouched.
    pub fn cancel_sync(&self, peer_device_id: DeviceId) -> bool {
        let cancels = self.inner.cancels.lock().unwrap();
        match cancels.get(&peer_device_id) {
            Some(flag) => {
                flag.store(true, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Snapshot of sync progress with a peer. Peers with no session on
    /// record report [`SyncPhase::Idle`].
    #[must_use]
    pub fn get_sync_status(&self, peer_device_id: DeviceId) -> SyncStatus {
        self.inner
            .status
            .lock()
            .unwrap()
            .get(&peer_device_id)
            .cloned()
            .unwrap_or_else(SyncStatus::idle)
    }

    /// Peers this device has pinned, most recently seen first.
    pub async fn trusted_peers(&self) -> SyncResult<Vec<TrustedPeer>> {
        let trust = self.inner.trust.clone();
        blocking(move || trust.list_peers()).await
    }

    /// Per-space history of completed sessions with a peer.
    pub async fn sync_history(&self, peer_device_id: DeviceId) -> SyncResult<Vec<SyncHistoryEntry>> {
        let store = self.inner.store.clone();
        blocking(move || store.history_for_peer(&peer_device_id)).await
    }

    async fn run_initiator(
        &self,
        peer_device_id: DeviceId,
        address: SocketAddr,
        cancel: &AtomicBool,
    ) -> SyncResult<SyncSummary> {
        let inner = &self.inner;
        let trust = inner.trust.clone();
        let peer = blocking(move || trust.lookup_peer(&peer_device_id))
            .await?
            .ok_or_else(|| SyncError::UntrustedPeer(peer_device_id.to_string()))?;

        inner.set_status(peer_device_id, SyncPhase::Handshaking, 0.1);
        let timeout = inner.config.network_timeout;
        let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
            .await
            .map_err(|_| SyncError::Timeout)??;
        let mut channel = SecureChannel::initiate(stream, &inner.identity, &peer, timeout).await?;

        inner.set_status(peer_device_id, SyncPhase::Exchanging, 0.25);
        let store = inner.store.clone();
        let spaces = blocking(move || store.list_spaces()).await?;
        let total = spaces.len().max(1);
        debug!(peer = %peer_device_id.short(), spaces = spaces.len(), "session established");

        let mut summary = SyncSummary {
            peer_device_id,
            spaces_synced: 0,
            entities_sent: 0,
            entities_applied: 0,
            conflicts_detected: 0,
            duration: Duration::ZERO,
        };
        for (index, space) in spaces.into_iter().enumerate() {
            check_cancelled(cancel)?;
            let stats = self
                .sync_space(&mut channel, space, peer_device_id, cancel)
                .await?;
            summary.spaces_synced += 1;
            summary.entities_sent += stats.sent;
            summary.entities_applied += stats.applied;
            summary.conflicts_detected += stats.conflicts;
            let progress = 0.25 + 0.65 * ((index + 1) as f64 / total as f64);
            inner.set_status(peer_device_id, SyncPhase::Applying, progress);
        }
        // Dropping the channel closes the connection; the responder reads
        // a clean end-of-stream and finishes its side.
        Ok(summary)
    }

    /// Drives the delta rounds for one space as the initiator.
    ///
    /// Candidates are recomputed every round on both sides, so writes
    /// that land mid-session extend the session instead of being lost.
    /// `max_rounds` bounds a peer that never reaches a final round.
    async fn sync_space(
        &self,
        channel: &mut SecureChannel<TcpStream>,
        space: SpaceId,
        peer: DeviceId,
        cancel: &AtomicBool,
    ) -> SyncResult<SpaceStats> {
        let inner = &self.inner;
        let timeout = inner.config.network_timeout;
        let store = inner.store.clone();

        let local_clock = {
            let store = store.clone();
            blocking(move || store.space_clock(&space)).await?
        };
        channel
            .send(&SyncMessage::SyncRequest(SyncRequestMessage {
                space_id: space,
                vector_clock: local_clock,
            }))
            .await?;

        let last_sync = {
            let store = store.clone();
            blocking(move || store.last_sync_at(&space, &peer)).await?
        };

        let mut stats = SpaceStats::default();
        for round in 1..=inner.config.max_rounds {
            check_cancelled(cancel)?;
            let incoming = expect_delta(channel.recv_timeout(timeout).await?, space)?;
            let final_in = incoming.is_final;
            let peer_clock = incoming.sender_clock.clone();

            let now = inner.observe_remote_stamps(&incoming.entities);
            let lock = inner.space_lock(space);
            let outcome = {
                let _space_guard = lock.lock().await;
                let store = store.clone();
                let entities = incoming.entities;
                let sender_clock = incoming.sender_clock;
                blocking(move || {
                    store.apply_round(&space, &entities, &sender_clock, final_in, peer, now)
                })
                .await?
            };
            stats.applied += outcome.applied.len();
            stats.conflicts += outcome.conflicts.len();
            debug!(
                space = %space,
                round,
                applied = outcome.applied.len(),
                conflicts = outcome.conflicts.len(),
                ignored = outcome.ignored,
                "applied remote delta"
            );
            inner.notify_round(&outcome).await;

            check_cancelled(cancel)?;
            let candidates = {
                let store = store.clone();
                blocking(move || store.delta_candidates(&space, last_sync)).await?
            };
            let batch =
                delta::select_batch(candidates, &peer_clock, inner.config.max_entities_per_round);
            let final_out = batch.is_final;
            stats.sent += batch.entities.len();
            channel
                .send(&SyncMessage::Delta(DeltaMessage {
                    space_id: space,
                    entities: batch.entities,
                    sender_clock: outcome.new_clock,
                    round,
                    is_final: final_out,
                }))
                .await?;

            let ack = expect_ack(channel.recv_timeout(timeout).await?, space, round)?;
            debug!(space = %space, round, peer_applied = ack.applied, "round acknowledged");

            if final_in && final_out {
                let entry = SyncHistoryEntry {
                    space_id: space,
                    peer_device_id: peer,
                    synced_at: now_ms(),
                    direction: SyncDirection::Initiated,
                    entities_sent: stats.sent,
                    entities_applied: stats.applied,
                    conflicts_detected: stats.conflicts,
                    total_syncs: 1,
                };
                let store = store.clone();
                blocking(move || store.record_history(&entry)).await?;
                return Ok(stats);
            }
        }
        Err(SyncError::Protocol(format!(
            "space {space} exceeded {} delta rounds",
            inner.config.max_rounds
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SyncStore;
    use crate::trust::TrustStore;

    fn engine() -> SyncEngine {
        let trust = TrustStore::open_in_memory().unwrap();
        let store = SyncStore::open_in_memory().unwrap();
        SyncEngine::new(SyncConfig::default(), trust, store).unwrap()
    }

    #[test]
    fn config_defaults_are_sane() {
        let config = SyncConfig::default();
        assert_eq!(config.listen_addr.port(), 0);
        assert!(config.max_entities_per_round > 0);
        assert!(config.max_rounds > 1);
        assert!(config.max_connections > 0);
    }

    #[test]
    fn in_flight_guard_admits_one_session_per_peer() {
        let engine = engine();
        let peer = DeviceId::new();

        let first = InFlightGuard::try_acquire(Arc::clone(&engine.inner), peer).unwrap();
        let second = InFlightGuard::try_acquire(Arc::clone(&engine.inner), peer);
        assert!(matches!(second, Err(SyncError::SyncAlreadyInProgress)));

        drop(first);
        InFlightGuard::try_acquire(Arc::clone(&engine.inner), peer).unwrap();
    }

    #[test]
    fn cancel_without_session_reports_false() {
        let engine = engine();
        assert!(!engine.cancel_sync(DeviceId::new()));
    }

    #[test]
    fn status_defaults_to_idle() {
        let engine = engine();
        let status = engine.get_sync_status(DeviceId::new());
        assert_eq!(status.phase, SyncPhase::Idle);
        assert!(status.error.is_none());
    }
}
