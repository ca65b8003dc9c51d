//! Inbound side of the engine: the TCP accept loop, connection routing,
//! and the responder half of sync and pairing sessions.
//!
//! One listener port serves both concerns. The first message on a
//! connection decides the path: `Hello` starts an encrypted sync
//! session, `Pair` starts a pairing exchange against the armed invite.
//! Responder failures are logged with the peer id and tear down only
//! that connection.

use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use weft_types::DeviceId;

use crate::codec;
use crate::delta;
use crate::discovery::{self, Advertisement};
use crate::engine::{check_cancelled, expect_delta, EngineInner, InFlightGuard, SpaceStats};
use crate::error::{SyncError, SyncResult};
use crate::model::{SyncDirection, SyncHistoryEntry, SyncPhase};
use crate::pairing;
use crate::protocol::{
    AckMessage, DeltaMessage, ErrorMessage, HelloMessage, PairingMessage, RejectMessage,
    RejectReason, SyncMessage, SyncRequestMessage, WireMessage,
};
use crate::session::{sync_name, wire_name, SecureChannel};
use crate::store::blocking;
use crate::trust::now_ms;

// ── Listener lifecycle ──────────────────────────────────────────────────

/// A running listener: the accept task, its bound address, and the mDNS
/// advertisement tied to its port.
pub(crate) struct ListenerHandle {
    local_addr: SocketAddr,
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
    advertisement: Option<Advertisement>,
}

impl ListenerHandle {
    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting and withdraws the advertisement. Connections
    /// already accepted run to completion on their own tasks.
    pub(crate) async fn stop(self) {
        self.shutdown.notify_one();
        drop(self.advertisement);
        let _ = self.task.await;
        info!("sync listener stopped");
    }
}

/// Binds the configured address and spawns the accept loop. mDNS
/// registration failure is not fatal; peers can still dial by address.
pub(crate) async fn spawn(inner: Arc<EngineInner>) -> SyncResult<ListenerHandle> {
    let listener = TcpListener::bind(inner.config.listen_addr).await?;
    let local_addr = listener.local_addr()?;

    let advertisement = match discovery::advertise(
        inner.identity.device_id,
        &inner.identity.display_name,
        local_addr.port(),
    ) {
        Ok(advertisement) => Some(advertisement),
        Err(err) => {
            warn!(error = %err, "mDNS advertisement failed; peers must dial by address");
            None
        }
    };

    let shutdown = Arc::new(Notify::new());
    let task = tokio::spawn(accept_loop(
        Arc::clone(&inner),
        listener,
        Arc::clone(&shutdown),
    ));
    info!(addr = %local_addr, "sync listener started");
    Ok(ListenerHandle {
        local_addr,
        shutdown,
        task,
        advertisement,
    })
}

async fn accept_loop(inner: Arc<EngineInner>, listener: TcpListener, shutdown: Arc<Notify>) {
    let semaphore = Arc::new(Semaphore::new(inner.config.max_connections));
    loop {
        let permit = tokio::select! {
            _ = shutdown.notified() => break,
            permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let (stream, addr) = tokio::select! {
            _ = shutdown.notified() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(error = %err, "failed to accept connection");
                    continue;
                }
            },
        };
        debug!(%addr, "inbound connection");
        let inner = Arc::clone(&inner);
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(err) = handle_connection(inner, stream, addr).await {
                warn!(%addr, error = %err, "connection handler failed");
            }
        });
    }
}

// ── Connection routing ──────────────────────────────────────────────────

async fn handle_connection(
    inner: Arc<EngineInner>,
    mut stream: TcpStream,
    addr: SocketAddr,
) -> SyncResult<()> {
    let timeout = inner.config.network_timeout;
    let first: WireMessage = codec::read_message_timeout(&mut stream, timeout).await?;
    match first {
        WireMessage::Hello(hello) => serve_sync(inner, stream, hello, addr).await,
        WireMessage::Pair(first) => serve_pairing(inner, stream, first, addr).await,
        other => {
            let reject = RejectMessage::new(RejectReason::Internal);
            let _ = codec::write_message(&mut stream, &WireMessage::Reject(reject)).await;
            Err(SyncError::Protocol(format!(
                "connection opened with {}",
                wire_name(&other)
            )))
        }
    }
}

async fn serve_pairing(
    inner: Arc<EngineInner>,
    mut stream: TcpStream,
    first: PairingMessage,
    addr: SocketAddr,
) -> SyncResult<()> {
    // Taking the invite disarms it; one attempt per invite regardless of
    // outcome.
    let invite = inner.armed_invite.lock().await.take();
    let Some(invite) = invite else {
        warn!(%addr, "pairing attempt with no armed invite");
        let reject = RejectMessage::new(RejectReason::PairingClosed);
        codec::write_message(&mut stream, &WireMessage::Reject(reject)).await?;
        return Ok(());
    };

    let timeout = inner.config.network_timeout;
    let peer = pairing::respond(
        &mut stream,
        &inner.identity,
        &inner.trust,
        &invite,
        first,
        timeout,
    )
    .await?;
    info!(
        peer = %peer.device_id.short(),
        name = %peer.display_name,
        %addr,
        "pairing completed"
    );
    Ok(())
}

// ── Responder session ───────────────────────────────────────────────────

async fn serve_sync(
    inner: Arc<EngineInner>,
    mut stream: TcpStream,
    hello: HelloMessage,
    addr: SocketAddr,
) -> SyncResult<()> {
    let peer = hello.device_id;
    let guard = match InFlightGuard::try_acquire(Arc::clone(&inner), peer) {
        Ok(guard) => guard,
        Err(err) => {
            let reject = RejectMessage::new(RejectReason::Busy);
            let _ = codec::write_message(&mut stream, &WireMessage::Reject(reject)).await;
            return Err(err);
        }
    };
    let cancel = guard.cancel_flag();

    inner.set_status(peer, SyncPhase::Handshaking, 0.1);
    let timeout = inner.config.network_timeout;
    let channel =
        match SecureChannel::accept(stream, &inner.identity, hello, &inner.trust, timeout).await {
            Ok(channel) => channel,
            Err(err) => {
                inner.fail_status(peer, &err);
                return Err(err);
            }
        };

    inner.set_status(peer, SyncPhase::Exchanging, 0.25);
    match run_responder(&inner, channel, &cancel).await {
        Ok(spaces) => {
            inner.set_status(peer, SyncPhase::Done, 1.0);
            if spaces > 0 {
                let trust = inner.trust.clone();
                blocking(move || trust.record_completed_sync(&peer)).await?;
            }
            info!(peer = %peer.short(), spaces, %addr, "inbound sync session complete");
            Ok(())
        }
        Err(err) => {
            inner.fail_status(peer, &err);
            Err(err)
        }
    }
}

/// Serves spaces until the initiator closes the connection. Returns how
/// many spaces completed.
async fn run_responder(
    inner: &Arc<EngineInner>,
    mut channel: SecureChannel<TcpStream>,
    cancel: &AtomicBool,
) -> SyncResult<usize> {
    let peer = channel.peer_device();
    let timeout = inner.config.network_timeout;
    let mut spaces_served = 0usize;
    loop {
        // The initiator either opens the next space or closes the
        // connection when it has no more.
        let msg = match channel.recv_timeout(timeout).await {
            Err(SyncError::ConnectionClosed) => return Ok(spaces_served),
            msg => msg?,
        };
        let request = match msg {
            SyncMessage::SyncRequest(request) => request,
            SyncMessage::Error(err) => {
                return Err(SyncError::Protocol(format!(
                    "peer reported error {}: {}",
                    err.code, err.message
                )));
            }
            other => {
                return Err(SyncError::Protocol(format!(
                    "expected SyncRequest, got {}",
                    sync_name(&other)
                )));
            }
        };
        serve_space(inner, &mut channel, request, peer, cancel).await?;
        spaces_served += 1;
    }
}

/// Drives the delta rounds for one space as the responder: send our
/// delta, apply theirs, acknowledge, until both directions are final.
async fn serve_space(
    inner: &Arc<EngineInner>,
    channel: &mut SecureChannel<TcpStream>,
    request: SyncRequestMessage,
    peer: DeviceId,
    cancel: &AtomicBool,
) -> SyncResult<()> {
    let space = request.space_id;
    let timeout = inner.config.network_timeout;
    let store = inner.store.clone();
    inner.set_status(peer, SyncPhase::Applying, 0.5);
    debug!(space = %space, peer = %peer.short(), "serving space");

    let mut peer_clock = request.vector_clock;
    let last_sync = {
        let store = store.clone();
        blocking(move || store.last_sync_at(&space, &peer)).await?
    };

    let mut stats = SpaceStats::default();
    for round in 1..=inner.config.max_rounds {
        check_cancelled(cancel)?;

        let candidates = {
            let store = store.clone();
            blocking(move || store.delta_candidates(&space, last_sync)).await?
        };
        let batch =
            delta::select_batch(candidates, &peer_clock, inner.config.max_entities_per_round);
        let final_out = batch.is_final;
        stats.sent += batch.entities.len();
        let sender_clock = {
            let store = store.clone();
            blocking(move || store.space_clock(&space)).await?
        };
        channel
            .send(&SyncMessage::Delta(DeltaMessage {
                space_id: space,
                entities: batch.entities,
                sender_clock,
                round,
                is_final: final_out,
            }))
            .await?;

        let incoming = expect_delta(channel.recv_timeout(timeout).await?, space)?;
        let final_in = incoming.is_final;
        peer_clock = incoming.sender_clock.clone();

        let now = inner.observe_remote_stamps(&incoming.entities);
        let lock = inner.space_lock(space);
        let outcome = {
            let _space_guard = lock.lock().await;
            let store = store.clone();
            let entities = incoming.entities;
            let remote_clock = incoming.sender_clock;
            blocking(move || {
                store.apply_round(&space, &entities, &remote_clock, final_in, peer, now)
            })
            .await
        };
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                // Tell the initiator before tearing the session down.
                let notice = ErrorMessage::internal(format!("apply failed for space {space}"));
                let _ = channel.send(&SyncMessage::Error(notice)).await;
                return Err(err);
            }
        };
        stats.applied += outcome.applied.len();
        stats.conflicts += outcome.conflicts.len();
        inner.notify_round(&outcome).await;

        channel
            .send(&SyncMessage::Ack(AckMessage {
                space_id: space,
                round,
                applied: outcome.applied.len() as u64,
                new_clock: outcome.new_clock,
            }))
            .await?;
        debug!(
            space = %space,
            round,
            applied = stats.applied,
            sent = stats.sent,
            "round served"
        );

        if final_in && final_out {
            let entry = SyncHistoryEntry {
                space_id: space,
                peer_device_id: peer,
                synced_at: now_ms(),
                direction: SyncDirection::Responded,
                entities_sent: stats.sent,
                entities_applied: stats.applied,
                conflicts_detected: stats.conflicts,
                total_syncs: 1,
            };
            let store = store.clone();
            blocking(move || store.record_history(&entry)).await?;
            return Ok(());
        }
    }
    Err(SyncError::Protocol(format!(
        "space {space} exceeded {} delta rounds",
        inner.config.max_rounds
    )))
}
