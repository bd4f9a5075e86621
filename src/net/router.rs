//! Message dispatch, filters and blocking waits.
//!
//! The router is the demultiplexer between the raw transport and the
//! announcement sessions. Sessions express what they expect next as a
//! disjunction of [`MessagePattern`]s and block on [`MessageRouter::wait_for`];
//! the dispatch task resolves exactly one waiting call per inbound message.
//! Announcement requests that no session claims are surfaced on a separate
//! channel so the engine can spawn a relay session for them.

use super::counter::ByteCounter;
use super::message::{Envelope, Message, MessageKind};
use crate::types::{PeerId, Uid};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

// =============================================================================
// TRANSPORT SEAM
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("not connected to {0}")]
    NotConnected(PeerId),

    #[error("transport closed")]
    Closed,
}

/// Raw message transport. Delivery is per-peer ordered but unreliable in
/// the sense that a peer may disconnect at any point; the router learns of
/// that through [`RouterEvent::Disconnected`].
pub trait Transport: Send + Sync + 'static {
    fn local_id(&self) -> PeerId;

    fn is_connected(&self, peer: PeerId) -> bool;

    fn send(
        &self,
        to: PeerId,
        env: Envelope,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// What the transport feeds into the router's dispatch task.
#[derive(Debug)]
pub enum RouterEvent {
    Message { from: PeerId, env: Envelope },
    Disconnected(PeerId),
}

// =============================================================================
// FILTERS
// =============================================================================

/// One alternative of a wait disjunction.
#[derive(Debug, Clone)]
pub struct MessagePattern {
    pub kind: MessageKind,
    pub source: PeerId,
    pub uid: Uid,
    pub timeout: Duration,
    /// Anchor the deadline at filter construction instead of at the start
    /// of the current wait. Used by the reply drain to enforce an absolute
    /// wall-clock cap across successive messages.
    pub from_creation: bool,
}

impl MessagePattern {
    pub fn new(kind: MessageKind, source: PeerId, uid: Uid, timeout: Duration) -> Self {
        Self {
            kind,
            source,
            uid,
            timeout,
            from_creation: false,
        }
    }

    pub fn from_creation(mut self) -> Self {
        self.from_creation = true;
        self
    }
}

/// Disjunction of patterns with a shared creation instant.
#[derive(Debug, Clone)]
pub struct MessageFilter {
    patterns: Vec<MessagePattern>,
    created: Instant,
}

impl MessageFilter {
    pub fn new(patterns: Vec<MessagePattern>) -> Self {
        Self {
            patterns,
            created: Instant::now(),
        }
    }

    pub fn patterns(&self) -> &[MessagePattern] {
        &self.patterns
    }
}

/// Result of a wait.
#[derive(Debug)]
pub enum WaitOutcome {
    Matched { from: PeerId, env: Envelope },
    TimedOut,
    Disconnected(PeerId),
}

// =============================================================================
// ROUTER
// =============================================================================

/// Announcement request no local waiter claimed: a new downstream peer is
/// asking to be admitted.
#[derive(Debug)]
pub struct InboundRequest {
    pub from: PeerId,
    pub env: Envelope,
}

/// Events delivered to a registered bulk-transfer receiver.
#[derive(Debug)]
pub enum ChunkEvent {
    Chunk { index: u32, data: Vec<u8> },
    Disconnected,
}

struct WaiterEntry {
    // (pattern, absolute deadline); expired pairs are pruned by the waiter
    patterns: Vec<(MessagePattern, Instant)>,
    tx: oneshot::Sender<WaitOutcome>,
    counter: ByteCounter,
}

struct TransferSlot {
    peer: PeerId,
    tx: mpsc::UnboundedSender<ChunkEvent>,
    counter: ByteCounter,
}

/// Unmatched message held for a filter armed slightly later. A hop sends
/// its next message as soon as the previous one is on the wire, so an
/// envelope routinely arrives in the gap between one wait ending and the
/// next beginning; dropping it there would stall the session.
struct Parked {
    at: Instant,
    from: PeerId,
    env: Envelope,
    size: usize,
}

/// How long an unmatched envelope waits for a filter to claim it.
const PARK_TTL: Duration = Duration::from_secs(10);

/// Cap on parked envelopes; the oldest are evicted beyond this.
const PARK_CAP: usize = 1024;

#[derive(Default)]
struct Registry {
    waiters: HashMap<u64, WaiterEntry>,
    next_waiter: u64,
    parked: std::collections::VecDeque<Parked>,
}

impl Registry {
    fn prune_parked(&mut self, now: Instant) {
        while let Some(front) = self.parked.front() {
            if now.duration_since(front.at) > PARK_TTL {
                self.parked.pop_front();
            } else {
                break;
            }
        }
        while self.parked.len() > PARK_CAP {
            self.parked.pop_front();
        }
    }

    fn park(&mut self, now: Instant, from: PeerId, env: Envelope, size: usize) {
        self.prune_parked(now);
        self.parked.push_back(Parked {
            at: now,
            from,
            env,
            size,
        });
    }

    /// Oldest parked envelope matching any of `patterns`, removed.
    fn claim_parked(
        &mut self,
        now: Instant,
        patterns: &[(MessagePattern, Instant)],
    ) -> Option<(PeerId, Envelope, usize)> {
        self.prune_parked(now);
        let pos = self.parked.iter().position(|p| {
            patterns.iter().any(|(pat, deadline)| {
                pat.kind == p.env.msg.kind()
                    && pat.source == p.from
                    && pat.uid == p.env.uid
                    && *deadline > now
            })
        })?;
        self.parked
            .remove(pos)
            .map(|p| (p.from, p.env, p.size))
    }

    /// Remove-and-return every parked chunk of one transfer, in order.
    fn claim_parked_chunks(&mut self, peer: PeerId, transfer_uid: u64) -> Vec<(u32, Vec<u8>, usize)> {
        let mut out = Vec::new();
        let mut keep = std::collections::VecDeque::with_capacity(self.parked.len());
        for p in self.parked.drain(..) {
            let wanted = p.from == peer
                && matches!(
                    &p.env.msg,
                    Message::RefChunk { transfer_uid: t, .. } if *t == transfer_uid
                );
            if wanted {
                if let Message::RefChunk { index, data, .. } = p.env.msg {
                    out.push((index, data.into_inner(), p.size));
                }
            } else {
                keep.push_back(p);
            }
        }
        self.parked = keep;
        out
    }
}

#[derive(Default)]
struct RouterShared {
    registry: Mutex<Registry>,
    transfers: Mutex<HashMap<u64, TransferSlot>>,
}

/// Per-node message router. Cheap to clone.
pub struct MessageRouter<T: Transport> {
    transport: Arc<T>,
    shared: Arc<RouterShared>,
}

impl<T: Transport> Clone for MessageRouter<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<T: Transport> MessageRouter<T> {
    /// Build the router and spawn its dispatch task. Returns the router and
    /// the channel of unclaimed announcement requests.
    pub fn start(
        transport: Arc<T>,
        events: mpsc::UnboundedReceiver<RouterEvent>,
    ) -> (Self, mpsc::UnboundedReceiver<InboundRequest>) {
        let shared = Arc::new(RouterShared::default());
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch(shared.clone(), events, req_tx));
        (Self { transport, shared }, req_rx)
    }

    pub fn local_id(&self) -> PeerId {
        self.transport.local_id()
    }

    pub fn is_connected(&self, peer: PeerId) -> bool {
        self.transport.is_connected(peer)
    }

    /// Send one message, counting its serialized size.
    pub async fn send(
        &self,
        to: PeerId,
        env: Envelope,
        counter: &ByteCounter,
    ) -> Result<(), TransportError> {
        let size = postcard::to_allocvec(&env)
            .map(|b| b.len())
            .unwrap_or_default();
        self.transport.send(to, env).await?;
        counter.sent_bytes(size, 0);
        Ok(())
    }

    /// Block until one pattern matches, every pattern expires, or a peer
    /// named as a source disconnects. At most one message is consumed.
    pub async fn wait_for(&self, filter: MessageFilter, counter: &ByteCounter) -> WaitOutcome {
        // A source that is already gone aborts the wait up front.
        for p in filter.patterns() {
            if !self.transport.is_connected(p.source) {
                return WaitOutcome::Disconnected(p.source);
            }
        }

        let now = Instant::now();
        let deadlines: Vec<(MessagePattern, Instant)> = filter
            .patterns
            .iter()
            .map(|p| {
                let anchor = if p.from_creation { filter.created } else { now };
                (p.clone(), anchor + p.timeout)
            })
            .collect();

        let (tx, mut rx) = oneshot::channel();
        let id = {
            let mut registry = self.shared.registry.lock().unwrap_or_else(|e| e.into_inner());

            // A matching envelope may already be parked from the gap
            // before this filter was armed; consume it instead of waiting.
            if let Some((from, env, size)) = registry.claim_parked(now, &deadlines) {
                counter.received_bytes(size, 0);
                return WaitOutcome::Matched { from, env };
            }

            registry.next_waiter += 1;
            let id = registry.next_waiter;
            registry.waiters.insert(
                id,
                WaiterEntry {
                    patterns: deadlines,
                    tx,
                    counter: counter.clone(),
                },
            );
            id
        };

        loop {
            let next_deadline = {
                let mut registry = self.shared.registry.lock().unwrap_or_else(|e| e.into_inner());
                match registry.waiters.get_mut(&id) {
                    None => None, // resolved by dispatch
                    Some(entry) => {
                        let now = Instant::now();
                        entry.patterns.retain(|(_, d)| *d > now);
                        if entry.patterns.is_empty() {
                            registry.waiters.remove(&id);
                            None
                        } else {
                            entry.patterns.iter().map(|(_, d)| *d).min()
                        }
                    }
                }
            };

            let Some(next_deadline) = next_deadline else {
                // Either every alternative expired or dispatch resolved us
                // while we were between locks; the channel decides.
                return match rx.try_recv() {
                    Ok(outcome) => outcome,
                    Err(_) => WaitOutcome::TimedOut,
                };
            };

            tokio::select! {
                res = &mut rx => {
                    return res.unwrap_or(WaitOutcome::TimedOut);
                }
                _ = tokio::time::sleep_until(next_deadline) => {
                    // Loop to prune the expired alternative
                }
            }
        }
    }

    /// Register a bulk-transfer receiver for `transfer_uid` from `peer`.
    /// Chunks that raced ahead of the registration are replayed first.
    pub fn register_transfer(
        &self,
        transfer_uid: u64,
        peer: PeerId,
        counter: &ByteCounter,
    ) -> mpsc::UnboundedReceiver<ChunkEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut transfers = self
                .shared
                .transfers
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            transfers.insert(
                transfer_uid,
                TransferSlot {
                    peer,
                    tx: tx.clone(),
                    counter: counter.clone(),
                },
            );
        }
        let parked = {
            let mut registry = self.shared.registry.lock().unwrap_or_else(|e| e.into_inner());
            registry.claim_parked_chunks(peer, transfer_uid)
        };
        for (index, data, size) in parked {
            counter.received_bytes(size, data.len());
            let _ = tx.send(ChunkEvent::Chunk { index, data });
        }
        rx
    }

    pub fn unregister_transfer(&self, transfer_uid: u64) {
        let mut transfers = self
            .shared
            .transfers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        transfers.remove(&transfer_uid);
    }
}

// =============================================================================
// DISPATCH
// =============================================================================

async fn dispatch(
    shared: Arc<RouterShared>,
    mut events: mpsc::UnboundedReceiver<RouterEvent>,
    requests: mpsc::UnboundedSender<InboundRequest>,
) {
    while let Some(event) = events.recv().await {
        match event {
            RouterEvent::Message { from, env } => {
                on_message(&shared, &requests, from, env);
            }
            RouterEvent::Disconnected(peer) => {
                on_disconnect(&shared, peer);
            }
        }
    }
    debug!("router dispatch: transport event stream ended");
}

fn on_message(
    shared: &RouterShared,
    requests: &mpsc::UnboundedSender<InboundRequest>,
    from: PeerId,
    env: Envelope,
) {
    let size = postcard::to_allocvec(&env)
        .map(|b| b.len())
        .unwrap_or_default();
    if !env.msg.validate_size(size) {
        warn!(
            "dropping oversized {} from {} ({} bytes)",
            env.msg.command(),
            from,
            size
        );
        return;
    }

    // Bulk chunks demux on transfer uid, not session uid.
    if let Message::RefChunk { transfer_uid, .. } = env.msg {
        on_chunk(shared, from, env, transfer_uid, size);
        return;
    }

    let kind = env.msg.kind();
    let now = Instant::now();
    let mut registry = shared.registry.lock().unwrap_or_else(|e| e.into_inner());

    let matched = registry.waiters.iter().find_map(|(id, entry)| {
        entry
            .patterns
            .iter()
            .any(|(p, deadline)| {
                p.kind == kind && p.source == from && p.uid == env.uid && *deadline > now
            })
            .then_some(*id)
    });

    if let Some(id) = matched {
        if let Some(entry) = registry.waiters.remove(&id) {
            entry.counter.received_bytes(size, 0);
            let _ = entry.tx.send(WaitOutcome::Matched { from, env });
        }
        return;
    }

    if kind == MessageKind::AnnouncementRequest {
        drop(registry);
        let _ = requests.send(InboundRequest { from, env });
        return;
    }

    // No filter wants this yet. The hop may simply be ahead of us;
    // the next wait_for will claim it from the park.
    debug!(
        "[{}] parking unclaimed {} from {}",
        env.uid,
        env.msg.command(),
        from
    );
    registry.park(now, from, env, size);
}

fn on_chunk(shared: &RouterShared, from: PeerId, env: Envelope, transfer_uid: u64, size: usize) {
    let slot_channel = |shared: &RouterShared| {
        let transfers = shared.transfers.lock().unwrap_or_else(|e| e.into_inner());
        transfers
            .get(&transfer_uid)
            .filter(|slot| slot.peer == from)
            .map(|slot| (slot.tx.clone(), slot.counter.clone()))
    };

    if let Some((tx, counter)) = slot_channel(shared) {
        if let Message::RefChunk { index, data, .. } = env.msg {
            counter.received_bytes(size, data.len());
            let _ = tx.send(ChunkEvent::Chunk {
                index,
                data: data.into_inner(),
            });
        }
        return;
    }

    // Chunks regularly outrun the receiver's registration; park them.
    {
        let mut registry = shared.registry.lock().unwrap_or_else(|e| e.into_inner());
        registry.park(Instant::now(), from, env, size);
    }

    // The receiver may have registered while we were parking; replay so
    // the chunk cannot be stranded until its TTL.
    if let Some((tx, counter)) = slot_channel(shared) {
        let parked = {
            let mut registry = shared.registry.lock().unwrap_or_else(|e| e.into_inner());
            registry.claim_parked_chunks(from, transfer_uid)
        };
        for (index, data, psize) in parked {
            counter.received_bytes(psize, data.len());
            let _ = tx.send(ChunkEvent::Chunk { index, data });
        }
    }
}

fn on_disconnect(shared: &RouterShared, peer: PeerId) {
    debug!("transport disconnect from {}", peer);

    {
        let mut registry = shared.registry.lock().unwrap_or_else(|e| e.into_inner());
        let hit: Vec<u64> = registry
            .waiters
            .iter()
            .filter(|(_, entry)| entry.patterns.iter().any(|(p, _)| p.source == peer))
            .map(|(id, _)| *id)
            .collect();
        for id in hit {
            if let Some(entry) = registry.waiters.remove(&id) {
                let _ = entry.tx.send(WaitOutcome::Disconnected(peer));
            }
        }
        registry.parked.retain(|p| p.from != peer);
    }

    let transfers = shared.transfers.lock().unwrap_or_else(|e| e.into_inner());
    for slot in transfers.values() {
        if slot.peer == peer {
            let _ = slot.tx.send(ChunkEvent::Disconnected);
        }
    }
}
