//! Per-peer substream table with Arc-per-peer pattern for minimal lock contention.
//!
//! The global map is locked only long enough to fetch a peer's `Arc<PeerEntry>`.
//! Everything else happens under that peer's own async mutex, so work on one
//! peer never waits for another.
//!
//! At most one live substream exists per (peer, protocol, direction). Activating
//! a second one closes the first and waits until its transport substream has
//! been released before the new one is inserted. An old substream that goes
//! away on its own while its successor is still handshaking counts as replaced
//! too.

use std::{
    collections::HashMap,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use parking_lot::{Mutex as SyncMutex, RwLock};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, trace};
use vertex_net_peer_score::ReputationGate;
use vertex_net_transport::{Direction, PeerId, ProtocolName};

use crate::{
    NotificationError, NotificationMetrics,
    substream::{SubstreamId, SubstreamInfo, SubstreamKey, SubstreamShared, SubstreamState},
};

const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Why an inbound substream was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The reputation gate reported the peer as banned.
    Banned,
    /// The peer asked for a protocol that is not registered.
    UnknownProtocol,
    /// The handshake failed or was refused by the validator.
    Handshake,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Banned => "banned",
            Self::UnknownProtocol => "unknown_protocol",
            Self::Handshake => "handshake",
        }
    }
}

/// Substream lifecycle events.
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    Opened {
        peer: PeerId,
        protocol: ProtocolName,
        direction: Direction,
        id: SubstreamId,
    },
    Closed {
        peer: PeerId,
        protocol: ProtocolName,
        direction: Direction,
        id: SubstreamId,
    },
    Failed {
        peer: PeerId,
        protocol: ProtocolName,
        direction: Direction,
        id: SubstreamId,
        error: NotificationError,
    },
    Rejected {
        peer: PeerId,
        protocol: ProtocolName,
        reason: RejectReason,
    },
    Replaced {
        peer: PeerId,
        protocol: ProtocolName,
        direction: Direction,
        old: SubstreamId,
        new: SubstreamId,
    },
}

impl ManagerEvent {
    pub fn peer(&self) -> &PeerId {
        match self {
            Self::Opened { peer, .. }
            | Self::Closed { peer, .. }
            | Self::Failed { peer, .. }
            | Self::Rejected { peer, .. }
            | Self::Replaced { peer, .. } => peer,
        }
    }
}

type SlotKey = (ProtocolName, Direction);

#[derive(Default)]
struct PeerSlots {
    substreams: HashMap<SlotKey, Arc<SubstreamShared>>,
    /// Set once the entry has been dropped from the global map.
    removed: bool,
}

#[derive(Default)]
struct PeerEntry {
    slots: Mutex<PeerSlots>,
}

/// Substreams of one key that are between handshake start and activation.
#[derive(Default)]
struct Pending {
    count: usize,
    /// Newest substream of the key released while `count > 0`.
    superseded: Option<SubstreamId>,
}

pub(crate) struct ManagerInner {
    gate: Arc<dyn ReputationGate>,
    /// Brief lock to get Arc, then release.
    peers: RwLock<HashMap<PeerId, Arc<PeerEntry>>>,
    pending: SyncMutex<HashMap<SubstreamKey, Pending>>,
    next_id: AtomicU64,
    shut_down: AtomicBool,
    events: broadcast::Sender<ManagerEvent>,
}

impl ManagerInner {
    /// Get or create the entry for `peer`.
    fn entry(&self, peer: PeerId) -> Arc<PeerEntry> {
        // Fast path: read lock
        if let Some(entry) = self.peers.read().get(&peer) {
            return Arc::clone(entry);
        }

        // Slow path: write lock (only on first substream per peer)
        Arc::clone(self.peers.write().entry(peer).or_default())
    }

    fn existing(&self, peer: &PeerId) -> Option<Arc<PeerEntry>> {
        self.peers.read().get(peer).cloned()
    }

    fn all_entries(&self) -> Vec<Arc<PeerEntry>> {
        self.peers.read().values().cloned().collect()
    }

    /// Drops `entry` from the global map. Caller holds the entry's lock.
    fn prune(&self, peer: &PeerId, entry: &Arc<PeerEntry>, slots: &mut PeerSlots) {
        slots.removed = true;
        let mut peers = self.peers.write();
        if peers.get(peer).is_some_and(|current| Arc::ptr_eq(current, entry)) {
            peers.remove(peer);
            trace!(target: "notifications::manager", %peer, "Pruned peer entry");
        }
    }

    /// Remembers `id` as superseded if a substream of the same key is handshaking.
    fn note_released(&self, key: &SubstreamKey, id: SubstreamId) {
        if let Some(pending) = self.pending.lock().get_mut(key) {
            pending.superseded = pending.superseded.max(Some(id));
        }
    }

    /// Takes the superseded substream that `new` replaces, if any.
    fn take_superseded(&self, key: &SubstreamKey, new: SubstreamId) -> Option<SubstreamId> {
        let mut pending = self.pending.lock();
        let entry = pending.get_mut(key)?;
        match entry.superseded {
            Some(old) if old < new => entry.superseded.take(),
            _ => None,
        }
    }

    fn emit(&self, event: ManagerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Removes `shared` from the table if it is still the registered substream
    /// for its key.
    pub(crate) async fn release(&self, shared: &SubstreamShared) {
        let key = shared.key();
        let Some(entry) = self.existing(&key.peer) else {
            return;
        };

        let mut slots = entry.slots.lock().await;
        let slot = (key.protocol.clone(), key.direction);
        if !slots
            .substreams
            .get(&slot)
            .is_some_and(|current| current.id() == shared.id())
        {
            return;
        }
        slots.substreams.remove(&slot);
        self.note_released(key, shared.id());

        let event = match shared.failure() {
            Some(error) => ManagerEvent::Failed {
                peer: key.peer,
                protocol: key.protocol.clone(),
                direction: key.direction,
                id: shared.id(),
                error,
            },
            None => ManagerEvent::Closed {
                peer: key.peer,
                protocol: key.protocol.clone(),
                direction: key.direction,
                id: shared.id(),
            },
        };
        if slots.substreams.is_empty() {
            self.prune(&key.peer, &entry, &mut slots);
        }

        debug!(target: "notifications::manager", peer = %key.peer, protocol = %key.protocol, direction = %key.direction, id = %shared.id(), "Substream removed");
        self.emit(event);
    }
}

/// Tracks the live substreams of every peer.
#[derive(Clone)]
pub struct PeerConnectionManager {
    inner: Arc<ManagerInner>,
}

impl PeerConnectionManager {
    pub fn new(gate: impl ReputationGate) -> Self {
        Self::with_event_capacity(gate, DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_event_capacity(gate: impl ReputationGate, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(ManagerInner {
                gate: Arc::new(gate),
                peers: RwLock::new(HashMap::new()),
                pending: SyncMutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                shut_down: AtomicBool::new(false),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_banned(&self, peer: &PeerId) -> bool {
        self.inner.gate.is_banned(peer)
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    pub(crate) fn next_id(&self) -> SubstreamId {
        SubstreamId(self.inner.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn downgrade(&self) -> Weak<ManagerInner> {
        Arc::downgrade(&self.inner)
    }

    /// Records that an inbound substream was refused.
    pub(crate) fn reject_inbound(
        &self,
        peer: PeerId,
        protocol: &ProtocolName,
        reason: RejectReason,
        metrics: Option<&NotificationMetrics>,
    ) {
        debug!(target: "notifications::manager", %peer, %protocol, reason = reason.as_str(), "Inbound substream rejected");
        if let Some(metrics) = metrics {
            metrics.inbound_rejected(reason.as_str());
        }
        self.inner.emit(ManagerEvent::Rejected {
            peer,
            protocol: protocol.clone(),
            reason,
        });
    }

    /// Consults the reputation gate for an inbound substream. Runs before any
    /// handshake bytes are exchanged.
    pub(crate) fn admit_inbound(
        &self,
        peer: PeerId,
        protocol: &ProtocolName,
        metrics: &NotificationMetrics,
    ) -> Result<(), NotificationError> {
        if self.is_banned(&peer) {
            self.reject_inbound(peer, protocol, RejectReason::Banned, Some(metrics));
            return Err(NotificationError::Banned(peer));
        }
        Ok(())
    }

    /// Marks a substream of `key` as handshaking until the returned guard drops.
    pub(crate) fn begin_handshake(&self, key: &SubstreamKey) -> HandshakeGuard {
        self.inner.pending.lock().entry(key.clone()).or_default().count += 1;
        HandshakeGuard {
            inner: Arc::clone(&self.inner),
            key: key.clone(),
        }
    }

    /// Registers a handshaken substream and moves it to `Open`, replacing any
    /// substream already registered for the same key.
    pub(crate) async fn activate(&self, shared: &Arc<SubstreamShared>) -> Result<(), NotificationError> {
        let key = shared.key();
        let slot = (key.protocol.clone(), key.direction);

        loop {
            let entry = self.inner.entry(key.peer);
            let mut slots = entry.slots.lock().await;
            if slots.removed {
                continue;
            }

            if self.is_shut_down() {
                if slots.substreams.is_empty() {
                    self.inner.prune(&key.peer, &entry, &mut slots);
                }
                return Err(NotificationError::TransportClosed);
            }

            // The peer may have been banned while the handshake ran.
            if self.is_banned(&key.peer) {
                if slots.substreams.is_empty() {
                    self.inner.prune(&key.peer, &entry, &mut slots);
                }
                return Err(NotificationError::Banned(key.peer));
            }

            let superseded = self.inner.take_superseded(key, shared.id());
            let replaced = match slots.substreams.remove(&slot) {
                Some(old) => {
                    info!(target: "notifications::manager", peer = %key.peer, protocol = %key.protocol, direction = %key.direction, old = %old.id(), new = %shared.id(), "Replacing substream");
                    old.request_close();
                    old.wait_released().await;
                    Some(old.id())
                }
                None => superseded,
            };
            if let Some(old) = replaced {
                self.inner.emit(ManagerEvent::Replaced {
                    peer: key.peer,
                    protocol: key.protocol.clone(),
                    direction: key.direction,
                    old,
                    new: shared.id(),
                });
            }

            if !shared.transition(SubstreamState::Open) {
                if slots.substreams.is_empty() {
                    self.inner.prune(&key.peer, &entry, &mut slots);
                }
                return Err(shared.terminal_error());
            }
            slots.substreams.insert(slot, Arc::clone(shared));
            shared.metrics().substream_opened();

            debug!(target: "notifications::manager", peer = %key.peer, protocol = %key.protocol, direction = %key.direction, id = %shared.id(), "Substream opened");
            self.inner.emit(ManagerEvent::Opened {
                peer: key.peer,
                protocol: key.protocol.clone(),
                direction: key.direction,
                id: shared.id(),
            });
            return Ok(());
        }
    }

    async fn live(&self, peer: &PeerId) -> Vec<Arc<SubstreamShared>> {
        match self.inner.existing(peer) {
            Some(entry) => entry.slots.lock().await.substreams.values().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Snapshot of the live substreams of `peer`.
    pub async fn substreams(&self, peer: &PeerId) -> Vec<SubstreamInfo> {
        self.live(peer).await.iter().map(|s| s.info()).collect()
    }

    pub async fn is_open(&self, peer: &PeerId, protocol: &ProtocolName, direction: Direction) -> bool {
        self.live(peer).await.iter().any(|s| {
            s.key().protocol == *protocol
                && s.key().direction == direction
                && s.state() == SubstreamState::Open
        })
    }

    /// Peers with at least one live substream.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.inner.peers.read().keys().copied().collect()
    }

    /// Gracefully closes every substream of `peer` and waits for them to be released.
    pub async fn disconnect_peer(&self, peer: &PeerId) {
        let substreams = self.live(peer).await;
        debug!(target: "notifications::manager", %peer, count = substreams.len(), "Disconnecting peer");
        close_all(substreams).await;
    }

    /// Fails every substream of `peer` with [`NotificationError::Banned`].
    ///
    /// Future admissions are decided by the reputation gate; record the ban
    /// there as well.
    pub async fn ban_peer(&self, peer: &PeerId) {
        let substreams = self.live(peer).await;
        info!(target: "notifications::manager", %peer, count = substreams.len(), "Banning peer");
        for substream in &substreams {
            substream.fail(NotificationError::Banned(*peer));
        }
        for substream in substreams {
            substream.wait_retired().await;
        }
    }

    /// Closes every substream of every peer and refuses to activate new ones.
    pub async fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);
        let mut substreams = Vec::new();
        for entry in self.inner.all_entries() {
            substreams.extend(entry.slots.lock().await.substreams.values().cloned());
        }
        info!(target: "notifications::manager", count = substreams.len(), "Shutting down");
        close_all(substreams).await;
    }
}

/// Keeps a key marked as handshaking. See [`PeerConnectionManager::begin_handshake`].
pub(crate) struct HandshakeGuard {
    inner: Arc<ManagerInner>,
    key: SubstreamKey,
}

impl Drop for HandshakeGuard {
    fn drop(&mut self) {
        let mut pending = self.inner.pending.lock();
        if let Some(entry) = pending.get_mut(&self.key) {
            entry.count = entry.count.saturating_sub(1);
            if entry.count == 0 {
                pending.remove(&self.key);
            }
        }
    }
}

async fn close_all(substreams: Vec<Arc<SubstreamShared>>) {
    for substream in &substreams {
        substream.request_close();
    }
    for substream in substreams {
        substream.wait_retired().await;
    }
}
