//! Reputation table with Arc-per-peer pattern for minimal lock contention.

use std::{collections::HashMap, sync::Arc};

use libp2p::PeerId;
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::{PeerScore, PeerScoreSnapshot, ReputationGate};

/// A reputation adjustment and why it was made.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReputationChange {
    pub value: f64,
    pub reason: &'static str,
}

impl ReputationChange {
    pub const fn new(value: f64, reason: &'static str) -> Self {
        Self { value, reason }
    }

    /// A change large enough to ban the peer on its own.
    pub const fn new_fatal(reason: &'static str) -> Self {
        Self::new(f64::MIN, reason)
    }
}

/// Configuration for [`PeerReputations`].
#[derive(Debug, Clone)]
pub struct ReputationConfig {
    /// Score at or below which peers are banned.
    pub ban_threshold: f64,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            ban_threshold: -100.0,
        }
    }
}

/// Per-peer reputation table.
///
/// Lookups take a brief read lock to get the peer's `Arc<PeerScore>`; score
/// updates on that `Arc` are lock-free.
#[derive(Debug, Default)]
pub struct PeerReputations {
    config: ReputationConfig,
    peers: RwLock<HashMap<PeerId, Arc<PeerScore>>>,
}

impl PeerReputations {
    pub fn new(config: ReputationConfig) -> Self {
        Self {
            config,
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ReputationConfig {
        &self.config
    }

    /// Get or create the score entry for `peer`.
    pub fn peer(&self, peer: PeerId) -> Arc<PeerScore> {
        // Fast path: read lock
        if let Some(score) = self.peers.read().get(&peer) {
            return Arc::clone(score);
        }

        // Slow path: write lock (only on first access per peer)
        Arc::clone(self.peers.write().entry(peer).or_default())
    }

    /// Applies `change` to `peer`. Returns `true` if this report banned the peer.
    pub fn report(&self, peer: PeerId, change: ReputationChange) -> bool {
        let score = self.peer(peer);
        let was_banned = self.banned_by(&score);
        let value = score.add_score(change.value);
        trace!(target: "peer::score", %peer, delta = change.value, reason = change.reason, score = value, "Reputation change");

        let now_banned = self.banned_by(&score);
        if now_banned && !was_banned {
            debug!(target: "peer::score", %peer, reason = change.reason, score = value, "Peer banned by reputation");
        }
        now_banned && !was_banned
    }

    /// Bans `peer` regardless of its score.
    pub fn ban(&self, peer: PeerId) {
        if !self.peer(peer).set_banned(true) {
            debug!(target: "peer::score", %peer, "Peer banned");
        }
    }

    /// Clears the explicit ban and resets the score of `peer`.
    pub fn unban(&self, peer: &PeerId) {
        if let Some(score) = self.peers.read().get(peer) {
            score.reset();
            debug!(target: "peer::score", %peer, "Peer unbanned");
        }
    }

    pub fn score(&self, peer: &PeerId) -> Option<f64> {
        self.peers.read().get(peer).map(|score| score.score())
    }

    /// Drops the entry for `peer`.
    pub fn remove(&self, peer: &PeerId) -> Option<Arc<PeerScore>> {
        self.peers.write().remove(peer)
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    pub fn snapshot(&self) -> HashMap<PeerId, PeerScoreSnapshot> {
        self.peers
            .read()
            .iter()
            .map(|(peer, score)| (*peer, score.snapshot()))
            .collect()
    }

    fn banned_by(&self, score: &PeerScore) -> bool {
        score.is_explicitly_banned() || score.score() <= self.config.ban_threshold
    }
}

impl ReputationGate for PeerReputations {
    fn is_banned(&self, peer: &PeerId) -> bool {
        self.peers
            .read()
            .get(peer)
            .is_some_and(|score| self.banned_by(score))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MISBEHAVED: ReputationChange = ReputationChange::new(-60.0, "misbehaved");

    #[test]
    fn test_unknown_peer_not_banned() {
        let table = PeerReputations::default();
        assert!(!table.is_banned(&PeerId::random()));
        assert!(table.is_empty());
    }

    #[test]
    fn test_report_crosses_threshold_once() {
        let table = PeerReputations::default();
        let peer = PeerId::random();

        assert!(!table.report(peer, MISBEHAVED));
        assert!(!table.is_banned(&peer));
        assert!(table.report(peer, MISBEHAVED));
        assert!(table.is_banned(&peer));
        assert!(!table.report(peer, MISBEHAVED));
    }

    #[test]
    fn test_fatal_change_bans_immediately() {
        let table = PeerReputations::default();
        let peer = PeerId::random();

        assert!(table.report(peer, ReputationChange::new_fatal("bad handshake")));
        assert!(table.is_banned(&peer));
    }

    #[test]
    fn test_explicit_ban_and_unban() {
        let table = PeerReputations::default();
        let peer = PeerId::random();

        table.ban(peer);
        assert!(table.is_banned(&peer));
        assert_eq!(table.score(&peer), Some(0.0));

        table.unban(&peer);
        assert!(!table.is_banned(&peer));
    }

    #[test]
    fn test_snapshot_lists_all_peers() {
        let table = PeerReputations::default();
        let a = PeerId::random();
        let b = PeerId::random();
        table.report(a, ReputationChange::new(5.0, "good"));
        table.ban(b);

        let snapshot = table.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot[&b].banned);
        assert!((snapshot[&a].score - 5.0).abs() < 1e-9);
    }
}
