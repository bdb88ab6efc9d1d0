use std::sync::Arc;

use libp2p::PeerId;

/// Admission predicate consulted before any I/O with a peer.
///
/// Implementations must be cheap and non-blocking; the gate is called on the
/// accept path for every inbound substream.
pub trait ReputationGate: Send + Sync + 'static {
    fn is_banned(&self, peer: &PeerId) -> bool;
}

/// Gate that admits every peer.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl ReputationGate for AllowAll {
    fn is_banned(&self, _peer: &PeerId) -> bool {
        false
    }
}

impl ReputationGate for () {
    fn is_banned(&self, _peer: &PeerId) -> bool {
        false
    }
}

impl<T: ReputationGate + ?Sized> ReputationGate for Arc<T> {
    fn is_banned(&self, peer: &PeerId) -> bool {
        (**self).is_banned(peer)
    }
}

impl<F> ReputationGate for F
where
    F: Fn(&PeerId) -> bool + Send + Sync + 'static,
{
    fn is_banned(&self, peer: &PeerId) -> bool {
        self(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_gate() {
        let banned = PeerId::random();
        let gate = move |peer: &PeerId| *peer == banned;

        assert!(gate.is_banned(&banned));
        assert!(!gate.is_banned(&PeerId::random()));
    }

    #[test]
    fn test_dyn_gate_through_arc() {
        let gate: Arc<dyn ReputationGate> = Arc::new(AllowAll);
        assert!(!gate.is_banned(&PeerId::random()));
    }
}
