//! Peer reputation for admission decisions.
//!
//! The notification layer only asks one question of reputation: is this peer
//! banned? That question is the [`ReputationGate`] trait. [`PeerReputations`] is
//! a reference implementation keeping a lock-free score per peer.

mod gate;
mod reputations;
mod score;

pub use gate::{AllowAll, ReputationGate};
pub use reputations::{PeerReputations, ReputationConfig, ReputationChange};
pub use score::{PeerScore, PeerScoreSnapshot};
