//! Lock-free peer score with atomics.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

/// Fixed-point scaling for score precision without floats in atomics.
const SCORE_SCALE: f64 = 100_000.0;
const MIN_SCORE: f64 = -1_000_000.0;
const MAX_SCORE: f64 = 1_000_000.0;
const ORD: Ordering = Ordering::Relaxed;

/// Reputation of a single peer.
#[derive(Debug, Default)]
pub struct PeerScore {
    /// Fixed-point score (score * SCORE_SCALE).
    score: AtomicI64,
    reports: AtomicU32,
    banned: AtomicBool,
}

impl PeerScore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn score(&self) -> f64 {
        self.score.load(ORD) as f64 / SCORE_SCALE
    }

    /// Atomically adjusts the score, clamped to bounds. Returns the new score.
    pub fn add_score(&self, delta: f64) -> f64 {
        let delta_scaled = (delta * SCORE_SCALE) as i64;
        let min = (MIN_SCORE * SCORE_SCALE) as i64;
        let max = (MAX_SCORE * SCORE_SCALE) as i64;

        let mut current = self.score.load(ORD);
        loop {
            let new_val = current.saturating_add(delta_scaled).clamp(min, max);
            match self
                .score
                .compare_exchange_weak(current, new_val, ORD, ORD)
            {
                Ok(_) => {
                    self.reports.fetch_add(1, ORD);
                    return new_val as f64 / SCORE_SCALE;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Whether the peer was banned explicitly, independent of its score.
    pub fn is_explicitly_banned(&self) -> bool {
        self.banned.load(ORD)
    }

    /// Sets the explicit ban flag. Returns the previous value.
    pub fn set_banned(&self, banned: bool) -> bool {
        self.banned.swap(banned, ORD)
    }

    pub fn reset(&self) {
        self.score.store(0, ORD);
        self.banned.store(false, ORD);
    }

    pub fn snapshot(&self) -> PeerScoreSnapshot {
        PeerScoreSnapshot {
            score: self.score(),
            reports: self.reports.load(ORD),
            banned: self.is_explicitly_banned(),
        }
    }
}

/// Point-in-time copy of a [`PeerScore`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeerScoreSnapshot {
    pub score: f64,
    pub reports: u32,
    pub banned: bool,
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_add_score_accumulates() {
        let score = PeerScore::new();
        score.add_score(10.0);
        score.add_score(-2.5);
        assert!((score.score() - 7.5).abs() < 1e-9);
        assert_eq!(score.snapshot().reports, 2);
    }

    #[test]
    fn test_explicit_ban_flag() {
        let score = PeerScore::new();
        assert!(!score.set_banned(true));
        assert!(score.is_explicitly_banned());
        score.reset();
        assert!(!score.is_explicitly_banned());
    }

    proptest! {
        #[test]
        fn test_score_stays_within_bounds(deltas in prop::collection::vec(-1e7f64..1e7, 1..32)) {
            let score = PeerScore::new();
            for delta in deltas {
                let value = score.add_score(delta);
                prop_assert!((MIN_SCORE..=MAX_SCORE).contains(&value));
            }
        }
    }
}
