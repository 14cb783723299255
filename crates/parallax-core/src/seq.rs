//! Cyclic sequence counter.

use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};

/// Exclusive upper bound for sequence values (2^53).
///
/// Values above this lose precision once they cross a float-typed boundary
/// (registry scores, JSON numbers), so the counter wraps below it.
pub const SEQ_LIMIT: u64 = 1 << 53;

const SEQ_MASK: u64 = SEQ_LIMIT - 1;

/// A concurrent sequence counter that wraps below 2^53.
///
/// Used for RPC correlation sequence numbers and inbound requester ids.
/// `SEQ_LIMIT` divides the natural u64 wrap point, so a masked
/// `fetch_add` stays monotonic modulo 2^53 without a CAS loop.
#[derive(Debug)]
pub struct CyclicSeq {
    counter: AtomicU64,
}

impl CyclicSeq {
    /// Creates a counter seeded at a random point of the cycle.
    #[must_use]
    pub fn new() -> Self {
        Self::with_seed(rand::thread_rng().gen_range(0..SEQ_LIMIT))
    }

    /// Creates a counter starting at `seed` (taken modulo 2^53).
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self {
            counter: AtomicU64::new(seed & SEQ_MASK),
        }
    }

    /// Returns the next value and advances the counter.
    pub fn next(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed) & SEQ_MASK
    }
}

impl Default for CyclicSeq {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_increment() {
        let seq = CyclicSeq::with_seed(41);
        assert_eq!(seq.next(), 41);
        assert_eq!(seq.next(), 42);
        assert_eq!(seq.next(), 43);
    }

    #[test]
    fn wraps_below_limit() {
        let seq = CyclicSeq::with_seed(SEQ_LIMIT - 2);
        assert_eq!(seq.next(), SEQ_LIMIT - 2);
        assert_eq!(seq.next(), SEQ_LIMIT - 1);
        assert_eq!(seq.next(), 0);
        assert_eq!(seq.next(), 1);
    }

    #[test]
    fn seed_is_masked() {
        let seq = CyclicSeq::with_seed(SEQ_LIMIT + 7);
        assert_eq!(seq.next(), 7);
    }

    #[test]
    fn random_seed_in_range() {
        for _ in 0..64 {
            let seq = CyclicSeq::new();
            assert!(seq.next() < SEQ_LIMIT);
        }
    }
}
