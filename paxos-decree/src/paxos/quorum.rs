//! Majority quorums and identity-keyed reply accumulation.

use std::collections::BTreeMap;

use crate::error::PaxosError;

/// Smallest cluster a proposer will run against.
pub const MIN_ACCEPTORS: usize = 3;

/// Majority of `num_acceptors`: `⌊N/2⌋ + 1`.
pub fn quorum_size(num_acceptors: usize) -> Result<usize, PaxosError> {
    if num_acceptors < MIN_ACCEPTORS {
        return Err(PaxosError::precondition(format!(
            "invalid number of acceptors {}, should be >= {}",
            num_acceptors, MIN_ACCEPTORS
        )));
    }
    Ok(num_acceptors / 2 + 1)
}

/// Latest reply per acceptor for the round in flight.
///
/// A retransmitted reply overwrites the earlier one instead of being counted
/// twice; the quorum is reached by distinct identities only.
#[derive(Debug, Clone)]
pub struct Replies<T> {
    by_identity: BTreeMap<String, T>,
    quorum: usize,
}

impl<T> Replies<T> {
    pub fn new(quorum: usize) -> Self {
        Replies {
            by_identity: BTreeMap::new(),
            quorum,
        }
    }

    /// Record `reply` from `identity`. Returns `true` if this identity was
    /// not counted before.
    pub fn record(&mut self, identity: &str, reply: T) -> bool {
        self.by_identity.insert(identity.to_string(), reply).is_none()
    }

    pub fn len(&self) -> usize {
        self.by_identity.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_identity.is_empty()
    }

    pub fn has_quorum(&self) -> bool {
        self.by_identity.len() >= self.quorum
    }

    pub fn replies(&self) -> impl Iterator<Item = &T> {
        self.by_identity.values()
    }

    pub fn clear(&mut self) {
        self.by_identity.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn majority_sizes() {
        assert_eq!(quorum_size(3).unwrap(), 2);
        assert_eq!(quorum_size(4).unwrap(), 3);
        assert_eq!(quorum_size(5).unwrap(), 3);
        assert_eq!(quorum_size(8).unwrap(), 5);
    }

    #[test]
    fn too_few_acceptors() {
        for n in 0..MIN_ACCEPTORS {
            assert!(matches!(
                quorum_size(n),
                Err(PaxosError::PreconditionViolation(_))
            ));
        }
    }

    #[test]
    fn any_two_quorums_intersect() {
        // Exhaustive over every pair of subsets for small clusters.
        for n in MIN_ACCEPTORS..=9 {
            let q = quorum_size(n).unwrap();
            let quorums: Vec<u32> = (0u32..(1 << n))
                .filter(|mask| mask.count_ones() as usize >= q)
                .collect();
            for a in &quorums {
                for b in &quorums {
                    assert_ne!(a & b, 0, "quorums {:b} and {:b} of {} are disjoint", a, b, n);
                }
            }
        }
    }

    #[test]
    fn duplicates_do_not_inflate_the_count() {
        let mut replies = Replies::new(2);
        assert!(replies.record("a1", 1));
        assert!(!replies.record("a1", 2));
        assert_eq!(replies.len(), 1);
        assert!(!replies.has_quorum());
        assert_eq!(replies.replies().copied().collect::<Vec<_>>(), vec![2]);

        assert!(replies.record("a2", 3));
        assert!(replies.has_quorum());

        replies.clear();
        assert!(replies.is_empty());
    }
}
