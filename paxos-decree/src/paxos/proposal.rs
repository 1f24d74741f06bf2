use std::fmt;

use serde::{Deserialize, Serialize};

/// A proposal number: `(round, proposer identity)`.
///
/// Ordering compares the round first and falls back to the identity, so two
/// proposers with distinct identities can never issue equal numbers, e.g.
/// `(4, "C") > (4, "B") > (3, "Z")`. Field order matters for the derived `Ord`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProposalNumber {
    round: i64,
    identity: String,
}

impl ProposalNumber {
    pub fn new(round: i64, identity: impl Into<String>) -> Self {
        ProposalNumber {
            round,
            identity: identity.into(),
        }
    }

    /// Sentinel that sorts below every number a proposer can issue.
    pub fn minimum() -> Self {
        ProposalNumber {
            round: -1,
            identity: String::new(),
        }
    }

    pub fn round(&self) -> i64 {
        self.round
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn is_minimum(&self) -> bool {
        *self == Self::minimum()
    }
}

impl fmt::Display for ProposalNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_minimum() {
            write!(f, "-")
        } else {
            write!(f, "{}.{}", self.round, self.identity)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_dominates_identity() {
        let low = ProposalNumber::new(3, "Z");
        let high = ProposalNumber::new(4, "A");
        assert!(high > low);
    }

    #[test]
    fn identity_breaks_ties() {
        let b = ProposalNumber::new(4, "B");
        let c = ProposalNumber::new(4, "C");
        assert!(c > b);
        assert_ne!(b, c);
    }

    #[test]
    fn minimum_precedes_everything() {
        let min = ProposalNumber::minimum();
        assert!(min < ProposalNumber::new(0, ""));
        assert!(min < ProposalNumber::new(-1, "a"));
        assert!(min < ProposalNumber::new(1, "proposer-1"));
        assert!(min.is_minimum());
    }

    #[test]
    fn display_uses_round_and_identity() {
        assert_eq!(ProposalNumber::new(2, "p1").to_string(), "2.p1");
        assert_eq!(ProposalNumber::minimum().to_string(), "-");
    }
}
