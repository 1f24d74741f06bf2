use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use log::info;

use crate::paxos::proposal::ProposalNumber;

/// A value decided by a proposer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub proposer: String,
    pub proposal_number: ProposalNumber,
    pub value: String,
}

/// Notified once when a proposer decides. Spreading the decision further is
/// up to the implementation.
pub trait Learner: Send {
    fn on_decided(&mut self, decision: &Decision);
}

impl<F> Learner for F
where
    F: FnMut(&Decision) + Send,
{
    fn on_decided(&mut self, decision: &Decision) {
        self(decision)
    }
}

/// Keeps every decision it is told about. Clones share the same list.
#[derive(Debug, Clone, Default)]
pub struct RecordingLearner {
    decisions: Arc<Mutex<Vec<Decision>>>,
}

impl RecordingLearner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decisions(&self) -> Vec<Decision> {
        self.decisions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Distinct decided values. More than one entry means agreement broke.
    pub fn distinct_values(&self) -> BTreeSet<String> {
        self.decisions().into_iter().map(|d| d.value).collect()
    }
}

impl Learner for RecordingLearner {
    fn on_decided(&mut self, decision: &Decision) {
        info!(
            "Learner: {} decided '{}' with proposal {}",
            decision.proposer, decision.value, decision.proposal_number
        );
        self.decisions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(decision.clone());
    }
}
