use log::{debug, info, warn};

use crate::error::PaxosError;
use crate::paxos::learner::{Decision, Learner};
use crate::paxos::messages::{Accept, AcceptedProposal, Accepted, Prepare, Promise};
use crate::paxos::proposal::ProposalNumber;
use crate::paxos::quorum::{quorum_size, Replies};
use crate::storage::{Persistence, ProposerRecord};

/// Where a proposer is in its current round.
///
/// `Decided` is terminal. `Rejected` means the last round was preempted and
/// the caller should start another with [`Proposer::get_prepare_message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposerState {
    New,
    ValueSet,
    /// Prepare issued, no promise received yet.
    Preparing,
    AwaitingPromises,
    /// Promise quorum resolved; an accept message can be built.
    Accepting,
    AwaitingAccepted,
    Decided,
    Rejected,
}

/// Result of feeding a promise to the proposer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseProgress {
    /// The reply belongs to no round in flight.
    Ignored,
    Waiting { received: usize, quorum: usize },
    QuorumReached,
}

/// Result of feeding an accepted reply to the proposer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    Ignored,
    Waiting { received: usize, quorum: usize },
    Decided(String),
    /// A higher proposal number reached some acceptor in the quorum. Start a
    /// new round; the next number will be above `observed`.
    Preempted { observed: ProposalNumber },
}

/// A Paxos proposer for a single decree.
pub struct Proposer<S> {
    identity: String,
    quorum_size: usize,
    max_round_number: i64,
    desired_value: Option<String>,
    proposal_number: Option<ProposalNumber>,
    /// Highest accepted proposal reported by the promise quorum.
    adopted: Option<AcceptedProposal>,
    /// Value sent in this round's accept message.
    round_value: Option<String>,
    promises: Replies<Promise>,
    accepted: Replies<Accepted>,
    state: ProposerState,
    chosen_value: Option<String>,
    store: S,
    learner: Option<Box<dyn Learner>>,
    failed: bool,
}

impl<S: Persistence<ProposerRecord>> Proposer<S> {
    /// A fresh proposer that has never issued a round.
    ///
    /// Fails with a precondition violation for fewer than three acceptors.
    pub fn new(
        identity: impl Into<String>,
        num_acceptors: usize,
        store: S,
    ) -> Result<Self, PaxosError> {
        let identity = identity.into();
        let quorum = quorum_size(num_acceptors)?;
        info!(
            "Proposer {}: initialized with {} acceptors (quorum {})",
            identity, num_acceptors, quorum
        );
        Ok(Proposer {
            identity,
            quorum_size: quorum,
            max_round_number: 0,
            desired_value: None,
            proposal_number: None,
            adopted: None,
            round_value: None,
            promises: Replies::new(quorum),
            accepted: Replies::new(quorum),
            state: ProposerState::New,
            chosen_value: None,
            store,
            learner: None,
            failed: false,
        })
    }

    /// Resume from the round counter in `store`, so no round number issued
    /// before a crash is reused.
    pub fn recover(
        identity: impl Into<String>,
        num_acceptors: usize,
        store: S,
    ) -> Result<Self, PaxosError> {
        let mut proposer = Self::new(identity, num_acceptors, store)?;
        proposer.restore()?;
        Ok(proposer)
    }

    pub fn with_learner(mut self, learner: impl Learner + 'static) -> Self {
        self.learner = Some(Box::new(learner));
        self
    }

    /// Reload the round counter from storage and abandon the round in flight.
    /// Clears a previous persistence failure.
    pub fn restore(&mut self) -> Result<(), PaxosError> {
        let record = self
            .store
            .load()
            .map_err(|source| PaxosError::PersistenceFailure {
                identity: self.identity.clone(),
                source,
            })?;

        if let Some(record) = record {
            if record.identity != self.identity {
                return Err(PaxosError::precondition(format!(
                    "stored record belongs to '{}', not '{}'",
                    record.identity, self.identity
                )));
            }
            self.max_round_number = record.max_round_number;
        }

        self.reset_round();
        self.proposal_number = None;
        self.state = if self.chosen_value.is_some() {
            ProposerState::Decided
        } else if self.desired_value.is_some() {
            ProposerState::ValueSet
        } else {
            ProposerState::New
        };
        self.failed = false;

        info!(
            "Proposer {}: restored max round {}",
            self.identity, self.max_round_number
        );
        Ok(())
    }

    /// Set the value this proposer wants chosen. Allowed once.
    pub fn propose_value(&mut self, value: impl Into<String>) -> Result<(), PaxosError> {
        if self.desired_value.is_some() {
            return Err(PaxosError::precondition(format!(
                "proposer {} already has a proposed value",
                self.identity
            )));
        }
        let value = value.into();
        info!("Proposer {}: client proposed '{}'", self.identity, value);
        self.desired_value = Some(value);
        if self.state == ProposerState::New {
            self.state = ProposerState::ValueSet;
        }
        Ok(())
    }

    /// Start a new round with a number above every round this proposer has
    /// used or seen. Replies gathered for earlier rounds are dropped.
    ///
    /// The returned message should be broadcast to every acceptor.
    pub fn get_prepare_message(&mut self) -> Result<Prepare, PaxosError> {
        self.ensure_alive()?;
        if self.state == ProposerState::Decided {
            return Err(PaxosError::precondition(format!(
                "proposer {} already decided",
                self.identity
            )));
        }

        let round = self.max_round_number + 1;
        self.write_max_round(round)?;
        self.max_round_number = round;

        let n = ProposalNumber::new(round, self.identity.clone());
        info!("Proposer {}: starting round {}", self.identity, n);
        self.proposal_number = Some(n.clone());
        self.reset_round();
        self.state = ProposerState::Preparing;

        Ok(Prepare { proposal_number: n })
    }

    /// Record a promise. On reaching a quorum, adopt the value with the
    /// highest accepted proposal number reported, if any.
    pub fn on_promise(&mut self, msg: Promise) -> Result<PhaseProgress, PaxosError> {
        self.ensure_alive()?;
        let Some(current) = self.proposal_number.as_ref() else {
            debug!(
                "Proposer {}: promise from {} with no round in flight",
                self.identity,
                msg.from_identity()
            );
            return Ok(PhaseProgress::Ignored);
        };
        if msg.min_proposal_number() < current {
            debug!(
                "Proposer {}: stale promise from {} (floor {} < {})",
                self.identity,
                msg.from_identity(),
                msg.min_proposal_number(),
                current
            );
            return Ok(PhaseProgress::Ignored);
        }

        let from = msg.from_identity().to_string();
        match self.state {
            ProposerState::Preparing | ProposerState::AwaitingPromises => {}
            ProposerState::Accepting | ProposerState::AwaitingAccepted => {
                // Late promises never change a value that may already be out.
                self.promises.record(&from, msg);
                return Ok(PhaseProgress::QuorumReached);
            }
            _ => return Ok(PhaseProgress::Ignored),
        }

        if !self.promises.record(&from, msg) {
            debug!(
                "Proposer {}: duplicate promise from {}",
                self.identity, from
            );
        }

        if !self.promises.has_quorum() {
            self.state = ProposerState::AwaitingPromises;
            return Ok(PhaseProgress::Waiting {
                received: self.promises.len(),
                quorum: self.quorum_size,
            });
        }

        self.adopted = self
            .promises
            .replies()
            .filter_map(Promise::accepted)
            .max_by(|a, b| a.proposal_number.cmp(&b.proposal_number))
            .cloned();
        match &self.adopted {
            Some(adopted) => info!(
                "Proposer {}: promise quorum reached, adopting '{}' from proposal {}",
                self.identity, adopted.value, adopted.proposal_number
            ),
            None => info!(
                "Proposer {}: promise quorum reached, no prior acceptance",
                self.identity
            ),
        }
        self.state = ProposerState::Accepting;
        Ok(PhaseProgress::QuorumReached)
    }

    /// The accept message for the current round. Needs a resolved promise
    /// quorum and a value; may be called again to re-broadcast.
    pub fn get_accept_message(&mut self) -> Result<Accept, PaxosError> {
        self.ensure_alive()?;
        if !matches!(
            self.state,
            ProposerState::Accepting | ProposerState::AwaitingAccepted
        ) {
            return Err(PaxosError::precondition(format!(
                "proposer {} has no promise quorum for the current round (state {:?})",
                self.identity, self.state
            )));
        }
        let Some(proposal_number) = self.proposal_number.clone() else {
            return Err(PaxosError::precondition("prepare phase has not run"));
        };

        let value = match &self.round_value {
            Some(v) => v.clone(),
            None => {
                let v = self
                    .adopted
                    .as_ref()
                    .map(|a| a.value.clone())
                    .or_else(|| self.desired_value.clone())
                    .ok_or_else(|| {
                        PaxosError::precondition(format!(
                            "proposer {} has no value to propose",
                            self.identity
                        ))
                    })?;
                self.round_value = Some(v.clone());
                v
            }
        };

        self.state = ProposerState::AwaitingAccepted;
        Ok(Accept {
            proposal_number,
            value,
        })
    }

    /// Record an accepted reply. On reaching a quorum, either decide or
    /// report preemption if any acceptor's floor passed this round.
    pub fn on_accepted(&mut self, msg: Accepted) -> Result<RoundOutcome, PaxosError> {
        self.ensure_alive()?;
        if self.state != ProposerState::AwaitingAccepted {
            debug!(
                "Proposer {}: accepted from {} ignored in state {:?}",
                self.identity, msg.from_identity, self.state
            );
            return Ok(RoundOutcome::Ignored);
        }
        let Some(current) = self.proposal_number.clone() else {
            return Ok(RoundOutcome::Ignored);
        };
        // An acceptor that already promised this round may still be answering
        // an accept from an abandoned one; its floor alone cannot tell.
        if msg.proposal_number != current {
            debug!(
                "Proposer {}: accepted from {} answers {}, not {}",
                self.identity, msg.from_identity, msg.proposal_number, current
            );
            return Ok(RoundOutcome::Ignored);
        }

        let from = msg.from_identity.clone();
        self.accepted.record(&from, msg);
        if !self.accepted.has_quorum() {
            return Ok(RoundOutcome::Waiting {
                received: self.accepted.len(),
                quorum: self.quorum_size,
            });
        }

        let highest = self
            .accepted
            .replies()
            .map(|a| &a.min_proposal_number)
            .max()
            .cloned();
        if let Some(observed) = highest.filter(|h| *h > current) {
            if observed.round() > self.max_round_number {
                self.write_max_round(observed.round())?;
                self.max_round_number = observed.round();
            }
            warn!(
                "Proposer {}: round {} preempted by {}",
                self.identity, current, observed
            );
            self.state = ProposerState::Rejected;
            return Ok(RoundOutcome::Preempted { observed });
        }

        let Some(value) = self.round_value.clone() else {
            return Err(PaxosError::precondition("accept phase has no value"));
        };
        info!(
            "Proposer {}: value '{}' chosen with proposal {}",
            self.identity, value, current
        );
        self.chosen_value = Some(value.clone());
        self.state = ProposerState::Decided;
        if let Some(learner) = self.learner.as_mut() {
            learner.on_decided(&Decision {
                proposer: self.identity.clone(),
                proposal_number: current,
                value: value.clone(),
            });
        }
        Ok(RoundOutcome::Decided(value))
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn quorum_size(&self) -> usize {
        self.quorum_size
    }

    pub fn max_round_number(&self) -> i64 {
        self.max_round_number
    }

    pub fn state(&self) -> ProposerState {
        self.state
    }

    pub fn proposal_number(&self) -> Option<&ProposalNumber> {
        self.proposal_number.as_ref()
    }

    pub fn desired_value(&self) -> Option<&str> {
        self.desired_value.as_deref()
    }

    /// The decided value; set once and never changed.
    pub fn chosen_value(&self) -> Option<&str> {
        self.chosen_value.as_deref()
    }

    pub fn promise_count(&self) -> usize {
        self.promises.len()
    }

    pub fn accepted_count(&self) -> usize {
        self.accepted.len()
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn reset_round(&mut self) {
        self.promises.clear();
        self.accepted.clear();
        self.adopted = None;
        self.round_value = None;
    }

    fn ensure_alive(&self) -> Result<(), PaxosError> {
        if self.failed {
            return Err(PaxosError::InstanceFailed {
                identity: self.identity.clone(),
            });
        }
        Ok(())
    }

    fn write_max_round(&mut self, round: i64) -> Result<(), PaxosError> {
        let record = ProposerRecord {
            identity: self.identity.clone(),
            max_round_number: round,
        };
        if let Err(source) = self.store.durable_write(&record) {
            warn!(
                "Proposer {}: durable write failed, refusing further messages: {}",
                self.identity, source
            );
            self.failed = true;
            return Err(PaxosError::PersistenceFailure {
                identity: self.identity.clone(),
                source,
            });
        }
        Ok(())
    }
}
