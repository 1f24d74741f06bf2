use log::{info, warn};

use crate::error::PaxosError;
use crate::paxos::messages::{Accept, AcceptedProposal, Accepted, Prepare, Promise};
use crate::paxos::proposal::ProposalNumber;
use crate::storage::{AcceptorRecord, Persistence};

/// A Paxos acceptor.
///
/// Holds a promise floor and at most one accepted proposal, both written
/// through its store before any reply leaves a handler. The floor never moves
/// backwards.
pub struct Acceptor<S> {
    identity: String,
    min_proposal_number: ProposalNumber,
    accepted: Option<AcceptedProposal>,
    store: S,
    failed: bool,
}

impl<S: Persistence<AcceptorRecord>> Acceptor<S> {
    /// A fresh acceptor that has promised and accepted nothing.
    pub fn new(identity: impl Into<String>, store: S) -> Self {
        Acceptor {
            identity: identity.into(),
            min_proposal_number: ProposalNumber::minimum(),
            accepted: None,
            store,
            failed: false,
        }
    }

    /// Rebuild an acceptor from the last record in `store`, or start fresh
    /// if nothing was ever written.
    pub fn recover(identity: impl Into<String>, store: S) -> Result<Self, PaxosError> {
        let mut acceptor = Self::new(identity, store);
        acceptor.restore()?;
        Ok(acceptor)
    }

    /// Reload durable state, clearing a previous persistence failure.
    pub fn restore(&mut self) -> Result<(), PaxosError> {
        let record = self
            .store
            .load()
            .map_err(|source| PaxosError::PersistenceFailure {
                identity: self.identity.clone(),
                source,
            })?;

        match record {
            Some(record) => {
                if record.identity != self.identity {
                    return Err(PaxosError::precondition(format!(
                        "stored record belongs to '{}', not '{}'",
                        record.identity, self.identity
                    )));
                }
                self.accepted = record.accepted().map_err(|source| {
                    PaxosError::PersistenceFailure {
                        identity: self.identity.clone(),
                        source,
                    }
                })?;
                self.min_proposal_number = record.min_proposal_number;
            }
            None => {
                self.min_proposal_number = ProposalNumber::minimum();
                self.accepted = None;
            }
        }
        self.failed = false;

        info!(
            "Acceptor {}: restored floor {} (accepted: {:?})",
            self.identity, self.min_proposal_number, self.accepted
        );
        Ok(())
    }

    /// Phase 1: raise the floor to the prepared number if it is not below
    /// the current one, then report whatever was accepted so far.
    ///
    /// A stale prepare still gets a promise; the proposer finds out about the
    /// higher floor from the reply.
    pub fn on_prepare(&mut self, msg: Prepare) -> Result<Promise, PaxosError> {
        self.ensure_alive()?;
        let n = msg.proposal_number;

        if n > self.min_proposal_number {
            let record = self.record(&n, self.accepted.as_ref());
            self.write(&record)?;
            info!(
                "Acceptor {}: promised proposal {} (was {})",
                self.identity, n, self.min_proposal_number
            );
            self.min_proposal_number = n;
        } else if n < self.min_proposal_number {
            warn!(
                "Acceptor {}: stale prepare {} below floor {}",
                self.identity, n, self.min_proposal_number
            );
        }

        Ok(Promise::new(
            self.identity.clone(),
            self.min_proposal_number.clone(),
            self.accepted.clone(),
        ))
    }

    /// Phase 2: accept the proposal unless a higher number was promised.
    ///
    /// Accepting also raises the floor to the accepted number. The reply
    /// names the proposal it answers and carries the floor, so a reply with a
    /// floor above the proposal tells the proposer it was preempted.
    pub fn on_accept(&mut self, msg: Accept) -> Result<Accepted, PaxosError> {
        self.ensure_alive()?;
        let answered = msg.proposal_number.clone();

        if msg.proposal_number >= self.min_proposal_number {
            let proposal = AcceptedProposal {
                proposal_number: msg.proposal_number,
                value: msg.value,
            };
            if self.accepted.as_ref() != Some(&proposal) {
                let record = self.record(&proposal.proposal_number, Some(&proposal));
                self.write(&record)?;
                info!(
                    "Acceptor {}: accepted proposal {} with value '{}'",
                    self.identity, proposal.proposal_number, proposal.value
                );
                self.min_proposal_number = proposal.proposal_number.clone();
                self.accepted = Some(proposal);
            }
        } else {
            warn!(
                "Acceptor {}: rejected accept {} below floor {}",
                self.identity, msg.proposal_number, self.min_proposal_number
            );
        }

        Ok(Accepted {
            from_identity: self.identity.clone(),
            proposal_number: answered,
            min_proposal_number: self.min_proposal_number.clone(),
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn min_proposal_number(&self) -> &ProposalNumber {
        &self.min_proposal_number
    }

    pub fn accepted(&self) -> Option<&AcceptedProposal> {
        self.accepted.as_ref()
    }

    /// True after a failed durable write until [`Acceptor::restore`] succeeds.
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn ensure_alive(&self) -> Result<(), PaxosError> {
        if self.failed {
            return Err(PaxosError::InstanceFailed {
                identity: self.identity.clone(),
            });
        }
        Ok(())
    }

    fn record(
        &self,
        floor: &ProposalNumber,
        accepted: Option<&AcceptedProposal>,
    ) -> AcceptorRecord {
        AcceptorRecord {
            identity: self.identity.clone(),
            min_proposal_number: floor.clone(),
            accepted_proposal_number: accepted.map(|a| a.proposal_number.clone()),
            accepted_value: accepted.map(|a| a.value.clone()),
        }
    }

    /// Write the state the handler is about to adopt. In-memory state is only
    /// touched by the caller after this returns `Ok`.
    fn write(&mut self, record: &AcceptorRecord) -> Result<(), PaxosError> {
        if let Err(source) = self.store.durable_write(record) {
            warn!(
                "Acceptor {}: durable write failed, refusing further messages: {}",
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
