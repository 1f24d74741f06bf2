use std::fmt;

use serde::{Deserialize, Serialize};

use crate::paxos::proposal::ProposalNumber;

/// A proposal an acceptor has voted for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptedProposal {
    pub proposal_number: ProposalNumber,
    pub value: String,
}

/// Phase 1a: broadcast by a proposer to every acceptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prepare {
    pub proposal_number: ProposalNumber,
}

/// Phase 1b: an acceptor's answer to a [`Prepare`].
///
/// Always sent, even when the acceptor's floor is above the prepared number.
/// The reported accepted pair is all-or-nothing; the wire form keeps the two
/// halves as separate optional fields and decoding rejects a half pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PromiseWire", into = "PromiseWire")]
pub struct Promise {
    from_identity: String,
    min_proposal_number: ProposalNumber,
    accepted: Option<AcceptedProposal>,
}

impl Promise {
    pub fn new(
        from_identity: impl Into<String>,
        min_proposal_number: ProposalNumber,
        accepted: Option<AcceptedProposal>,
    ) -> Self {
        Promise {
            from_identity: from_identity.into(),
            min_proposal_number,
            accepted,
        }
    }

    pub fn from_identity(&self) -> &str {
        &self.from_identity
    }

    /// The acceptor's promise floor after it handled the prepare.
    pub fn min_proposal_number(&self) -> &ProposalNumber {
        &self.min_proposal_number
    }

    pub fn accepted(&self) -> Option<&AcceptedProposal> {
        self.accepted.as_ref()
    }

    pub fn accepted_proposal_number(&self) -> Option<&ProposalNumber> {
        self.accepted.as_ref().map(|a| &a.proposal_number)
    }

    pub fn accepted_value(&self) -> Option<&str> {
        self.accepted.as_ref().map(|a| a.value.as_str())
    }
}

#[derive(Serialize, Deserialize)]
struct PromiseWire {
    from_identity: String,
    min_proposal_number: ProposalNumber,
    accepted_proposal_number: Option<ProposalNumber>,
    accepted_value: Option<String>,
}

/// Decoded promise reported only one half of its accepted pair.
#[derive(Debug, thiserror::Error)]
#[error("promise from {from_identity} carries an incomplete accepted pair")]
pub struct IncompletePromise {
    pub from_identity: String,
}

impl TryFrom<PromiseWire> for Promise {
    type Error = IncompletePromise;

    fn try_from(wire: PromiseWire) -> Result<Self, Self::Error> {
        let accepted = match (wire.accepted_proposal_number, wire.accepted_value) {
            (Some(proposal_number), Some(value)) => Some(AcceptedProposal {
                proposal_number,
                value,
            }),
            (None, None) => None,
            _ => {
                return Err(IncompletePromise {
                    from_identity: wire.from_identity,
                })
            }
        };
        Ok(Promise {
            from_identity: wire.from_identity,
            min_proposal_number: wire.min_proposal_number,
            accepted,
        })
    }
}

impl From<Promise> for PromiseWire {
    fn from(promise: Promise) -> Self {
        let (accepted_proposal_number, accepted_value) = match promise.accepted {
            Some(a) => (Some(a.proposal_number), Some(a.value)),
            None => (None, None),
        };
        PromiseWire {
            from_identity: promise.from_identity,
            min_proposal_number: promise.min_proposal_number,
            accepted_proposal_number,
            accepted_value,
        }
    }
}

/// Phase 2a: sent once a proposer holds a quorum of promises.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accept {
    pub proposal_number: ProposalNumber,
    pub value: String,
}

/// Phase 2b: an acceptor's answer to an [`Accept`].
///
/// `proposal_number` echoes the accept being answered. `min_proposal_number`
/// is the acceptor's floor at reply time: equal to `proposal_number` when the
/// accept was taken, above it when the round was preempted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accepted {
    pub from_identity: String,
    pub proposal_number: ProposalNumber,
    pub min_proposal_number: ProposalNumber,
}

impl Accepted {
    /// True if the acceptor took the proposal it answers.
    pub fn is_accepted(&self) -> bool {
        self.min_proposal_number == self.proposal_number
    }
}

/// The closed set of protocol messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaxosMessage {
    Prepare(Prepare),
    Promise(Promise),
    Accept(Accept),
    Accepted(Accepted),
}

impl PaxosMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            PaxosMessage::Prepare(_) => MessageKind::Prepare,
            PaxosMessage::Promise(_) => MessageKind::Promise,
            PaxosMessage::Accept(_) => MessageKind::Accept,
            PaxosMessage::Accepted(_) => MessageKind::Accepted,
        }
    }
}

impl From<Prepare> for PaxosMessage {
    fn from(msg: Prepare) -> Self {
        PaxosMessage::Prepare(msg)
    }
}

impl From<Promise> for PaxosMessage {
    fn from(msg: Promise) -> Self {
        PaxosMessage::Promise(msg)
    }
}

impl From<Accept> for PaxosMessage {
    fn from(msg: Accept) -> Self {
        PaxosMessage::Accept(msg)
    }
}

impl From<Accepted> for PaxosMessage {
    fn from(msg: Accepted) -> Self {
        PaxosMessage::Accepted(msg)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Prepare,
    Promise,
    Accept,
    Accepted,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Prepare => "Prepare",
            MessageKind::Promise => "Promise",
            MessageKind::Accept => "Accept",
            MessageKind::Accepted => "Accepted",
        };
        f.write_str(name)
    }
}
