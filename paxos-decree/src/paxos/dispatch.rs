//! Routes an inbound [`PaxosMessage`] to the role handler that understands it.

use std::fmt;

use crate::error::PaxosError;
use crate::paxos::acceptor::Acceptor;
use crate::paxos::messages::PaxosMessage;
use crate::paxos::proposer::{PhaseProgress, Proposer, RoundOutcome};
use crate::storage::{AcceptorRecord, Persistence, ProposerRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Acceptor,
    Proposer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Acceptor => f.write_str("Acceptor"),
            Role::Proposer => f.write_str("Proposer"),
        }
    }
}

/// What handling a message produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// A reply to send back to the sender.
    Reply(PaxosMessage),
    Promises(PhaseProgress),
    Round(RoundOutcome),
}

pub trait MessageHandler {
    const ROLE: Role;

    fn handle_message(&mut self, msg: PaxosMessage) -> Result<Response, PaxosError>;
}

fn unsupported(role: Role, msg: &PaxosMessage) -> PaxosError {
    PaxosError::UnsupportedMessage {
        role,
        kind: msg.kind(),
    }
}

impl<S: Persistence<AcceptorRecord>> MessageHandler for Acceptor<S> {
    const ROLE: Role = Role::Acceptor;

    fn handle_message(&mut self, msg: PaxosMessage) -> Result<Response, PaxosError> {
        match msg {
            PaxosMessage::Prepare(prepare) => {
                Ok(Response::Reply(self.on_prepare(prepare)?.into()))
            }
            PaxosMessage::Accept(accept) => Ok(Response::Reply(self.on_accept(accept)?.into())),
            other @ (PaxosMessage::Promise(_) | PaxosMessage::Accepted(_)) => {
                Err(unsupported(Self::ROLE, &other))
            }
        }
    }
}

impl<S: Persistence<ProposerRecord>> MessageHandler for Proposer<S> {
    const ROLE: Role = Role::Proposer;

    fn handle_message(&mut self, msg: PaxosMessage) -> Result<Response, PaxosError> {
        match msg {
            PaxosMessage::Promise(promise) => Ok(Response::Promises(self.on_promise(promise)?)),
            PaxosMessage::Accepted(accepted) => Ok(Response::Round(self.on_accepted(accepted)?)),
            other @ (PaxosMessage::Prepare(_) | PaxosMessage::Accept(_)) => {
                Err(unsupported(Self::ROLE, &other))
            }
        }
    }
}
