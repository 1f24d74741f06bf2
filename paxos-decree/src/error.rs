use thiserror::Error;

use crate::paxos::dispatch::Role;
use crate::paxos::messages::MessageKind;
use crate::storage::StorageError;

/// Errors surfaced by the protocol roles.
///
/// Preemption is not an error: it is reported as
/// [`RoundOutcome::Preempted`](crate::paxos::proposer::RoundOutcome::Preempted).
#[derive(Debug, Error)]
pub enum PaxosError {
    /// Caller misuse: value proposed twice, accept requested before a
    /// promise quorum, or fewer than three acceptors.
    #[error("precondition violated: {0}")]
    PreconditionViolation(String),

    #[error("{role} does not support messages of type {kind}")]
    UnsupportedMessage { role: Role, kind: MessageKind },

    /// The state change behind a reply could not be made durable, so no
    /// reply was produced.
    #[error("{identity}: durable write failed: {source}")]
    PersistenceFailure {
        identity: String,
        #[source]
        source: StorageError,
    },

    /// A previous durable write failed and the instance has not been
    /// restored from storage since.
    #[error("{identity} refuses messages until its durable state is restored")]
    InstanceFailed { identity: String },
}

impl PaxosError {
    pub(crate) fn precondition(msg: impl Into<String>) -> Self {
        PaxosError::PreconditionViolation(msg.into())
    }
}
