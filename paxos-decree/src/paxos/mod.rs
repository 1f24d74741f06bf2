pub mod acceptor;
pub mod dispatch;
pub mod learner;
pub mod messages;
pub mod proposal;
pub mod proposer;
pub mod quorum;

pub use acceptor::Acceptor;
pub use dispatch::{MessageHandler, Response, Role};
pub use learner::{Decision, Learner, RecordingLearner};
pub use messages::{
    Accept, Accepted, AcceptedProposal, MessageKind, PaxosMessage, Prepare, Promise,
};
pub use proposal::ProposalNumber;
pub use proposer::{PhaseProgress, Proposer, ProposerState, RoundOutcome};
