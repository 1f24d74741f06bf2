//! Single-decree Paxos: proposer and acceptor roles that agree on one value,
//! with durable role state, a JSON-lines wire codec and two runtimes for
//! driving a cluster (a seeded simulation and a thread-per-role mailbox).

pub mod cluster;
pub mod codec;
pub mod config;
pub mod error;
pub mod network;
pub mod paxos;
pub mod storage;

pub use error::PaxosError;
pub use paxos::{Acceptor, ProposalNumber, Proposer};
