pub mod mailbox;
pub mod simulation;

use crate::paxos::messages::PaxosMessage;

/// A message in flight between two named nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub from: String,
    pub to: String,
    pub msg: PaxosMessage,
}

/// Fire-and-forget delivery. Implementations may reorder, duplicate or drop.
pub trait Transport {
    fn send(&mut self, from: &str, to: &str, msg: PaxosMessage);

    fn broadcast(&mut self, from: &str, targets: &[String], msg: PaxosMessage) {
        for target in targets {
            self.send(from, target, msg.clone());
        }
    }
}
