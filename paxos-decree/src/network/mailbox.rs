//! Threaded runtime: every role runs on its own thread and owns an mpsc
//! mailbox. Messages travel between mailboxes as JSON lines written and read
//! by the codec's stream functions, the same framing a socket would carry.

use std::collections::{BTreeMap, HashMap};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

use crate::codec::{self, CodecError};
use crate::config::SimulationConfig;
use crate::error::PaxosError;
use crate::paxos::dispatch::{MessageHandler, Response};
use crate::paxos::learner::RecordingLearner;
use crate::paxos::messages::PaxosMessage;
use crate::paxos::proposer::{PhaseProgress, ProposerState, RoundOutcome};
use crate::paxos::{Acceptor, Proposer};
use crate::storage::{AcceptorRecord, MemoryStore, ProposerRecord};

#[derive(Debug, Error)]
pub enum MailboxError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Paxos(#[from] PaxosError),

    #[error("no mailbox for '{0}'")]
    UnknownPeer(String),

    #[error("mailbox of '{0}' disconnected")]
    Disconnected(String),

    #[error("{id} gave up after {rounds} rounds")]
    GaveUp { id: String, rounds: usize },

    #[error("failed to spawn thread for '{0}': {1}")]
    Spawn(String, #[source] std::io::Error),

    #[error("thread for '{0}' panicked")]
    ThreadPanicked(String),
}

#[derive(Debug, Clone, Copy)]
pub struct MailboxOptions {
    /// How long a proposer waits for a reply before starting a new round.
    pub round_timeout: Duration,
    /// Upper bound of the random pause before retrying a preempted round.
    pub max_backoff: Duration,
    pub max_rounds: usize,
}

impl Default for MailboxOptions {
    fn default() -> Self {
        MailboxOptions {
            round_timeout: Duration::from_millis(200),
            max_backoff: Duration::from_millis(20),
            max_rounds: 1000,
        }
    }
}

/// A newline-terminated JSON message as `codec::write_message` framed it.
enum Frame {
    Line { from: String, bytes: Vec<u8> },
    Shutdown,
}

impl Frame {
    fn line(from: &str, msg: &PaxosMessage) -> Result<Frame, CodecError> {
        let mut bytes = Vec::new();
        codec::write_message(&mut bytes, msg)?;
        Ok(Frame::Line {
            from: from.to_string(),
            bytes,
        })
    }
}

/// Decode the message carried by a frame; an empty frame is an error.
fn read_frame(bytes: &[u8]) -> Result<PaxosMessage, CodecError> {
    let mut reader = bytes;
    codec::read_message(&mut reader)?.ok_or_else(|| {
        CodecError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "empty frame",
        ))
    })
}

/// Sending side of every mailbox, shared by all threads.
#[derive(Clone)]
struct Router {
    peers: HashMap<String, Sender<Frame>>,
}

impl Router {
    fn send(&self, from: &str, to: &str, msg: &PaxosMessage) -> Result<(), MailboxError> {
        let tx = self
            .peers
            .get(to)
            .ok_or_else(|| MailboxError::UnknownPeer(to.to_string()))?;
        let frame = Frame::line(from, msg)?;
        if tx.send(frame).is_err() {
            // The receiver already finished; nothing is waiting for this.
            debug!("Mailbox: {} dropped {} for finished {}", from, msg.kind(), to);
        }
        Ok(())
    }

    fn broadcast(
        &self,
        from: &str,
        targets: &[String],
        msg: &PaxosMessage,
    ) -> Result<(), MailboxError> {
        for target in targets {
            self.send(from, target, msg)?;
        }
        Ok(())
    }

    fn shutdown(&self, to: &str) {
        if let Some(tx) = self.peers.get(to) {
            let _ = tx.send(Frame::Shutdown);
        }
    }
}

/// Run every acceptor and proposer in `config` on its own thread until each
/// proposer has decided. Returns the value each proposer decided.
pub fn run_threaded(
    config: &SimulationConfig,
    options: MailboxOptions,
    learner: RecordingLearner,
) -> Result<BTreeMap<String, String>, MailboxError> {
    let acceptor_ids = config.acceptor_ids();
    let mut peers = HashMap::new();
    let mut inboxes = Vec::new();
    for id in acceptor_ids
        .iter()
        .chain(config.proposers.iter().map(|p| &p.id))
    {
        let (tx, rx) = mpsc::channel();
        peers.insert(id.clone(), tx);
        inboxes.push((id.clone(), rx));
    }
    let router = Router { peers };
    let mut inboxes: HashMap<String, Receiver<Frame>> = inboxes.into_iter().collect();

    let mut acceptor_threads = Vec::new();
    for id in &acceptor_ids {
        let rx = take_inbox(&mut inboxes, id)?;
        let acceptor = Acceptor::new(id.clone(), MemoryStore::new());
        let router = router.clone();
        let handle = thread::Builder::new()
            .name(id.clone())
            .spawn(move || acceptor_loop(acceptor, rx, router))
            .map_err(|e| MailboxError::Spawn(id.clone(), e))?;
        acceptor_threads.push((id.clone(), handle));
    }

    let mut proposer_threads = Vec::new();
    for (i, spec) in config.proposers.iter().enumerate() {
        let rx = take_inbox(&mut inboxes, &spec.id)?;
        let mut proposer = Proposer::new(spec.id.clone(), config.acceptors, MemoryStore::new())?
            .with_learner(learner.clone());
        proposer.propose_value(spec.value.clone())?;
        let worker = ProposerWorker {
            proposer,
            rx,
            router: router.clone(),
            acceptors: acceptor_ids.clone(),
            rng: StdRng::seed_from_u64(config.seed.wrapping_add(i as u64)),
            options,
        };
        let handle = thread::Builder::new()
            .name(spec.id.clone())
            .spawn(move || worker.run())
            .map_err(|e| MailboxError::Spawn(spec.id.clone(), e))?;
        proposer_threads.push((spec.id.clone(), handle));
    }

    let mut decisions = BTreeMap::new();
    let mut first_error = None;
    for (id, handle) in proposer_threads {
        match join(&id, handle) {
            Ok(value) => {
                decisions.insert(id, value);
            }
            Err(e) => {
                warn!("Mailbox: {} failed: {}", id, e);
                first_error.get_or_insert(e);
            }
        }
    }

    for id in &acceptor_ids {
        router.shutdown(id);
    }
    for (id, handle) in acceptor_threads {
        if let Err(e) = join(&id, handle) {
            first_error.get_or_insert(e);
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(decisions),
    }
}

fn take_inbox(
    inboxes: &mut HashMap<String, Receiver<Frame>>,
    id: &str,
) -> Result<Receiver<Frame>, MailboxError> {
    inboxes
        .remove(id)
        .ok_or_else(|| MailboxError::UnknownPeer(id.to_string()))
}

fn join<T>(id: &str, handle: JoinHandle<Result<T, MailboxError>>) -> Result<T, MailboxError> {
    handle
        .join()
        .map_err(|_| MailboxError::ThreadPanicked(id.to_string()))?
}

fn acceptor_loop(
    mut acceptor: Acceptor<MemoryStore<AcceptorRecord>>,
    rx: Receiver<Frame>,
    router: Router,
) -> Result<(), MailboxError> {
    loop {
        let (from, bytes) = match rx.recv() {
            Ok(Frame::Line { from, bytes }) => (from, bytes),
            Ok(Frame::Shutdown) | Err(_) => break,
        };
        let msg = match read_frame(&bytes) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Acceptor {}: bad frame from {}: {}", acceptor.identity(), from, e);
                continue;
            }
        };
        match acceptor.handle_message(msg) {
            Ok(Response::Reply(reply)) => router.send(acceptor.identity(), &from, &reply)?,
            Ok(_) => {}
            Err(PaxosError::PersistenceFailure { .. } | PaxosError::InstanceFailed { .. }) => {
                acceptor.restore()?;
            }
            Err(e) => warn!("Acceptor {}: {}", acceptor.identity(), e),
        }
    }
    info!("Acceptor {}: shutting down", acceptor.identity());
    Ok(())
}

struct ProposerWorker {
    proposer: Proposer<MemoryStore<ProposerRecord>>,
    rx: Receiver<Frame>,
    router: Router,
    acceptors: Vec<String>,
    rng: StdRng,
    options: MailboxOptions,
}

impl ProposerWorker {
    fn run(mut self) -> Result<String, MailboxError> {
        let id = self.proposer.identity().to_string();
        let mut rounds = 0;

        'rounds: loop {
            if rounds >= self.options.max_rounds {
                return Err(MailboxError::GaveUp { id, rounds });
            }
            rounds += 1;
            let prepare = self.proposer.get_prepare_message()?;
            self.router.broadcast(&id, &self.acceptors, &prepare.into())?;

            loop {
                let (from, bytes) = match self.rx.recv_timeout(self.options.round_timeout) {
                    Ok(Frame::Line { from, bytes }) => (from, bytes),
                    Ok(Frame::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                        return Err(MailboxError::Disconnected(id));
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        debug!("Proposer {}: round timed out", id);
                        continue 'rounds;
                    }
                };
                let msg = match read_frame(&bytes) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!("Proposer {}: bad frame from {}: {}", id, from, e);
                        continue;
                    }
                };

                match self.proposer.handle_message(msg)? {
                    Response::Promises(PhaseProgress::QuorumReached)
                        if self.proposer.state() == ProposerState::Accepting =>
                    {
                        let accept = self.proposer.get_accept_message()?;
                        self.router.broadcast(&id, &self.acceptors, &accept.into())?;
                    }
                    Response::Round(RoundOutcome::Decided(value)) => return Ok(value),
                    Response::Round(RoundOutcome::Preempted { observed }) => {
                        let max = self.options.max_backoff.as_millis() as u64;
                        let pause = Duration::from_millis(self.rng.random_range(0..=max));
                        info!(
                            "Proposer {}: preempted by {}, retrying in {:?}",
                            id, observed, pause
                        );
                        thread::sleep(pause);
                        continue 'rounds;
                    }
                    _ => {}
                }
            }
        }
    }
}
