//! A retrying driver that runs proposers and acceptors over a [`SimNetwork`].
//!
//! The protocol roles never retry or time out on their own. This driver
//! re-broadcasts the current phase message when a proposer stops making
//! progress, starts a fresh round after repeated stalls, and restarts a
//! preempted round after a random backoff so competing proposers stop
//! trampling each other.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use log::{info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::SimulationConfig;
use crate::error::PaxosError;
use crate::network::simulation::{Faults, NetworkStats, SimNetwork};
use crate::network::{Envelope, Transport};
use crate::paxos::dispatch::{MessageHandler, Response};
use crate::paxos::learner::RecordingLearner;
use crate::paxos::messages::Prepare;
use crate::paxos::proposer::{PhaseProgress, ProposerState, RoundOutcome};
use crate::paxos::{Acceptor, Proposer};
use crate::storage::{AcceptorRecord, FileStore, MemoryStore, Persistence, ProposerRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Steps without progress before the proposer acts.
    pub stall_steps: usize,
    /// Re-broadcasts of the same round before giving it up.
    pub max_resends: usize,
    /// Upper bound of the random delay before restarting a preempted round.
    pub max_backoff_steps: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            stall_steps: 200,
            max_resends: 2,
            max_backoff_steps: 50,
        }
    }
}

/// What a run produced.
#[derive(Debug, Clone)]
pub struct Report {
    pub decisions: BTreeMap<String, Option<String>>,
    pub rounds: BTreeMap<String, usize>,
    pub steps: usize,
    pub network: NetworkStats,
}

impl Report {
    pub fn all_decided(&self) -> bool {
        self.decisions.values().all(Option::is_some)
    }

    pub fn distinct_values(&self) -> BTreeSet<&str> {
        self.decisions.values().flatten().map(String::as_str).collect()
    }

    /// The single value every deciding proposer chose, if any decided and
    /// they all agree.
    pub fn agreed_value(&self) -> Option<&str> {
        let values = self.distinct_values();
        if values.len() == 1 {
            values.into_iter().next()
        } else {
            None
        }
    }
}

struct Driven<S> {
    proposer: Proposer<S>,
    last_prepare: Option<Prepare>,
    last_progress: usize,
    restart_at: Option<usize>,
    resends: usize,
    rounds: usize,
}

impl<S> Driven<S> {
    fn begin_round(&mut self, step: usize, prepare: Prepare) {
        self.last_prepare = Some(prepare);
        self.last_progress = step;
        self.restart_at = None;
        self.resends = 0;
        self.rounds += 1;
    }
}

pub struct Cluster<SA, SP> {
    acceptors: BTreeMap<String, Acceptor<SA>>,
    proposers: BTreeMap<String, Driven<SP>>,
    acceptor_ids: Vec<String>,
    network: SimNetwork,
    rng: StdRng,
    retry: RetryPolicy,
    learner: RecordingLearner,
    step: usize,
}

impl<SA, SP> Cluster<SA, SP>
where
    SA: Persistence<AcceptorRecord>,
    SP: Persistence<ProposerRecord>,
{
    pub fn new(network: SimNetwork, seed: u64, retry: RetryPolicy) -> Self {
        Cluster {
            acceptors: BTreeMap::new(),
            proposers: BTreeMap::new(),
            acceptor_ids: Vec::new(),
            network,
            rng: StdRng::seed_from_u64(seed),
            retry,
            learner: RecordingLearner::new(),
            step: 0,
        }
    }

    pub fn add_acceptor(&mut self, acceptor: Acceptor<SA>) {
        let id = acceptor.identity().to_string();
        if self.acceptors.insert(id.clone(), acceptor).is_none() {
            self.acceptor_ids.push(id);
        }
    }

    pub fn add_proposer(&mut self, proposer: Proposer<SP>) {
        let id = proposer.identity().to_string();
        self.proposers.insert(
            id,
            Driven {
                proposer,
                last_prepare: None,
                last_progress: 0,
                restart_at: None,
                resends: 0,
                rounds: 0,
            },
        );
    }

    /// Shared learner handed to proposers built by [`in_memory`] and
    /// [`on_disk`].
    pub fn learner(&self) -> &RecordingLearner {
        &self.learner
    }

    pub fn acceptor(&self, id: &str) -> Option<&Acceptor<SA>> {
        self.acceptors.get(id)
    }

    pub fn proposer(&self, id: &str) -> Option<&Proposer<SP>> {
        self.proposers.get(id).map(|d| &d.proposer)
    }

    /// Run until every proposer has decided or `max_steps` messages have
    /// been processed.
    pub fn run(&mut self, max_steps: usize) -> Result<Report, PaxosError> {
        let ids: Vec<String> = self.proposers.keys().cloned().collect();
        for id in &ids {
            if self.needs_round(id) {
                self.start_round(id)?;
            }
        }

        let limit = self.step + max_steps;
        while self.step < limit && !self.all_decided() {
            self.step += 1;
            self.fire_timers(&ids)?;
            match self.network.deliver_next() {
                Some(envelope) => self.deliver(envelope)?,
                None => self.kick_idle(&ids)?,
            }
        }

        Ok(self.report())
    }

    pub fn report(&self) -> Report {
        Report {
            decisions: self
                .proposers
                .iter()
                .map(|(id, d)| (id.clone(), d.proposer.chosen_value().map(str::to_string)))
                .collect(),
            rounds: self
                .proposers
                .iter()
                .map(|(id, d)| (id.clone(), d.rounds))
                .collect(),
            steps: self.step,
            network: self.network.stats(),
        }
    }

    fn all_decided(&self) -> bool {
        self.proposers
            .values()
            .all(|d| d.proposer.state() == ProposerState::Decided)
    }

    fn needs_round(&self, id: &str) -> bool {
        self.proposers
            .get(id)
            .map(|d| d.proposer.state() != ProposerState::Decided)
            .unwrap_or(false)
    }

    fn start_round(&mut self, id: &str) -> Result<(), PaxosError> {
        let Some(driven) = self.proposers.get_mut(id) else {
            return Ok(());
        };
        let prepare = driven.proposer.get_prepare_message()?;
        driven.begin_round(self.step, prepare.clone());
        self.network.broadcast(id, &self.acceptor_ids, prepare.into());
        Ok(())
    }

    /// Re-broadcast the message of the phase the proposer is stuck in, or
    /// give the round up after too many attempts.
    fn retry(&mut self, id: &str) -> Result<(), PaxosError> {
        let Some(driven) = self.proposers.get_mut(id) else {
            return Ok(());
        };
        if driven.resends >= self.retry.max_resends {
            info!("Driver: {} giving up round after {} resends", id, driven.resends);
            return self.start_round(id);
        }
        driven.resends += 1;
        driven.last_progress = self.step;

        match driven.proposer.state() {
            ProposerState::Preparing | ProposerState::AwaitingPromises => {
                if let Some(prepare) = driven.last_prepare.clone() {
                    self.network.broadcast(id, &self.acceptor_ids, prepare.into());
                    return Ok(());
                }
                self.start_round(id)
            }
            ProposerState::Accepting | ProposerState::AwaitingAccepted => {
                let accept = driven.proposer.get_accept_message()?;
                self.network.broadcast(id, &self.acceptor_ids, accept.into());
                Ok(())
            }
            ProposerState::Decided => Ok(()),
            ProposerState::New | ProposerState::ValueSet | ProposerState::Rejected => {
                self.start_round(id)
            }
        }
    }

    fn fire_timers(&mut self, ids: &[String]) -> Result<(), PaxosError> {
        for id in ids {
            let Some(driven) = self.proposers.get(id) else {
                continue;
            };
            if driven.proposer.state() == ProposerState::Decided {
                continue;
            }
            let stalled = self.step - driven.last_progress >= self.retry.stall_steps;
            let restart_at = driven.restart_at;
            match restart_at {
                Some(at) if at <= self.step => self.start_round(id)?,
                Some(_) => {}
                None if stalled => self.retry(id)?,
                None => {}
            }
        }
        Ok(())
    }

    /// Nothing is in flight: every undecided proposer is waiting on replies
    /// that will never come.
    fn kick_idle(&mut self, ids: &[String]) -> Result<(), PaxosError> {
        for id in ids {
            let Some(driven) = self.proposers.get(id) else {
                continue;
            };
            if driven.proposer.state() == ProposerState::Decided {
                continue;
            }
            if driven.restart_at.is_some() {
                self.start_round(id)?;
            } else {
                self.retry(id)?;
            }
        }
        Ok(())
    }

    fn deliver(&mut self, envelope: Envelope) -> Result<(), PaxosError> {
        let Envelope { from, to, msg } = envelope;

        if let Some(acceptor) = self.acceptors.get_mut(&to) {
            match acceptor.handle_message(msg) {
                Ok(Response::Reply(reply)) => self.network.send(&to, &from, reply),
                Ok(_) => {}
                Err(
                    e @ (PaxosError::PersistenceFailure { .. }
                    | PaxosError::InstanceFailed { .. }),
                ) => {
                    // The request is lost, as if the acceptor had crashed
                    // before answering.
                    warn!("Driver: {}", e);
                    acceptor.restore()?;
                }
                Err(e) => return Err(e),
            }
            return Ok(());
        }

        let step = self.step;
        let Some(driven) = self.proposers.get_mut(&to) else {
            warn!("Driver: message for unknown node {} dropped", to);
            return Ok(());
        };
        match driven.proposer.handle_message(msg)? {
            Response::Promises(PhaseProgress::QuorumReached)
                if driven.proposer.state() == ProposerState::Accepting =>
            {
                let accept = driven.proposer.get_accept_message()?;
                driven.last_progress = step;
                driven.resends = 0;
                self.network.broadcast(&to, &self.acceptor_ids, accept.into());
            }
            Response::Promises(PhaseProgress::Waiting { .. })
            | Response::Round(RoundOutcome::Waiting { .. }) => {
                driven.last_progress = step;
            }
            Response::Round(RoundOutcome::Decided(value)) => {
                info!(
                    "Driver: {} decided '{}' after {} round(s)",
                    to, value, driven.rounds
                );
            }
            Response::Round(RoundOutcome::Preempted { observed }) => {
                let backoff = self.rng.random_range(0..=self.retry.max_backoff_steps);
                info!(
                    "Driver: {} preempted by {}, retrying in {} steps",
                    to, observed, backoff
                );
                driven.restart_at = Some(step + backoff);
            }
            _ => {}
        }
        Ok(())
    }
}

fn network_for(config: &SimulationConfig) -> SimNetwork {
    SimNetwork::new(
        config.seed,
        Faults {
            drop_probability: config.drop_probability,
            duplicate_probability: config.duplicate_probability,
        },
    )
}

fn retry_for(config: &SimulationConfig) -> RetryPolicy {
    RetryPolicy {
        stall_steps: config.stall_steps,
        ..RetryPolicy::default()
    }
}

/// A cluster whose state lives in memory only.
pub fn in_memory(
    config: &SimulationConfig,
) -> Result<Cluster<MemoryStore<AcceptorRecord>, MemoryStore<ProposerRecord>>, PaxosError> {
    let mut cluster = Cluster::new(network_for(config), config.seed, retry_for(config));
    for id in config.acceptor_ids() {
        cluster.add_acceptor(Acceptor::new(id, MemoryStore::new()));
    }
    for spec in &config.proposers {
        let mut proposer = Proposer::new(spec.id.clone(), config.acceptors, MemoryStore::new())?
            .with_learner(cluster.learner().clone());
        proposer.propose_value(spec.value.clone())?;
        cluster.add_proposer(proposer);
    }
    Ok(cluster)
}

/// A cluster backed by files under `dir`. Roles resume from whatever an
/// earlier run left there.
pub fn on_disk(
    config: &SimulationConfig,
    dir: &Path,
) -> Result<Cluster<FileStore<AcceptorRecord>, FileStore<ProposerRecord>>, PaxosError> {
    let mut cluster = Cluster::new(network_for(config), config.seed, retry_for(config));
    for id in config.acceptor_ids() {
        let store = open_store(&dir.join("acceptors"), &id)?;
        cluster.add_acceptor(Acceptor::recover(id, store)?);
    }
    for spec in &config.proposers {
        let store = open_store(&dir.join("proposers"), &spec.id)?;
        let mut proposer = Proposer::recover(spec.id.clone(), config.acceptors, store)?
            .with_learner(cluster.learner().clone());
        proposer.propose_value(spec.value.clone())?;
        cluster.add_proposer(proposer);
    }
    Ok(cluster)
}

fn open_store<R>(dir: &Path, id: &str) -> Result<FileStore<R>, PaxosError> {
    FileStore::open(dir, id).map_err(|source| PaxosError::PersistenceFailure {
        identity: id.to_string(),
        source,
    })
}
