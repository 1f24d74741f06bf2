use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::network::{Envelope, Transport};
use crate::paxos::messages::PaxosMessage;

/// Fault rates applied to every message handed to the network.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Faults {
    pub drop_probability: f64,
    pub duplicate_probability: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetworkStats {
    pub sent: usize,
    pub dropped: usize,
    pub duplicated: usize,
    pub delivered: usize,
}

/// Deterministic in-memory network.
///
/// Messages wait in a pool and [`SimNetwork::deliver_next`] picks one at
/// random, so delivery order is arbitrary. Each send may also be dropped or
/// delivered twice. The same seed always yields the same schedule.
pub struct SimNetwork {
    rng: StdRng,
    faults: Faults,
    in_flight: Vec<Envelope>,
    stats: NetworkStats,
}

impl SimNetwork {
    pub fn new(seed: u64, faults: Faults) -> Self {
        SimNetwork {
            rng: StdRng::seed_from_u64(seed),
            faults: Faults {
                drop_probability: faults.drop_probability.clamp(0.0, 1.0),
                duplicate_probability: faults.duplicate_probability.clamp(0.0, 1.0),
            },
            in_flight: Vec::new(),
            stats: NetworkStats::default(),
        }
    }

    /// Reorders, but never drops or duplicates.
    pub fn reliable(seed: u64) -> Self {
        Self::new(seed, Faults::default())
    }

    /// Remove and return a random message from the pool.
    pub fn deliver_next(&mut self) -> Option<Envelope> {
        if self.in_flight.is_empty() {
            return None;
        }
        let idx = self.rng.random_range(0..self.in_flight.len());
        let envelope = self.in_flight.swap_remove(idx);
        self.stats.delivered += 1;
        Some(envelope)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn stats(&self) -> NetworkStats {
        self.stats
    }
}

impl Transport for SimNetwork {
    fn send(&mut self, from: &str, to: &str, msg: PaxosMessage) {
        self.stats.sent += 1;
        if self.rng.random_bool(self.faults.drop_probability) {
            debug!("Network: dropped {} from {} to {}", msg.kind(), from, to);
            self.stats.dropped += 1;
            return;
        }
        let envelope = Envelope {
            from: from.to_string(),
            to: to.to_string(),
            msg,
        };
        if self.rng.random_bool(self.faults.duplicate_probability) {
            debug!(
                "Network: duplicated {} from {} to {}",
                envelope.msg.kind(),
                from,
                to
            );
            self.stats.duplicated += 1;
            self.in_flight.push(envelope.clone());
        }
        self.in_flight.push(envelope);
    }
}
