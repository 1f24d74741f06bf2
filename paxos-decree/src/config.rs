//! Simulation settings, read from a YAML document such as:
//!
//! ```yaml
//! acceptors: 5
//! proposers:
//!   - id: proposer-1
//!     value: foo
//!   - id: proposer-2
//!     value: bar
//! seed: 7
//! drop_probability: 0.1
//! duplicate_probability: 0.1
//! max_steps: 100000
//! stall_steps: 200
//! state_dir: state
//! ```
//!
//! Every key is optional.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use yaml_rust::{Yaml, YamlLoader};

use crate::paxos::quorum::MIN_ACCEPTORS;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Yaml(#[from] yaml_rust::ScanError),

    #[error("invalid `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposerSpec {
    pub id: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationConfig {
    pub acceptors: usize,
    pub proposers: Vec<ProposerSpec>,
    pub seed: u64,
    pub drop_probability: f64,
    pub duplicate_probability: f64,
    pub max_steps: usize,
    /// Steps without progress before a proposer re-sends or restarts.
    pub stall_steps: usize,
    /// Use file-backed storage under this directory instead of memory.
    pub state_dir: Option<PathBuf>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            acceptors: 3,
            proposers: vec![
                ProposerSpec {
                    id: "proposer-1".into(),
                    value: "foo".into(),
                },
                ProposerSpec {
                    id: "proposer-2".into(),
                    value: "bar".into(),
                },
            ],
            seed: 0,
            drop_probability: 0.0,
            duplicate_probability: 0.0,
            max_steps: 100_000,
            stall_steps: 200,
            state_dir: None,
        }
    }
}

impl SimulationConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let s = fs::read_to_string(&path)?;
        Self::from_yaml_str(&s)
    }

    pub fn from_yaml_str(s: &str) -> Result<Self, ConfigError> {
        let docs = YamlLoader::load_from_str(s)?;
        let mut config = SimulationConfig::default();
        let Some(doc) = docs.first() else {
            return Ok(config);
        };

        if let Some(n) = integer(doc, "acceptors")? {
            config.acceptors = to_usize("acceptors", n)?;
        }
        if let Some(n) = integer(doc, "seed")? {
            config.seed = u64::try_from(n).map_err(|_| ConfigError::Invalid {
                field: "seed",
                reason: format!("{} is negative", n),
            })?;
        }
        if let Some(p) = real(doc, "drop_probability")? {
            config.drop_probability = p;
        }
        if let Some(p) = real(doc, "duplicate_probability")? {
            config.duplicate_probability = p;
        }
        if let Some(n) = integer(doc, "max_steps")? {
            config.max_steps = to_usize("max_steps", n)?;
        }
        if let Some(n) = integer(doc, "stall_steps")? {
            config.stall_steps = to_usize("stall_steps", n)?;
        }
        match &doc["state_dir"] {
            Yaml::BadValue | Yaml::Null => {}
            Yaml::String(dir) => config.state_dir = Some(PathBuf::from(dir)),
            other => {
                return Err(ConfigError::Invalid {
                    field: "state_dir",
                    reason: format!("expected a path, got {:?}", other),
                })
            }
        }
        match &doc["proposers"] {
            Yaml::BadValue | Yaml::Null => {}
            Yaml::Array(entries) => {
                config.proposers = entries
                    .iter()
                    .map(proposer_spec)
                    .collect::<Result<Vec<_>, _>>()?;
            }
            other => {
                return Err(ConfigError::Invalid {
                    field: "proposers",
                    reason: format!("expected a list, got {:?}", other),
                })
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.acceptors < MIN_ACCEPTORS {
            return Err(ConfigError::Invalid {
                field: "acceptors",
                reason: format!("{} is below the minimum of {}", self.acceptors, MIN_ACCEPTORS),
            });
        }
        if self.proposers.is_empty() {
            return Err(ConfigError::Invalid {
                field: "proposers",
                reason: "at least one proposer is required".into(),
            });
        }
        for (i, p) in self.proposers.iter().enumerate() {
            if self.proposers[..i].iter().any(|q| q.id == p.id) {
                return Err(ConfigError::Invalid {
                    field: "proposers",
                    reason: format!("duplicate proposer id '{}'", p.id),
                });
            }
        }
        for (field, p) in [
            ("drop_probability", self.drop_probability),
            ("duplicate_probability", self.duplicate_probability),
        ] {
            if !(0.0..1.0).contains(&p) {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("{} is outside [0, 1)", p),
                });
            }
        }
        if self.stall_steps == 0 {
            return Err(ConfigError::Invalid {
                field: "stall_steps",
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }

    pub fn acceptor_ids(&self) -> Vec<String> {
        (1..=self.acceptors)
            .map(|i| format!("acceptor-{}", i))
            .collect()
    }
}

fn integer(doc: &Yaml, field: &'static str) -> Result<Option<i64>, ConfigError> {
    match &doc[field] {
        Yaml::BadValue | Yaml::Null => Ok(None),
        Yaml::Integer(n) => Ok(Some(*n)),
        other => Err(ConfigError::Invalid {
            field,
            reason: format!("expected an integer, got {:?}", other),
        }),
    }
}

fn real(doc: &Yaml, field: &'static str) -> Result<Option<f64>, ConfigError> {
    match &doc[field] {
        Yaml::BadValue | Yaml::Null => Ok(None),
        Yaml::Integer(n) => Ok(Some(*n as f64)),
        Yaml::Real(_) => doc[field].as_f64().map(Some).ok_or_else(|| ConfigError::Invalid {
            field,
            reason: "not a number".into(),
        }),
        other => Err(ConfigError::Invalid {
            field,
            reason: format!("expected a number, got {:?}", other),
        }),
    }
}

fn to_usize(field: &'static str, n: i64) -> Result<usize, ConfigError> {
    usize::try_from(n).map_err(|_| ConfigError::Invalid {
        field,
        reason: format!("{} is negative", n),
    })
}

fn proposer_spec(entry: &Yaml) -> Result<ProposerSpec, ConfigError> {
    let id = entry["id"].as_str().ok_or_else(|| ConfigError::Invalid {
        field: "proposers",
        reason: "every proposer needs a string `id`".into(),
    })?;
    let value = match &entry["value"] {
        Yaml::String(s) => s.clone(),
        Yaml::Integer(n) => n.to_string(),
        _ => {
            return Err(ConfigError::Invalid {
                field: "proposers",
                reason: format!("proposer '{}' needs a `value`", id),
            })
        }
    };
    Ok(ProposerSpec {
        id: id.to_string(),
        value,
    })
}
