//! Durable state for the protocol roles.
//!
//! An acceptor persists its promise floor and its accepted pair; a proposer
//! persists the highest round it has used. Every handler writes through a
//! [`Persistence`] implementation before it produces a reply, so a restarted
//! process can resume from [`Persistence::load`] without breaking a promise it
//! already made.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use bincode::config::Configuration;
use log::debug;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::paxos::messages::AcceptedProposal;
use crate::paxos::proposal::ProposalNumber;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode record: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("failed to decode record: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("record for {identity} carries an incomplete accepted pair")]
    IncompleteRecord { identity: String },
}

/// On-disk shape of an acceptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptorRecord {
    pub identity: String,
    pub min_proposal_number: ProposalNumber,
    pub accepted_proposal_number: Option<ProposalNumber>,
    pub accepted_value: Option<String>,
}

impl AcceptorRecord {
    /// The accepted pair. A record holding only half of it is refused rather
    /// than read as "nothing accepted".
    pub fn accepted(&self) -> Result<Option<AcceptedProposal>, StorageError> {
        match (&self.accepted_proposal_number, &self.accepted_value) {
            (Some(n), Some(v)) => Ok(Some(AcceptedProposal {
                proposal_number: n.clone(),
                value: v.clone(),
            })),
            (None, None) => Ok(None),
            _ => Err(StorageError::IncompleteRecord {
                identity: self.identity.clone(),
            }),
        }
    }
}

/// On-disk shape of a proposer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposerRecord {
    pub identity: String,
    pub max_round_number: i64,
}

/// Durable storage for a single record.
pub trait Persistence<R> {
    /// Replace the stored record. Must not return `Ok` until the record
    /// would survive a crash.
    fn durable_write(&mut self, record: &R) -> Result<(), StorageError>;

    /// The last record written, if any.
    fn load(&self) -> Result<Option<R>, StorageError>;
}

struct MemoryCell<R> {
    record: Option<R>,
    writes: usize,
    failing: bool,
}

/// In-memory storage.
///
/// Clones share the same cell, so a test can keep a handle, drop the role
/// ("crash") and recover a fresh instance from the surviving record.
pub struct MemoryStore<R> {
    cell: Arc<Mutex<MemoryCell<R>>>,
}

impl<R> Clone for MemoryStore<R> {
    fn clone(&self) -> Self {
        MemoryStore {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<R> Default for MemoryStore<R> {
    fn default() -> Self {
        MemoryStore {
            cell: Arc::new(Mutex::new(MemoryCell {
                record: None,
                writes: 0,
                failing: false,
            })),
        }
    }
}

impl<R: Clone> MemoryStore<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following write fail until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.lock().failing = failing;
    }

    pub fn snapshot(&self) -> Option<R> {
        self.lock().record.clone()
    }

    /// Number of successful writes.
    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    fn lock(&self) -> MutexGuard<'_, MemoryCell<R>> {
        self.cell.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<R: Clone> Persistence<R> for MemoryStore<R> {
    fn durable_write(&mut self, record: &R) -> Result<(), StorageError> {
        let mut cell = self.lock();
        if cell.failing {
            return Err(StorageError::Unavailable("injected write failure".into()));
        }
        cell.record = Some(record.clone());
        cell.writes += 1;
        Ok(())
    }

    fn load(&self) -> Result<Option<R>, StorageError> {
        let cell = self.lock();
        if cell.failing {
            return Err(StorageError::Unavailable("injected read failure".into()));
        }
        Ok(cell.record.clone())
    }
}

/// File-backed storage: one bincode-encoded record per key.
///
/// Writes go to a temporary file which is fsynced and atomically renamed over
/// the previous record, so a crash leaves either the old or the new record.
pub struct FileStore<R> {
    dir: PathBuf,
    path: PathBuf,
    bincode_config: Configuration,
    _record: PhantomData<fn() -> R>,
}

impl<R> FileStore<R> {
    /// Open (creating if needed) the store for `key` under `dir`.
    pub fn open(dir: impl AsRef<Path>, key: &str) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}.bin", key));
        Ok(FileStore {
            dir,
            path,
            bincode_config: bincode::config::standard(),
            _record: PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<R> Persistence<R> for FileStore<R>
where
    R: Serialize + DeserializeOwned,
{
    fn durable_write(&mut self, record: &R) -> Result<(), StorageError> {
        let blob = bincode::serde::encode_to_vec(record, self.bincode_config)?;
        let tmp = self.path.with_extension("bin.tmp");
        {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            f.write_all(&blob)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        // Directory handles cannot be opened on every platform.
        if let Ok(dir) = File::open(&self.dir) {
            dir.sync_all()?;
        }
        debug!(
            "Storage: wrote {} bytes to '{}'",
            blob.len(),
            self.path.display()
        );
        Ok(())
    }

    fn load(&self) -> Result<Option<R>, StorageError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let blob = fs::read(&self.path)?;
        let (record, _) = bincode::serde::decode_from_slice(&blob, self.bincode_config)?;
        Ok(Some(record))
    }
}
