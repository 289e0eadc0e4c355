//! Shared monotonic counters.
//!
//! Every package that receives a carrier reference first draws a fresh value
//! from a [`SequenceCounter`]. Uniqueness over time lives here, not in the
//! allocator: two concurrent callers must never observe the same value, and a
//! counter never goes backwards, even across restarts.
//!
//! - [`MemorySequence`] keeps counters behind a mutex; values are lost when the
//!   process exits.
//! - [`FileSequence`] persists counters to a JSON file and serializes
//!   read-modify-write cycles across processes with a lock file.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use consign_lock::LockFile;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default sequence used for carrier references.
pub const DEFAULT_SEQUENCE_ID: &str = "carrier.reference";

/// Default counter file name inside a state directory.
pub const SEQUENCE_FILE: &str = "sequence.json";

/// Lock guarding the counter file.
pub const SEQUENCE_LOCK_FILE: &str = "sequence.lock";

#[derive(Debug, Error)]
pub enum SequenceError {
    #[error("sequence {0} overflowed")]
    Overflow(String),

    #[error("sequence lock poisoned")]
    Poisoned,

    #[error("sequence storage failed: {0}")]
    Storage(String),
}

/// Source of strictly increasing values, keyed by sequence id.
///
/// Values are not necessarily contiguous.
pub trait SequenceCounter: Send + Sync {
    /// Atomically advance `sequence_id` and return the new value.
    fn next(&self, sequence_id: &str) -> Result<u64, SequenceError>;

    /// Last value handed out for `sequence_id` (0 when never used).
    fn current(&self, sequence_id: &str) -> Result<u64, SequenceError>;
}

/// In-process counters guarded by a mutex.
#[derive(Debug, Default)]
pub struct MemorySequence {
    values: Mutex<BTreeMap<String, u64>>,
}

impl MemorySequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter whose first `next()` returns `value + 1`.
    pub fn starting_from(sequence_id: &str, value: u64) -> Self {
        let mut values = BTreeMap::new();
        values.insert(sequence_id.to_string(), value);
        Self {
            values: Mutex::new(values),
        }
    }
}

impl SequenceCounter for MemorySequence {
    fn next(&self, sequence_id: &str) -> Result<u64, SequenceError> {
        let mut values = self.values.lock().map_err(|_| SequenceError::Poisoned)?;
        advance(&mut values, sequence_id)
    }

    fn current(&self, sequence_id: &str) -> Result<u64, SequenceError> {
        let values = self.values.lock().map_err(|_| SequenceError::Poisoned)?;
        Ok(values.get(sequence_id).copied().unwrap_or_default())
    }
}

fn advance(values: &mut BTreeMap<String, u64>, sequence_id: &str) -> Result<u64, SequenceError> {
    let slot = values.entry(sequence_id.to_string()).or_default();
    *slot = slot
        .checked_add(1)
        .ok_or_else(|| SequenceError::Overflow(sequence_id.to_string()))?;
    Ok(*slot)
}

/// On-disk layout of the counter file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SequenceFileData {
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    sequences: BTreeMap<String, u64>,
}

/// Durable counters stored in a JSON file.
#[derive(Debug)]
pub struct FileSequence {
    path: PathBuf,
    lock_path: PathBuf,
    lock_wait: Duration,
    stale_after: Duration,
    local: Mutex<()>,
}

impl FileSequence {
    /// Counter file inside a state directory.
    pub fn new(state_dir: &Path) -> Self {
        Self::at(state_dir.join(SEQUENCE_FILE))
    }

    /// Counter file at an explicit path; the lock sits next to it.
    pub fn at(path: PathBuf) -> Self {
        let lock_path = path.with_file_name(SEQUENCE_LOCK_FILE);
        Self {
            path,
            lock_path,
            lock_wait: Duration::from_secs(10),
            stale_after: Duration::from_secs(60),
            local: Mutex::new(()),
        }
    }

    /// How long `next` waits for another process to release the counter.
    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<SequenceFileData, SequenceError> {
        if !self.path.exists() {
            return Ok(SequenceFileData::default());
        }
        let content = fs::read_to_string(&self.path).map_err(|e| {
            SequenceError::Storage(format!("failed to read {}: {e}", self.path.display()))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            SequenceError::Storage(format!("failed to parse {}: {e}", self.path.display()))
        })
    }

    fn write(&self, data: &SequenceFileData) -> Result<(), SequenceError> {
        let storage = |what: &str, e: std::io::Error| {
            SequenceError::Storage(format!("failed to {what} {}: {e}", self.path.display()))
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| storage("create dir for", e))?;
        }

        let json = serde_json::to_string_pretty(data)
            .map_err(|e| SequenceError::Storage(format!("failed to serialize counters: {e}")))?;

        let tmp_path = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp_path).map_err(|e| storage("create tmp for", e))?;
            file.write_all(json.as_bytes())
                .map_err(|e| storage("write tmp for", e))?;
            file.sync_all().map_err(|e| storage("sync tmp for", e))?;
        }
        fs::rename(&tmp_path, &self.path).map_err(|e| storage("rename tmp to", e))
    }
}

impl SequenceCounter for FileSequence {
    fn next(&self, sequence_id: &str) -> Result<u64, SequenceError> {
        let _local = self.local.lock().map_err(|_| SequenceError::Poisoned)?;
        let _lock = LockFile::acquire_waiting(&self.lock_path, self.lock_wait, self.stale_after)
            .map_err(|e| SequenceError::Storage(format!("{e:#}")))?;

        let mut data = self.read()?;
        let value = advance(&mut data.sequences, sequence_id)?;
        data.updated_at = Some(Utc::now());
        self.write(&data)?;
        Ok(value)
    }

    fn current(&self, sequence_id: &str) -> Result<u64, SequenceError> {
        let data = self.read()?;
        Ok(data.sequences.get(sequence_id).copied().unwrap_or_default())
    }
}
