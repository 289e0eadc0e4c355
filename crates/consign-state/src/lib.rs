//! Persistence for batch entries and transmission receipts.
//!
//! Every shipment queued for offline sending becomes a [`BatchEntry`] in
//! `entries.json`. Entries are never deleted; the only mutation is the
//! `draft -> done` transition applied by [`EntryStore::commit_done`], which
//! rewrites the whole file once (temp file then rename) so a batch is either
//! entirely committed or untouched.
//!
//! ```
//! use consign_state::{EntryStore, MemoryEntryStore};
//!
//! let store = MemoryEntryStore::new();
//! let batch = store.draft_batch("seur-main").expect("batch");
//! assert!(batch.is_empty());
//! ```

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use consign_types::{BatchEntry, EntryState, TransmissionReceipt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const ENTRIES_FILE: &str = "entries.json";
pub const RECEIPTS_FILE: &str = "receipts.jsonl";

/// Schema tag written into `entries.json`.
pub const ENTRIES_SCHEMA: &str = "consign.entries.v1";

/// Length of a batch id in hex characters.
const BATCH_ID_LEN: usize = 16;

pub fn entries_path(state_dir: &Path) -> PathBuf {
    state_dir.join(ENTRIES_FILE)
}

pub fn receipts_path(state_dir: &Path) -> PathBuf {
    state_dir.join(RECEIPTS_FILE)
}

/// Deterministic id for a set of entries: truncated SHA-256 over their ids.
pub fn batch_id<'a>(entry_ids: impl IntoIterator<Item = &'a str>) -> String {
    let mut hasher = Sha256::new();
    for id in entry_ids {
        hasher.update(id.as_bytes());
        hasher.update(b"\n");
    }
    let mut id = hex::encode(hasher.finalize());
    id.truncate(BATCH_ID_LEN);
    id
}

/// Draft entries of one account, transmitted together.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub account: String,
    pub batch_id: String,
    pub entries: Vec<BatchEntry>,
}

impl Batch {
    pub fn new(account: &str, entries: Vec<BatchEntry>) -> Self {
        Self {
            account: account.to_string(),
            batch_id: batch_id(entries.iter().map(|e| e.id.as_str())),
            entries,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entry_ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.id.clone()).collect()
    }
}

/// Storage for batch entries.
pub trait EntryStore: Send + Sync {
    /// Every stored entry, in insertion order.
    fn entries(&self) -> Result<Vec<BatchEntry>>;

    /// Store new entries. Ids and (account, shipment) pairs must be new.
    fn append(&self, entries: &[BatchEntry]) -> Result<()>;

    /// Mark the given draft entries of `account` as done in a single write.
    ///
    /// Fails without changing anything if any id is unknown, belongs to
    /// another account or is no longer a draft.
    fn commit_done(&self, account: &str, ids: &[String]) -> Result<usize>;

    /// Where the entries live, for messages.
    fn location(&self) -> String;

    /// Current draft entries of `account` as a batch.
    fn draft_batch(&self, account: &str) -> Result<Batch> {
        let drafts = self
            .entries()?
            .into_iter()
            .filter(|e| e.account == account && e.is_draft())
            .collect();
        Ok(Batch::new(account, drafts))
    }
}

/// One entry per id, and one entry per shipment of an account.
fn check_new_entries(existing: &[BatchEntry], new: &[BatchEntry]) -> Result<()> {
    let mut ids: HashSet<&str> = existing.iter().map(|e| e.id.as_str()).collect();
    let mut shipments: HashSet<(&str, &str)> = existing
        .iter()
        .map(|e| (e.account.as_str(), e.shipment.as_str()))
        .collect();
    for entry in new {
        if !ids.insert(entry.id.as_str()) {
            bail!("batch entry {} already exists", entry.id);
        }
        if !shipments.insert((entry.account.as_str(), entry.shipment.as_str())) {
            bail!(
                "shipment {} already has a batch entry for account {}",
                entry.shipment,
                entry.account
            );
        }
    }
    Ok(())
}

/// Validates every id before touching any entry.
fn mark_done(entries: &mut [BatchEntry], account: &str, ids: &[String]) -> Result<usize> {
    for id in ids {
        match entries.iter().find(|e| &e.id == id) {
            None => bail!("batch entry {id} not found"),
            Some(e) if e.account != account => {
                bail!("batch entry {id} belongs to account {}", e.account)
            }
            Some(e) if !e.is_draft() => bail!("batch entry {id} is already {}", e.state),
            Some(_) => {}
        }
    }

    let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
    let now = Utc::now();
    let mut changed = 0;
    for entry in entries.iter_mut().filter(|e| wanted.contains(e.id.as_str())) {
        entry.state = EntryState::Done;
        entry.updated_at = now;
        changed += 1;
    }
    Ok(changed)
}

/// Entries kept in memory.
#[derive(Debug, Default)]
pub struct MemoryEntryStore {
    entries: Mutex<Vec<BatchEntry>>,
}

impl MemoryEntryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EntryStore for MemoryEntryStore {
    fn entries(&self) -> Result<Vec<BatchEntry>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("entry store lock poisoned"))?;
        Ok(entries.clone())
    }

    fn append(&self, new: &[BatchEntry]) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("entry store lock poisoned"))?;
        check_new_entries(&entries, new)?;
        entries.extend_from_slice(new);
        Ok(())
    }

    fn commit_done(&self, account: &str, ids: &[String]) -> Result<usize> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("entry store lock poisoned"))?;
        mark_done(&mut entries, account, ids)
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}

/// On-disk layout of `entries.json`.
#[derive(Debug, Serialize, Deserialize)]
struct EntriesFile {
    schema_version: String,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    entries: Vec<BatchEntry>,
}

/// Parse the contents of an entries file.
pub fn parse_entries(content: &str) -> Result<Vec<BatchEntry>> {
    let file: EntriesFile =
        serde_json::from_str(content).context("failed to parse entries JSON")?;
    if file.schema_version != ENTRIES_SCHEMA {
        bail!(
            "unsupported entries schema {} (expected {})",
            file.schema_version,
            ENTRIES_SCHEMA
        );
    }
    Ok(file.entries)
}

/// Entries persisted as one JSON document.
#[derive(Debug)]
pub struct FileEntryStore {
    path: PathBuf,
    local: Mutex<()>,
}

impl FileEntryStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: entries_path(state_dir),
            local: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Vec<BatchEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read entries file {}", self.path.display()))?;
        parse_entries(&content)
            .with_context(|| format!("failed to load entries from {}", self.path.display()))
    }

    fn save(&self, entries: Vec<BatchEntry>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create state dir {}", parent.display()))?;
        }

        let file = EntriesFile {
            schema_version: ENTRIES_SCHEMA.to_string(),
            updated_at: Utc::now(),
            entries,
        };
        let json =
            serde_json::to_string_pretty(&file).context("failed to serialize entries to JSON")?;

        let tmp_path = self.path.with_extension("tmp");
        {
            let mut tmp = fs::File::create(&tmp_path)
                .with_context(|| format!("failed to create {}", tmp_path.display()))?;
            tmp.write_all(json.as_bytes())
                .with_context(|| format!("failed to write {}", tmp_path.display()))?;
            tmp.sync_all().context("failed to sync entries file")?;
        }
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to rename entries file to {}", self.path.display()))
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.local
            .lock()
            .map_err(|_| anyhow::anyhow!("entry store lock poisoned"))
    }
}

impl EntryStore for FileEntryStore {
    fn entries(&self) -> Result<Vec<BatchEntry>> {
        let _guard = self.guard()?;
        self.load()
    }

    fn append(&self, new: &[BatchEntry]) -> Result<()> {
        if new.is_empty() {
            return Ok(());
        }
        let _guard = self.guard()?;
        let mut entries = self.load()?;
        check_new_entries(&entries, new)?;
        entries.extend_from_slice(new);
        self.save(entries)
    }

    fn commit_done(&self, account: &str, ids: &[String]) -> Result<usize> {
        let _guard = self.guard()?;
        let mut entries = self.load()?;
        let changed = mark_done(&mut entries, account, ids)?;
        self.save(entries)?;
        Ok(changed)
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

/// Append a receipt to `receipts.jsonl`.
pub fn append_receipt(state_dir: &Path, receipt: &TransmissionReceipt) -> Result<()> {
    let path = receipts_path(state_dir);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create state dir {}", parent.display()))?;
    }

    let line = serde_json::to_string(receipt).context("failed to serialize receipt to JSON")?;

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open receipts file {}", path.display()))?;

    writeln!(file, "{}", line)
        .with_context(|| format!("failed to write receipt to {}", path.display()))?;

    Ok(())
}

/// Read every receipt, oldest first.
pub fn read_receipts(state_dir: &Path) -> Result<Vec<TransmissionReceipt>> {
    let path = receipts_path(state_dir);
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = fs::File::open(&path)
        .with_context(|| format!("failed to open receipts file {}", path.display()))?;

    let mut receipts = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.with_context(|| format!("failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        receipts.push(
            serde_json::from_str(&line)
                .with_context(|| format!("failed to parse receipt in {}", path.display()))?,
        );
    }
    Ok(receipts)
}
