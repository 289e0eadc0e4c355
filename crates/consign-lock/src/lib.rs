//! Lock files that keep consign jobs and counters exclusive.
//!
//! A lock is a small JSON file created with `create_new`, so exactly one
//! process wins the race. It records the holder (PID, hostname, timestamp and
//! an optional job label) and is removed when the [`LockFile`] is dropped.
//!
//! Two locks are used in a state directory: `lock`, held for the duration of
//! an assemble or send job, and `sequence.lock`, held around each counter
//! read-modify-write.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const LOCK_FILE: &str = "lock";

/// Delay between attempts while waiting for a held lock.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Contents of a lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
    /// What the holder is doing (e.g. "send seur-main")
    pub holder: Option<String>,
}

/// A held lock. The file is removed on drop.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    released: bool,
}

impl LockFile {
    /// Take the job lock of `state_dir`, failing at once when it is held.
    pub fn acquire(state_dir: &Path) -> Result<Self> {
        Self::acquire_at(&lock_path(state_dir))
    }

    /// Acquire a lock at an explicit path.
    pub fn acquire_at(lock_path: &Path) -> Result<Self> {
        match Self::try_create(lock_path)? {
            Some(lock) => Ok(lock),
            None => {
                let held = read_info(lock_path)?;
                bail!(
                    "lock already held by pid {} on {} since {} ({})",
                    held.pid,
                    held.hostname,
                    held.acquired_at,
                    held.holder.as_deref().unwrap_or("unlabelled")
                );
            }
        }
    }

    /// Like [`LockFile::acquire`], but first clears a lock older than `stale_after`.
    pub fn acquire_with_timeout(state_dir: &Path, stale_after: Duration) -> Result<Self> {
        let path = lock_path(state_dir);
        remove_if_stale(&path, stale_after)?;
        Self::acquire_at(&path)
    }

    /// Wait up to `wait` for a lock at `lock_path` to become free.
    ///
    /// Locks older than `stale_after` are treated as abandoned and removed.
    pub fn acquire_waiting(lock_path: &Path, wait: Duration, stale_after: Duration) -> Result<Self> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(lock) = Self::try_create(lock_path)? {
                return Ok(lock);
            }
            remove_if_stale(lock_path, stale_after)?;
            if Instant::now() >= deadline {
                bail!(
                    "timed out after {:?} waiting for lock {}",
                    wait,
                    lock_path.display()
                );
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn try_create(lock_path: &Path) -> Result<Option<Self>> {
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create lock dir {}", parent.display()))?;
        }

        let mut file = match OpenOptions::new().write(true).create_new(true).open(lock_path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to create lock file {}", lock_path.display()));
            }
        };

        let info = LockInfo {
            pid: std::process::id(),
            hostname: gethostname::gethostname().to_string_lossy().into_owned(),
            acquired_at: Utc::now(),
            holder: None,
        };
        file.write_all(&encode_info(&info)?)
            .and_then(|()| file.sync_all())
            .with_context(|| format!("failed to write lock file {}", lock_path.display()))?;

        Ok(Some(Self {
            path: lock_path.to_path_buf(),
            released: false,
        }))
    }

    /// Remove the lock file now rather than at drop.
    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to remove lock file {}", self.path.display()));
            }
        }
        self.released = true;
        Ok(())
    }

    /// Label the lock with the job holding it (e.g. "assemble seur-main").
    pub fn set_holder(&self, holder: &str) -> Result<()> {
        if self.released {
            bail!("lock {} was already released", self.path.display());
        }
        let mut info = read_info(&self.path)?;
        info.holder = Some(holder.to_string());

        let tmp = self.path.with_extension("tmp");
        let mut file = File::create(&tmp)
            .with_context(|| format!("failed to create {}", tmp.display()))?;
        file.write_all(&encode_info(&info)?)
            .and_then(|()| file.sync_all())
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        drop(file);
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace lock file {}", self.path.display()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_locked(state_dir: &Path) -> bool {
        lock_path(state_dir).exists()
    }

    /// Current holder of the job lock in `state_dir`.
    pub fn read_lock_info(state_dir: &Path) -> Result<LockInfo> {
        read_info(&lock_path(state_dir))
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

fn remove_if_stale(path: &Path, stale_after: Duration) -> Result<()> {
    if !is_stale(path, stale_after) {
        return Ok(());
    }

    // Clearing happens under a guard file and the age is checked again there,
    // so a lock another waiter just created is never removed.
    let guard_path = path.with_extension("reap");
    let _guard = match LockFile::try_create(&guard_path)? {
        Some(guard) => guard,
        None if is_stale(&guard_path, stale_after) => {
            let _ = fs::remove_file(&guard_path);
            match LockFile::try_create(&guard_path)? {
                Some(guard) => guard,
                None => return Ok(()),
            }
        }
        None => return Ok(()),
    };

    if is_stale(path, stale_after) {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to remove stale lock {}", path.display()));
            }
        }
    }
    Ok(())
}

fn is_stale(path: &Path, stale_after: Duration) -> bool {
    if !path.exists() {
        return false;
    }
    match read_info(path) {
        Ok(info) => {
            let age = Utc::now().signed_duration_since(info.acquired_at);
            age.num_seconds().unsigned_abs() > stale_after.as_secs()
        }
        // A holder may be between create and write; only clear it once it is old.
        Err(_) => fs::metadata(path)
            .and_then(|m| m.modified())
            .is_ok_and(|modified| modified.elapsed().unwrap_or_default() > stale_after),
    }
}

fn encode_info(info: &LockInfo) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(info).context("failed to serialize lock info")
}

fn read_info(path: &Path) -> Result<LockInfo> {
    let content = fs::read(path)
        .with_context(|| format!("failed to read lock file {}", path.display()))?;
    serde_json::from_slice(&content)
        .with_context(|| format!("lock file {} is not valid JSON", path.display()))
}

/// Job lock path inside a state directory.
pub fn lock_path(state_dir: &Path) -> PathBuf {
    state_dir.join(LOCK_FILE)
}
