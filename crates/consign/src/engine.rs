use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use consign_config::{CarrierAccount, Config};
use consign_events::{ALL_SHIPMENTS, EventLog, events_path};
use consign_lock::{LockFile, LockInfo};
use consign_sequence::FileSequence;
use consign_state::{EntryStore, FileEntryStore, append_receipt, read_receipts};
use consign_types::{BatchEntry, BatchEvent, EventType, Shipment};

use crate::assemble::{BatchAssembler, BatchPlan};
use crate::label::{TextLabelRenderer, write_labels};
use crate::manifest::ManifestTemplate;
use crate::transmit::{ManifestTransmitter, TransmitResult};

/// Directory under the state dir that receives rendered labels.
pub const LABELS_DIR: &str = "labels";

pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub state_dir: PathBuf,
    /// Job locks older than this are removed as stale
    pub lock_timeout: Duration,
    /// How long to wait for the shared counter lock
    pub sequence_lock_wait: Duration,
    /// Render text labels for every queued package
    pub write_labels: bool,
}

impl RuntimeOptions {
    pub fn new(state_dir: PathBuf) -> Self {
        Self {
            state_dir,
            lock_timeout: Duration::from_secs(3600),
            sequence_lock_wait: Duration::from_secs(10),
            write_labels: true,
        }
    }

    /// Options from the `[state]` table, with relative dirs resolved against `base`.
    pub fn from_config(config: &Config, base: &Path) -> Self {
        Self {
            lock_timeout: config.state.lock_timeout,
            ..Self::new(config.state_dir(base))
        }
    }
}

#[derive(Debug, Clone)]
pub struct AssembleReport {
    pub plan: BatchPlan,
    pub label_files: Vec<PathBuf>,
}

/// Allocate references for `shipments` and queue them as draft entries.
pub fn run_assemble(
    account: &CarrierAccount,
    shipments: &[Shipment],
    opts: &RuntimeOptions,
    reporter: &mut dyn Reporter,
) -> Result<AssembleReport> {
    let state_dir = &opts.state_dir;
    let lock = LockFile::acquire_with_timeout(state_dir, opts.lock_timeout)
        .context("failed to acquire job lock")?;
    lock.set_holder(&format!("assemble {}", account.name()))?;

    reporter.info(&format!("state dir: {}", state_dir.display()));

    let mut event_log = EventLog::new();
    let events_file = events_path(state_dir);
    event_log.emit(
        account.name(),
        ALL_SHIPMENTS,
        EventType::AssembleStarted {
            shipment_count: shipments.len(),
        },
    );

    let store = FileEntryStore::new(state_dir);
    let queued = store
        .entries()
        .context("failed to read batch entries")?
        .into_iter()
        .filter(|e| e.account == account.name())
        .map(|e| e.shipment);

    let counter = FileSequence::new(state_dir).with_lock_wait(opts.sequence_lock_wait);
    let assembler = BatchAssembler::new(account, &counter).with_queued(queued);
    let plan = match assembler.assemble(shipments) {
        Ok(plan) => plan,
        Err(err) => {
            reporter.error(&format!("assembly aborted: {err}"));
            event_log.write_to_file(&events_file)?;
            return Err(err.into());
        }
    };

    for issue in &plan.issues {
        reporter.warn(&format!("{}: skipped ({})", issue.shipment, issue.message));
        event_log.emit(
            account.name(),
            &issue.shipment,
            EventType::ShipmentRejected {
                kind: issue.kind,
                message: issue.message.clone(),
            },
        );
    }

    for entry in &plan.entries {
        record_queued(&mut event_log, entry);
        reporter.info(&format!(
            "{}: queued {} package(s), tracking {}",
            entry.shipment,
            entry.vals.references.len(),
            entry.vals.tracking_ref
        ));
    }

    if let Err(err) = store.append(&plan.entries) {
        event_log.write_to_file(&events_file)?;
        return Err(err.context("failed to store draft entries"));
    }

    // Entries are stored; flush their events before writing labels.
    event_log.emit(
        account.name(),
        ALL_SHIPMENTS,
        EventType::AssembleFinished {
            queued: plan.entries.len(),
            rejected: plan.issues.len(),
        },
    );
    event_log.write_to_file(&events_file)?;

    let mut label_files = Vec::new();
    if opts.write_labels {
        let dir = state_dir.join(LABELS_DIR);
        for entry in &plan.entries {
            match write_labels(&TextLabelRenderer, &dir, entry) {
                Ok(files) => label_files.extend(files),
                Err(err) => {
                    reporter.error(&format!("{}: labels not written: {err:#}", entry.shipment));
                    return Err(err.context("entries were queued but labels failed"));
                }
            }
        }
    }

    Ok(AssembleReport { plan, label_files })
}

fn record_queued(event_log: &mut EventLog, entry: &BatchEntry) {
    for label in entry.vals.package_labels() {
        event_log.emit(
            &entry.account,
            &entry.shipment,
            EventType::PackageAllocated {
                package: label.package,
                reference: label.reference,
                barcode: label.barcode,
            },
        );
    }
    event_log.emit(
        &entry.account,
        &entry.shipment,
        EventType::ShipmentQueued {
            tracking_ref: entry.vals.tracking_ref.clone(),
            packages: entry.vals.fields.total_packages,
        },
    );
}

/// Send every draft entry of `account` as one manifest.
pub fn run_send(
    account: &CarrierAccount,
    template: Arc<dyn ManifestTemplate>,
    opts: &RuntimeOptions,
    reporter: &mut dyn Reporter,
) -> Result<TransmitResult> {
    let state_dir = &opts.state_dir;
    let lock = LockFile::acquire_with_timeout(state_dir, opts.lock_timeout)
        .context("failed to acquire job lock")?;
    lock.set_holder(&format!("send {}", account.name()))?;

    let transmitter = ManifestTransmitter::from_account(account, template)?;
    let relay = transmitter.ensure_ready()?.describe();
    let store = FileEntryStore::new(state_dir);
    let batch = store.draft_batch(account.name())?;

    if batch.is_empty() {
        reporter.info(&format!("{}: no draft entries to send", account.name()));
        return Ok(transmitter.transmit(&batch, &store)?);
    }

    reporter.info(&format!(
        "sending batch {} ({} entries) via {relay}",
        batch.batch_id,
        batch.len()
    ));

    let mut event_log = EventLog::new();
    let events_file = events_path(state_dir);
    event_log.emit(
        account.name(),
        ALL_SHIPMENTS,
        EventType::TransmitStarted {
            batch_id: batch.batch_id.clone(),
            entry_count: batch.len(),
        },
    );

    let result = match transmitter.transmit(&batch, &store) {
        Ok(result) => result,
        Err(err) => {
            reporter.error(&format!("batch {} not sent: {err}", batch.batch_id));
            event_log.emit(
                account.name(),
                ALL_SHIPMENTS,
                EventType::TransmitFailed {
                    batch_id: batch.batch_id.clone(),
                    message: err.to_string(),
                },
            );
            event_log.write_to_file(&events_file)?;
            return Err(err.into());
        }
    };

    let attachment = result.attachment.clone().unwrap_or_default();
    event_log.emit(
        account.name(),
        ALL_SHIPMENTS,
        EventType::TransmitSucceeded {
            batch_id: result.batch_id.clone(),
            entry_count: result.done_entries.len(),
            attachment: attachment.clone(),
        },
    );
    event_log.write_to_file(&events_file)?;

    if let Some(receipt) = result.receipt(account.name()) {
        append_receipt(state_dir, &receipt)?;
    }

    reporter.info(&format!(
        "batch {} sent as {attachment}; {} entries done",
        result.batch_id,
        result.done_entries.len()
    ));
    Ok(result)
}

/// Snapshot of an account's queue.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub account: String,
    pub drafts: Vec<BatchEntry>,
    pub done: usize,
    pub last_transmission: Option<BatchEvent>,
    pub receipts: usize,
    /// Current job lock holder, if a job is running
    pub lock: Option<LockInfo>,
}

impl StatusReport {
    pub fn draft_packages(&self) -> usize {
        self.drafts.iter().map(|e| e.vals.references.len()).sum()
    }
}

/// Read-only view of the state dir for `account`.
pub fn run_status(account: &str, opts: &RuntimeOptions) -> Result<StatusReport> {
    let state_dir = &opts.state_dir;
    let entries = FileEntryStore::new(state_dir).entries()?;
    let (drafts, done): (Vec<_>, Vec<_>) = entries
        .into_iter()
        .filter(|e| e.account == account)
        .partition(|e| e.is_draft());

    let events = EventLog::read_from_file(&events_path(state_dir))?;
    let receipts = read_receipts(state_dir)?
        .into_iter()
        .filter(|r| r.account == account)
        .count();
    let lock = if LockFile::is_locked(state_dir) {
        LockFile::read_lock_info(state_dir).ok()
    } else {
        None
    };

    Ok(StatusReport {
        account: account.to_string(),
        drafts,
        done: done.len(),
        last_transmission: events.last_transmission(account).cloned(),
        receipts,
        lock,
    })
}
