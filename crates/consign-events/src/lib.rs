//! Append-only JSONL event log for batch assembly and transmission.
//!
//! Events are buffered in memory while a job runs and flushed to
//! `events.jsonl` in the state directory when it finishes, so one job's
//! events land as a contiguous block.
//!
//! ```
//! use consign_events::EventLog;
//! use consign_types::EventType;
//!
//! let mut log = EventLog::new();
//! log.emit("seur-main", "all", EventType::AssembleStarted { shipment_count: 3 });
//! assert_eq!(log.events_for_account("seur-main").len(), 1);
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use consign_types::{BatchEvent, EventType};

/// Log file name inside a state directory.
pub const EVENTS_FILE: &str = "events.jsonl";

/// Shipment name used for batch-level events.
pub const ALL_SHIPMENTS: &str = "all";

pub fn events_path(state_dir: &Path) -> PathBuf {
    state_dir.join(EVENTS_FILE)
}

#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<BatchEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, event: BatchEvent) {
        self.events.push(event);
    }

    /// Record an event stamped with the current time.
    pub fn emit(&mut self, account: &str, shipment: &str, event_type: EventType) {
        self.record(BatchEvent {
            timestamp: Utc::now(),
            event_type,
            account: account.to_string(),
            shipment: shipment.to_string(),
        });
    }

    /// Append all recorded events to `path`, one JSON object per line.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        if self.events.is_empty() {
            return Ok(());
        }
        let mut block = String::new();
        for event in &self.events {
            block.push_str(&serde_json::to_string(event).context("failed to encode event")?);
            block.push('\n');
        }

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open event log {}", path.display()))?;
        file.write_all(block.as_bytes())
            .with_context(|| format!("failed to append to event log {}", path.display()))
    }

    /// Read every event from a JSONL file. A missing file is an empty log.
    pub fn read_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }

        let reader = File::open(path)
            .map(BufReader::new)
            .with_context(|| format!("failed to open event log {}", path.display()))?;

        let mut log = Self::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line.with_context(|| format!("failed to read {}", path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            let event = serde_json::from_str(&line).with_context(|| {
                format!("failed to parse event on line {} of {}", idx + 1, path.display())
            })?;
            log.record(event);
        }
        Ok(log)
    }

    pub fn events_for_account(&self, account: &str) -> Vec<&BatchEvent> {
        self.events.iter().filter(|e| e.account == account).collect()
    }

    pub fn events_for_shipment(&self, account: &str, shipment: &str) -> Vec<&BatchEvent> {
        self.events
            .iter()
            .filter(|e| e.account == account && e.shipment == shipment)
            .collect()
    }

    /// Most recent transmission outcome recorded for an account.
    pub fn last_transmission(&self, account: &str) -> Option<&BatchEvent> {
        self.events.iter().rev().find(|e| {
            e.account == account
                && matches!(
                    e.event_type,
                    EventType::TransmitSucceeded { .. } | EventType::TransmitFailed { .. }
                )
        })
    }

    pub fn all_events(&self) -> &[BatchEvent] {
        &self.events
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
