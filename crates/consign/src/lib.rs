//! # Consign
//!
//! Offline consignment for a parcel carrier: the warehouse allocates carrier
//! references and barcodes itself, prints labels, and later mails the carrier
//! a manifest of everything it shipped.
//!
//! ## Pipeline
//!
//! The flow is **assemble → (labels) → transmit**:
//!
//! 1. [`assemble::BatchAssembler`] validates shipments, draws one reference
//!    per package from a shared [`sequence::SequenceCounter`], maps it into
//!    the account's [`types::ReferenceRange`] and builds the barcode and
//!    label fields. Queued shipments become draft [`types::BatchEntry`] rows.
//! 2. [`label::write_labels`] renders one label file per package.
//! 3. [`transmit::ManifestTransmitter`] collects every draft entry of an
//!    account into a [`manifest::Manifest`], hands it to a
//!    [`mail::MailRelay`] and marks the entries done only once the relay
//!    accepted it. A failed send leaves the drafts in place, so the next run
//!    retries the same batch.
//!
//! [`engine`] wraps the steps with the job lock, the event log and the
//! on-disk state that the `consign` CLI uses.
//!
//! ## Example
//!
//! ```ignore
//! use consign::assemble::BatchAssembler;
//! use consign::sequence::MemorySequence;
//!
//! let counter = MemorySequence::new();
//! let plan = BatchAssembler::new(&account, &counter).assemble(&shipments)?;
//! for issue in &plan.issues {
//!     eprintln!("{}: {}", issue.shipment, issue.message);
//! }
//! ```

/// Batch assembly: validation, reference allocation and label fields.
pub mod assemble;

/// Lock-guarded assemble, send and status jobs over a state directory.
pub mod engine;

/// Error taxonomy shared by the assemble and transmit paths.
pub mod error;

/// Package label rendering.
pub mod label;

/// Manifest document and attachment templates.
pub mod manifest;

/// Manifest transmission and draft-to-done commit.
pub mod transmit;

/// Reference mapping, check digits and barcode strings.
/// Re-exported from consign-barcode microcrate.
pub use consign_barcode as barcode;

/// `.consign.toml` loading and carrier accounts.
/// Re-exported from consign-config microcrate.
pub use consign_config as config;

/// Append-only JSONL event log.
/// Re-exported from consign-events microcrate.
pub use consign_events as events;

/// Job lock held by a running assemble or send.
/// Re-exported from consign-lock microcrate.
pub use consign_lock as lock;

/// Mail relays for manifest delivery.
/// Re-exported from consign-mail microcrate.
pub use consign_mail as mail;

/// Shared, crash-safe reference counters.
/// Re-exported from consign-sequence microcrate.
pub use consign_sequence as sequence;

/// Entry store and transmission receipts.
/// Re-exported from consign-state microcrate.
pub use consign_state as state;

/// Domain types: shipments, label fields, entries, events.
/// Re-exported from consign-types microcrate.
pub use consign_types as types;

pub use error::{Error, Result};

/// Property-based tests for allocation and batch invariants.
#[cfg(test)]
mod property_tests;

/// Stress tests for concurrent allocation.
#[cfg(test)]
mod stress_tests;
