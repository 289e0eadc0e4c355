//! Core domain types for consign.
//!
//! This crate provides the types shared across the consign workspace:
//! shipment input records, per-package label data, offline batch entries,
//! and the event/receipt records written to the state directory.

use std::num::ParseIntError;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Separator used when persisting a shipment's package references.
pub const REFERENCE_SEPARATOR: char = ',';

/// Bounded pool of carrier references, configured per carrier account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceRange {
    /// Lowest reference in the pool (inclusive)
    pub min: u64,
    /// Highest reference in the pool (inclusive)
    pub max: u64,
}

impl ReferenceRange {
    pub fn new(min: u64, max: u64) -> Self {
        Self { min, max }
    }

    /// Number of references in the pool, or `None` when `min > max`.
    ///
    /// Computed in `u128` so that a full `0..=u64::MAX` pool does not overflow.
    pub fn size(&self) -> Option<u128> {
        if self.min > self.max {
            return None;
        }
        Some(u128::from(self.max) - u128::from(self.min) + 1)
    }

    pub fn contains(&self, reference: u64) -> bool {
        reference >= self.min && reference <= self.max
    }
}

impl std::fmt::Display for ReferenceRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..={}", self.min, self.max)
    }
}

/// Join package references into the persisted tracking-reference form.
pub fn join_references(references: &[u64]) -> String {
    references
        .iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(&REFERENCE_SEPARATOR.to_string())
}

/// Split a persisted tracking reference back into its ordered references.
pub fn split_references(tracking_ref: &str) -> Result<Vec<u64>, ParseIntError> {
    tracking_ref
        .split(REFERENCE_SEPARATOR)
        .map(str::parse::<u64>)
        .collect()
}

/// Lifecycle state of an offline batch entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    /// Queued, not yet transmitted to the carrier
    #[default]
    Draft,
    /// Included in a manifest the carrier accepted
    Done,
}

impl std::fmt::Display for EntryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryState::Draft => write!(f, "draft"),
            EntryState::Done => write!(f, "done"),
        }
    }
}

/// Delivery address of a shipment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Address {
    /// Contact name at the address (falls back to the customer name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub street: String,
    #[serde(default)]
    pub city: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zip: Option<String>,
    /// ISO country code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

/// Outbound shipment waiting for a carrier reference.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Shipment {
    /// Warehouse-side shipment code
    pub code: String,
    pub customer_name: String,
    /// Postal code of the originating warehouse
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warehouse_zip: Option<String>,
    pub delivery: Address,
    /// Declared package count; anything below 1 is treated as 1
    #[serde(default)]
    pub packages: i64,
    /// Total weight in kilograms
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    /// Carrier service code (falls back to the account default)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default)]
    pub cash_on_delivery: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cod_total: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sale_price_total: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_amount: Option<f64>,
}

impl Shipment {
    /// Declared package count, at least one and saturating at `u32::MAX`.
    pub fn package_count(&self) -> u32 {
        u32::try_from(self.packages.max(1)).unwrap_or(u32::MAX)
    }

    /// Amount to collect on delivery: COD total, then sale price, then total.
    pub fn cod_price(&self) -> Option<f64> {
        self.cod_total
            .or(self.sale_price_total)
            .or(self.total_amount)
    }
}

/// Shipment-level fields handed to label rendering and the manifest.
///
/// Serialized names follow the carrier's label contract.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabelFields {
    #[serde(rename = "servicio")]
    pub service: String,
    #[serde(rename = "producto")]
    pub product: String,
    #[serde(rename = "total_bultos")]
    pub total_packages: u32,
    #[serde(rename = "total_kilos", default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(rename = "observaciones", default)]
    pub notes: String,
    #[serde(rename = "referencia_expedicion")]
    pub shipment_reference: String,
    #[serde(rename = "ref_bulto")]
    pub package_reference: String,
    #[serde(rename = "clave_portes", default, skip_serializing_if = "Option::is_none")]
    pub carriage_key: Option<String>,
    #[serde(rename = "clave_reembolso", default, skip_serializing_if = "Option::is_none")]
    pub cod_key: Option<String>,
    #[serde(rename = "valor_reembolso", default, skip_serializing_if = "Option::is_none")]
    pub cod_amount: Option<String>,
    #[serde(rename = "cliente_nombre")]
    pub customer_name: String,
    #[serde(rename = "cliente_direccion")]
    pub customer_street: String,
    #[serde(rename = "cliente_poblacion")]
    pub customer_city: String,
    #[serde(rename = "cliente_cpostal")]
    pub customer_zip: String,
    #[serde(rename = "cliente_pais")]
    pub customer_country: String,
    #[serde(rename = "cliente_telefono", default)]
    pub customer_phone: String,
    #[serde(rename = "cliente_atencion")]
    pub customer_attention: String,
}

/// Data for one physical package label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageLabel {
    /// 1-based package index within the shipment
    #[serde(rename = "bulto")]
    pub package: u32,
    pub reference: u64,
    pub barcode: String,
    pub barcode_compact: String,
    #[serde(flatten)]
    pub fields: LabelFields,
}

/// Per-shipment values produced by batch assembly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShipmentVals {
    /// Comma-joined package references in allocation order
    pub tracking_ref: String,
    pub references: Vec<u64>,
    pub barcodes: Vec<String>,
    #[serde(flatten)]
    pub fields: LabelFields,
}

impl ShipmentVals {
    /// Label data for every package, numbered in allocation order.
    pub fn package_labels(&self) -> Vec<PackageLabel> {
        self.references
            .iter()
            .zip(&self.barcodes)
            .enumerate()
            .map(|(idx, (reference, barcode))| PackageLabel {
                package: idx as u32 + 1,
                reference: *reference,
                barcode: barcode.clone(),
                barcode_compact: barcode.replace(' ', ""),
                fields: self.fields.clone(),
            })
            .collect()
    }
}

/// Why a shipment was left out of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// Warehouse or delivery postal code is missing
    MissingZip,
    /// Delivery country is missing
    MissingCountry,
    /// Cash on delivery requested without any price
    MissingCodPrice,
    /// Neither the shipment nor the account names a service
    NoService,
    /// The account already holds an entry for this shipment
    AlreadyQueued,
    /// The same shipment code appears twice in one input
    DuplicateShipment,
    /// More packages than one shipment may carry
    TooManyPackages,
}

impl std::fmt::Display for IssueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IssueKind::MissingZip => write!(f, "missing_zip"),
            IssueKind::MissingCountry => write!(f, "missing_country"),
            IssueKind::MissingCodPrice => write!(f, "missing_cod_price"),
            IssueKind::NoService => write!(f, "no_service"),
            IssueKind::AlreadyQueued => write!(f, "already_queued"),
            IssueKind::DuplicateShipment => write!(f, "duplicate_shipment"),
            IssueKind::TooManyPackages => write!(f, "too_many_packages"),
        }
    }
}

/// Per-shipment validation failure collected during assembly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub shipment: String,
    pub kind: IssueKind,
    pub message: String,
}

/// A shipment queued for offline sending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchEntry {
    /// Unique entry id ("<account>/<shipment>/<first reference>")
    pub id: String,
    pub account: String,
    pub shipment: String,
    pub state: EntryState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub vals: ShipmentVals,
}

impl BatchEntry {
    /// Create a new draft entry for a shipment.
    pub fn draft(account: &str, shipment: &str, vals: ShipmentVals) -> Self {
        let now = Utc::now();
        let first = vals.references.first().copied().unwrap_or_default();
        Self {
            id: format!("{account}/{shipment}/{first}"),
            account: account.to_string(),
            shipment: shipment.to_string(),
            state: EntryState::Draft,
            created_at: now,
            updated_at: now,
            vals,
        }
    }

    pub fn is_draft(&self) -> bool {
        self.state == EntryState::Draft
    }
}

/// Event types for the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    /// Batch assembly started
    AssembleStarted { shipment_count: usize },
    /// A package received its reference and barcode
    PackageAllocated {
        package: u32,
        reference: u64,
        barcode: String,
    },
    /// Shipment queued as a draft entry
    ShipmentQueued { tracking_ref: String, packages: u32 },
    /// Shipment excluded by validation
    ShipmentRejected { kind: IssueKind, message: String },
    /// Batch assembly finished
    AssembleFinished { queued: usize, rejected: usize },
    /// Manifest transmission started
    TransmitStarted { batch_id: String, entry_count: usize },
    /// Carrier relay accepted the manifest
    TransmitSucceeded {
        batch_id: String,
        entry_count: usize,
        attachment: String,
    },
    /// Manifest transmission failed; entries stay draft
    TransmitFailed { batch_id: String, message: String },
}

/// An entry in the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchEvent {
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event_type: EventType,
    /// Carrier account the event belongs to
    pub account: String,
    /// Shipment this event relates to (or "all" for batch-level events)
    pub shipment: String,
}

/// Record of a manifest the relay accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransmissionReceipt {
    pub batch_id: String,
    pub account: String,
    pub sent_at: DateTime<Utc>,
    pub recipients: Vec<String>,
    pub attachment: String,
    pub shipments: Vec<String>,
    pub tracking_refs: Vec<String>,
}
