//! The manifest document sent to the carrier's back office.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use consign_config::CarrierAccount;
use consign_state::Batch;
use consign_types::ShipmentVals;
use serde::{Deserialize, Serialize};

/// Everything the carrier needs to register a batch of shipments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Customer code
    pub ci: String,
    pub vat: String,
    /// Account code
    pub ccc: String,
    pub account: String,
    pub batch_id: String,
    pub generated_at: DateTime<Utc>,
    pub shipments: Vec<ManifestShipment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestShipment {
    pub shipment: String,
    #[serde(flatten)]
    pub vals: ShipmentVals,
}

impl Manifest {
    pub fn build(account: &CarrierAccount, batch: &Batch, generated_at: DateTime<Utc>) -> Self {
        let credentials = account.credentials();
        Self {
            ci: credentials.ci.clone(),
            vat: credentials.vat.clone(),
            ccc: credentials.ccc.clone(),
            account: account.name().to_string(),
            batch_id: batch.batch_id.clone(),
            generated_at,
            shipments: batch
                .entries
                .iter()
                .map(|entry| ManifestShipment {
                    shipment: entry.shipment.clone(),
                    vals: entry.vals.clone(),
                })
                .collect(),
        }
    }

    pub fn package_count(&self) -> usize {
        self.shipments.iter().map(|s| s.vals.references.len()).sum()
    }
}

/// Renders a [`Manifest`] into attachment bytes.
///
/// Handed to the transmitter once at construction and shared read-only.
pub trait ManifestTemplate: Send + Sync {
    fn render(&self, manifest: &Manifest) -> Result<Vec<u8>>;

    fn content_type(&self) -> &str;

    /// File extension without the dot
    fn extension(&self) -> &str;
}

/// Pretty-printed JSON manifest.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonManifestTemplate;

impl ManifestTemplate for JsonManifestTemplate {
    fn render(&self, manifest: &Manifest) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(manifest).context("failed to serialize manifest to JSON")
    }

    fn content_type(&self) -> &str {
        "application/json"
    }

    fn extension(&self) -> &str {
        "json"
    }
}

/// One line per package, tab separated, with a header row.
#[derive(Debug, Clone, Copy, Default)]
pub struct TsvManifestTemplate;

const TSV_COLUMNS: [&str; 11] = [
    "shipment",
    "bulto",
    "reference",
    "barcode",
    "servicio",
    "total_bultos",
    "cliente_nombre",
    "cliente_cpostal",
    "cliente_pais",
    "clave_reembolso",
    "valor_reembolso",
];

fn tsv_cell(value: &str) -> String {
    value.replace(['\t', '\n', '\r'], " ")
}

impl ManifestTemplate for TsvManifestTemplate {
    fn render(&self, manifest: &Manifest) -> Result<Vec<u8>> {
        let mut out = TSV_COLUMNS.join("\t");
        out.push('\n');
        for shipment in &manifest.shipments {
            for label in shipment.vals.package_labels() {
                let fields = &label.fields;
                let row = [
                    tsv_cell(&shipment.shipment),
                    label.package.to_string(),
                    label.reference.to_string(),
                    label.barcode.clone(),
                    tsv_cell(&fields.service),
                    fields.total_packages.to_string(),
                    tsv_cell(&fields.customer_name),
                    tsv_cell(&fields.customer_zip),
                    tsv_cell(&fields.customer_country),
                    fields.cod_key.clone().unwrap_or_default(),
                    fields.cod_amount.clone().unwrap_or_default(),
                ];
                out.push_str(&row.join("\t"));
                out.push('\n');
            }
        }
        Ok(out.into_bytes())
    }

    fn content_type(&self) -> &str {
        "text/tab-separated-values"
    }

    fn extension(&self) -> &str {
        "tsv"
    }
}

/// Attachment name: `<prefix>-<YYYYmmddHHMMSS>-<batch id>.<ext>`.
pub fn attachment_name(
    account: &CarrierAccount,
    manifest: &Manifest,
    template: &dyn ManifestTemplate,
) -> String {
    format!(
        "{}-{}-{}.{}",
        account.filename_prefix(),
        manifest.generated_at.format("%Y%m%d%H%M%S"),
        manifest.batch_id,
        template.extension()
    )
}
