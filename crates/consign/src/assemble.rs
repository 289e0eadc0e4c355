//! Turn draft shipments into label data and draft batch entries.
//!
//! For every package of every valid shipment the assembler draws one value
//! from the shared counter, folds it into the account's reference pool and
//! encodes the label barcode. Invalid shipments are reported and skipped
//! without consuming counter values, and so are shipments the account has
//! already queued.

use std::collections::BTreeSet;

use consign_barcode::{Barcode, allocate};
use consign_config::CarrierAccount;
use consign_sequence::SequenceCounter;
use consign_types::{
    BatchEntry, IssueKind, LabelFields, Shipment, ShipmentVals, ValidationIssue, join_references,
};

use crate::error::{Error, Result};

/// Charge code sent with cash-on-delivery shipments (invoiced).
pub const COD_KEY: &str = "F";

/// Most packages a single shipment may declare.
pub const MAX_PACKAGES: u32 = 999;

/// Outcome of assembling one set of shipments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchPlan {
    pub account: String,
    /// One draft entry per accepted shipment, in input order
    pub entries: Vec<BatchEntry>,
    /// Shipments left out, in input order
    pub issues: Vec<ValidationIssue>,
}

impl BatchPlan {
    pub fn vals(&self) -> impl Iterator<Item = &ShipmentVals> {
        self.entries.iter().map(|e| &e.vals)
    }

    pub fn package_count(&self) -> usize {
        self.entries.iter().map(|e| e.vals.references.len()).sum()
    }

    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Fields of a shipment that passed validation.
struct Checked<'s> {
    from_zip: &'s str,
    to_zip: &'s str,
    country: &'s str,
    service: String,
    cod_amount: Option<f64>,
    packages: u32,
}

pub struct BatchAssembler<'a> {
    account: &'a CarrierAccount,
    counter: &'a dyn SequenceCounter,
    queued: BTreeSet<String>,
}

impl<'a> BatchAssembler<'a> {
    pub fn new(account: &'a CarrierAccount, counter: &'a dyn SequenceCounter) -> Self {
        Self {
            account,
            counter,
            queued: BTreeSet::new(),
        }
    }

    /// Shipment codes that already have an entry for this account.
    pub fn with_queued(mut self, codes: impl IntoIterator<Item = String>) -> Self {
        self.queued.extend(codes);
        self
    }

    /// Assemble `shipments` for this account.
    ///
    /// Fails before touching the counter when the account is not offline or
    /// its reference range is empty. Sequence failures and barcode contract
    /// violations abort the whole run; references already drawn are simply
    /// skipped by the counter.
    pub fn assemble(&self, shipments: &[Shipment]) -> Result<BatchPlan> {
        if !self.account.is_offline() {
            return Err(Error::Configuration(format!(
                "account '{}' is not configured for offline sending",
                self.account.name()
            )));
        }
        let range = self.account.range();
        if range.size().is_none() {
            return Err(Error::Configuration(format!(
                "account '{}': invalid reference range {}",
                self.account.name(),
                range
            )));
        }

        let mut plan = BatchPlan {
            account: self.account.name().to_string(),
            ..BatchPlan::default()
        };

        let mut seen = BTreeSet::new();
        for shipment in shipments {
            if self.queued.contains(&shipment.code) {
                plan.issues.push(issue(
                    shipment,
                    IssueKind::AlreadyQueued,
                    "shipment already has a batch entry for this account",
                ));
                continue;
            }
            if !seen.insert(shipment.code.as_str()) {
                plan.issues.push(issue(
                    shipment,
                    IssueKind::DuplicateShipment,
                    "shipment code appears more than once in the input",
                ));
                continue;
            }

            let checked = match self.check(shipment) {
                Ok(checked) => checked,
                Err(issue) => {
                    plan.issues.push(issue);
                    continue;
                }
            };

            let count = checked.packages;
            let mut references = Vec::with_capacity(count as usize);
            let mut barcodes = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let value = self.counter.next(self.account.sequence_id())?;
                let reference = allocate(&range, value)?;
                let barcode = Barcode::for_reference(
                    checked.from_zip,
                    checked.to_zip,
                    reference,
                    self.account.transport(),
                )?;
                references.push(reference);
                barcodes.push(barcode.to_string());
            }

            let vals = ShipmentVals {
                tracking_ref: join_references(&references),
                references,
                barcodes,
                fields: self.label_fields(shipment, &checked, count),
            };
            plan.entries
                .push(BatchEntry::draft(self.account.name(), &shipment.code, vals));
        }

        Ok(plan)
    }

    fn check<'s>(&self, shipment: &'s Shipment) -> std::result::Result<Checked<'s>, ValidationIssue> {
        let reject = |kind: IssueKind, message: &str| issue(shipment, kind, message);

        let from_zip = present(&shipment.warehouse_zip)
            .ok_or_else(|| reject(IssueKind::MissingZip, "warehouse postal code is missing"))?;
        let to_zip = present(&shipment.delivery.zip)
            .ok_or_else(|| reject(IssueKind::MissingZip, "delivery postal code is missing"))?;
        let country = present(&shipment.delivery.country)
            .ok_or_else(|| reject(IssueKind::MissingCountry, "delivery country is missing"))?;

        let service = present(&shipment.service)
            .or(self.account.default_service())
            .ok_or_else(|| {
                reject(
                    IssueKind::NoService,
                    "no carrier service on the shipment and no account default",
                )
            })?
            .to_string();

        let cod_amount = if shipment.cash_on_delivery {
            Some(shipment.cod_price().ok_or_else(|| {
                reject(
                    IssueKind::MissingCodPrice,
                    "cash on delivery requested without a price",
                )
            })?)
        } else {
            None
        };

        let packages = shipment.package_count();
        if packages > MAX_PACKAGES {
            return Err(reject(
                IssueKind::TooManyPackages,
                &format!(
                    "{} packages declared; at most {MAX_PACKAGES} allowed",
                    shipment.packages
                ),
            ));
        }

        Ok(Checked {
            from_zip,
            to_zip,
            country,
            service,
            cod_amount,
            packages,
        })
    }

    fn label_fields(&self, shipment: &Shipment, checked: &Checked<'_>, count: u32) -> LabelFields {
        let delivery = &shipment.delivery;
        LabelFields {
            service: checked.service.clone(),
            product: self.account.product().to_string(),
            total_packages: count,
            weight: shipment.weight,
            notes: shipment.notes.clone().unwrap_or_default(),
            shipment_reference: shipment.code.clone(),
            package_reference: shipment.code.clone(),
            carriage_key: self.account.carriage_key().map(str::to_string),
            cod_key: checked.cod_amount.map(|_| COD_KEY.to_string()),
            cod_amount: checked.cod_amount.map(|amount| format!("{amount:.2}")),
            customer_name: shipment.customer_name.clone(),
            customer_street: delivery.street.clone(),
            customer_city: delivery.city.clone(),
            customer_zip: checked.to_zip.to_string(),
            customer_country: checked.country.to_string(),
            customer_phone: delivery.phone.clone().unwrap_or_default(),
            customer_attention: present(&delivery.name)
                .unwrap_or(shipment.customer_name.as_str())
                .to_string(),
        }
    }
}

fn issue(shipment: &Shipment, kind: IssueKind, message: &str) -> ValidationIssue {
    ValidationIssue {
        shipment: shipment.code.clone(),
        kind,
        message: message.to_string(),
    }
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}
