//! Printable package labels.
//!
//! Real label layouts belong to the printing side; this module only fixes
//! the input contract ([`PackageLabel`]) and ships a plain-text renderer.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use consign_types::{BatchEntry, PackageLabel};

pub trait LabelRenderer {
    fn render(&self, label: &PackageLabel) -> Result<Vec<u8>>;

    /// File extension without the dot
    fn extension(&self) -> &str;
}

/// Plain text label, one field per line.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextLabelRenderer;

impl LabelRenderer for TextLabelRenderer {
    fn render(&self, label: &PackageLabel) -> Result<Vec<u8>> {
        let f = &label.fields;
        let mut lines = vec![
            format!("*{}*", label.barcode_compact),
            label.barcode.clone(),
            format!("BULTO {}/{}   REF {}", label.package, f.total_packages, label.reference),
            format!("SERVICIO {}   PRODUCTO {}", f.service, f.product),
            String::new(),
            f.customer_name.clone(),
            f.customer_street.clone(),
            format!("{} {} ({})", f.customer_zip, f.customer_city, f.customer_country),
        ];
        if !f.customer_attention.is_empty() && f.customer_attention != f.customer_name {
            lines.push(format!("ATT: {}", f.customer_attention));
        }
        if !f.customer_phone.is_empty() {
            lines.push(format!("TEL: {}", f.customer_phone));
        }
        if let Some(weight) = f.weight {
            lines.push(format!("KG: {weight}"));
        }
        if let (Some(key), Some(amount)) = (&f.cod_key, &f.cod_amount) {
            lines.push(format!("REEMBOLSO {key} {amount}"));
        }
        if let Some(key) = &f.carriage_key {
            lines.push(format!("PORTES {key}"));
        }
        if !f.notes.is_empty() {
            lines.push(format!("OBS: {}", f.notes));
        }
        lines.push(format!("EXP {}", f.shipment_reference));

        let mut text = lines.join("\n");
        text.push('\n');
        Ok(text.into_bytes())
    }

    fn extension(&self) -> &str {
        "txt"
    }
}

fn file_stem(shipment: &str) -> String {
    shipment
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

/// Render every package label of `entry` into `dir`, returning the paths.
pub fn write_labels(
    renderer: &dyn LabelRenderer,
    dir: &Path,
    entry: &BatchEntry,
) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create labels dir {}", dir.display()))?;

    let stem = file_stem(&entry.shipment);
    let mut paths = Vec::new();
    for label in entry.vals.package_labels() {
        let bytes = renderer.render(&label).with_context(|| {
            format!("failed to render label {} of {}", label.package, entry.shipment)
        })?;
        let path = dir.join(format!(
            "{stem}-{}-{}.{}",
            label.reference,
            label.package,
            renderer.extension()
        ));
        fs::write(&path, bytes)
            .with_context(|| format!("failed to write label {}", path.display()))?;
        paths.push(path);
    }
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use consign_sequence::MemorySequence;
    use tempfile::tempdir;

    use super::*;
    use crate::assemble::BatchAssembler;
    use crate::assemble::tests::{account, shipment};

    fn entry() -> BatchEntry {
        let account = account();
        let counter = MemorySequence::new();
        let mut input = shipment("OUT/1", 2);
        input.cash_on_delivery = true;
        input.cod_total = Some(15.0);
        input.notes = Some("Fragil".to_string());
        let mut plan = BatchAssembler::new(&account, &counter)
            .assemble(&[input])
            .expect("assemble");
        plan.entries.remove(0)
    }

    #[test]
    fn text_label_layout() {
        let entry = entry();
        let label = &entry.vals.package_labels()[1];
        let text = String::from_utf8(TextLabelRenderer.render(label).expect("render")).expect("utf8");
        insta::assert_snapshot!(text.trim_end(), @r"
        *19230149000020*
        19 230 1 4900002 0
        BULTO 2/2   REF 4900002
        SERVICIO 031   PRODUCTO 2

        Ferreteria Lopez
        Calle Mayor 3
        23006 Jaen (ES)
        TEL: 953000000
        KG: 4.5
        REEMBOLSO F 15.00
        PORTES F
        OBS: Fragil
        EXP OUT/1
        ");
    }

    #[test]
    fn write_labels_creates_one_file_per_package() {
        let td = tempdir().expect("tempdir");
        let entry = entry();
        let paths = write_labels(&TextLabelRenderer, &td.path().join("labels"), &entry)
            .expect("write");
        assert_eq!(paths.len(), 2);
        assert!(paths[0].ends_with("OUT_1-4900001-1.txt"));
        assert!(paths[1].ends_with("OUT_1-4900002-2.txt"));
        let first = fs::read_to_string(&paths[0]).expect("read");
        assert!(first.starts_with("*19230149000013*\n19 230 1 4900001 3\n"));
    }
}
