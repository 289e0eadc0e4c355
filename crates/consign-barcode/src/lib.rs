//! Reference allocation and label barcodes for offline carrier sending.
//!
//! Two pure building blocks:
//!
//! - [`allocate`] folds a shared, ever-increasing counter value into an
//!   account's bounded reference pool. The pool wraps around, so references
//!   repeat once more than `range.size()` of them have been handed out.
//! - [`Barcode::encode`] renders `"<from2> <to3> <transport> <reference> <check>"`
//!   with the carrier's check digit.
//!
//! # Example
//!
//! ```
//! use consign_barcode::{allocate, Barcode, DEFAULT_TRANSPORT};
//! use consign_types::ReferenceRange;
//!
//! let range = ReferenceRange::new(4900000, 4920999);
//! assert_eq!(allocate(&range, 1).unwrap(), 4900001);
//!
//! let barcode = Barcode::encode("19005", "23006", "8201977", DEFAULT_TRANSPORT).unwrap();
//! assert_eq!(barcode.to_string(), "19 230 1 8201977 5");
//! ```

use consign_types::ReferenceRange;
use thiserror::Error;

/// Transport code used for road parcels.
pub const DEFAULT_TRANSPORT: u8 = 1;

/// Characters of the origin postal code that enter the barcode.
pub const FROM_ZIP_PREFIX: usize = 2;

/// Characters of the destination postal code that enter the barcode.
pub const TO_ZIP_PREFIX: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BarcodeError {
    #[error("reference range {min}..={max} is empty (min exceeds max)")]
    EmptyRange { min: u64, max: u64 },

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Map a sequence counter value into the reference pool.
///
/// `range.min + (counter_value mod range.size)`; fails only when the range
/// itself is misconfigured.
pub fn allocate(range: &ReferenceRange, counter_value: u64) -> Result<u64, BarcodeError> {
    let size = range.size().ok_or(BarcodeError::EmptyRange {
        min: range.min,
        max: range.max,
    })?;
    let offset = u128::from(counter_value) % size;
    // offset < size, so min + offset <= max always fits in u64
    Ok(range.min + offset as u64)
}

fn require_digits(field: &str, value: &str) -> Result<(), BarcodeError> {
    if value.is_empty() {
        return Err(BarcodeError::InvalidInput(format!("{field} is empty")));
    }
    if !value.chars().all(|c| c.is_ascii_digit()) {
        return Err(BarcodeError::InvalidInput(format!(
            "{field} must contain only digits: {value:?}"
        )));
    }
    Ok(())
}

fn prefix(value: &str, len: usize) -> String {
    value.chars().take(len).collect()
}

/// Compute the carrier check digit.
///
/// Positions are 1-indexed over `from_zip[..2] + reference`: odd positions
/// weigh 3, even positions weigh 1, and the digit completes the weighted sum
/// to one below the next multiple of ten (9 when the sum is already a multiple).
pub fn check_digit(from_zip: &str, reference: &str) -> Result<u8, BarcodeError> {
    let from = prefix(from_zip, FROM_ZIP_PREFIX);
    require_digits("from_zip", &from)?;
    require_digits("reference", reference)?;

    let mut odd = 0u64;
    let mut even = 0u64;
    for (idx, c) in from.chars().chain(reference.chars()).enumerate() {
        let digit = u64::from(c.to_digit(10).unwrap_or_default());
        if (idx + 1) % 2 == 0 {
            even += digit;
        } else {
            odd += digit;
        }
    }

    let last = (even + odd * 3) % 10;
    if last == 0 {
        Ok(9)
    } else {
        Ok((10 - last - 1) as u8)
    }
}

/// A rendered label barcode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Barcode {
    from: String,
    to: String,
    transport: u8,
    reference: String,
    check: u8,
}

impl Barcode {
    /// Encode a barcode from postal codes, a reference and a transport code.
    pub fn encode(
        from_zip: &str,
        to_zip: &str,
        reference: &str,
        transport: u8,
    ) -> Result<Self, BarcodeError> {
        let from = prefix(from_zip, FROM_ZIP_PREFIX);
        let to = prefix(to_zip, TO_ZIP_PREFIX);
        require_digits("to_zip", &to)?;
        if transport > 9 {
            return Err(BarcodeError::InvalidInput(format!(
                "transport must be a single digit, got {transport}"
            )));
        }
        let check = check_digit(&from, reference)?;

        Ok(Self {
            from,
            to,
            transport,
            reference: reference.to_string(),
            check,
        })
    }

    /// Encode a barcode for a numeric reference.
    pub fn for_reference(
        from_zip: &str,
        to_zip: &str,
        reference: u64,
        transport: u8,
    ) -> Result<Self, BarcodeError> {
        Self::encode(from_zip, to_zip, &reference.to_string(), transport)
    }

    /// Parse a rendered barcode. The check digit is read, not validated;
    /// use [`Barcode::verify`] for that.
    pub fn parse(s: &str) -> Result<Self, BarcodeError> {
        let parts: Vec<&str> = s.split(' ').collect();
        let [from, to, transport, reference, check] = parts.as_slice() else {
            return Err(BarcodeError::InvalidInput(format!(
                "expected 5 space-separated fields, got {}: {s:?}",
                parts.len()
            )));
        };

        if from.chars().count() > FROM_ZIP_PREFIX {
            return Err(BarcodeError::InvalidInput(format!("origin prefix too long: {from:?}")));
        }
        if to.chars().count() > TO_ZIP_PREFIX {
            return Err(BarcodeError::InvalidInput(format!(
                "destination prefix too long: {to:?}"
            )));
        }
        require_digits("from_zip", from)?;
        require_digits("to_zip", to)?;
        require_digits("reference", reference)?;

        let transport = single_digit("transport", transport)?;
        let check = single_digit("check digit", check)?;

        Ok(Self {
            from: from.to_string(),
            to: to.to_string(),
            transport,
            reference: reference.to_string(),
            check,
        })
    }

    /// Whether the check digit matches the origin prefix and reference.
    pub fn verify(&self) -> bool {
        check_digit(&self.from, &self.reference).is_ok_and(|c| c == self.check)
    }

    /// Barcode with the separators removed, as printed under the bars.
    pub fn compact(&self) -> String {
        format!(
            "{}{}{}{}{}",
            self.from, self.to, self.transport, self.reference, self.check
        )
    }

    pub fn from_prefix(&self) -> &str {
        &self.from
    }

    pub fn to_prefix(&self) -> &str {
        &self.to
    }

    pub fn transport(&self) -> u8 {
        self.transport
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn check(&self) -> u8 {
        self.check
    }
}

fn single_digit(field: &str, value: &str) -> Result<u8, BarcodeError> {
    match value.as_bytes() {
        [b] if b.is_ascii_digit() => Ok(b - b'0'),
        _ => Err(BarcodeError::InvalidInput(format!(
            "{field} must be a single digit: {value:?}"
        ))),
    }
}

impl std::fmt::Display for Barcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            self.from, self.to, self.transport, self.reference, self.check
        )
    }
}

impl std::str::FromStr for Barcode {
    type Err = BarcodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Encode a barcode straight to its rendered string.
pub fn encode(
    from_zip: &str,
    to_zip: &str,
    reference: &str,
    transport: u8,
) -> Result<String, BarcodeError> {
    Barcode::encode(from_zip, to_zip, reference, transport).map(|b| b.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> ReferenceRange {
        ReferenceRange::new(4900000, 4920999)
    }

    #[test]
    fn allocate_known_values() {
        assert_eq!(allocate(&pool(), 1).unwrap(), 4900001);
        assert_eq!(allocate(&pool(), 4900000).unwrap(), 4907000);
        assert_eq!(allocate(&pool(), 4906999).unwrap(), 4913999);
        assert_eq!(allocate(&pool(), 4920100).unwrap(), 4906100);
    }

    #[test]
    fn allocate_wraps_at_pool_size() {
        assert_eq!(allocate(&pool(), 0).unwrap(), 4900000);
        assert_eq!(allocate(&pool(), 20999).unwrap(), 4920999);
        assert_eq!(allocate(&pool(), 21000).unwrap(), 4900000);
    }

    #[test]
    fn allocate_single_reference_pool() {
        let range = ReferenceRange::new(42, 42);
        assert_eq!(allocate(&range, 0).unwrap(), 42);
        assert_eq!(allocate(&range, u64::MAX).unwrap(), 42);
    }

    #[test]
    fn allocate_full_u64_pool() {
        let range = ReferenceRange::new(0, u64::MAX);
        assert_eq!(allocate(&range, u64::MAX).unwrap(), u64::MAX);
    }

    #[test]
    fn allocate_rejects_empty_range() {
        let range = ReferenceRange::new(10, 9);
        let err = allocate(&range, 5).unwrap_err();
        assert_eq!(err, BarcodeError::EmptyRange { min: 10, max: 9 });
        assert!(err.to_string().contains("min exceeds max"));
    }

    #[test]
    fn encode_known_barcode() {
        assert_eq!(
            encode("19005", "23006", "8201977", 1).unwrap(),
            "19 230 1 8201977 5"
        );
    }

    #[test]
    fn check_digit_zero_sum_maps_to_nine() {
        // "00" + "0": weighted sum 0
        assert_eq!(check_digit("00000", "0").unwrap(), 9);
        // "10" + "0": odd=1 → 3, last digit 3 → 6
        assert_eq!(check_digit("10", "0").unwrap(), 6);
    }

    #[test]
    fn check_digit_uses_zip_prefix_positions() {
        // same digits, shifted position changes the weighting
        assert_ne!(
            check_digit("19", "8201977").unwrap(),
            check_digit("91", "8201977").unwrap()
        );
    }

    #[test]
    fn short_zips_keep_natural_width() {
        let barcode = Barcode::encode("1", "23", "15", 1).unwrap();
        assert_eq!(barcode.from_prefix(), "1");
        assert_eq!(barcode.to_prefix(), "23");
        assert!(barcode.to_string().starts_with("1 23 1 15 "));
    }

    #[test]
    fn encode_rejects_non_digit_input() {
        assert!(matches!(
            encode("19005", "23006", "82O1977", 1),
            Err(BarcodeError::InvalidInput(_))
        ));
        assert!(matches!(
            encode("A9005", "23006", "8201977", 1),
            Err(BarcodeError::InvalidInput(_))
        ));
        assert!(matches!(
            encode("19005", "SW1A", "8201977", 1),
            Err(BarcodeError::InvalidInput(_))
        ));
        assert!(matches!(
            encode("19005", "23006", "-8201977", 1),
            Err(BarcodeError::InvalidInput(_))
        ));
    }

    #[test]
    fn encode_rejects_empty_input() {
        assert!(encode("", "23006", "1", 1).is_err());
        assert!(encode("19005", "", "1", 1).is_err());
        assert!(encode("19005", "23006", "", 1).is_err());
    }

    #[test]
    fn encode_accepts_any_transport_digit() {
        for transport in 0..=9 {
            let barcode = Barcode::encode("19005", "23006", "8201977", transport).unwrap();
            assert_eq!(barcode.transport(), transport);
            assert_eq!(barcode.check(), 5);
        }
        assert!(Barcode::encode("19005", "23006", "8201977", 10).is_err());
    }

    #[test]
    fn compact_strips_separators() {
        let barcode = Barcode::for_reference("19005", "23006", 8201977, 1).unwrap();
        assert_eq!(barcode.compact(), "19230182019775");
    }

    #[test]
    fn parse_and_verify() {
        let barcode: Barcode = "19 230 1 8201977 5".parse().unwrap();
        assert_eq!(barcode.reference(), "8201977");
        assert!(barcode.verify());

        let tampered = Barcode::parse("19 230 1 8201977 4").unwrap();
        assert!(!tampered.verify());
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(Barcode::parse("19 230 1 8201977").is_err());
        assert!(Barcode::parse("19 230 12 8201977 5").is_err());
        assert!(Barcode::parse("190 230 1 8201977 5").is_err());
        assert!(Barcode::parse("19  230 1 8201977 5").is_err());
        assert!(Barcode::parse("19 230 1 8201977 x").is_err());
    }
}
