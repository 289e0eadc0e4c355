//! Property-based tests for consign invariants.
//!
//! - Allocation stays inside the pool and wraps with period `size`
//! - Check digits depend only on the origin prefix and the reference
//! - Assembly never hands out a reference twice within a pool cycle

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use proptest::prelude::*;

    use crate::assemble::BatchAssembler;
    use crate::assemble::tests::{account, shipment};
    use crate::barcode::{Barcode, allocate, check_digit};
    use crate::sequence::MemorySequence;
    use crate::state::{EntryStore, MemoryEntryStore, batch_id};
    use crate::types::{ReferenceRange, join_references, split_references};

    fn range_strategy() -> impl Strategy<Value = ReferenceRange> {
        (0u64..u64::MAX / 2, 0u64..1_000_000).prop_map(|(min, len)| ReferenceRange::new(min, min + len))
    }

    proptest! {
        /// Property: every allocated reference lies within the pool
        #[test]
        fn allocate_stays_in_range(range in range_strategy(), value in any::<u64>()) {
            let reference = allocate(&range, value).unwrap();
            prop_assert!(range.contains(reference));
        }

        /// Property: counter values one pool apart map to the same reference
        #[test]
        fn allocate_is_periodic(range in range_strategy(), value in 0u64..u64::MAX / 2) {
            let size = range.size().unwrap() as u64;
            prop_assert_eq!(allocate(&range, value).unwrap(), allocate(&range, value + size).unwrap());
        }

        /// Property: consecutive counter values give consecutive references until the wrap
        #[test]
        fn allocate_is_sequential(min in 0u64..1_000_000, len in 1u64..1000, value in 0u64..10_000) {
            let range = ReferenceRange::new(min, min + len);
            let a = allocate(&range, value).unwrap();
            let b = allocate(&range, value + 1).unwrap();
            if a == range.max {
                prop_assert_eq!(b, range.min);
            } else {
                prop_assert_eq!(b, a + 1);
            }
        }

        /// Property: an inverted range never allocates
        #[test]
        fn inverted_range_rejected(min in 1u64..u64::MAX, value in any::<u64>()) {
            let range = ReferenceRange::new(min, min - 1);
            prop_assert!(allocate(&range, value).is_err());
        }

        /// Property: the check digit ignores the destination zip and transport
        #[test]
        fn check_digit_ignores_destination(
            from in "[0-9]{5}",
            to_a in "[0-9]{5}",
            to_b in "[0-9]{5}",
            transport in 0u8..10,
            reference in 1u64..100_000_000,
        ) {
            let a = Barcode::for_reference(&from, &to_a, reference, 1).unwrap();
            let b = Barcode::for_reference(&from, &to_b, reference, transport).unwrap();
            prop_assert_eq!(a.check(), b.check());
            prop_assert_eq!(a.check(), check_digit(&from, &reference.to_string()).unwrap());
            prop_assert!(a.check() <= 9);
        }

        /// Property: every encoded barcode parses back and verifies
        #[test]
        fn encoded_barcodes_verify(
            from in "[0-9]{5}",
            to in "[0-9]{5}",
            reference in any::<u64>(),
        ) {
            let barcode = Barcode::for_reference(&from, &to, reference, 1).unwrap();
            let parsed = Barcode::parse(&barcode.to_string()).unwrap();
            prop_assert!(parsed.verify());
            prop_assert_eq!(parsed, barcode);
        }

        /// Property: tracking refs split back into the joined references
        #[test]
        fn tracking_ref_round_trip(refs in prop::collection::vec(any::<u64>(), 1..20)) {
            prop_assert_eq!(split_references(&join_references(&refs)).unwrap(), refs);
        }

        /// Property: batch ids are stable and order sensitive
        #[test]
        fn batch_id_is_deterministic(ids in prop::collection::vec("[a-z0-9/-]{1,12}", 2..8)) {
            let a = batch_id(ids.iter().map(String::as_str));
            let b = batch_id(ids.iter().map(String::as_str));
            prop_assert_eq!(&a, &b);
            prop_assert_eq!(a.len(), 16);
        }

        /// Property: a batch allocates exactly one unique reference per package
        #[test]
        fn assemble_allocates_unique_references(packages in prop::collection::vec(-2i64..6, 1..12)) {
            let account = account();
            let counter = MemorySequence::new();
            let shipments: Vec<_> = packages
                .iter()
                .enumerate()
                .map(|(idx, n)| shipment(&format!("OUT/{idx}"), *n))
                .collect();

            let plan = BatchAssembler::new(&account, &counter).assemble(&shipments).unwrap();
            let expected: usize = packages.iter().map(|n| (*n).max(1) as usize).sum();
            prop_assert_eq!(plan.package_count(), expected);
            prop_assert!(plan.is_clean());

            let refs: BTreeSet<u64> = plan.vals().flat_map(|v| v.references.iter().copied()).collect();
            prop_assert_eq!(refs.len(), expected);
            for vals in plan.vals() {
                prop_assert_eq!(vals.references.len(), vals.barcodes.len());
                prop_assert_eq!(vals.fields.total_packages as usize, vals.references.len());
            }
        }

        /// Property: committing a batch flips all of its entries or none
        #[test]
        fn commit_is_all_or_nothing(count in 1usize..6, bogus in any::<bool>()) {
            let account = account();
            let counter = MemorySequence::new();
            let shipments: Vec<_> = (0..count).map(|i| shipment(&format!("OUT/{i}"), 1)).collect();
            let plan = BatchAssembler::new(&account, &counter).assemble(&shipments).unwrap();

            let store = MemoryEntryStore::new();
            store.append(&plan.entries).unwrap();
            let mut ids: Vec<String> = plan.entries.iter().map(|e| e.id.clone()).collect();
            if bogus {
                ids.push("seur-main/missing/0".to_string());
            }

            let result = store.commit_done(account.name(), &ids);
            let drafts = store.draft_batch(account.name()).unwrap();
            if bogus {
                prop_assert!(result.is_err());
                prop_assert_eq!(drafts.len(), count);
            } else {
                prop_assert_eq!(result.unwrap(), count);
                prop_assert!(drafts.is_empty());
            }
        }
    }
}
