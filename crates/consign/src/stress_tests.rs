//! Stress tests for concurrent reference allocation.
//!
//! - Several assemblers sharing one counter file never collide
//! - The job lock survives rapid acquire/release cycles

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use tempfile::TempDir;

    use crate::assemble::BatchAssembler;
    use crate::assemble::tests::{account, shipment};
    use crate::lock::LockFile;
    use crate::sequence::{DEFAULT_SEQUENCE_ID, FileSequence, MemorySequence, SequenceCounter};
    use crate::state::{EntryStore, FileEntryStore};

    #[test]
    fn stress_file_sequence_across_threads() {
        let temp_dir = TempDir::new().unwrap();
        let state_dir = Arc::new(temp_dir.path().to_path_buf());
        let threads = 8;
        let per_thread = 25;

        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let state_dir = Arc::clone(&state_dir);
                thread::spawn(move || {
                    let account = account();
                    let counter = FileSequence::new(&state_dir).with_lock_wait(Duration::from_secs(30));
                    let shipments: Vec<_> = (0..per_thread)
                        .map(|i| shipment(&format!("T{t}/{i}"), 1))
                        .collect();
                    BatchAssembler::new(&account, &counter)
                        .assemble(&shipments)
                        .unwrap()
                })
            })
            .collect();

        let mut refs = BTreeSet::new();
        for handle in handles {
            let plan = handle.join().unwrap();
            for vals in plan.vals() {
                refs.extend(vals.references.iter().copied());
            }
        }

        assert_eq!(refs.len(), threads * per_thread);
        let counter = FileSequence::new(&state_dir);
        assert_eq!(
            counter.current(DEFAULT_SEQUENCE_ID).unwrap(),
            (threads * per_thread) as u64
        );
    }

    #[test]
    fn stress_memory_sequence_shared_by_assemblers() {
        let counter = Arc::new(MemorySequence::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    let account = account();
                    let shipments: Vec<_> =
                        (0..50).map(|i| shipment(&format!("M{t}/{i}"), 2)).collect();
                    BatchAssembler::new(&account, counter.as_ref())
                        .assemble(&shipments)
                        .unwrap()
                })
            })
            .collect();

        let mut refs = BTreeSet::new();
        for handle in handles {
            for vals in handle.join().unwrap().vals() {
                refs.extend(vals.references.iter().copied());
            }
        }
        assert_eq!(refs.len(), 4 * 50 * 2);
    }

    #[test]
    fn stress_entry_store_large_batch() {
        let temp_dir = TempDir::new().unwrap();
        let account = account();
        let counter = MemorySequence::new();
        let store = FileEntryStore::new(temp_dir.path());

        for chunk in 0..10 {
            let shipments: Vec<_> = (0..50)
                .map(|i| shipment(&format!("C{chunk}/{i}"), 1))
                .collect();
            let plan = BatchAssembler::new(&account, &counter)
                .assemble(&shipments)
                .unwrap();
            store.append(&plan.entries).unwrap();
        }

        let batch = store.draft_batch(account.name()).unwrap();
        assert_eq!(batch.len(), 500);
        let ids = batch.entry_ids();
        assert_eq!(store.commit_done(account.name(), &ids).unwrap(), 500);
        assert!(store.draft_batch(account.name()).unwrap().is_empty());
    }

    #[test]
    fn stress_lock_acquire_release_cycle() {
        let temp_dir = TempDir::new().unwrap();
        let state_dir = temp_dir.path().join(".consign");

        for i in 0..100 {
            let lock = LockFile::acquire(&state_dir)
                .unwrap_or_else(|_| panic!("failed to acquire lock on iteration {i}"));
            assert!(LockFile::is_locked(&state_dir));
            drop(lock);
            assert!(!LockFile::is_locked(&state_dir));
        }
    }
}
