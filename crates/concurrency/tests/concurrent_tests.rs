//! Concurrent/Multi-threaded Tests for gamma-concurrency
//!
//! These tests drive raw transactions from several threads to exercise:
//!
//! 1. **Commit Locking** - Only one of two racing writers commits
//! 2. **Lost Updates** - Hand-rolled retry loops never lose an increment
//! 3. **Version Monotonicity** - Versions only grow under load
//! 4. **Read Consistency** - No attempt observes a broken invariant
//! 5. **Blocking** - Retry latches wake on commit
//!
//! ## Running These Tests
//!
//! ```bash
//! cargo test --test concurrent_tests
//! cargo test --test concurrent_tests -- --nocapture --test-threads=1  # sequential for debugging
//! ```

use gamma_concurrency::{GammaStm, GammaTxn, TxnRef, TxnValue};
use gamma_core::{LockMode, StmError, StmResult, TxnStatus};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

// ============================================================================
// Test Helpers
// ============================================================================

/// Run `block` until it commits, retrying on conflicts
fn run_until_committed<T, F>(stm: &GammaStm, mut block: F) -> T
where
    F: FnMut(&mut GammaTxn) -> StmResult<T>,
{
    loop {
        let mut tx = stm.begin();
        match block(&mut tx).and_then(|value| tx.commit().map(|_| value)) {
            Ok(value) => return value,
            Err(err) if err.is_conflict() => thread::yield_now(),
            Err(err) => panic!("unexpected error: {err}"),
        }
    }
}

fn increment(r: &TxnRef<u64>, tx: &mut GammaTxn) -> StmResult<()> {
    let v = r.get(tx)?;
    r.set(tx, v + 1)
}

fn read_all<T: TxnValue>(refs: &[TxnRef<T>], tx: &mut GammaTxn) -> StmResult<Vec<T>> {
    refs.iter().map(|r| r.get(tx)).collect()
}

// ============================================================================
// SECTION 1: Commit Locking
// ============================================================================

mod commit_locking {
    use super::*;

    /// Two transactions read and write the same reference, then commit
    /// at the same time. Exactly one wins.
    #[test]
    fn test_racing_writers_one_wins() {
        let stm = GammaStm::new();
        let r = stm.new_ref(0u64);
        let barrier = Arc::new(Barrier::new(2));
        let success_count = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..2u64)
            .map(|i| {
                let stm = stm.clone();
                let r = r.clone();
                let barrier = Arc::clone(&barrier);
                let success_count = Arc::clone(&success_count);
                thread::spawn(move || {
                    let mut tx = stm.begin();
                    r.get(&mut tx).unwrap();
                    r.set(&mut tx, i + 1).unwrap();

                    barrier.wait();
                    if tx.commit().is_ok() {
                        success_count.fetch_add(1, Ordering::SeqCst);
                    } else {
                        assert_eq!(tx.status(), TxnStatus::Aborted);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        // Both read version 0 before either commits
        assert_eq!(success_count.load(Ordering::SeqCst), 1);
        assert_eq!(r.version(), 1);
        assert!(matches!(r.atomic_get().unwrap(), 1 | 2));
        assert_eq!(r.lock_mode(), LockMode::None);
        assert_eq!(r.surplus(), 0);
    }

    /// Commits touching disjoint references never conflict
    #[test]
    fn test_disjoint_writers_all_commit() {
        let stm = GammaStm::new();
        let refs: Vec<_> = (0..8).map(|_| stm.new_ref(0u64)).collect();
        let barrier = Arc::new(Barrier::new(refs.len()));

        let handles: Vec<_> = refs
            .iter()
            .cloned()
            .map(|r| {
                let stm = stm.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let mut tx = stm.begin();
                    increment(&r, &mut tx).unwrap();
                    barrier.wait();
                    tx.commit().unwrap();
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(refs.iter().all(|r| r.atomic_get().unwrap() == 1));
    }
}

// ============================================================================
// SECTION 2: Lost Updates
// ============================================================================

mod lost_updates {
    use super::*;

    #[test]
    fn test_concurrent_increments_all_land() {
        let stm = GammaStm::new();
        let counter = stm.new_ref(0u64);
        let num_threads = 8;
        let per_thread = 250;

        let handles: Vec<_> = (0..num_threads)
            .map(|_| {
                let stm = stm.clone();
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..per_thread {
                        run_until_committed(&stm, |tx| increment(&counter, tx));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let expected = (num_threads * per_thread) as u64;
        assert_eq!(counter.atomic_get().unwrap(), expected);
        assert_eq!(counter.version(), expected);

        let metrics = stm.metrics();
        assert_eq!(metrics.total_committed, expected);
        assert_eq!(metrics.active_count, 0);
    }

    #[test]
    fn test_commutes_never_conflict() {
        let stm = GammaStm::new();
        let counter = stm.new_ref(0u64);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let stm = stm.clone();
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        run_until_committed(&stm, |tx| counter.commute(tx, |v| v + 1));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.atomic_get().unwrap(), 800);
    }

    #[test]
    fn test_atomic_ops_mix_with_transactions() {
        let stm = GammaStm::new();
        let counter = stm.new_ref(0u64);

        let transactional = {
            let stm = stm.clone();
            let counter = counter.clone();
            thread::spawn(move || {
                for _ in 0..300 {
                    run_until_committed(&stm, |tx| increment(&counter, tx));
                }
            })
        };
        let atomic = {
            let counter = counter.clone();
            thread::spawn(move || {
                let mut done = 0;
                while done < 300 {
                    if counter.atomic_alter_and_get(|v| v + 1).is_ok() {
                        done += 1;
                    }
                }
            })
        };
        transactional.join().unwrap();
        atomic.join().unwrap();
        assert_eq!(counter.atomic_get().unwrap(), 600);
    }
}

// ============================================================================
// SECTION 3: Version Monotonicity
// ============================================================================

mod version_monotonicity {
    use super::*;

    #[test]
    fn test_versions_never_decrease() {
        let stm = GammaStm::new();
        let r = stm.new_ref(0u64);
        let stop = Arc::new(AtomicBool::new(false));

        let observer = {
            let r = r.clone();
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut last = 0;
                while !stop.load(Ordering::SeqCst) {
                    let version = r.version();
                    assert!(version >= last, "version went from {last} to {version}");
                    last = version;
                }
            })
        };

        let writers: Vec<_> = (0..4)
            .map(|_| {
                let stm = stm.clone();
                let r = r.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        run_until_committed(&stm, |tx| increment(&r, tx));
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }
        stop.store(true, Ordering::SeqCst);
        observer.join().unwrap();
        assert_eq!(r.version(), 800);
    }
}

// ============================================================================
// SECTION 4: Read Consistency
// ============================================================================

mod read_consistency {
    use super::*;

    /// Transfers keep the sum of all accounts constant. A reader that ever
    /// sees a different total computed on an inconsistent snapshot.
    #[test]
    fn test_readers_never_see_broken_total() {
        let stm = GammaStm::new();
        let accounts: Arc<Vec<_>> = Arc::new((0..5).map(|_| stm.new_ref(100i64)).collect());
        let stop = Arc::new(AtomicBool::new(false));
        let bad_totals = Arc::new(Mutex::new(Vec::new()));

        let transfers: Vec<_> = (0..3usize)
            .map(|t| {
                let stm = stm.clone();
                let accounts = Arc::clone(&accounts);
                thread::spawn(move || {
                    for i in 0..300usize {
                        let from = (i + t) % accounts.len();
                        let to = (i + t + 1) % accounts.len();
                        run_until_committed(&stm, |tx| {
                            let a = accounts[from].get(tx)?;
                            accounts[from].set(tx, a - 7)?;
                            let b = accounts[to].get(tx)?;
                            accounts[to].set(tx, b + 7)
                        });
                    }
                })
            })
            .collect();

        let readers: Vec<_> = (0..2)
            .map(|_| {
                let stm = stm.clone();
                let accounts = Arc::clone(&accounts);
                let stop = Arc::clone(&stop);
                let bad_totals = Arc::clone(&bad_totals);
                thread::spawn(move || {
                    while !stop.load(Ordering::SeqCst) {
                        let mut tx = stm.begin();
                        // Every successful read set must be consistent, even
                        // if the attempt later fails
                        if let Ok(values) = read_all(&accounts, &mut tx) {
                            let total: i64 = values.iter().sum();
                            if total != 500 {
                                bad_totals.lock().push(total);
                            }
                        }
                        let _ = tx.abort();
                    }
                })
            })
            .collect();

        for handle in transfers {
            handle.join().unwrap();
        }
        stop.store(true, Ordering::SeqCst);
        for handle in readers {
            handle.join().unwrap();
        }

        assert!(bad_totals.lock().is_empty(), "saw {:?}", bad_totals.lock());
        let total: i64 = accounts.iter().map(|a| a.atomic_get().unwrap()).sum();
        assert_eq!(total, 500);
    }
}

// ============================================================================
// SECTION 5: Blocking
// ============================================================================

mod blocking {
    use super::*;

    #[test]
    fn test_retry_latch_wakes_on_commit() {
        let stm = GammaStm::new();
        let flag = stm.new_ref(false);

        let mut tx = stm.begin();
        let result: StmResult<()> = match flag.get(&mut tx).unwrap() {
            true => Ok(()),
            false => tx.retry(),
        };
        assert!(matches!(result, Err(StmError::Retry)));
        let latch = tx.take_retry_latch().unwrap();

        let setter = {
            let stm = stm.clone();
            let flag = flag.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                run_until_committed(&stm, |tx| flag.set(tx, true));
            })
        };

        assert!(latch.await_open(Some(Duration::from_secs(5))));
        setter.join().unwrap();
        assert!(flag.atomic_get().unwrap());
    }

    #[test]
    fn test_latch_times_out_without_commit() {
        let stm = GammaStm::new();
        let flag = stm.new_ref(0u8);
        let mut tx = stm.begin();
        flag.get(&mut tx).unwrap();
        let _ = tx.retry::<()>();
        let latch = tx.take_retry_latch().unwrap();
        assert!(!latch.await_open(Some(Duration::from_millis(10))));
    }

    #[test]
    fn test_unchanged_commit_does_not_wake() {
        let stm = GammaStm::new();
        let r = stm.new_ref(1u8);
        let mut tx = stm.begin();
        r.get(&mut tx).unwrap();
        let _ = tx.retry::<()>();
        let latch = tx.take_retry_latch().unwrap();

        // Dirty check: same value, no version bump, no wake
        r.atomic_set(1).unwrap();
        assert!(!latch.is_open());
        r.atomic_set(2).unwrap();
        assert!(latch.is_open());
    }
}

// ============================================================================
// SECTION 6: Property Tests
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// A single-threaded sequence of transactions matches a plain model
    #[test]
    fn prop_sequential_transactions_match_model(
        ops in prop::collection::vec((0usize..4, any::<i32>(), any::<bool>()), 1..40)
    ) {
        let stm = GammaStm::new();
        let refs: Vec<_> = (0..4).map(|_| stm.new_ref(0i32)).collect();
        let mut model = [0i32; 4];
        let mut versions = [0u64; 4];

        for (index, value, commit) in ops {
            let mut tx = stm.begin();
            refs[index].set(&mut tx, value).unwrap();
            if commit {
                tx.commit().unwrap();
                if model[index] != value {
                    versions[index] += 1;
                }
                model[index] = value;
            } else {
                tx.abort().unwrap();
            }
        }

        for (i, r) in refs.iter().enumerate() {
            prop_assert_eq!(r.atomic_get().unwrap(), model[i]);
            prop_assert_eq!(r.version(), versions[i]);
            prop_assert_eq!(r.surplus(), 0);
        }
    }
}
