//! Publishing prepared transactions
//!
//! A [`PreparedCommit`] owns the entries of a transaction that passed
//! prepare, together with the Write locks prepare acquired. It is `Send`,
//! so a commit barrier can collect the prepared work of several parties and
//! let the last one to arrive publish everything.
//!
//! Publishing a group:
//! 1. Upgrade every commit lock to Exclusive (readers now spin)
//! 2. Install values, run commutes, bump versions (dirty-checked)
//! 3. Bump the global conflict counter if another transaction had a
//!    written reference open
//! 4. Release all locks and surplus
//! 5. Wake waiters of every reference whose version changed
//!
//! A `PreparedCommit` dropped without being applied releases its locks.

use crate::reference::ErasedRef;
use crate::stm::GammaStm;
use crate::tranlocal::{AccessMode, Tranlocal};
use gamma_core::{LockMode, TxnId};
use std::sync::Arc;
use tracing::{error, trace};

/// What a commit changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitOutcome {
    /// References whose version was bumped
    pub refs_written: usize,
    /// Blocked transactions woken
    pub waiters_woken: usize,
}

/// Prepared, locked work of one transaction, ready to publish
#[derive(Debug)]
pub struct PreparedCommit {
    txn_id: TxnId,
    stm: GammaStm,
    entries: Vec<Tranlocal>,
    dirty_check: bool,
}

impl PreparedCommit {
    pub(crate) fn new(
        txn_id: TxnId,
        stm: GammaStm,
        entries: Vec<Tranlocal>,
        dirty_check: bool,
    ) -> Self {
        PreparedCommit {
            txn_id,
            stm,
            entries,
            dirty_check,
        }
    }

    /// Transaction this work belongs to
    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    /// Number of tracked references
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing was tracked
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Publish this transaction's writes
    pub fn apply(self) -> CommitOutcome {
        Self::apply_group(vec![self])
    }

    /// Publish several prepared transactions as one unit
    pub fn apply_group(mut commits: Vec<PreparedCommit>) -> CommitOutcome {
        let mut outcome = CommitOutcome::default();
        let Some(stm) = commits.first().map(|c| c.stm.clone()) else {
            return outcome;
        };

        for commit in commits.iter_mut() {
            let owner = commit.txn_id;
            for entry in commit.entries.iter_mut().filter(|e| e.is_write()) {
                if entry.lock_mode == LockMode::Exclusive {
                    continue;
                }
                let upgraded = entry
                    .core
                    .lock_word()
                    .try_acquire(owner, entry.lock_mode, LockMode::Exclusive);
                // The Write lock holder is the only party that can upgrade
                debug_assert!(
                    upgraded.is_ok(),
                    "commit lock upgrade refused to its owner"
                );
                match upgraded {
                    Ok(()) => entry.lock_mode = LockMode::Exclusive,
                    Err(held) => error!(
                        target: "gamma::txn",
                        txn_id = owner.as_u64(),
                        ref_id = entry.ref_id().as_u64(),
                        held = %held,
                        "Commit lock upgrade refused"
                    ),
                }
            }
        }

        let mut changed: Vec<Arc<dyn ErasedRef>> = Vec::new();
        let mut readers_present = false;
        for commit in commits.iter_mut() {
            let dirty_check = commit.dirty_check;
            for entry in commit.entries.iter_mut().filter(|e| e.is_write()) {
                let constructed = entry.mode == AccessMode::Construct;
                let value = entry.value.take();
                let commutes = std::mem::take(&mut entry.commutes);
                if entry.core.publish(value, commutes, constructed, dirty_check) {
                    if entry.core.surplus() > u32::from(entry.has_surplus) {
                        readers_present = true;
                    }
                    changed.push(Arc::clone(&entry.core));
                }
            }
        }

        // Readers must see the counter move before the locks go away
        if readers_present {
            stm.signal_conflict();
        }

        for commit in commits.iter_mut() {
            commit.release_entries();
        }

        outcome.refs_written = changed.len();
        for core in &changed {
            outcome.waiters_woken += core.wake_waiters();
        }
        trace!(
            target: "gamma::txn",
            parties = commits.len(),
            refs_written = outcome.refs_written,
            waiters_woken = outcome.waiters_woken,
            "Commit published"
        );
        outcome
    }

    /// Give up the prepared work, releasing every lock
    pub fn release(mut self) {
        self.release_entries();
    }

    fn release_entries(&mut self) {
        let owner = self.txn_id;
        for mut entry in self.entries.drain(..) {
            entry.release(owner);
        }
    }
}

impl Drop for PreparedCommit {
    fn drop(&mut self) {
        self.release_entries();
    }
}
