//! Transactional references
//!
//! A [`TxnRef<T>`] is a cheap, clonable handle to a shared [`RefCore<T>`]:
//!
//! - `committed`: value and version stored together so an unlocked read
//!   never observes a torn pair
//! - `lock`: the lock word (see [`crate::lock`])
//! - `surplus`: number of live transactions that currently have it open
//! - `waiters`: retry latches of blocked transactions that read it
//!
//! Value and version only change inside the lock-held window of a commit,
//! and the version grows by exactly one per value-changing commit.
//!
//! Transactions track references through the object-safe [`ErasedRef`]
//! trait so a single read set can hold references of different types.

use crate::blocking::{RetryLatch, WaiterList};
use crate::lock::LockWord;
use crate::stm::{next_txn_id, GammaStm};
use crate::transaction::GammaTxn;
use gamma_core::{AccessIntent, LockMode, RefId, StmError, StmResult, TxnId};
use parking_lot::RwLock;
use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_REF_ID: AtomicU64 = AtomicU64::new(1);

/// Values that can live in a transactional reference
///
/// `PartialEq` drives the dirty check: a write that leaves the value
/// unchanged does not bump the version.
pub trait TxnValue: Clone + PartialEq + Send + Sync + 'static {}

impl<T: Clone + PartialEq + Send + Sync + 'static> TxnValue for T {}

/// Deferred update applied at commit time
pub type CommuteFn<T> = Box<dyn FnOnce(T) -> T + Send>;

/// Type-erased buffered value or commute function
pub(crate) type ErasedValue = Box<dyn Any + Send>;

pub(crate) fn downcast_value<T: 'static>(value: ErasedValue) -> Option<T> {
    value.downcast::<T>().ok().map(|boxed| *boxed)
}

struct Committed<T> {
    value: T,
    version: u64,
}

/// Shared state behind a [`TxnRef`]
pub struct RefCore<T> {
    id: RefId,
    stm: GammaStm,
    lock: LockWord,
    surplus: AtomicU32,
    committed: RwLock<Committed<T>>,
    waiters: WaiterList,
}

impl<T: TxnValue> RefCore<T> {
    pub(crate) fn new(stm: GammaStm, value: T) -> Self {
        Self::with_lock(stm, value, LockWord::new())
    }

    /// A reference created inside `owner`, exclusively locked until it commits
    pub(crate) fn constructed(stm: GammaStm, owner: TxnId, value: T) -> Self {
        Self::with_lock(stm, value, LockWord::new_exclusive(owner))
    }

    fn with_lock(stm: GammaStm, value: T, lock: LockWord) -> Self {
        RefCore {
            id: RefId::new(NEXT_REF_ID.fetch_add(1, Ordering::Relaxed)),
            stm,
            lock,
            surplus: AtomicU32::new(0),
            committed: RwLock::new(Committed { value, version: 0 }),
            waiters: WaiterList::default(),
        }
    }

    /// Committed value and version, read as one pair
    pub(crate) fn load(&self) -> (T, u64) {
        let committed = self.committed.read();
        (committed.value.clone(), committed.version)
    }

    /// Load a pair that was not being published by another transaction.
    ///
    /// Spins while another transaction holds the Exclusive lock, and
    /// re-checks the lock after the load.
    pub(crate) fn load_consistent(&self, me: TxnId, spin_count: u32) -> Result<(T, u64), LockMode> {
        for round in 0..=spin_count {
            self.lock.await_not_exclusive(me, spin_count)?;
            let pair = self.load();
            if self.lock.exclusive_by_other(me).is_none() {
                return Ok(pair);
            }
            crate::lock::spin_backoff(round);
        }
        Err(LockMode::Exclusive)
    }
}

/// Object-safe view of a reference used by read sets and commits
pub(crate) trait ErasedRef: Send + Sync {
    fn id(&self) -> RefId;
    fn lock_word(&self) -> &LockWord;
    fn version(&self) -> u64;
    fn surplus(&self) -> u32;
    fn arrive(&self);
    fn depart(&self);
    fn register_waiter(&self, latch: &Arc<RetryLatch>);
    fn wake_waiters(&self) -> usize;

    /// Install a buffered value and/or run deferred commutes.
    ///
    /// Caller must hold the Exclusive lock. Returns `true` if the version
    /// was bumped.
    fn publish(
        &self,
        value: Option<ErasedValue>,
        commutes: Vec<ErasedValue>,
        constructed: bool,
        dirty_check: bool,
    ) -> bool;
}

impl<T: TxnValue> ErasedRef for RefCore<T> {
    fn id(&self) -> RefId {
        self.id
    }

    fn lock_word(&self) -> &LockWord {
        &self.lock
    }

    fn version(&self) -> u64 {
        self.committed.read().version
    }

    fn surplus(&self) -> u32 {
        self.surplus.load(Ordering::SeqCst)
    }

    fn arrive(&self) {
        self.surplus.fetch_add(1, Ordering::SeqCst);
    }

    fn depart(&self) {
        let _ = self
            .surplus
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |x| {
                Some(x.saturating_sub(1))
            });
    }

    fn register_waiter(&self, latch: &Arc<RetryLatch>) {
        self.waiters.register(latch);
    }

    fn wake_waiters(&self) -> usize {
        self.waiters.wake_all()
    }

    fn publish(
        &self,
        value: Option<ErasedValue>,
        commutes: Vec<ErasedValue>,
        constructed: bool,
        dirty_check: bool,
    ) -> bool {
        let mut committed = self.committed.write();
        let mut next = match value.and_then(downcast_value::<T>) {
            Some(v) => v,
            None => committed.value.clone(),
        };
        for function in commutes {
            if let Some(function) = downcast_value::<CommuteFn<T>>(function) {
                next = function(next);
            }
        }
        if !constructed && dirty_check && next == committed.value {
            return false;
        }
        committed.value = next;
        committed.version += 1;
        true
    }
}

/// Handle to a transactional memory cell
///
/// Transactional operations take the running transaction as an explicit
/// argument:
///
/// ```ignore
/// let balance = stm.new_ref(10u64);
/// executor.atomic(|tx| {
///     let v = balance.get(tx)?;
///     balance.set(tx, v + 1)
/// })?;
/// ```
pub struct TxnRef<T> {
    pub(crate) core: Arc<RefCore<T>>,
}

impl<T> Clone for TxnRef<T> {
    fn clone(&self) -> Self {
        TxnRef {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T: TxnValue> TxnRef<T> {
    pub(crate) fn from_core(core: Arc<RefCore<T>>) -> Self {
        TxnRef { core }
    }

    /// Create a reference inside `tx`; it becomes visible when `tx` commits
    ///
    /// # Errors
    ///
    /// Same as [`GammaTxn::new_ref`].
    pub fn new_in(tx: &mut GammaTxn, value: T) -> StmResult<Self> {
        tx.new_ref(value)
    }

    // === Introspection ===

    /// Identity of this reference
    pub fn id(&self) -> RefId {
        self.core.id
    }

    /// Current committed version
    pub fn version(&self) -> u64 {
        ErasedRef::version(&*self.core)
    }

    /// Number of live transactions that have this reference open
    pub fn surplus(&self) -> u32 {
        ErasedRef::surplus(&*self.core)
    }

    /// Current lock mode
    pub fn lock_mode(&self) -> LockMode {
        self.core.lock.mode()
    }

    /// Owner of a Write or Exclusive lock
    pub fn lock_owner(&self) -> Option<TxnId> {
        self.core.lock.owner()
    }

    /// Number of blocked transactions waiting for this reference to change
    pub fn waiter_count(&self) -> usize {
        self.core.waiters.len()
    }

    // === Transactional operations ===

    /// Track this reference in `tx` without returning the value
    pub fn open(&self, tx: &mut GammaTxn, intent: AccessIntent) -> StmResult<()> {
        tx.open(&self.core, intent, LockMode::None).map(|_| ())
    }

    /// Read the value as seen by `tx` (including its own writes)
    pub fn get(&self, tx: &mut GammaTxn) -> StmResult<T> {
        tx.read(&self.core, LockMode::None)
    }

    /// Buffer a new value in `tx`
    pub fn set(&self, tx: &mut GammaTxn, value: T) -> StmResult<()> {
        tx.write(&self.core, value)
    }

    /// Buffer a new value and return the previous one
    pub fn get_and_set(&self, tx: &mut GammaTxn, value: T) -> StmResult<T> {
        let old = tx.read(&self.core, LockMode::None)?;
        tx.write(&self.core, value)?;
        Ok(old)
    }

    /// Apply `f` and return the new value
    pub fn alter_and_get<F>(&self, tx: &mut GammaTxn, f: F) -> StmResult<T>
    where
        F: FnOnce(&T) -> T,
    {
        let old = tx.read(&self.core, LockMode::None)?;
        let new = f(&old);
        tx.write(&self.core, new.clone())?;
        Ok(new)
    }

    /// Apply `f` and return the old value
    pub fn get_and_alter<F>(&self, tx: &mut GammaTxn, f: F) -> StmResult<T>
    where
        F: FnOnce(&T) -> T,
    {
        let old = tx.read(&self.core, LockMode::None)?;
        tx.write(&self.core, f(&old))?;
        Ok(old)
    }

    /// Defer `f` until commit without reading the current value.
    ///
    /// If the reference is already open in `tx`, `f` is applied right away.
    pub fn commute<F>(&self, tx: &mut GammaTxn, f: F) -> StmResult<()>
    where
        F: FnOnce(T) -> T + Send + 'static,
    {
        tx.commute(&self.core, Box::new(f))
    }

    /// Return the value once `predicate` holds, otherwise block-retry
    pub fn await_value<P>(&self, tx: &mut GammaTxn, predicate: P) -> StmResult<T>
    where
        P: FnOnce(&T) -> bool,
    {
        let value = tx.read(&self.core, LockMode::None)?;
        if predicate(&value) {
            Ok(value)
        } else {
            tx.retry()
        }
    }

    /// Open this reference and hold `mode` on it until `tx` completes
    pub fn acquire_lock(&self, tx: &mut GammaTxn, mode: LockMode) -> StmResult<()> {
        tx.acquire_lock(&self.core, mode)
    }

    // === Atomic operations outside transactions ===

    /// Read the committed value without a transaction
    pub fn atomic_get(&self) -> StmResult<T> {
        let me = next_txn_id();
        let spin_count = self.core.stm.default_config().spin_count;
        self.core
            .load_consistent(me, spin_count)
            .map(|(value, _)| value)
            .map_err(|mode| StmError::ReadWriteConflict {
                ref_id: self.id(),
                reason: gamma_core::ConflictReason::LockedByOther { mode },
            })
    }

    /// Commit `value` as a single-reference transaction
    pub fn atomic_set(&self, value: T) -> StmResult<()> {
        self.atomic_alter_and_get(|_| value).map(|_| ())
    }

    /// Commit `f(current)` as a single-reference transaction and return it
    pub fn atomic_alter_and_get<F>(&self, f: F) -> StmResult<T>
    where
        F: FnOnce(&T) -> T,
    {
        let me = next_txn_id();
        let stm = &self.core.stm;
        let config = stm.default_config();
        self.core
            .lock
            .acquire(me, LockMode::None, LockMode::Exclusive, config.spin_count)
            .map_err(|held| StmError::LockNotFree {
                ref_id: self.id(),
                requested: LockMode::Exclusive,
                held,
            })?;

        let (changed, next) = {
            let mut committed = self.core.committed.write();
            let next = f(&committed.value);
            if config.dirty_check && next == committed.value {
                (false, next)
            } else {
                committed.value = next.clone();
                committed.version += 1;
                (true, next)
            }
        };
        if changed && ErasedRef::surplus(&*self.core) > 0 {
            stm.signal_conflict();
        }
        self.core.lock.release(me, LockMode::Exclusive);
        if changed {
            self.core.waiters.wake_all();
        }
        Ok(next)
    }
}

impl<T> PartialEq for TxnRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.core.id == other.core.id
    }
}

impl<T> Eq for TxnRef<T> {}

impl<T> Hash for TxnRef<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.core.id.hash(state);
    }
}

impl<T: TxnValue + fmt::Debug> fmt::Debug for TxnRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (value, version) = self.core.load();
        f.debug_struct("TxnRef")
            .field("id", &self.core.id)
            .field("version", &version)
            .field("value", &value)
            .field("lock", &self.core.lock.mode())
            .finish()
    }
}
