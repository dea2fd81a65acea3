//! Gamma transactions
//!
//! A [`GammaTxn`] is one attempt at running a block atomically. It buffers
//! everything it reads and writes in a [`TranlocalSet`] and only touches
//! shared references during commit.
//!
//! # Lifecycle
//!
//! ```text
//! Active ──prepare()──> Prepared ──commit()──> Committed
//!   │                      │
//!   └──────abort()─────────┴──────────────────> Aborted
//! ```
//!
//! - Operations on a Prepared transaction abort it and fail with
//!   `PreparedTransaction`.
//! - Operations on a Committed or Aborted transaction fail with
//!   `DeadTransaction` and leave the status unchanged.
//! - `commit()` on an Active transaction prepares implicitly.
//!
//! # Variants
//!
//! The [`TxnKind`] fixes the capacity of the read/write set and whether fat
//! features (commute, explicit locks, listeners, construction, timeouts)
//! are available. Asking a variant for something it lacks aborts the
//! transaction with `SpeculativeConfigurationFailure`, which tells the
//! executor which richer variant to run next.
//!
//! # Read consistency
//!
//! Every open after the first compares the global conflict counter with the
//! snapshot taken at the previous check; if it moved, the whole read set is
//! revalidated before the new value is handed out. An attempt therefore
//! never computes on a mix of old and new values.

use crate::blocking::RetryLatch;
use crate::commit::PreparedCommit;
use crate::reference::{
    downcast_value, CommuteFn, ErasedRef, ErasedValue, RefCore, TxnRef, TxnValue,
};
use crate::stm::{next_txn_id, GammaStm};
use crate::tranlocal::{AccessMode, Tranlocal, TranlocalSet};
use crate::validation::{validate_entries, ValidationScope};
use gamma_core::{
    AccessIntent, Capability, ConflictReason, LockMode, RefId, StmError, StmResult, TxnConfig,
    TxnEvent, TxnId, TxnKind, TxnStatus,
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Callback notified of transaction lifecycle events
///
/// Only fat variants accept listeners.
pub trait TxnListener: Send {
    /// Called for every event of the transaction it is registered on
    fn notify(&mut self, txn_id: TxnId, event: TxnEvent);
}

impl<F> TxnListener for F
where
    F: FnMut(TxnId, TxnEvent) + Send,
{
    fn notify(&mut self, txn_id: TxnId, event: TxnEvent) {
        self(txn_id, event)
    }
}

/// One attempt at executing a transactional block
pub struct GammaTxn {
    id: TxnId,
    stm: GammaStm,
    kind: TxnKind,
    config: Arc<TxnConfig>,
    status: TxnStatus,
    /// 1-based attempt number within the executor's retry loop
    attempt: u32,
    remaining_timeout: Option<Duration>,
    entries: TranlocalSet,
    listeners: Vec<Box<dyn TxnListener>>,
    local_conflict_count: u64,
    retry_latch: Option<Arc<RetryLatch>>,
}

fn conflict(ref_id: RefId, reason: ConflictReason) -> StmError {
    StmError::ReadWriteConflict { ref_id, reason }
}

impl GammaTxn {
    pub(crate) fn new(stm: GammaStm, config: Arc<TxnConfig>, kind: TxnKind) -> Self {
        let id = next_txn_id();
        stm.record_start();
        debug!(
            target: "gamma::txn",
            txn_id = id.as_u64(),
            kind = %kind,
            family = %config.family_name,
            "Transaction started"
        );
        let entries = TranlocalSet::for_kind(kind, config.max_fixed_length);
        let remaining_timeout = config.timeout();
        let local_conflict_count = stm.conflict_count();
        GammaTxn {
            id,
            stm,
            kind,
            config,
            status: TxnStatus::Active,
            attempt: 1,
            remaining_timeout,
            entries,
            listeners: Vec::new(),
            local_conflict_count,
            retry_latch: None,
        }
    }

    // === Introspection ===

    /// Transaction id
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Representation variant
    pub fn kind(&self) -> TxnKind {
        self.kind
    }

    /// Current status
    pub fn status(&self) -> TxnStatus {
        self.status
    }

    /// Whether the transaction accepts operations
    pub fn is_active(&self) -> bool {
        self.status == TxnStatus::Active
    }

    /// Configuration this transaction runs with
    pub fn config(&self) -> &Arc<TxnConfig> {
        &self.config
    }

    /// STM this transaction belongs to
    pub fn stm(&self) -> &GammaStm {
        &self.stm
    }

    /// 1-based attempt number
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Set the attempt number (used by executors when restarting a block)
    pub fn set_attempt(&mut self, attempt: u32) {
        self.attempt = attempt;
    }

    /// Blocking budget left for this logical transaction
    pub fn remaining_timeout(&self) -> Option<Duration> {
        self.remaining_timeout
    }

    /// Carry the blocking budget over from a previous attempt
    pub fn set_remaining_timeout(&mut self, remaining: Option<Duration>) {
        self.remaining_timeout = remaining;
    }

    /// Number of references tracked in any mode
    pub fn tracked_count(&self) -> usize {
        self.entries.len()
    }

    /// Whether `id` is tracked by this transaction
    pub fn is_tracked(&self, id: RefId) -> bool {
        self.entries.find(id).is_some()
    }

    fn count_mode(&self, mode: AccessMode) -> usize {
        self.entries.iter().filter(|e| e.mode == mode).count()
    }

    /// References opened for read only
    pub fn read_count(&self) -> usize {
        self.count_mode(AccessMode::Read)
    }

    /// References with a buffered write
    pub fn write_count(&self) -> usize {
        self.count_mode(AccessMode::Write)
    }

    /// References with only deferred commutes
    pub fn commute_count(&self) -> usize {
        self.count_mode(AccessMode::Commute)
    }

    /// References created by this transaction
    pub fn constructed_count(&self) -> usize {
        self.count_mode(AccessMode::Construct)
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    // === State checks ===

    fn ensure_active(&mut self) -> StmResult<()> {
        match self.status {
            TxnStatus::Active => Ok(()),
            TxnStatus::Prepared => {
                self.abort_internal();
                Err(StmError::PreparedTransaction { txn_id: self.id })
            }
            status => Err(StmError::DeadTransaction {
                txn_id: self.id,
                status,
            }),
        }
    }

    /// Abort (if still alive) and hand back `err`
    fn fail(&mut self, err: StmError) -> StmError {
        if self.status.is_alive() {
            trace!(target: "gamma::txn", txn_id = self.id.as_u64(), error = %err, "Attempt failed");
            self.abort_internal();
        }
        err
    }

    fn require(&mut self, capability: Capability) -> StmResult<()> {
        if self.kind.supports(capability, self.config.max_fixed_length) {
            return Ok(());
        }
        Err(self.fail(StmError::SpeculativeConfigurationFailure {
            kind: self.kind,
            capability,
        }))
    }

    /// Revalidate the read set if another commit may have invalidated it
    fn check_consistency(&mut self) -> StmResult<()> {
        let current = self.stm.conflict_count();
        if current == self.local_conflict_count {
            return Ok(());
        }
        validate_entries(self.entries.iter(), self.id, ValidationScope::Open).into_result()?;
        self.local_conflict_count = current;
        Ok(())
    }

    // === Opening references ===

    /// Track `core` with the given intent and lock, returning its slot
    pub(crate) fn open<T: TxnValue>(
        &mut self,
        core: &Arc<RefCore<T>>,
        intent: AccessIntent,
        explicit: LockMode,
    ) -> StmResult<usize> {
        self.ensure_active()?;
        let configured = match intent {
            AccessIntent::Read => self.config.read_lock_mode,
            AccessIntent::Write => self.config.write_lock_mode,
        };
        if configured != LockMode::None {
            self.require(Capability::PessimisticLockMode)?;
        }
        if explicit != LockMode::None {
            self.require(Capability::ExplicitLocking)?;
        }
        let lock = configured.max(explicit);
        let ref_id = core.id();

        if let Some(index) = self.entries.find(ref_id) {
            self.reopen(index, core, intent, lock)?;
            return Ok(index);
        }

        let required = self.entries.len() + 1;
        self.require(Capability::Capacity { required })?;

        core.arrive();
        let (value, version) = match core.load_consistent(self.id, self.config.spin_count) {
            Ok(pair) => pair,
            Err(mode) => {
                core.depart();
                return Err(self.fail(conflict(ref_id, ConflictReason::LockedByOther { mode })));
            }
        };
        let mode = match intent {
            AccessIntent::Read => AccessMode::Read,
            AccessIntent::Write => AccessMode::Write,
        };
        let erased: Arc<dyn ErasedRef> = core.clone();
        let mut entry = Tranlocal::opened(erased, mode, version, Box::new(value));

        if lock != LockMode::None {
            if let Err(held) =
                core.lock_word()
                    .acquire(self.id, LockMode::None, lock, self.config.spin_count)
            {
                entry.release(self.id);
                return Err(self.fail(StmError::LockNotFree {
                    ref_id,
                    requested: lock,
                    held,
                }));
            }
            entry.lock_mode = lock;
            let current_version = core.version();
            if current_version != version {
                entry.release(self.id);
                return Err(self.fail(conflict(
                    ref_id,
                    ConflictReason::VersionChanged {
                        read_version: version,
                        current_version,
                    },
                )));
            }
        }

        if let Err(err) = self.check_consistency() {
            entry.release(self.id);
            return Err(self.fail(err));
        }

        match self.entries.insert(entry) {
            Ok(index) => Ok(index),
            Err(mut entry) => {
                entry.release(self.id);
                Err(self.fail(StmError::SpeculativeConfigurationFailure {
                    kind: self.kind,
                    capability: Capability::Capacity { required },
                }))
            }
        }
    }

    fn reopen<T: TxnValue>(
        &mut self,
        index: usize,
        core: &Arc<RefCore<T>>,
        intent: AccessIntent,
        lock: LockMode,
    ) -> StmResult<()> {
        let Some(mode) = self.entries.get(index).map(|e| e.mode) else {
            return Ok(());
        };
        match (mode, intent) {
            (AccessMode::Commute, _) => self.fixate(index, core)?,
            (AccessMode::Read, AccessIntent::Write) => {
                if let Some(entry) = self.entries.get_mut(index) {
                    entry.mode = AccessMode::Write;
                }
            }
            _ => {}
        }

        let owner = self.id;
        let spin_count = self.config.spin_count;
        let Some(entry) = self.entries.get_mut(index) else {
            return Ok(());
        };
        if lock <= entry.lock_mode {
            return Ok(());
        }
        let ref_id = entry.ref_id();
        let acquired = entry
            .core
            .lock_word()
            .acquire(owner, entry.lock_mode, lock, spin_count);
        match acquired {
            Ok(()) => {
                entry.lock_mode = lock;
                let current_version = entry.core.version();
                let read_version = entry.read_version;
                if current_version != read_version {
                    return Err(self.fail(conflict(
                        ref_id,
                        ConflictReason::VersionChanged {
                            read_version,
                            current_version,
                        },
                    )));
                }
                Ok(())
            }
            Err(held) => Err(self.fail(StmError::LockNotFree {
                ref_id,
                requested: lock,
                held,
            })),
        }
    }

    /// Turn a commuting entry into a regular write by reading the
    /// committed value and applying the pending functions to it
    fn fixate<T: TxnValue>(&mut self, index: usize, core: &Arc<RefCore<T>>) -> StmResult<()> {
        let ref_id = core.id();
        core.arrive();
        let (value, version) = match core.load_consistent(self.id, self.config.spin_count) {
            Ok(pair) => pair,
            Err(mode) => {
                core.depart();
                return Err(self.fail(conflict(ref_id, ConflictReason::LockedByOther { mode })));
            }
        };
        let Some(entry) = self.entries.get_mut(index) else {
            core.depart();
            return Ok(());
        };
        let mut next = value;
        for function in std::mem::take(&mut entry.commutes) {
            if let Some(function) = downcast_value::<CommuteFn<T>>(function) {
                next = function(next);
            }
        }
        entry.mode = AccessMode::Write;
        entry.read_version = version;
        entry.has_surplus = true;
        entry.value = Some(Box::new(next));

        if let Err(err) = self.check_consistency() {
            return Err(self.fail(err));
        }
        Ok(())
    }

    pub(crate) fn read<T: TxnValue>(
        &mut self,
        core: &Arc<RefCore<T>>,
        lock: LockMode,
    ) -> StmResult<T> {
        let index = self.open(core, AccessIntent::Read, lock)?;
        match self.entries.get(index).and_then(|e| e.value_ref::<T>()) {
            Some(value) => Ok(value.clone()),
            None => Ok(core.load().0),
        }
    }

    pub(crate) fn write<T: TxnValue>(&mut self, core: &Arc<RefCore<T>>, value: T) -> StmResult<()> {
        let index = self.open(core, AccessIntent::Write, LockMode::None)?;
        if let Some(entry) = self.entries.get_mut(index) {
            entry.value = Some(Box::new(value));
        }
        Ok(())
    }

    pub(crate) fn commute<T: TxnValue>(
        &mut self,
        core: &Arc<RefCore<T>>,
        function: CommuteFn<T>,
    ) -> StmResult<()> {
        self.ensure_active()?;
        self.require(Capability::Commute)?;

        if let Some(index) = self.entries.find(core.id()) {
            if let Some(entry) = self.entries.get_mut(index) {
                if entry.mode == AccessMode::Commute {
                    let erased: ErasedValue = Box::new(function);
                    entry.commutes.push(erased);
                } else {
                    // Already open: no reason to defer
                    let current = match entry.value_ref::<T>() {
                        Some(value) => value.clone(),
                        None => core.load().0,
                    };
                    entry.value = Some(Box::new(function(current)));
                    if entry.mode == AccessMode::Read {
                        entry.mode = AccessMode::Write;
                    }
                }
            }
            return Ok(());
        }

        let required = self.entries.len() + 1;
        self.require(Capability::Capacity { required })?;
        let erased_ref: Arc<dyn ErasedRef> = core.clone();
        let erased_fn: ErasedValue = Box::new(function);
        if self
            .entries
            .insert(Tranlocal::commuting(erased_ref, erased_fn))
            .is_err()
        {
            return Err(self.fail(StmError::SpeculativeConfigurationFailure {
                kind: self.kind,
                capability: Capability::Capacity { required },
            }));
        }
        Ok(())
    }

    pub(crate) fn acquire_lock<T: TxnValue>(
        &mut self,
        core: &Arc<RefCore<T>>,
        mode: LockMode,
    ) -> StmResult<()> {
        self.open(core, AccessIntent::Read, mode).map(|_| ())
    }

    /// Create a reference that becomes visible when this transaction
    /// commits (at version 1).
    ///
    /// Until then it is exclusively locked by this transaction; if the
    /// transaction aborts the lock is released and the reference stays at
    /// version 0.
    ///
    /// # Errors
    ///
    /// - `SpeculativeConfigurationFailure` on lean variants or a full set
    /// - `DeadTransaction` / `PreparedTransaction` if not active
    pub fn new_ref<T: TxnValue>(&mut self, value: T) -> StmResult<TxnRef<T>> {
        self.ensure_active()?;
        self.require(Capability::Construction)?;
        let required = self.entries.len() + 1;
        self.require(Capability::Capacity { required })?;

        let core = Arc::new(RefCore::constructed(
            self.stm.clone(),
            self.id,
            value.clone(),
        ));
        let erased: Arc<dyn ErasedRef> = core.clone();
        if let Err(mut entry) = self
            .entries
            .insert(Tranlocal::constructed(erased, Box::new(value)))
        {
            entry.release(self.id);
            return Err(self.fail(StmError::SpeculativeConfigurationFailure {
                kind: self.kind,
                capability: Capability::Capacity { required },
            }));
        }
        Ok(TxnRef::from_core(core))
    }

    /// Register a lifecycle listener (fat variants only)
    pub fn register<L>(&mut self, listener: L) -> StmResult<()>
    where
        L: TxnListener + 'static,
    {
        self.ensure_active()?;
        self.require(Capability::Listeners)?;
        self.listeners.push(Box::new(listener));
        Ok(())
    }

    fn notify(&mut self, event: TxnEvent) {
        let id = self.id;
        for listener in self.listeners.iter_mut() {
            listener.notify(id, event);
        }
    }

    // === Blocking ===

    /// Give up this attempt until something it read changes.
    ///
    /// Registers a latch on every read or written reference, aborts the
    /// attempt and returns `Err(Retry)`. The executor waits on the latch
    /// (see [`GammaTxn::take_retry_latch`]) and then runs the block again.
    ///
    /// # Errors
    ///
    /// - `RetryNotAllowed` if blocking is disabled
    /// - `RetryNotPossible` if nothing tracked could ever change
    /// - `SpeculativeConfigurationFailure` on a lean variant with a timeout
    /// - `Retry` otherwise
    pub fn retry<T>(&mut self) -> StmResult<T> {
        self.ensure_active()?;
        if !self.config.blocking_allowed {
            return Err(self.fail(StmError::RetryNotAllowed));
        }
        if !self.entries.iter().any(Tranlocal::is_watchable) {
            return Err(self.fail(StmError::RetryNotPossible));
        }
        if self.config.timeout_ns.is_some() {
            self.require(Capability::Timeout)?;
        }

        let latch = RetryLatch::new();
        for entry in self.entries.iter().filter(|e| e.is_watchable()) {
            entry.core.register_waiter(&latch);
            // Change that slipped in before registration
            if entry.core.version() != entry.read_version {
                latch.open();
            }
        }
        trace!(
            target: "gamma::txn",
            txn_id = self.id.as_u64(),
            watched = self.read_count() + self.write_count(),
            "Retry requested"
        );
        self.retry_latch = Some(latch);
        self.abort_internal();
        Err(StmError::Retry)
    }

    /// Latch registered by the last `retry()`
    pub fn take_retry_latch(&mut self) -> Option<Arc<RetryLatch>> {
        self.retry_latch.take()
    }

    // === Commit protocol ===

    /// Lock the write set in ref-id order and validate the read set.
    ///
    /// Calling `prepare()` on a Prepared transaction is a no-op.
    ///
    /// # Errors
    ///
    /// - `ReadWriteConflict` if a lock cannot be taken or a read is stale
    ///   (the transaction is aborted)
    /// - `DeadTransaction` if already committed or aborted
    pub fn prepare(&mut self) -> StmResult<()> {
        match self.status {
            TxnStatus::Prepared => return Ok(()),
            TxnStatus::Active => {}
            status => {
                return Err(StmError::DeadTransaction {
                    txn_id: self.id,
                    status,
                })
            }
        }
        self.notify(TxnEvent::PrePrepare);

        let owner = self.id;
        let spin_count = self.config.spin_count;
        for index in self.entries.lock_order() {
            let Some(entry) = self.entries.get_mut(index) else {
                continue;
            };
            if !entry.is_write() || entry.lock_mode >= LockMode::Write {
                continue;
            }
            let acquired =
                entry
                    .core
                    .lock_word()
                    .acquire(owner, entry.lock_mode, LockMode::Write, spin_count);
            match acquired {
                Ok(()) => entry.lock_mode = LockMode::Write,
                Err(held) => {
                    let ref_id = entry.ref_id();
                    debug!(
                        target: "gamma::txn",
                        txn_id = owner.as_u64(),
                        ref_id = ref_id.as_u64(),
                        held = %held,
                        "Commit lock not acquired"
                    );
                    return Err(self.fail(conflict(
                        ref_id,
                        ConflictReason::LockContended {
                            requested: LockMode::Write,
                        },
                    )));
                }
            }
        }

        let result = validate_entries(self.entries.iter(), owner, ValidationScope::Prepare);
        if !result.is_valid() {
            debug!(
                target: "gamma::txn",
                txn_id = owner.as_u64(),
                conflicts = result.conflict_count(),
                first_ref = ?result.conflicts.first().map(|c| c.ref_id().as_u64()),
                "Validation failed"
            );
        }
        if let Err(err) = result.into_result() {
            return Err(self.fail(err));
        }
        self.status = TxnStatus::Prepared;
        Ok(())
    }

    /// Publish this transaction's writes.
    ///
    /// Prepares first when still Active. Committing a Committed transaction
    /// is a no-op.
    ///
    /// # Errors
    ///
    /// - `ReadWriteConflict` from the implicit prepare
    /// - `DeadTransaction` if aborted
    pub fn commit(&mut self) -> StmResult<()> {
        match self.status {
            TxnStatus::Committed => return Ok(()),
            TxnStatus::Aborted => {
                return Err(StmError::DeadTransaction {
                    txn_id: self.id,
                    status: TxnStatus::Aborted,
                })
            }
            TxnStatus::Active => self.prepare()?,
            TxnStatus::Prepared => {}
        }
        let outcome = self.detach().apply();
        trace!(
            target: "gamma::txn",
            txn_id = self.id.as_u64(),
            refs_written = outcome.refs_written,
            "Writes published"
        );
        self.mark_committed();
        Ok(())
    }

    fn detach(&mut self) -> PreparedCommit {
        PreparedCommit::new(
            self.id,
            self.stm.clone(),
            self.entries.take_all(),
            self.config.dirty_check,
        )
    }

    /// Prepare (if needed) and move the locked work out of this transaction.
    ///
    /// The transaction stays Prepared; finish it with
    /// [`GammaTxn::mark_committed`] once the work was applied, or
    /// [`GammaTxn::mark_aborted`] once it was released.
    pub fn take_prepared_commit(&mut self) -> StmResult<PreparedCommit> {
        match self.status {
            TxnStatus::Active => self.prepare()?,
            TxnStatus::Prepared => {}
            status => {
                return Err(StmError::DeadTransaction {
                    txn_id: self.id,
                    status,
                })
            }
        }
        Ok(self.detach())
    }

    /// Finish a Prepared transaction whose work has been applied
    pub fn mark_committed(&mut self) {
        if self.status != TxnStatus::Prepared {
            return;
        }
        self.release_all();
        self.status = TxnStatus::Committed;
        self.stm.record_commit();
        debug!(
            target: "gamma::txn",
            txn_id = self.id.as_u64(),
            attempt = self.attempt,
            "Transaction committed"
        );
        self.notify(TxnEvent::PostCommit);
    }

    /// Finish a live transaction as aborted
    pub fn mark_aborted(&mut self) {
        self.abort_internal();
    }

    /// Discard this attempt, releasing every lock it holds.
    ///
    /// Aborting an Aborted transaction is a no-op.
    ///
    /// # Errors
    ///
    /// `DeadTransaction` if the transaction already committed.
    pub fn abort(&mut self) -> StmResult<()> {
        match self.status {
            TxnStatus::Aborted => Ok(()),
            TxnStatus::Committed => Err(StmError::DeadTransaction {
                txn_id: self.id,
                status: TxnStatus::Committed,
            }),
            TxnStatus::Active | TxnStatus::Prepared => {
                self.abort_internal();
                Ok(())
            }
        }
    }

    fn abort_internal(&mut self) {
        if !self.status.is_alive() {
            return;
        }
        self.release_all();
        self.status = TxnStatus::Aborted;
        self.stm.record_abort();
        debug!(
            target: "gamma::txn",
            txn_id = self.id.as_u64(),
            attempt = self.attempt,
            "Transaction aborted"
        );
        self.notify(TxnEvent::PostAbort);
    }

    fn release_all(&mut self) {
        let owner = self.id;
        for mut entry in self.entries.take_all() {
            entry.release(owner);
        }
    }
}

impl Drop for GammaTxn {
    fn drop(&mut self) {
        self.abort_internal();
    }
}

impl fmt::Debug for GammaTxn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GammaTxn")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("status", &self.status)
            .field("attempt", &self.attempt)
            .field("entries", &self.entries)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
