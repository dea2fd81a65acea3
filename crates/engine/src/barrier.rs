//! Commit barrier
//!
//! A [`CommitBarrier`] makes several independent transactions commit
//! together. Each party prepares its transaction and hands the locked work
//! to the barrier; the last expected party publishes all of it as one
//! group while every lock is still held, so no other transaction can
//! observe a partial outcome.
//!
//! ```text
//! Closed ──last party joins / count_down()──> Committed
//!   │
//!   └──abort() / a party fails to prepare──> Aborted
//! ```
//!
//! Waiting parties block on a condition variable until the barrier
//! resolves. There is no interrupt: only resolution ends the wait.

use gamma_concurrency::{GammaTxn, PreparedCommit};
use gamma_core::{BarrierState, StmError, StmResult, TxnStatus};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

type Task = Box<dyn FnOnce() + Send>;

struct BarrierInner {
    state: BarrierState,
    parties: usize,
    number_waiting: usize,
    pending: Vec<PreparedCommit>,
    on_commit: Vec<Task>,
    on_abort: Vec<Task>,
}

/// Joins the commits of several transactions into one atomic step
pub struct CommitBarrier {
    inner: Mutex<BarrierInner>,
    resolved: Condvar,
}

impl CommitBarrier {
    /// Barrier that commits once `parties` transactions have joined.
    ///
    /// A barrier with zero parties starts Committed.
    pub fn new(parties: usize) -> Self {
        let state = if parties == 0 {
            BarrierState::Committed
        } else {
            BarrierState::Closed
        };
        CommitBarrier {
            inner: Mutex::new(BarrierInner {
                state,
                parties,
                number_waiting: 0,
                pending: Vec::new(),
                on_commit: Vec::new(),
                on_abort: Vec::new(),
            }),
            resolved: Condvar::new(),
        }
    }

    /// Current state
    pub fn state(&self) -> BarrierState {
        self.inner.lock().state
    }

    /// Whether parties can still join
    pub fn is_closed(&self) -> bool {
        self.state() == BarrierState::Closed
    }

    /// Whether the barrier committed
    pub fn is_committed(&self) -> bool {
        self.state() == BarrierState::Committed
    }

    /// Whether the barrier aborted
    pub fn is_aborted(&self) -> bool {
        self.state() == BarrierState::Aborted
    }

    /// Parties that joined and are waiting
    pub fn number_waiting(&self) -> usize {
        self.inner.lock().number_waiting
    }

    /// Parties still required for the barrier to commit
    pub fn parties(&self) -> usize {
        self.inner.lock().parties
    }

    /// Run `task` once the barrier commits (immediately if it already has)
    pub fn register_on_commit<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut inner = self.inner.lock();
        match inner.state {
            BarrierState::Closed => inner.on_commit.push(Box::new(task)),
            BarrierState::Committed => {
                drop(inner);
                task();
            }
            BarrierState::Aborted => {}
        }
    }

    /// Run `task` once the barrier aborts (immediately if it already has)
    pub fn register_on_abort<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut inner = self.inner.lock();
        match inner.state {
            BarrierState::Closed => inner.on_abort.push(Box::new(task)),
            BarrierState::Aborted => {
                drop(inner);
                task();
            }
            BarrierState::Committed => {}
        }
    }

    /// Prepare `tx` and wait until every party has joined.
    ///
    /// The last party to join commits the whole group. Returns once `tx`
    /// is Committed.
    ///
    /// # Errors
    ///
    /// - `CommitBarrierResolved` if the barrier already committed or aborted
    ///   (`tx` is aborted)
    /// - `DeadTransaction` / `PreparedTransaction` if `tx` is not active
    ///   (the barrier is untouched)
    /// - the prepare error, after aborting the barrier
    /// - `CommitBarrierAborted` if the barrier aborts while waiting
    pub fn join_commit(&self, tx: &mut GammaTxn) -> StmResult<()> {
        let state = self.state();
        if state != BarrierState::Closed {
            // Only a Committed tx refuses abort, and the caller learns the
            // barrier state either way
            tx.abort().ok();
            return Err(StmError::CommitBarrierResolved { state });
        }
        match tx.status() {
            TxnStatus::Active => {}
            TxnStatus::Prepared => {
                return Err(StmError::PreparedTransaction { txn_id: tx.id() });
            }
            status => {
                return Err(StmError::DeadTransaction {
                    txn_id: tx.id(),
                    status,
                })
            }
        }

        if let Err(err) = tx.prepare() {
            debug!(
                target: "gamma::barrier",
                txn_id = tx.id().as_u64(),
                error = %err,
                "Party failed to prepare"
            );
            // Fails only if another party already committed the barrier;
            // the prepare error is what this party reports
            self.abort().ok();
            return Err(err);
        }
        let work = tx.take_prepared_commit()?;

        let mut inner = self.inner.lock();
        if inner.state != BarrierState::Closed {
            let state = inner.state;
            drop(inner);
            work.release();
            tx.mark_aborted();
            return Err(StmError::CommitBarrierResolved { state });
        }

        inner.pending.push(work);
        inner.number_waiting += 1;
        trace!(
            target: "gamma::barrier",
            txn_id = tx.id().as_u64(),
            waiting = inner.number_waiting,
            parties = inner.parties,
            "Party joined"
        );

        if inner.number_waiting >= inner.parties {
            let tasks = self.commit_locked(&mut inner);
            drop(inner);
            tx.mark_committed();
            run_tasks(tasks);
            return Ok(());
        }

        while inner.state == BarrierState::Closed {
            self.resolved.wait(&mut inner);
        }
        let state = inner.state;
        drop(inner);

        match state {
            BarrierState::Committed => {
                tx.mark_committed();
                Ok(())
            }
            _ => {
                tx.mark_aborted();
                Err(StmError::CommitBarrierAborted)
            }
        }
    }

    /// Lower the number of required parties by one.
    ///
    /// Commits the waiting parties if they now suffice. Ignored once the
    /// barrier resolved.
    pub fn count_down(&self) {
        let mut inner = self.inner.lock();
        if inner.state != BarrierState::Closed {
            return;
        }
        inner.parties = inner.parties.saturating_sub(1);
        if inner.number_waiting >= inner.parties {
            let tasks = self.commit_locked(&mut inner);
            drop(inner);
            run_tasks(tasks);
        }
    }

    /// Abort the barrier, releasing every waiting party's locks.
    ///
    /// Aborting an Aborted barrier is a no-op.
    ///
    /// # Errors
    ///
    /// `CommitBarrierResolved` if the barrier already committed.
    pub fn abort(&self) -> StmResult<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            BarrierState::Aborted => return Ok(()),
            BarrierState::Committed => {
                return Err(StmError::CommitBarrierResolved {
                    state: BarrierState::Committed,
                })
            }
            BarrierState::Closed => {}
        }
        inner.state = BarrierState::Aborted;
        let pending = std::mem::take(&mut inner.pending);
        let tasks = std::mem::take(&mut inner.on_abort);
        inner.on_commit.clear();
        debug!(
            target: "gamma::barrier",
            released = pending.len(),
            "Barrier aborted"
        );
        for work in pending {
            work.release();
        }
        self.resolved.notify_all();
        drop(inner);
        run_tasks(tasks);
        Ok(())
    }

    /// Publish all pending work; caller holds the mutex
    fn commit_locked(&self, inner: &mut BarrierInner) -> Vec<Task> {
        let pending = std::mem::take(&mut inner.pending);
        let outcome = PreparedCommit::apply_group(pending);
        inner.state = BarrierState::Committed;
        inner.on_abort.clear();
        debug!(
            target: "gamma::barrier",
            parties = inner.number_waiting,
            refs_written = outcome.refs_written,
            "Barrier committed"
        );
        self.resolved.notify_all();
        std::mem::take(&mut inner.on_commit)
    }
}

fn run_tasks(tasks: Vec<Task>) {
    for task in tasks {
        task();
    }
}

impl std::fmt::Debug for CommitBarrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CommitBarrier")
            .field("state", &inner.state)
            .field("parties", &inner.parties)
            .field("number_waiting", &inner.number_waiting)
            .finish()
    }
}
