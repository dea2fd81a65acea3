//! STM runtime handle
//!
//! [`GammaStm`] is the shared state every transaction and reference points
//! back to:
//! - the global conflict counter used for read consistency
//! - the default transaction configuration
//! - lifecycle metrics (started, committed, aborted)
//!
//! Transaction and reference ids come from process-wide counters so ids
//! stay unique even when several STM instances exist.

use crate::reference::{RefCore, TxnRef, TxnValue};
use crate::transaction::GammaTxn;
use gamma_core::{StmResult, TxnConfig, TxnId, TxnKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_TXN_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a fresh transaction id (never 0)
pub(crate) fn next_txn_id() -> TxnId {
    TxnId::new(NEXT_TXN_ID.fetch_add(1, Ordering::SeqCst))
}

struct StmShared {
    /// Bumped by every commit that changes a reference other transactions
    /// have open. Transactions compare it to their snapshot on each open.
    conflict_counter: AtomicU64,
    default_config: Arc<TxnConfig>,
    /// Metric counters use Relaxed ordering; they synchronize nothing.
    active_count: AtomicU64,
    total_started: AtomicU64,
    total_committed: AtomicU64,
    total_aborted: AtomicU64,
}

/// Cheaply clonable handle to an STM instance
#[derive(Clone)]
pub struct GammaStm {
    shared: Arc<StmShared>,
}

impl GammaStm {
    /// Create an STM with the default configuration
    pub fn new() -> Self {
        Self::from_validated(TxnConfig::default())
    }

    /// Create an STM whose transactions default to `config`
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `config` fails validation.
    pub fn with_config(config: TxnConfig) -> StmResult<Self> {
        config.validate()?;
        Ok(Self::from_validated(config))
    }

    fn from_validated(config: TxnConfig) -> Self {
        GammaStm {
            shared: Arc::new(StmShared {
                conflict_counter: AtomicU64::new(0),
                default_config: Arc::new(config),
                active_count: AtomicU64::new(0),
                total_started: AtomicU64::new(0),
                total_committed: AtomicU64::new(0),
                total_aborted: AtomicU64::new(0),
            }),
        }
    }

    /// Configuration used by [`GammaStm::begin`] and atomic reference ops
    pub fn default_config(&self) -> &Arc<TxnConfig> {
        &self.shared.default_config
    }

    /// Create a reference, visible immediately at version 0
    pub fn new_ref<T: TxnValue>(&self, value: T) -> TxnRef<T> {
        TxnRef::from_core(Arc::new(RefCore::new(self.clone(), value)))
    }

    /// Start a transaction with the default configuration.
    ///
    /// Uses the configured `kind`, or the fat variable-length variant.
    pub fn begin(&self) -> GammaTxn {
        let config = Arc::clone(&self.shared.default_config);
        let kind = config.non_speculative_kind();
        GammaTxn::new(self.clone(), config, kind)
    }

    /// Start a transaction of a specific variant
    pub fn begin_with(&self, config: Arc<TxnConfig>, kind: TxnKind) -> GammaTxn {
        GammaTxn::new(self.clone(), config, kind)
    }

    /// Current value of the global conflict counter
    pub fn conflict_count(&self) -> u64 {
        self.shared.conflict_counter.load(Ordering::SeqCst)
    }

    pub(crate) fn signal_conflict(&self) {
        self.shared.conflict_counter.fetch_add(1, Ordering::SeqCst);
    }

    // === Metrics ===

    pub(crate) fn record_start(&self) {
        self.shared.active_count.fetch_add(1, Ordering::Relaxed);
        self.shared.total_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_commit(&self) {
        self.finish_active();
        self.shared.total_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_abort(&self) {
        self.finish_active();
        self.shared.total_aborted.fetch_add(1, Ordering::Relaxed);
    }

    fn finish_active(&self) {
        // Saturating decrement
        let _ = self
            .shared
            .active_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| {
                Some(x.saturating_sub(1))
            });
    }

    /// Snapshot of transaction statistics
    pub fn metrics(&self) -> StmMetrics {
        let started = self.shared.total_started.load(Ordering::Relaxed);
        let committed = self.shared.total_committed.load(Ordering::Relaxed);

        StmMetrics {
            active_count: self.shared.active_count.load(Ordering::Relaxed),
            total_started: started,
            total_committed: committed,
            total_aborted: self.shared.total_aborted.load(Ordering::Relaxed),
            conflict_count: self.conflict_count(),
            commit_rate: if started > 0 {
                committed as f64 / started as f64
            } else {
                0.0
            },
        }
    }
}

impl Default for GammaStm {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for GammaStm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GammaStm")
            .field("conflict_count", &self.conflict_count())
            .field("default_config", &self.shared.default_config)
            .finish()
    }
}

/// Transaction metrics
///
/// Each attempt counts as one transaction, so a block that retried twice
/// contributes three starts.
#[derive(Debug, Clone)]
pub struct StmMetrics {
    /// Number of currently live transactions
    pub active_count: u64,
    /// Total number of transactions started
    pub total_started: u64,
    /// Total number of transactions committed
    pub total_committed: u64,
    /// Total number of transactions aborted
    pub total_aborted: u64,
    /// Value of the global conflict counter
    pub conflict_count: u64,
    /// Commit success rate (committed / started)
    pub commit_rate: f64,
}

impl StmMetrics {
    /// Total transactions that completed (committed + aborted)
    pub fn total_completed(&self) -> u64 {
        self.total_committed + self.total_aborted
    }

    /// Abort rate (aborted / started)
    pub fn abort_rate(&self) -> f64 {
        if self.total_started > 0 {
            self.total_aborted as f64 / self.total_started as f64
        } else {
            0.0
        }
    }
}
