//! Transaction executor
//!
//! A [`TxnExecutor`] runs a block under a transaction according to its
//! configuration's [`PropagationLevel`], and restarts it until it commits:
//!
//! - conflicts back off exponentially and run again
//! - capability failures escalate to a richer variant (when speculative)
//! - `retry()` parks the thread until a watched reference changes
//! - anything else aborts the attempt and propagates
//!
//! There is no thread-local ambient transaction. Callers that already run
//! inside a transaction pass it explicitly through
//! [`TxnExecutor::execute`] or [`TxnExecutor::atomic_within`].
//!
//! # Example
//!
//! ```ignore
//! let stm = GammaStm::new();
//! let balance = stm.new_ref(10u64);
//! let executor = stm.executor();
//! executor.atomic(|tx| {
//!     let v = balance.get(tx)?;
//!     balance.set(tx, v + 1)
//! })?;
//! ```

use crate::speculative::SpeculativeConfig;
use gamma_concurrency::{GammaStm, GammaTxn};
use gamma_core::{PropagationLevel, StmError, StmResult, TxnConfig, TxnKind};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Runs transactional blocks with retry, escalation and propagation
///
/// Clones share the same [`SpeculativeConfig`], so they count as one call
/// site.
#[derive(Debug, Clone)]
pub struct TxnExecutor {
    stm: GammaStm,
    config: Arc<TxnConfig>,
    speculative: Arc<SpeculativeConfig>,
}

/// Executor construction on the STM handle
pub trait StmExecutorExt {
    /// Executor using the STM's default configuration
    fn executor(&self) -> TxnExecutor;

    /// Executor with its own configuration
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `config` fails validation.
    fn executor_with(&self, config: TxnConfig) -> StmResult<TxnExecutor>;
}

impl StmExecutorExt for GammaStm {
    fn executor(&self) -> TxnExecutor {
        TxnExecutor::from_validated(self, Arc::clone(self.default_config()))
    }

    fn executor_with(&self, config: TxnConfig) -> StmResult<TxnExecutor> {
        TxnExecutor::new(self, config)
    }
}

/// How an attempt ended when it did not commit
enum Restart {
    Backoff,
    Escalate,
    Blocked(Option<Duration>),
}

impl TxnExecutor {
    /// Create an executor for `stm`
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `config` fails validation.
    pub fn new(stm: &GammaStm, config: TxnConfig) -> StmResult<Self> {
        config.validate()?;
        Ok(Self::from_validated(stm, Arc::new(config)))
    }

    fn from_validated(stm: &GammaStm, config: Arc<TxnConfig>) -> Self {
        let speculative = Arc::new(SpeculativeConfig::new(&config));
        TxnExecutor {
            stm: stm.clone(),
            config,
            speculative,
        }
    }

    /// Configuration of every transaction this executor starts
    pub fn config(&self) -> &Arc<TxnConfig> {
        &self.config
    }

    /// STM this executor runs on
    pub fn stm(&self) -> &GammaStm {
        &self.stm
    }

    /// Variant requirements learned so far
    pub fn speculative_config(&self) -> &SpeculativeConfig {
        &self.speculative
    }

    /// Variant the next new transaction starts with
    pub fn next_kind(&self) -> TxnKind {
        if self.config.speculative {
            self.speculative.select()
        } else {
            self.config.non_speculative_kind()
        }
    }

    /// Run `block` as a top-level transaction.
    ///
    /// # Errors
    ///
    /// - `TransactionMandatory` if the propagation level provides no
    ///   transaction (`Never`, `Supports`); `block` does not run
    /// - `RetryLimitExceeded`, `RetryTimeout`, `RetryNotPossible` when the
    ///   retry policy is exhausted
    /// - any non-control-flow error returned by `block`
    pub fn atomic<T, F>(&self, mut block: F) -> StmResult<T>
    where
        F: FnMut(&mut GammaTxn) -> StmResult<T>,
    {
        self.execute(None, |tx| match tx {
            Some(tx) => block(tx),
            None => Err(StmError::TransactionMandatory),
        })
    }

    /// Run `block` inside (or, for `RequiresNew`, beside) `current`
    pub fn atomic_within<T, F>(&self, current: &mut GammaTxn, mut block: F) -> StmResult<T>
    where
        F: FnMut(&mut GammaTxn) -> StmResult<T>,
    {
        self.execute(Some(current), |tx| match tx {
            Some(tx) => block(tx),
            None => Err(StmError::TransactionMandatory),
        })
    }

    /// Run `block` according to the propagation level.
    ///
    /// | Level | no `current` | `current` given |
    /// |---|---|---|
    /// | Requires | new | reuse |
    /// | RequiresNew | new | new, `current` untouched |
    /// | Mandatory | `TransactionMandatory` | reuse |
    /// | Never | no transaction | `TransactionNotAllowed` |
    /// | Supports | no transaction | reuse |
    ///
    /// A reused transaction is not committed here and errors propagate
    /// unchanged to whoever owns it.
    pub fn execute<T, F>(&self, current: Option<&mut GammaTxn>, mut block: F) -> StmResult<T>
    where
        F: FnMut(Option<&mut GammaTxn>) -> StmResult<T>,
    {
        use PropagationLevel::*;
        match (self.config.propagation_level, current) {
            (Requires | Mandatory | Supports, Some(tx)) => {
                trace!(
                    target: "gamma::executor",
                    txn_id = tx.id().as_u64(),
                    "Joining ambient transaction"
                );
                block(Some(tx))
            }
            (Requires | RequiresNew, None) => self.run_new(|tx| block(Some(tx))),
            (RequiresNew, Some(outer)) => {
                trace!(
                    target: "gamma::executor",
                    txn_id = outer.id().as_u64(),
                    "Suspending ambient transaction"
                );
                self.run_new(|tx| block(Some(tx)))
            }
            (Mandatory, None) => Err(StmError::TransactionMandatory),
            (Never, Some(_)) => Err(StmError::TransactionNotAllowed),
            (Never | Supports, None) => block(None),
        }
    }

    /// Retry loop for a freshly started transaction
    fn run_new<T, F>(&self, mut block: F) -> StmResult<T>
    where
        F: FnMut(&mut GammaTxn) -> StmResult<T>,
    {
        let max_attempts = self.config.max_retries.saturating_add(1);
        let mut remaining = self.config.timeout();
        // Reported to the block; grows on every restart
        let mut attempt: u32 = 1;
        // Checked against the limit; escalations are free
        let mut counted: u32 = 1;

        loop {
            let kind = self.next_kind();
            let mut tx = self.stm.begin_with(Arc::clone(&self.config), kind);
            tx.set_attempt(attempt);
            tx.set_remaining_timeout(remaining);

            let err = match block(&mut tx) {
                Ok(value) => match tx.commit() {
                    Ok(()) => return Ok(value),
                    Err(err) => err,
                },
                Err(err) => err,
            };

            let restart = self.classify(&mut tx, err)?;
            remaining = tx.remaining_timeout();
            drop(tx);

            match restart {
                Restart::Escalate => {}
                Restart::Backoff => {
                    if counted >= max_attempts {
                        return Err(self.limit_exceeded(counted));
                    }
                    let delay = self.config.backoff_delay(counted);
                    if delay.is_zero() {
                        thread::yield_now();
                    } else {
                        thread::sleep(delay);
                    }
                    counted += 1;
                }
                Restart::Blocked(left) => {
                    remaining = left;
                    if counted >= max_attempts {
                        return Err(self.limit_exceeded(counted));
                    }
                    counted += 1;
                }
            }
            attempt = attempt.saturating_add(1);
        }
    }

    /// Decide how to continue after a failed attempt, or surface the error
    fn classify(&self, tx: &mut GammaTxn, err: StmError) -> StmResult<Restart> {
        match err {
            err if err.is_conflict() => {
                tx.mark_aborted();
                debug!(
                    target: "gamma::executor",
                    txn_id = tx.id().as_u64(),
                    attempt = tx.attempt(),
                    error = %err,
                    "Conflict, retrying"
                );
                Ok(Restart::Backoff)
            }
            StmError::SpeculativeConfigurationFailure { kind, capability } => {
                tx.mark_aborted();
                if !self.config.speculative {
                    return Err(StmError::SpeculativeConfigurationFailure { kind, capability });
                }
                self.speculative.signal(capability);
                Ok(Restart::Escalate)
            }
            StmError::Retry => {
                let latch = tx.take_retry_latch();
                tx.mark_aborted();
                let Some(latch) = latch else {
                    return Err(StmError::RetryNotPossible);
                };
                let remaining = tx.remaining_timeout();
                trace!(
                    target: "gamma::executor",
                    txn_id = tx.id().as_u64(),
                    timeout = ?remaining,
                    "Blocking until a read reference changes"
                );
                let started = Instant::now();
                if !latch.await_open(remaining) {
                    debug!(
                        target: "gamma::executor",
                        txn_id = tx.id().as_u64(),
                        "Blocking retry timed out"
                    );
                    return Err(StmError::RetryTimeout);
                }
                Ok(Restart::Blocked(
                    remaining.map(|budget| budget.saturating_sub(started.elapsed())),
                ))
            }
            err => {
                tx.mark_aborted();
                Err(err)
            }
        }
    }

    fn limit_exceeded(&self, attempts: u32) -> StmError {
        warn!(
            target: "gamma::executor",
            family = %self.config.family_name,
            attempts,
            "Retry limit exceeded"
        );
        StmError::RetryLimitExceeded { attempts }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gamma_core::TxnStatus;

    #[test]
    fn test_atomic_commits() {
        let stm = GammaStm::new();
        let r = stm.new_ref(10u64);
        let value = stm
            .executor()
            .atomic(|tx| r.alter_and_get(tx, |v| v + 1))
            .unwrap();
        assert_eq!(value, 11);
        assert_eq!(r.atomic_get().unwrap(), 11);
        assert_eq!(r.version(), 1);
    }

    #[test]
    fn test_new_validates_config() {
        let stm = GammaStm::new();
        let bad = TxnConfig::new().with_max_fixed_length(0);
        assert!(matches!(
            TxnExecutor::new(&stm, bad),
            Err(StmError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_application_error_aborts_without_retry() {
        let stm = GammaStm::new();
        let r = stm.new_ref(0u32);
        let mut runs = 0;
        let result: StmResult<()> = stm.executor().atomic(|tx| {
            runs += 1;
            r.set(tx, 5)?;
            Err(StmError::application(std::io::Error::new(
                std::io::ErrorKind::Other,
                "boom",
            )))
        });
        assert!(matches!(result, Err(StmError::Application(_))));
        assert_eq!(runs, 1);
        assert_eq!(r.atomic_get().unwrap(), 0);
        assert_eq!(stm.metrics().total_aborted, 1);
    }

    #[test]
    fn test_conflicts_retried_until_limit() {
        let stm = GammaStm::new();
        let r = stm.new_ref(0u32);
        let executor = TxnExecutor::new(
            &stm,
            TxnConfig::new().with_max_retries(2).with_backoff_us(0, 0),
        )
        .unwrap();
        let mut runs = 0;
        let result = executor.atomic(|tx| {
            runs += 1;
            let v = r.get(tx)?;
            // Invalidate the read before commit
            r.atomic_set(v + 100)?;
            r.set(tx, v + 1)
        });
        assert!(matches!(
            result,
            Err(StmError::RetryLimitExceeded { attempts: 3 })
        ));
        assert_eq!(runs, 3);
    }

    #[test]
    fn test_attempt_numbers_increase() {
        let stm = GammaStm::new();
        let r = stm.new_ref(0u32);
        let executor = TxnExecutor::new(&stm, TxnConfig::new().with_backoff_us(0, 0)).unwrap();
        let mut seen = Vec::new();
        executor
            .atomic(|tx| {
                seen.push(tx.attempt());
                let v = r.get(tx)?;
                if tx.attempt() < 3 {
                    r.atomic_set(v + 1)?;
                }
                r.set(tx, v + 10)
            })
            .unwrap();
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn test_speculative_escalates_and_remembers() {
        let stm = GammaStm::new();
        let refs: Vec<_> = (0..3).map(|i| stm.new_ref(i)).collect();
        let executor = stm.executor();
        let mut kinds = Vec::new();
        executor
            .atomic(|tx| {
                kinds.push(tx.kind());
                for r in &refs {
                    r.get(tx)?;
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(kinds, vec![TxnKind::LeanMono, TxnKind::LeanFixedLength]);
        assert_eq!(executor.next_kind(), TxnKind::LeanFixedLength);

        // A clone is the same call site
        assert_eq!(executor.clone().next_kind(), TxnKind::LeanFixedLength);
    }

    #[test]
    fn test_non_speculative_surfaces_capability_failure() {
        let stm = GammaStm::new();
        let r = stm.new_ref(0u32);
        let config = TxnConfig::new()
            .with_speculative(false)
            .with_kind(TxnKind::LeanMono);
        let executor = TxnExecutor::new(&stm, config).unwrap();
        let err = executor
            .atomic(|tx| r.commute(tx, |v| v + 1))
            .unwrap_err();
        assert!(matches!(
            err,
            StmError::SpeculativeConfigurationFailure {
                kind: TxnKind::LeanMono,
                ..
            }
        ));
    }

    #[test]
    fn test_retry_without_reads_not_possible() {
        let stm = GammaStm::new();
        let result: StmResult<()> = stm.executor().atomic(|tx| tx.retry());
        assert!(matches!(result, Err(StmError::RetryNotPossible)));
    }

    #[test]
    fn test_retry_times_out() {
        let stm = GammaStm::new();
        let r = stm.new_ref(0u32);
        let executor = TxnExecutor::new(
            &stm,
            TxnConfig::new().with_timeout(Duration::from_millis(20)),
        )
        .unwrap();
        let started = Instant::now();
        let result = executor.atomic(|tx| r.await_value(tx, |v| *v > 0));
        assert!(matches!(result, Err(StmError::RetryTimeout)));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    // === Propagation ===

    fn executor_with_level(stm: &GammaStm, level: PropagationLevel) -> TxnExecutor {
        TxnExecutor::new(stm, TxnConfig::new().with_propagation_level(level)).unwrap()
    }

    #[test]
    fn test_requires_reuses_ambient() {
        let stm = GammaStm::new();
        let r = stm.new_ref(0u32);
        let mut outer = stm.begin();
        let outer_id = outer.id();
        stm.executor()
            .atomic_within(&mut outer, |tx| {
                assert_eq!(tx.id(), outer_id);
                r.set(tx, 1)
            })
            .unwrap();
        // Not committed by the nested call
        assert_eq!(outer.status(), TxnStatus::Active);
        assert_eq!(r.atomic_get().unwrap(), 0);
        outer.commit().unwrap();
        assert_eq!(r.atomic_get().unwrap(), 1);
    }

    #[test]
    fn test_requires_new_runs_separately() {
        let stm = GammaStm::new();
        let r = stm.new_ref(0u32);
        let mut outer = stm.begin();
        let outer_id = outer.id();
        executor_with_level(&stm, PropagationLevel::RequiresNew)
            .atomic_within(&mut outer, |tx| {
                assert_ne!(tx.id(), outer_id);
                r.set(tx, 7)
            })
            .unwrap();
        assert_eq!(r.atomic_get().unwrap(), 7);
        assert_eq!(outer.status(), TxnStatus::Active);
        outer.abort().unwrap();
        assert_eq!(r.atomic_get().unwrap(), 7);
    }

    #[test]
    fn test_mandatory_without_ambient_fails() {
        let stm = GammaStm::new();
        let mut ran = false;
        let result: StmResult<()> = executor_with_level(&stm, PropagationLevel::Mandatory)
            .atomic(|_| {
                ran = true;
                Ok(())
            });
        assert!(matches!(result, Err(StmError::TransactionMandatory)));
        assert!(!ran);
    }

    #[test]
    fn test_never_with_ambient_fails() {
        let stm = GammaStm::new();
        let mut outer = stm.begin();
        let mut ran = false;
        let result: StmResult<()> = executor_with_level(&stm, PropagationLevel::Never)
            .execute(Some(&mut outer), |_| {
                ran = true;
                Ok(())
            });
        assert!(matches!(result, Err(StmError::TransactionNotAllowed)));
        assert!(!ran);
        assert_eq!(outer.status(), TxnStatus::Active);
    }

    #[test]
    fn test_supports_without_ambient_runs_bare() {
        let stm = GammaStm::new();
        let executor = executor_with_level(&stm, PropagationLevel::Supports);
        let had_tx = executor.execute(None, |tx| Ok(tx.is_some())).unwrap();
        assert!(!had_tx);
        assert_eq!(stm.metrics().total_started, 0);
    }

    #[test]
    fn test_nested_errors_propagate_unchanged() {
        let stm = GammaStm::new();
        let mut outer = stm.begin();
        let result: StmResult<()> = stm
            .executor()
            .atomic_within(&mut outer, |_| Err(StmError::Retry));
        assert!(matches!(result, Err(StmError::Retry)));
    }
}
