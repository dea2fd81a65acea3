//! Error types for the Gamma STM
//!
//! Every fallible operation returns [`StmResult`]. Errors fall into classes:
//!
//! - Control-flow signals (`ReadWriteConflict`, `LockNotFree`,
//!   `SpeculativeConfigurationFailure`, `Retry`): consumed by the executor's
//!   retry loop, normally never seen by callers.
//! - Propagation errors (`TransactionMandatory`, `TransactionNotAllowed`).
//! - Lifecycle errors (`DeadTransaction`, `PreparedTransaction`): misuse of
//!   a transaction that is no longer active.
//! - Resource errors (`RetryNotAllowed`, `RetryNotPossible`,
//!   `RetryLimitExceeded`, `RetryTimeout`).
//! - Barrier errors (`CommitBarrierResolved`, `CommitBarrierAborted`).
//! - Application errors raised by user blocks, never retried.

use crate::types::{BarrierState, Capability, LockMode, RefId, TxnId, TxnKind, TxnStatus};
use std::fmt;
use thiserror::Error;

/// Result type alias for STM operations
pub type StmResult<T> = std::result::Result<T, StmError>;

/// Why a read or commit could not proceed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    /// The version observed at open no longer matches the committed version
    VersionChanged {
        /// Version recorded when the reference was opened
        read_version: u64,
        /// Version found at validation time
        current_version: u64,
    },
    /// Another transaction holds a lock that blocks this access
    LockedByOther {
        /// Mode held by the other transaction
        mode: LockMode,
    },
    /// A commit lock could not be acquired within the spin budget
    LockContended {
        /// Mode that was requested
        requested: LockMode,
    },
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictReason::VersionChanged {
                read_version,
                current_version,
            } => write!(
                f,
                "version changed from {} to {}",
                read_version, current_version
            ),
            ConflictReason::LockedByOther { mode } => {
                write!(f, "{} lock held by another transaction", mode)
            }
            ConflictReason::LockContended { requested } => {
                write!(f, "{} lock not acquired within spin budget", requested)
            }
        }
    }
}

/// Errors raised by references, transactions, executors and barriers
#[derive(Debug, Error)]
pub enum StmError {
    // === Control-flow signals ===
    /// A read or commit observed a concurrent change; the attempt must restart
    #[error("read/write conflict on {ref_id}: {reason}")]
    ReadWriteConflict {
        /// Reference that conflicted
        ref_id: RefId,
        /// What was observed
        reason: ConflictReason,
    },

    /// An explicit lock request could not be granted
    #[error("lock not free on {ref_id}: requested {requested}, held {held}")]
    LockNotFree {
        /// Reference whose lock was requested
        ref_id: RefId,
        /// Mode requested
        requested: LockMode,
        /// Mode held by someone else
        held: LockMode,
    },

    /// The current variant lacks a capability the block needs
    #[error("configuration too small: {kind} lacks {capability}")]
    SpeculativeConfigurationFailure {
        /// Variant that was running
        kind: TxnKind,
        /// Capability that was needed
        capability: Capability,
    },

    /// The block asked to wait until something it read changes
    #[error("retry requested")]
    Retry,

    // === Propagation ===
    /// Propagation level `Mandatory` without an ambient transaction
    #[error("transaction mandatory but none is active")]
    TransactionMandatory,

    /// Propagation level `Never` with an ambient transaction
    #[error("transaction not allowed but one is active")]
    TransactionNotAllowed,

    // === Lifecycle ===
    /// Operation on a committed or aborted transaction
    #[error("{txn_id} is dead ({status})")]
    DeadTransaction {
        /// Transaction that was used
        txn_id: TxnId,
        /// Its (unchanged) terminal status
        status: TxnStatus,
    },

    /// Operation on a prepared transaction; the transaction was aborted
    #[error("{txn_id} is prepared and can no longer be used")]
    PreparedTransaction {
        /// Transaction that was used
        txn_id: TxnId,
    },

    // === Resource ===
    /// `retry()` while blocking is disabled
    #[error("blocking retry is not allowed by the transaction configuration")]
    RetryNotAllowed,

    /// `retry()` with nothing that another transaction could change
    #[error("retry is not possible: no tracked reads to wait on")]
    RetryNotPossible,

    /// The executor ran out of attempts
    #[error("retry limit exceeded after {attempts} attempts")]
    RetryLimitExceeded {
        /// Attempts made
        attempts: u32,
    },

    /// A blocking retry did not wake before the timeout elapsed
    #[error("blocking retry timed out")]
    RetryTimeout,

    // === Barrier ===
    /// Joining a barrier that already committed or aborted
    #[error("commit barrier already {state}")]
    CommitBarrierResolved {
        /// Terminal state of the barrier
        state: BarrierState,
    },

    /// The barrier was aborted while this party waited
    #[error("commit barrier aborted")]
    CommitBarrierAborted,

    // === Configuration ===
    /// Invalid or unreadable configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // === Application ===
    /// Error raised by user code inside a transaction block
    #[error("application error: {0}")]
    Application(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StmError {
    /// Wrap an application error so it aborts the transaction and propagates
    pub fn application<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        StmError::Application(err.into())
    }

    /// Create an invalid-config error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        StmError::InvalidConfig(msg.into())
    }

    /// Signals handled by the executor's retry loop
    pub fn is_control_flow(&self) -> bool {
        matches!(
            self,
            StmError::ReadWriteConflict { .. }
                | StmError::LockNotFree { .. }
                | StmError::SpeculativeConfigurationFailure { .. }
                | StmError::Retry
        )
    }

    /// Concurrency conflicts that a fresh attempt may not hit again
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StmError::ReadWriteConflict { .. } | StmError::LockNotFree { .. }
        )
    }

    /// Errors that a new attempt can resolve
    pub fn is_retryable(&self) -> bool {
        self.is_control_flow()
    }

    /// `TransactionMandatory` or `TransactionNotAllowed`
    pub fn is_propagation(&self) -> bool {
        matches!(
            self,
            StmError::TransactionMandatory | StmError::TransactionNotAllowed
        )
    }

    /// `DeadTransaction` or `PreparedTransaction`
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            StmError::DeadTransaction { .. } | StmError::PreparedTransaction { .. }
        )
    }

    /// Capability that a speculative failure asked for
    pub fn needed_capability(&self) -> Option<Capability> {
        match self {
            StmError::SpeculativeConfigurationFailure { capability, .. } => Some(*capability),
            _ => None,
        }
    }
}
