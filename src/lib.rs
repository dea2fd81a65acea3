//! Gamma - software transactional memory for Rust
//!
//! Gamma lets threads share mutable state through transactional references
//! instead of locks. A block of reads and writes runs as one atomic,
//! isolated transaction; conflicting blocks are restarted automatically.
//!
//! # Quick Start
//!
//! ```ignore
//! use gammastm::{GammaStm, StmExecutorExt};
//!
//! let stm = GammaStm::new();
//! let from = stm.new_ref(100i64);
//! let to = stm.new_ref(0i64);
//!
//! stm.executor().atomic(|tx| {
//!     let amount = 25;
//!     from.alter_and_get(tx, |v| v - amount)?;
//!     to.alter_and_get(tx, |v| v + amount)?;
//!     Ok(())
//! })?;
//! ```
//!
//! # Architecture
//!
//! - `gamma-core`: ids, enums, errors and [`TxnConfig`]
//! - `gamma-concurrency`: references, transactions and the commit protocol
//! - `gamma-engine`: executors, speculative escalation and commit barriers

pub use gamma_concurrency::{
    AccessMode, CommitOutcome, CommuteFn, GammaStm, GammaTxn, PreparedCommit, RetryLatch,
    StmMetrics, TxnListener, TxnRef, TxnValue,
};
pub use gamma_core::{
    AccessIntent, BarrierState, Capability, ConflictReason, LockMode, PropagationLevel, RefId,
    StmError, StmResult, TxnConfig, TxnEvent, TxnId, TxnKind, TxnStatus,
};
pub use gamma_engine::{CommitBarrier, SpeculativeConfig, StmExecutorExt, TxnExecutor};
