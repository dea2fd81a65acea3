//! Transactional memory runtime for Gamma
//!
//! This crate implements the transaction machinery:
//! - [`GammaStm`]: shared runtime state (conflict counter, defaults, metrics)
//! - [`TxnRef`]: transactional references with versioned values
//! - [`GammaTxn`]: read/write-set tracking, locking and the commit protocol
//! - [`PreparedCommit`]: locked work that can be published on its own or as
//!   part of a group
//!
//! Retry loops, propagation and commit barriers live in `gamma-engine`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod blocking;
pub mod commit;
pub mod lock;
pub mod reference;
pub mod stm;
pub mod tranlocal;
pub mod transaction;
pub mod validation;

pub use blocking::RetryLatch;
pub use commit::{CommitOutcome, PreparedCommit};
pub use lock::LockWord;
pub use reference::{CommuteFn, TxnRef, TxnValue};
pub use stm::{GammaStm, StmMetrics};
pub use tranlocal::AccessMode;
pub use transaction::{GammaTxn, TxnListener};
pub use validation::{ConflictType, ValidationResult, ValidationScope};
