//! Transaction execution for Gamma
//!
//! This crate sits on top of `gamma-concurrency` and provides:
//! - [`TxnExecutor`]: retry loop, propagation levels and blocking retry
//! - [`SpeculativeConfig`]: per-call-site variant escalation
//! - [`CommitBarrier`]: commit several transactions as one unit

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod barrier;
pub mod executor;
pub mod speculative;

pub use barrier::CommitBarrier;
pub use executor::{StmExecutorExt, TxnExecutor};
pub use speculative::SpeculativeConfig;
