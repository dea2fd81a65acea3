//! Core types for the Gamma STM
//!
//! This crate defines the foundational types used throughout the engine:
//! - TxnId / RefId: identities of transactions and references
//! - LockMode, PropagationLevel, TxnStatus, TxnKind, Capability
//! - StmError: the error taxonomy shared by every layer
//! - TxnConfig: per-family transaction configuration, loadable from TOML

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod types;

pub use config::{TxnConfig, DEFAULT_MAX_FIXED_LENGTH, DEFAULT_MAX_RETRIES, DEFAULT_SPIN_COUNT};
pub use error::{ConflictReason, StmError, StmResult};
pub use types::{
    AccessIntent, BarrierState, Capability, LockMode, PropagationLevel, RefId, TxnEvent, TxnId,
    TxnKind, TxnStatus,
};
