//! Identifiers and enums shared by every layer of the engine
//!
//! This module defines:
//! - TxnId / RefId: identities of transactions and references
//! - LockMode: the lock levels a reference can be held at
//! - PropagationLevel: how an executor treats an ambient transaction
//! - TxnStatus: the transaction state machine
//! - TxnKind / Capability: transaction variants and what each can do
//! - BarrierState, TxnEvent, AccessIntent

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Identifiers
// ============================================================================

/// Identity of a single transaction attempt.
///
/// Allocated by the STM from a monotonically increasing counter, so ids are
/// unique for the lifetime of the process that created them. Id 0 is never
/// handed out and is reserved as "no owner" in lock words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxnId(u64);

impl TxnId {
    /// Wrap a raw id
    pub const fn new(raw: u64) -> Self {
        TxnId(raw)
    }

    /// Raw numeric value
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

/// Identity of a transactional reference.
///
/// Ref ids define the global lock acquisition order used during prepare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RefId(u64);

impl RefId {
    /// Wrap a raw id
    pub const fn new(raw: u64) -> Self {
        RefId(raw)
    }

    /// Raw numeric value
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ref-{}", self.0)
    }
}

// ============================================================================
// Locking
// ============================================================================

/// Lock level held on a reference.
///
/// Ordered by strength: `None < Read < Write < Exclusive`.
///
/// - `Read`: shared, counted. Blocks writers from committing.
/// - `Write`: single owner. Readers may still read the committed value.
/// - `Exclusive`: single owner. Readers must wait until it is released.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// No lock
    #[default]
    None,
    /// Shared read lock
    Read,
    /// Single-owner write lock
    Write,
    /// Single-owner exclusive lock
    Exclusive,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockMode::None => "none",
            LockMode::Read => "read",
            LockMode::Write => "write",
            LockMode::Exclusive => "exclusive",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Propagation
// ============================================================================

/// How an executor reacts to an already running (ambient) transaction.
///
/// | Level       | No ambient tx          | Ambient tx exists               |
/// |-------------|------------------------|---------------------------------|
/// | Requires    | start new              | reuse ambient                   |
/// | RequiresNew | start new              | run a new, independent tx       |
/// | Mandatory   | `TransactionMandatory` | reuse ambient                   |
/// | Never       | run without tx         | `TransactionNotAllowed`         |
/// | Supports    | run without tx         | reuse ambient                   |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropagationLevel {
    /// Join the ambient transaction or start one
    #[default]
    Requires,
    /// Always start an independent transaction
    RequiresNew,
    /// Require an ambient transaction
    Mandatory,
    /// Refuse to run inside a transaction
    Never,
    /// Use the ambient transaction if there is one
    Supports,
}

// ============================================================================
// Transaction state
// ============================================================================

/// Transaction status
///
/// State transitions:
/// - `Active` → `Prepared`: prepare acquired locks and validated reads
/// - `Prepared` → `Committed`: writes published
/// - `Active`/`Prepared` → `Aborted`: attempt discarded
///
/// `Committed` and `Aborted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxnStatus {
    /// Executing; reads and writes are allowed
    Active,
    /// Locks held and reads validated; waiting for commit
    Prepared,
    /// Writes are visible (terminal)
    Committed,
    /// Attempt discarded (terminal)
    Aborted,
}

impl TxnStatus {
    /// Active or Prepared
    pub fn is_alive(self) -> bool {
        matches!(self, TxnStatus::Active | TxnStatus::Prepared)
    }

    /// Committed or Aborted
    pub fn is_terminal(self) -> bool {
        !self.is_alive()
    }
}

impl fmt::Display for TxnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxnStatus::Active => "active",
            TxnStatus::Prepared => "prepared",
            TxnStatus::Committed => "committed",
            TxnStatus::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Lifecycle event delivered to transaction listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxnEvent {
    /// Fired before prepare acquires any lock
    PrePrepare,
    /// Fired after the transaction committed
    PostCommit,
    /// Fired after the transaction aborted
    PostAbort,
}

/// What a caller intends to do with a reference it opens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessIntent {
    /// Track for read validation only
    Read,
    /// Track as a pending write
    Write,
}

// ============================================================================
// Variants
// ============================================================================

/// Something a transaction body may ask for that not every variant provides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Track at least `required` references
    Capacity {
        /// Number of entries the body needed
        required: usize,
    },
    /// Deferred commuting updates
    Commute,
    /// Explicit lock acquisition on a reference
    ExplicitLocking,
    /// Lifecycle listeners
    Listeners,
    /// References created inside the transaction
    Construction,
    /// A timeout on blocking retry
    Timeout,
    /// A non-`None` read or write lock mode in the configuration
    PessimisticLockMode,
}

impl Capability {
    /// Whether satisfying this need requires a fat variant
    pub fn requires_fat(self) -> bool {
        !matches!(self, Capability::Capacity { .. })
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Capacity { required } => write!(f, "capacity for {} refs", required),
            Capability::Commute => f.write_str("commute"),
            Capability::ExplicitLocking => f.write_str("explicit locking"),
            Capability::Listeners => f.write_str("listeners"),
            Capability::Construction => f.write_str("construction"),
            Capability::Timeout => f.write_str("timeout"),
            Capability::PessimisticLockMode => f.write_str("pessimistic lock mode"),
        }
    }
}

/// Transaction representation variant.
///
/// Ordered from cheapest to most capable; speculative escalation only ever
/// moves forward through this order.
///
/// | Variant           | Max refs         | Fat features |
/// |-------------------|------------------|--------------|
/// | LeanMono          | 1                | no           |
/// | LeanFixedLength   | max_fixed_length | no           |
/// | FatMono           | 1                | yes          |
/// | FatFixedLength    | max_fixed_length | yes          |
/// | FatVariableLength | unbounded        | yes          |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxnKind {
    /// One ref, no fat features
    LeanMono,
    /// Up to `max_fixed_length` refs, no fat features
    LeanFixedLength,
    /// One ref with fat features
    FatMono,
    /// Up to `max_fixed_length` refs with fat features
    FatFixedLength,
    /// Any number of refs with fat features
    FatVariableLength,
}

impl TxnKind {
    /// Lean variants lack commute, locking, listeners, construction and timeouts
    pub fn is_lean(self) -> bool {
        matches!(self, TxnKind::LeanMono | TxnKind::LeanFixedLength)
    }

    /// Opposite of [`TxnKind::is_lean`]
    pub fn is_fat(self) -> bool {
        !self.is_lean()
    }

    /// Maximum number of tracked references, `None` when unbounded
    pub fn capacity(self, max_fixed_length: usize) -> Option<usize> {
        match self {
            TxnKind::LeanMono | TxnKind::FatMono => Some(1),
            TxnKind::LeanFixedLength | TxnKind::FatFixedLength => Some(max_fixed_length),
            TxnKind::FatVariableLength => None,
        }
    }

    /// Whether this variant can satisfy `capability`
    pub fn supports(self, capability: Capability, max_fixed_length: usize) -> bool {
        match capability {
            Capability::Capacity { required } => match self.capacity(max_fixed_length) {
                Some(max) => required <= max,
                None => true,
            },
            _ => self.is_fat(),
        }
    }
}

impl fmt::Display for TxnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxnKind::LeanMono => "lean-mono",
            TxnKind::LeanFixedLength => "lean-fixed-length",
            TxnKind::FatMono => "fat-mono",
            TxnKind::FatFixedLength => "fat-fixed-length",
            TxnKind::FatVariableLength => "fat-variable-length",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Commit barrier
// ============================================================================

/// State of a commit barrier. `Committed` and `Aborted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BarrierState {
    /// Accepting parties
    Closed,
    /// Every party committed
    Committed,
    /// Every party aborted
    Aborted,
}

impl fmt::Display for BarrierState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BarrierState::Closed => "closed",
            BarrierState::Committed => "committed",
            BarrierState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_mode_ordering() {
        assert!(LockMode::None < LockMode::Read);
        assert!(LockMode::Read < LockMode::Write);
        assert!(LockMode::Write < LockMode::Exclusive);
    }

    #[test]
    fn test_status_terminal() {
        assert!(TxnStatus::Active.is_alive());
        assert!(TxnStatus::Prepared.is_alive());
        assert!(TxnStatus::Committed.is_terminal());
        assert!(TxnStatus::Aborted.is_terminal());
    }

    #[test]
    fn test_kind_capacity() {
        assert_eq!(TxnKind::LeanMono.capacity(20), Some(1));
        assert_eq!(TxnKind::FatFixedLength.capacity(20), Some(20));
        assert_eq!(TxnKind::FatVariableLength.capacity(20), None);
    }

    #[test]
    fn test_lean_rejects_fat_capabilities() {
        for cap in [
            Capability::Commute,
            Capability::ExplicitLocking,
            Capability::Listeners,
            Capability::Construction,
            Capability::Timeout,
            Capability::PessimisticLockMode,
        ] {
            assert!(!TxnKind::LeanMono.supports(cap, 20));
            assert!(!TxnKind::LeanFixedLength.supports(cap, 20));
            assert!(TxnKind::FatMono.supports(cap, 20));
            assert!(cap.requires_fat());
        }
    }

    #[test]
    fn test_capacity_support() {
        let two = Capability::Capacity { required: 2 };
        assert!(!TxnKind::LeanMono.supports(two, 20));
        assert!(TxnKind::LeanFixedLength.supports(two, 20));
        assert!(!TxnKind::FatFixedLength.supports(Capability::Capacity { required: 21 }, 20));
        assert!(TxnKind::FatVariableLength.supports(Capability::Capacity { required: 10_000 }, 20));
        assert!(!two.requires_fat());
    }

    #[test]
    fn test_kind_order_is_escalation_order() {
        assert!(TxnKind::LeanMono < TxnKind::LeanFixedLength);
        assert!(TxnKind::LeanFixedLength < TxnKind::FatMono);
        assert!(TxnKind::FatFixedLength < TxnKind::FatVariableLength);
    }

    #[test]
    fn test_display() {
        assert_eq!(TxnId::new(7).to_string(), "txn-7");
        assert_eq!(RefId::new(3).to_string(), "ref-3");
        assert_eq!(TxnKind::FatMono.to_string(), "fat-mono");
        assert_eq!(BarrierState::Aborted.to_string(), "aborted");
    }
}
