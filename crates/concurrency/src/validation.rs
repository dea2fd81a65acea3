//! Read-set validation
//!
//! A transaction is consistent when every reference it read or wrote still
//! has the version it observed at open. Validation runs in two places:
//!
//! - On open, whenever the global conflict counter moved since the last
//!   check (`ValidationScope::Open`). Only Exclusive locks held by others
//!   count, since those mark a commit that is being published.
//! - At prepare (`ValidationScope::Prepare`). Read entries must also not be
//!   Write-locked by another transaction, which is about to commit them.
//!
//! Commuting and constructed entries are never validated: their outcome
//! does not depend on a previously observed value.

use crate::tranlocal::{AccessMode, Tranlocal};
use gamma_core::{ConflictReason, LockMode, RefId, StmError, TxnId};

/// When validation runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationScope {
    /// While the transaction is still executing
    Open,
    /// During prepare, with commit locks held
    Prepare,
}

/// Types of conflicts found during validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictType {
    /// Reference was read at one version but the current version differs
    ReadWriteConflict {
        /// Reference that changed
        ref_id: RefId,
        /// Version recorded when opened
        read_version: u64,
        /// Version at validation time
        current_version: u64,
    },

    /// Another transaction holds a lock that invalidates the read
    LockConflict {
        /// Reference that is locked
        ref_id: RefId,
        /// Mode held by the other transaction
        held: LockMode,
    },
}

impl ConflictType {
    /// Reference involved in the conflict
    pub fn ref_id(&self) -> RefId {
        match self {
            ConflictType::ReadWriteConflict { ref_id, .. } => *ref_id,
            ConflictType::LockConflict { ref_id, .. } => *ref_id,
        }
    }

    /// Convert into the control-flow error raised to the executor
    pub fn into_error(self) -> StmError {
        match self {
            ConflictType::ReadWriteConflict {
                ref_id,
                read_version,
                current_version,
            } => StmError::ReadWriteConflict {
                ref_id,
                reason: ConflictReason::VersionChanged {
                    read_version,
                    current_version,
                },
            },
            ConflictType::LockConflict { ref_id, held } => StmError::ReadWriteConflict {
                ref_id,
                reason: ConflictReason::LockedByOther { mode: held },
            },
        }
    }
}

/// Result of transaction validation
///
/// Accumulates all conflicts found during validation.
/// A transaction commits only if is_valid() returns true.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// All conflicts detected during validation
    pub conflicts: Vec<ConflictType>,
}

impl ValidationResult {
    /// Create a successful validation result (no conflicts)
    pub fn ok() -> Self {
        ValidationResult {
            conflicts: Vec::new(),
        }
    }

    /// Check if validation passed (no conflicts)
    pub fn is_valid(&self) -> bool {
        self.conflicts.is_empty()
    }

    /// Get the number of conflicts
    pub fn conflict_count(&self) -> usize {
        self.conflicts.len()
    }

    /// First conflict as an error, `Ok` when valid
    pub fn into_result(self) -> Result<(), StmError> {
        match self.conflicts.into_iter().next() {
            None => Ok(()),
            Some(conflict) => Err(conflict.into_error()),
        }
    }
}

/// Validate a single entry owned by `owner`
pub(crate) fn validate_entry(
    entry: &Tranlocal,
    owner: TxnId,
    scope: ValidationScope,
) -> Option<ConflictType> {
    if !matches!(entry.mode, AccessMode::Read | AccessMode::Write) {
        return None;
    }
    let lock = entry.core.lock_word();
    let blocking = match (scope, entry.mode) {
        (ValidationScope::Prepare, AccessMode::Read) => lock.write_locked_by_other(owner),
        _ => lock.exclusive_by_other(owner),
    };
    if let Some(held) = blocking {
        return Some(ConflictType::LockConflict {
            ref_id: entry.ref_id(),
            held,
        });
    }
    let current_version = entry.core.version();
    if current_version != entry.read_version {
        return Some(ConflictType::ReadWriteConflict {
            ref_id: entry.ref_id(),
            read_version: entry.read_version,
            current_version,
        });
    }
    None
}

/// Validate every entry, collecting all conflicts
pub(crate) fn validate_entries<'a>(
    entries: impl Iterator<Item = &'a Tranlocal>,
    owner: TxnId,
    scope: ValidationScope,
) -> ValidationResult {
    let mut result = ValidationResult::ok();
    for entry in entries {
        if let Some(conflict) = validate_entry(entry, owner, scope) {
            result.conflicts.push(conflict);
        }
    }
    result
}
