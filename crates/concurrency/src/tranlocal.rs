//! Transaction-local reference state
//!
//! A [`Tranlocal`] records what one transaction knows about one reference:
//! the version it observed, how it accesses the reference, which lock it
//! holds and the value it buffered. The [`TranlocalSet`] storing them comes
//! in three capacity classes matching the transaction variants:
//!
//! - `Mono`: a single slot
//! - `Fixed`: up to `max_fixed_length` slots, searched linearly
//! - `Variable`: unbounded, indexed by ref id

use crate::reference::{ErasedRef, ErasedValue};
use gamma_core::{LockMode, RefId, TxnId, TxnKind};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

/// How a transaction uses a tracked reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    /// Read only; validated at prepare
    Read,
    /// Buffered write; validated and published at commit
    Write,
    /// Created by this transaction; published at commit
    Construct,
    /// Only deferred commutes; never read
    Commute,
}

pub(crate) struct Tranlocal {
    pub(crate) core: Arc<dyn ErasedRef>,
    pub(crate) mode: AccessMode,
    pub(crate) read_version: u64,
    pub(crate) lock_mode: LockMode,
    pub(crate) has_surplus: bool,
    /// Value read at open, or the pending write
    pub(crate) value: Option<ErasedValue>,
    pub(crate) commutes: Vec<ErasedValue>,
}

impl Tranlocal {
    pub(crate) fn opened(
        core: Arc<dyn ErasedRef>,
        mode: AccessMode,
        read_version: u64,
        value: ErasedValue,
    ) -> Self {
        Tranlocal {
            core,
            mode,
            read_version,
            lock_mode: LockMode::None,
            has_surplus: true,
            value: Some(value),
            commutes: Vec::new(),
        }
    }

    pub(crate) fn constructed(core: Arc<dyn ErasedRef>, value: ErasedValue) -> Self {
        Tranlocal {
            core,
            mode: AccessMode::Construct,
            read_version: 0,
            lock_mode: LockMode::Exclusive,
            has_surplus: false,
            value: Some(value),
            commutes: Vec::new(),
        }
    }

    pub(crate) fn commuting(core: Arc<dyn ErasedRef>, function: ErasedValue) -> Self {
        Tranlocal {
            core,
            mode: AccessMode::Commute,
            read_version: 0,
            lock_mode: LockMode::None,
            has_surplus: false,
            value: None,
            commutes: vec![function],
        }
    }

    pub(crate) fn ref_id(&self) -> RefId {
        self.core.id()
    }

    /// Another transaction committing this reference could wake a retry
    pub(crate) fn is_watchable(&self) -> bool {
        matches!(self.mode, AccessMode::Read | AccessMode::Write)
    }

    /// Needs the commit lock during prepare
    pub(crate) fn is_write(&self) -> bool {
        matches!(
            self.mode,
            AccessMode::Write | AccessMode::Construct | AccessMode::Commute
        )
    }

    pub(crate) fn value_ref<T: 'static>(&self) -> Option<&T> {
        self.value.as_ref().and_then(|v| v.downcast_ref::<T>())
    }

    /// Drop the lock and surplus obligation held by this entry
    pub(crate) fn release(&mut self, owner: TxnId) {
        self.core.lock_word().release(owner, self.lock_mode);
        self.lock_mode = LockMode::None;
        if self.has_surplus {
            self.core.depart();
            self.has_surplus = false;
        }
    }
}

impl fmt::Debug for Tranlocal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tranlocal")
            .field("ref_id", &self.ref_id())
            .field("mode", &self.mode)
            .field("read_version", &self.read_version)
            .field("lock_mode", &self.lock_mode)
            .field("has_surplus", &self.has_surplus)
            .field("commutes", &self.commutes.len())
            .finish()
    }
}

/// Read/write set of a transaction
#[derive(Debug)]
pub(crate) enum TranlocalSet {
    Mono(Option<Tranlocal>),
    Fixed {
        entries: SmallVec<[Tranlocal; 4]>,
        capacity: usize,
    },
    Variable {
        entries: Vec<Tranlocal>,
        index: FxHashMap<RefId, usize>,
    },
}

impl TranlocalSet {
    pub(crate) fn for_kind(kind: TxnKind, max_fixed_length: usize) -> Self {
        match kind {
            TxnKind::LeanMono | TxnKind::FatMono => TranlocalSet::Mono(None),
            TxnKind::LeanFixedLength | TxnKind::FatFixedLength => TranlocalSet::Fixed {
                entries: SmallVec::new(),
                capacity: max_fixed_length,
            },
            TxnKind::FatVariableLength => TranlocalSet::Variable {
                entries: Vec::new(),
                index: FxHashMap::default(),
            },
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            TranlocalSet::Mono(slot) => usize::from(slot.is_some()),
            TranlocalSet::Fixed { entries, .. } => entries.len(),
            TranlocalSet::Variable { entries, .. } => entries.len(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn find(&self, id: RefId) -> Option<usize> {
        match self {
            TranlocalSet::Mono(slot) => slot
                .as_ref()
                .filter(|entry| entry.ref_id() == id)
                .map(|_| 0),
            TranlocalSet::Fixed { entries, .. } => {
                entries.iter().position(|entry| entry.ref_id() == id)
            }
            TranlocalSet::Variable { index, .. } => index.get(&id).copied(),
        }
    }

    pub(crate) fn get(&self, index: usize) -> Option<&Tranlocal> {
        match self {
            TranlocalSet::Mono(slot) => slot.as_ref().filter(|_| index == 0),
            TranlocalSet::Fixed { entries, .. } => entries.get(index),
            TranlocalSet::Variable { entries, .. } => entries.get(index),
        }
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut Tranlocal> {
        match self {
            TranlocalSet::Mono(slot) => slot.as_mut().filter(|_| index == 0),
            TranlocalSet::Fixed { entries, .. } => entries.get_mut(index),
            TranlocalSet::Variable { entries, .. } => entries.get_mut(index),
        }
    }

    /// Insert a new entry.
    ///
    /// Returns the entry back when the set is full.
    pub(crate) fn insert(&mut self, entry: Tranlocal) -> Result<usize, Tranlocal> {
        match self {
            TranlocalSet::Mono(slot) => {
                if slot.is_some() {
                    return Err(entry);
                }
                *slot = Some(entry);
                Ok(0)
            }
            TranlocalSet::Fixed { entries, capacity } => {
                if entries.len() >= *capacity {
                    return Err(entry);
                }
                entries.push(entry);
                Ok(entries.len() - 1)
            }
            TranlocalSet::Variable { entries, index } => {
                let position = entries.len();
                index.insert(entry.ref_id(), position);
                entries.push(entry);
                Ok(position)
            }
        }
    }

    pub(crate) fn iter(&self) -> Box<dyn Iterator<Item = &Tranlocal> + '_> {
        match self {
            TranlocalSet::Mono(slot) => Box::new(slot.iter()),
            TranlocalSet::Fixed { entries, .. } => Box::new(entries.iter()),
            TranlocalSet::Variable { entries, .. } => Box::new(entries.iter()),
        }
    }

    /// Entry positions ordered by ascending ref id
    pub(crate) fn lock_order(&self) -> Vec<usize> {
        let mut order: Vec<(RefId, usize)> = self
            .iter()
            .enumerate()
            .map(|(position, entry)| (entry.ref_id(), position))
            .collect();
        order.sort_unstable();
        order.into_iter().map(|(_, position)| position).collect()
    }

    /// Remove every entry, leaving the set empty
    pub(crate) fn take_all(&mut self) -> Vec<Tranlocal> {
        match self {
            TranlocalSet::Mono(slot) => slot.take().into_iter().collect(),
            TranlocalSet::Fixed { entries, .. } => entries.drain(..).collect(),
            TranlocalSet::Variable { entries, index } => {
                index.clear();
                std::mem::take(entries)
            }
        }
    }
}
