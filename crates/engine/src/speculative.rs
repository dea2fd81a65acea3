//! Speculative variant selection
//!
//! Each executor owns one [`SpeculativeConfig`]. It starts at the cheapest
//! variant and only ever grows: a capability failure marks the call site as
//! fat (sticky) and/or raises the minimum read-set length (fetch-max), and
//! every later transaction from that executor starts at the learned
//! variant.

use gamma_core::{Capability, TxnConfig, TxnKind};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::debug;

/// Learned variant requirements of one call site
#[derive(Debug)]
pub struct SpeculativeConfig {
    fat: AtomicBool,
    min_length: AtomicUsize,
    max_fixed_length: usize,
}

impl SpeculativeConfig {
    /// Start from what `config` already demands
    pub fn new(config: &TxnConfig) -> Self {
        SpeculativeConfig {
            fat: AtomicBool::new(config.requires_fat()),
            min_length: AtomicUsize::new(1),
            max_fixed_length: config.max_fixed_length,
        }
    }

    /// Whether a fat feature was ever needed
    pub fn is_fat(&self) -> bool {
        self.fat.load(Ordering::Acquire)
    }

    /// Largest read-set size ever needed
    pub fn min_length(&self) -> usize {
        self.min_length.load(Ordering::Acquire)
    }

    /// Cheapest variant satisfying everything learned so far
    pub fn select(&self) -> TxnKind {
        let length = self.min_length();
        match (self.is_fat(), length) {
            (false, n) if n <= 1 => TxnKind::LeanMono,
            (false, n) if n <= self.max_fixed_length => TxnKind::LeanFixedLength,
            (true, n) if n <= 1 => TxnKind::FatMono,
            (true, n) if n <= self.max_fixed_length => TxnKind::FatFixedLength,
            _ => TxnKind::FatVariableLength,
        }
    }

    /// Record a failed capability and return the variant to try next
    pub fn signal(&self, capability: Capability) -> TxnKind {
        let before = self.select();
        match capability {
            Capability::Capacity { required } => {
                self.min_length.fetch_max(required, Ordering::AcqRel);
            }
            _ => self.fat.store(true, Ordering::Release),
        }
        let after = self.select();
        if after != before {
            debug!(
                target: "gamma::executor",
                from = %before,
                to = %after,
                capability = %capability,
                "Speculative escalation"
            );
        }
        after
    }
}
