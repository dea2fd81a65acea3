//! Transaction configuration
//!
//! A [`TxnConfig`] is shared (behind an `Arc`) by every transaction an
//! executor starts. Build one with the `with_*` methods, or load it from a
//! TOML file:
//!
//! ```toml
//! propagation_level = "requires"
//! speculative = true
//! max_retries = 1000
//! timeout_ns = 5000000
//! write_lock_mode = "none"
//! ```
//!
//! Missing keys fall back to [`TxnConfig::default`].

use crate::error::{StmError, StmResult};
use crate::types::{LockMode, PropagationLevel, TxnKind};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default number of attempts after the first one
pub const DEFAULT_MAX_RETRIES: u32 = 1000;
/// Default spin budget for lock acquisition and locked reads
pub const DEFAULT_SPIN_COUNT: u32 = 64;
/// Default capacity of the fixed-length variants
pub const DEFAULT_MAX_FIXED_LENGTH: usize = 20;

/// Configuration applied to every transaction an executor starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TxnConfig {
    /// Name used in log output for transactions of this family
    pub family_name: String,
    /// Reaction to an ambient transaction
    pub propagation_level: PropagationLevel,
    /// Start lean and escalate on demand
    pub speculative: bool,
    /// Whether `retry()` may block
    pub blocking_allowed: bool,
    /// Skip writes whose value equals the committed value
    pub dirty_check: bool,
    /// Attempts allowed after the first one
    pub max_retries: u32,
    /// Budget for blocking retry, shared across attempts (`None` = wait forever)
    pub timeout_ns: Option<u64>,
    /// Lock acquired on every read
    pub read_lock_mode: LockMode,
    /// Lock acquired on every write
    pub write_lock_mode: LockMode,
    /// Spin iterations before a contended lock or locked read gives up
    pub spin_count: u32,
    /// Capacity of the fixed-length variants
    pub max_fixed_length: usize,
    /// Variant used when `speculative` is off (`None` = fat variable length)
    pub kind: Option<TxnKind>,
    /// First conflict backoff in microseconds (0 = yield only)
    pub backoff_base_us: u64,
    /// Upper bound on conflict backoff in microseconds
    pub backoff_max_us: u64,
}

impl Default for TxnConfig {
    fn default() -> Self {
        Self {
            family_name: "anonymous".to_string(),
            propagation_level: PropagationLevel::Requires,
            speculative: true,
            blocking_allowed: true,
            dirty_check: true,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout_ns: None,
            read_lock_mode: LockMode::None,
            write_lock_mode: LockMode::None,
            spin_count: DEFAULT_SPIN_COUNT,
            max_fixed_length: DEFAULT_MAX_FIXED_LENGTH,
            kind: None,
            backoff_base_us: 1,
            backoff_max_us: 1_000,
        }
    }
}

impl TxnConfig {
    /// Create a config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the family name shown in logs
    pub fn with_family_name(mut self, name: impl Into<String>) -> Self {
        self.family_name = name.into();
        self
    }

    /// Set the propagation level
    pub fn with_propagation_level(mut self, level: PropagationLevel) -> Self {
        self.propagation_level = level;
        self
    }

    /// Enable or disable speculative escalation
    pub fn with_speculative(mut self, speculative: bool) -> Self {
        self.speculative = speculative;
        self
    }

    /// Allow or forbid blocking retry
    pub fn with_blocking_allowed(mut self, allowed: bool) -> Self {
        self.blocking_allowed = allowed;
        self
    }

    /// Enable or disable the dirty check
    pub fn with_dirty_check(mut self, dirty_check: bool) -> Self {
        self.dirty_check = dirty_check;
        self
    }

    /// Set the number of attempts allowed after the first
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the blocking timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ns = Some(u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX));
        self
    }

    /// Set the lock acquired on every read
    pub fn with_read_lock_mode(mut self, mode: LockMode) -> Self {
        self.read_lock_mode = mode;
        self
    }

    /// Set the lock acquired on every write
    pub fn with_write_lock_mode(mut self, mode: LockMode) -> Self {
        self.write_lock_mode = mode;
        self
    }

    /// Set the spin budget
    pub fn with_spin_count(mut self, spin_count: u32) -> Self {
        self.spin_count = spin_count;
        self
    }

    /// Set the capacity of fixed-length variants
    pub fn with_max_fixed_length(mut self, max_fixed_length: usize) -> Self {
        self.max_fixed_length = max_fixed_length;
        self
    }

    /// Force a variant for non-speculative execution
    pub fn with_kind(mut self, kind: TxnKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Set conflict backoff bounds in microseconds
    pub fn with_backoff_us(mut self, base_us: u64, max_us: u64) -> Self {
        self.backoff_base_us = base_us;
        self.backoff_max_us = max_us;
        self
    }

    /// Blocking timeout as a `Duration`
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ns.map(Duration::from_nanos)
    }

    /// Whether the lock modes force a fat variant
    pub fn requires_fat(&self) -> bool {
        self.read_lock_mode != LockMode::None || self.write_lock_mode != LockMode::None
    }

    /// Variant to run when speculation is off
    pub fn non_speculative_kind(&self) -> TxnKind {
        self.kind.unwrap_or(TxnKind::FatVariableLength)
    }

    /// Exponential backoff before conflict attempt `attempt` (1-based)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        // Cap the shift to prevent overflow
        let shift = attempt.saturating_sub(1).min(63);
        let multiplier = 1u64 << shift;
        let delay_us = self.backoff_base_us.saturating_mul(multiplier);
        Duration::from_micros(delay_us.min(self.backoff_max_us))
    }

    /// Check the config for contradictory settings.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if:
    /// - `max_fixed_length` is 0
    /// - `read_lock_mode` is stronger than `write_lock_mode`
    /// - `backoff_base_us` exceeds `backoff_max_us`
    /// - a lean `kind` is forced together with a pessimistic lock mode
    pub fn validate(&self) -> StmResult<()> {
        if self.max_fixed_length == 0 {
            return Err(StmError::invalid_config("max_fixed_length must be at least 1"));
        }
        if self.read_lock_mode > self.write_lock_mode {
            return Err(StmError::invalid_config(format!(
                "read_lock_mode '{}' is stronger than write_lock_mode '{}'",
                self.read_lock_mode, self.write_lock_mode
            )));
        }
        if self.backoff_base_us > self.backoff_max_us {
            return Err(StmError::invalid_config(format!(
                "backoff_base_us {} exceeds backoff_max_us {}",
                self.backoff_base_us, self.backoff_max_us
            )));
        }
        if let Some(kind) = self.kind {
            if kind.is_lean() && self.requires_fat() {
                return Err(StmError::invalid_config(format!(
                    "{} cannot run with pessimistic lock modes",
                    kind
                )));
            }
        }
        Ok(())
    }

    /// Parse and validate a config from TOML text.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the text does not parse or fails
    /// [`TxnConfig::validate`].
    pub fn from_toml_str(content: &str) -> StmResult<Self> {
        let config: TxnConfig = toml::from_str(content)
            .map_err(|e| StmError::invalid_config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> StmResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            StmError::invalid_config(format!(
                "failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> StmResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| StmError::invalid_config(format!("failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            StmError::invalid_config(format!(
                "failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Gamma transaction configuration
#
# Propagation: "requires" (default), "requires_new", "mandatory", "never", "supports"
propagation_level = "requires"

# Start with the cheapest transaction variant and escalate on demand
speculative = true

# Allow retry() to block until a read value changes
blocking_allowed = true

# Skip writes that leave the value unchanged
dirty_check = true

# Attempts allowed after the first one
max_retries = 1000

# Blocking timeout in nanoseconds, shared across attempts (omit to wait forever)
# timeout_ns = 1000000000

# Pessimistic locking: "none", "read", "write", "exclusive"
read_lock_mode = "none"
write_lock_mode = "none"

# Spin budget for contended locks
spin_count = 64

# Capacity of fixed-length transactions
max_fixed_length = 20

# Forced variant when speculative = false (default fat_variable_length)
# kind = "fat_variable_length"

# Conflict backoff bounds in microseconds
backoff_base_us = 1
backoff_max_us = 1000
"#
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config_values() {
        let config = TxnConfig::default();
        assert_eq!(config.propagation_level, PropagationLevel::Requires);
        assert!(config.speculative);
        assert!(config.blocking_allowed);
        assert!(config.dirty_check);
        assert_eq!(config.max_retries, 1000);
        assert_eq!(config.timeout(), None);
        assert_eq!(config.non_speculative_kind(), TxnKind::FatVariableLength);
        assert!(!config.requires_fat());
        config.validate().unwrap();
    }

    #[test]
    fn default_toml_parses_to_default() {
        let config = TxnConfig::from_toml_str(TxnConfig::default_toml()).unwrap();
        assert_eq!(config, TxnConfig::default());
    }

    #[test]
    fn parse_partial_toml() {
        let config = TxnConfig::from_toml_str(
            "propagation_level = \"mandatory\"\ntimeout_ns = 500\nwrite_lock_mode = \"exclusive\"\n",
        )
        .unwrap();
        assert_eq!(config.propagation_level, PropagationLevel::Mandatory);
        assert_eq!(config.timeout(), Some(Duration::from_nanos(500)));
        assert_eq!(config.write_lock_mode, LockMode::Exclusive);
        assert!(config.requires_fat());
        assert_eq!(config.max_retries, DEFAULT_MAX_RETRIES);
    }

    #[test]
    fn parse_invalid_toml_returns_error() {
        let err = TxnConfig::from_toml_str("propagation_level = \"sometimes\"").unwrap_err();
        assert!(matches!(err, StmError::InvalidConfig(_)));
    }

    #[test]
    fn validate_rejects_read_stronger_than_write() {
        let config = TxnConfig::new().with_read_lock_mode(LockMode::Write);
        assert!(config.validate().is_err());
        let config = config.with_write_lock_mode(LockMode::Exclusive);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_lean_kind_with_locks() {
        let config = TxnConfig::new()
            .with_kind(TxnKind::LeanMono)
            .with_write_lock_mode(LockMode::Write);
        assert!(config.validate().is_err());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let config = TxnConfig::new().with_backoff_us(10, 100);
        assert_eq!(config.backoff_delay(1), Duration::from_micros(10));
        assert_eq!(config.backoff_delay(2), Duration::from_micros(20));
        assert_eq!(config.backoff_delay(4), Duration::from_micros(80));
        assert_eq!(config.backoff_delay(5), Duration::from_micros(100));
        assert_eq!(config.backoff_delay(500), Duration::from_micros(100));
    }

    #[test]
    fn file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gamma.toml");
        let config = TxnConfig::new()
            .with_family_name("transfer")
            .with_timeout(Duration::from_millis(5))
            .with_speculative(false)
            .with_kind(TxnKind::FatFixedLength);
        config.write_to_file(&path).unwrap();

        let loaded = TxnConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn missing_file_is_error() {
        let dir = TempDir::new().unwrap();
        assert!(TxnConfig::from_file(&dir.path().join("missing.toml")).is_err());
    }
}
