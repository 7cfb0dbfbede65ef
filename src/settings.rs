//! Tunable constants and bucket configuration.

use serde::Deserialize;
use std::fs;
use std::path::Path;

/// How fast the store's logical clock advances relative to wall-clock time.
pub const CORE_VERSIONS_PER_SECOND: i64 = 1_000_000;

/// Default task lease length, expressed in store versions (60 seconds).
pub const DEFAULT_TIMEOUT_VERSIONS: i64 = 60 * CORE_VERSIONS_PER_SECOND;

/// Highest priority level. Priorities are integers in `[0, MAX_PRIORITY]`.
pub const MAX_PRIORITY: i64 = 5;

/// Probability that a claim transaction first sweeps the timeouts subspace,
/// so expired tasks keep getting requeued even when new work never runs dry.
pub const CHECK_TIMEOUT_CHANCE: f64 = 0.02;

/// Lease jitter: the effective lease is `timeout_versions * (OFFSET + RANGE * rand01())`.
pub const TIMEOUT_JITTER_OFFSET: f64 = 0.9;
pub const TIMEOUT_JITTER_RANGE: f64 = 0.2;

/// How many times `check_active` polls the active marker, and how long it
/// sleeps between polls.
pub const CHECK_ACTIVE_AMOUNT: usize = 10;
pub const CHECK_ACTIVE_DELAY_MS: u64 = 20;

/// Maximum timeout rows moved by a single requeue scan.
pub const MAX_TASK_KEYS: usize = 1000;

/// Row limit for reads that are expected to fetch an entire (small) range.
pub const TOO_MANY: usize = 1_000_000;

fn default_timeout_versions() -> i64 {
    DEFAULT_TIMEOUT_VERSIONS
}

fn default_max_priority() -> i64 {
    MAX_PRIORITY
}

fn default_check_timeout_chance() -> f64 {
    CHECK_TIMEOUT_CHANCE
}

/// Configuration for a [`crate::TaskBucket`].
///
/// Every field has a serde default matching the constants above, so a bucket
/// section in a TOML config file may set only the fields it cares about.
#[derive(Debug, Clone, Deserialize)]
pub struct BucketSettings {
    /// Lease length in store versions for newly claimed tasks.
    #[serde(default = "default_timeout_versions")]
    pub timeout_versions: i64,
    /// Highest priority this bucket partitions by.
    #[serde(default = "default_max_priority")]
    pub max_priority: i64,
    /// Probability that a claim first requeues timed-out tasks.
    #[serde(default = "default_check_timeout_chance")]
    pub check_timeout_chance: f64,
    /// Run claim transactions at batch priority (longer conflict backoff).
    #[serde(default)]
    pub priority_batch: bool,
    /// Fault-injection mode: perturb lease-race timers by a random factor in
    /// [0, 2) to shake out ordering assumptions in task bodies.
    #[serde(default)]
    pub timeout_fault_injection: bool,
}

impl Default for BucketSettings {
    fn default() -> Self {
        Self {
            timeout_versions: default_timeout_versions(),
            max_priority: default_max_priority(),
            check_timeout_chance: default_check_timeout_chance(),
            priority_batch: false,
            timeout_fault_injection: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

impl BucketSettings {
    /// Load settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let raw = fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }
}
