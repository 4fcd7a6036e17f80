//! Layered configuration for the locking core.
//!
//! Values are resolved in this order, later sources overriding earlier ones:
//!
//! 1. Built-in defaults ([`LockCoreConfig::default`])
//! 2. An optional TOML file
//! 3. Environment variables prefixed with `VECLOCK_`, nested with `__`
//!    (for example `VECLOCK_DEADLOCK__SCAN_INTERVAL_MS=50`)
//!
//! ```toml
//! [retry]
//! max_retries = 16
//! backoff_initial_ns = 64
//! backoff_max_ns = 1000000
//!
//! [deadlock]
//! policy = "prevent"
//! scan_interval_ms = 100
//! ```

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "VECLOCK_";

/// Configuration validation and loading errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A field holds a value outside its accepted range.
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue {
        /// Dotted path of the offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },

    /// The configuration sources could not be read or parsed.
    #[error("Failed to load configuration: {0}")]
    Load(String),

    /// The configuration could not be rendered back to TOML.
    #[error("Failed to serialize configuration: {0}")]
    Serialize(String),
}

/// Retry and backoff policy for the lock-free primitive layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries allowed before a lock-free path must fall back to blocking.
    pub max_retries: u32,
    /// First backoff delay in nanoseconds.
    pub backoff_initial_ns: u64,
    /// Cap on the backoff delay in nanoseconds.
    pub backoff_max_ns: u64,
    /// Random jitter applied to each delay, in percent of the delay.
    pub jitter_percent: u8,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 16,
            backoff_initial_ns: 64,
            backoff_max_ns: 1_000_000,
            jitter_percent: 25,
        }
    }
}

/// Per-resource lock manager settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Longest single sleep of a blocked writer before it re-checks the lock,
    /// its cancellation signal and its deadlock-victim flag (microseconds).
    pub wait_slice_us: u64,
    /// Number of idle (zero-reference) locks kept in the global table before
    /// releases start evicting them.
    pub retain_idle: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            wait_slice_us: 1_000,
            retain_idle: 4_096,
        }
    }
}

impl ManagerConfig {
    /// Returns the wait slice as a [`Duration`].
    #[must_use]
    pub fn wait_slice(&self) -> Duration {
        Duration::from_micros(self.wait_slice_us)
    }
}

/// NUMA topology and per-node cache settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NumaConfig {
    /// Number of NUMA nodes the static topology exposes.
    pub nodes: usize,
    /// Maximum entries in each node's lock cache.
    pub cache_capacity: usize,
}

impl Default for NumaConfig {
    fn default() -> Self {
        Self {
            nodes: 1,
            cache_capacity: 4_096,
        }
    }
}

/// How the manager uses the dependency graph when a context takes a second lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeadlockPolicy {
    /// Check reachability before inserting an edge; refuse with `WouldDeadlock`.
    #[default]
    Prevent,
    /// Record edges without checking; the periodic scan breaks cycles.
    Detect,
    /// Do not track dependencies at all.
    Off,
}

/// Deadlock detector settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadlockConfig {
    /// Dependency tracking policy.
    pub policy: DeadlockPolicy,
    /// Run the periodic background scan.
    pub background_scan: bool,
    /// Period of the background scan in milliseconds.
    pub scan_interval_ms: u64,
    /// Maximum depth explored by reachability checks and cycle scans.
    pub max_depth: usize,
    /// Maximum number of cycles collected in one scan pass.
    pub max_cycles_per_scan: usize,
}

impl Default for DeadlockConfig {
    fn default() -> Self {
        Self {
            policy: DeadlockPolicy::Prevent,
            background_scan: true,
            scan_interval_ms: 100,
            max_depth: 32,
            max_cycles_per_scan: 16,
        }
    }
}

impl DeadlockConfig {
    /// Returns the scan period as a [`Duration`].
    #[must_use]
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }
}

/// Complete configuration of a [`LockCore`](crate::LockCore).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LockCoreConfig {
    /// Lock-free retry policy.
    pub retry: RetryConfig,
    /// Resource lock manager.
    pub manager: ManagerConfig,
    /// NUMA cache.
    pub numa: NumaConfig,
    /// Deadlock detector.
    pub deadlock: DeadlockConfig,
}

impl LockCoreConfig {
    /// Loads configuration from defaults, an optional TOML file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ConfigError::Load(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parses configuration from a TOML string layered over the defaults.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::string(source))
            .extract()
            .map_err(|e| ConfigError::Load(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Renders the configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))
    }

    /// Checks every field against its accepted range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_retries == 0 {
            return Err(invalid("retry.max_retries", "must be at least 1"));
        }
        if self.retry.backoff_initial_ns == 0 {
            return Err(invalid("retry.backoff_initial_ns", "must be at least 1"));
        }
        if self.retry.backoff_max_ns < self.retry.backoff_initial_ns {
            return Err(invalid(
                "retry.backoff_max_ns",
                format!(
                    "{} is below backoff_initial_ns ({})",
                    self.retry.backoff_max_ns, self.retry.backoff_initial_ns
                ),
            ));
        }
        if self.retry.jitter_percent > 100 {
            return Err(invalid("retry.jitter_percent", "must be within 0..=100"));
        }
        if self.manager.wait_slice_us == 0 {
            return Err(invalid("manager.wait_slice_us", "must be at least 1"));
        }
        if self.numa.nodes == 0 {
            return Err(invalid("numa.nodes", "must be at least 1"));
        }
        if self.deadlock.scan_interval_ms == 0 {
            return Err(invalid("deadlock.scan_interval_ms", "must be at least 1"));
        }
        if self.deadlock.max_depth == 0 {
            return Err(invalid("deadlock.max_depth", "must be at least 1"));
        }
        if self.deadlock.max_cycles_per_scan == 0 {
            return Err(invalid("deadlock.max_cycles_per_scan", "must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.into(),
    }
}
