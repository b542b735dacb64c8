//! Configuration for the storage facade
//!
//! Presets cover the common shapes; fields are public for anything else.

use std::fmt;
use std::str::FromStr;

use crate::error::KvError;
use crate::eviction::EvictionPolicy;

/// What happens to a local edit when a slave refuses it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplicationPolicy {
    /// Undo the local edit so the master matches a world where it never happened
    #[default]
    Rollback,
    /// Keep the local edit and only report the failure
    BestEffort,
}

impl FromStr for ReplicationPolicy {
    type Err = KvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "rollback" => Ok(ReplicationPolicy::Rollback),
            "besteffort" => Ok(ReplicationPolicy::BestEffort),
            _ => Err(KvError::InvalidConfig(format!("unknown replication policy {:?}", s))),
        }
    }
}

impl fmt::Display for ReplicationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicationPolicy::Rollback => write!(f, "rollback"),
            ReplicationPolicy::BestEffort => write!(f, "best-effort"),
        }
    }
}

/// layerkv configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Log every edit for undo/redo and replication rollback
    pub version_control: bool,
    /// Version log budget (MB); writes past it still commit but warn
    pub version_limit_mb: f64,
    /// Byte budget of the main connection (0 = unbounded)
    pub cache_max_bytes: u64,
    /// Victim selection for the main connection
    pub cache_policy: EvictionPolicy,
    /// Byte budget of the message-queue cache (0 = unbounded)
    pub queue_max_bytes: u64,
    /// Victim selection for the message-queue cache
    pub queue_policy: EvictionPolicy,
    /// Reaction to a slave refusing an edit
    pub replication: ReplicationPolicy,
}

impl Config {
    /// Versioned, unbounded main store, 1GB queue cache
    pub fn standard() -> Self {
        Self {
            version_control: true,
            version_limit_mb: 128.0,
            cache_max_bytes: 0,
            cache_policy: EvictionPolicy::Lru,
            queue_max_bytes: 1024 * 1024 * 1024,
            queue_policy: EvictionPolicy::Lru,
            replication: ReplicationPolicy::Rollback,
        }
    }

    /// No version log; a refused replication is rolled back by applying the
    /// inverse edit directly
    pub fn unversioned() -> Self {
        Self {
            version_control: false,
            ..Self::standard()
        }
    }

    /// Main store capped at `max_bytes`
    pub fn bounded(max_bytes: u64) -> Self {
        Self {
            cache_max_bytes: max_bytes,
            ..Self::standard()
        }
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if !(self.version_limit_mb.is_finite() && self.version_limit_mb > 0.0) {
            return Err("version_limit_mb must be a finite number > 0".into());
        }
        if usize::try_from(self.cache_max_bytes).is_err() {
            return Err("cache_max_bytes does not fit in memory on this platform".into());
        }
        if usize::try_from(self.queue_max_bytes).is_err() {
            return Err("queue_max_bytes does not fit in memory on this platform".into());
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self { Self::standard() }
}
