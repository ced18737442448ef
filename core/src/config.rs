//! Database configuration

use crate::error::{EmberError, EmberResult};
use crate::transaction::Tx;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Batch notification of keys removed by the expiration sweep.
pub type OnExpired = Arc<dyn Fn(Vec<String>) + Send + Sync>;

/// Per-key notification, run inside the sweep's write transaction before the
/// key is deleted. Returning an error keeps the key until the next sweep.
pub type OnExpiredSync = Arc<dyn Fn(&str, &str, &Tx<'_>) -> EmberResult<()> + Send + Sync>;

/// How often committed writes are fsynced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPolicy {
    /// Leave flushing to the operating system.
    Never,
    /// Fsync once per maintenance tick.
    EverySecond,
    /// Fsync on every commit.
    Always,
}

impl TryFrom<i64> for SyncPolicy {
    type Error = EmberError;

    fn try_from(value: i64) -> EmberResult<Self> {
        match value {
            0 => Ok(SyncPolicy::Never),
            1 => Ok(SyncPolicy::EverySecond),
            2 => Ok(SyncPolicy::Always),
            _ => Err(EmberError::InvalidSyncPolicy),
        }
    }
}

impl FromStr for SyncPolicy {
    type Err = EmberError;

    fn from_str(s: &str) -> EmberResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "never" => Ok(SyncPolicy::Never),
            "everysecond" | "every-second" | "every_second" => Ok(SyncPolicy::EverySecond),
            "always" => Ok(SyncPolicy::Always),
            other => match other.parse::<i64>() {
                Ok(n) => SyncPolicy::try_from(n),
                Err(_) => Err(EmberError::InvalidSyncPolicy),
            },
        }
    }
}

impl fmt::Display for SyncPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncPolicy::Never => "never",
            SyncPolicy::EverySecond => "everysecond",
            SyncPolicy::Always => "always",
        };
        f.write_str(name)
    }
}

/// Database configuration
#[derive(Clone)]
pub struct Config {
    pub sync_policy: SyncPolicy,
    /// Growth over the last compacted size, in percent, before an automatic
    /// shrink is considered.
    pub auto_shrink_percentage: u64,
    /// Log size in bytes below which automatic shrinks never run.
    pub auto_shrink_min_size: u64,
    pub auto_shrink_disabled: bool,
    pub on_expired: Option<OnExpired>,
    pub on_expired_sync: Option<OnExpiredSync>,
    /// Period of the background maintenance loop.
    pub maintenance_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sync_policy: SyncPolicy::EverySecond,
            auto_shrink_percentage: 100,
            auto_shrink_min_size: 32 * 1024 * 1024, // 32MB
            auto_shrink_disabled: false,
            on_expired: None,
            on_expired_sync: None,
            maintenance_interval: Duration::from_secs(1),
        }
    }
}

impl Config {
    /// Log size above which the background manager shrinks the log.
    pub(crate) fn shrink_threshold(&self, baseline: u64) -> u64 {
        let grown = baseline.saturating_add(baseline.saturating_mul(self.auto_shrink_percentage) / 100);
        grown.max(self.auto_shrink_min_size)
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("sync_policy", &self.sync_policy)
            .field("auto_shrink_percentage", &self.auto_shrink_percentage)
            .field("auto_shrink_min_size", &self.auto_shrink_min_size)
            .field("auto_shrink_disabled", &self.auto_shrink_disabled)
            .field("on_expired", &self.on_expired.is_some())
            .field("on_expired_sync", &self.on_expired_sync.is_some())
            .field("maintenance_interval", &self.maintenance_interval)
            .finish()
    }
}
