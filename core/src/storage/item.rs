//! Stored items and expiration helpers.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A key/value record with an optional absolute expiration.
///
/// Items are immutable once built. The keyspace, the expiration index and
/// every secondary index share the same `Arc<Item>`; an update swaps in a
/// new item rather than mutating the old one, which keeps the old one around
/// for rollback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub key: String,
    pub value: String,
    pub expires_at: Option<SystemTime>,
}

impl Item {
    /// Create an item without expiration.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            expires_at: None,
        }
    }

    /// Create an item expiring at an absolute time.
    pub fn expiring_at(key: impl Into<String>, value: impl Into<String>, at: SystemTime) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            expires_at: Some(at),
        }
    }

    pub fn into_shared(self) -> Arc<Item> {
        Arc::new(self)
    }

    /// Whether the item is expired at `now`.
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(SystemTime::now())
    }

    /// Remaining time to live, or None if the item never expires.
    pub fn ttl(&self, now: SystemTime) -> Option<Duration> {
        self.expires_at
            .map(|at| at.duration_since(now).unwrap_or(Duration::ZERO))
    }
}

/// Milliseconds since the unix epoch, saturating at zero for earlier times.
pub fn to_unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The time `millis` after the unix epoch, or None past the platform's
/// representable range.
pub fn from_unix_millis(millis: u64) -> Option<SystemTime> {
    UNIX_EPOCH.checked_add(Duration::from_millis(millis))
}
