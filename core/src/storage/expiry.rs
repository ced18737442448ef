//! Expiration index ordered by (expiration time, key).

use super::item::Item;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::SystemTime;

#[derive(Debug, Clone)]
struct ExpiryEntry {
    at: SystemTime,
    item: Arc<Item>,
}

impl PartialEq for ExpiryEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ExpiryEntry {}

impl PartialOrd for ExpiryEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ExpiryEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.at
            .cmp(&other.at)
            .then_with(|| self.item.key.cmp(&other.item.key))
    }
}

/// Items that carry an expiration, earliest first.
#[derive(Debug, Clone, Default)]
pub struct ExpirationIndex {
    entries: BTreeSet<ExpiryEntry>,
}

impl ExpirationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track an item. Items without expiration are ignored.
    pub fn insert(&mut self, item: &Arc<Item>) {
        if let Some(at) = item.expires_at {
            self.entries.insert(ExpiryEntry {
                at,
                item: Arc::clone(item),
            });
        }
    }

    /// Stop tracking an item.
    pub fn remove(&mut self, item: &Arc<Item>) {
        if let Some(at) = item.expires_at {
            self.entries.remove(&ExpiryEntry {
                at,
                item: Arc::clone(item),
            });
        }
    }

    /// The item with the earliest expiration.
    pub fn next_expiring(&self) -> Option<&Arc<Item>> {
        self.entries.first().map(|entry| &entry.item)
    }

    /// Up to `limit` items expired at `now`, earliest first.
    pub fn expired(&self, now: SystemTime, limit: usize) -> Vec<Arc<Item>> {
        self.entries
            .iter()
            .take_while(|entry| entry.at <= now)
            .take(limit)
            .map(|entry| Arc::clone(&entry.item))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// (expiration, key) pairs in index order.
    pub fn snapshot(&self) -> Vec<(SystemTime, String)> {
        self.entries
            .iter()
            .map(|entry| (entry.at, entry.item.key.clone()))
            .collect()
    }
}
