//! Ordered keyspace.
//!
//! Owns the primary key order, the expiration index and the secondary
//! indexes, and updates all three in the same call for every mutation so no
//! reader ever sees them disagree.

use super::expiry::ExpirationIndex;
use super::index::Index;
use super::item::Item;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use std::time::SystemTime;

/// Whether `(lower, upper)` is a range `BTreeMap::range` accepts.
pub(crate) fn is_valid_range<T: Ord>(lower: &Bound<T>, upper: &Bound<T>) -> bool {
    match (lower, upper) {
        (Bound::Excluded(a), Bound::Excluded(b)) => a < b,
        (Bound::Included(a) | Bound::Excluded(a), Bound::Included(b) | Bound::Excluded(b)) => {
            a <= b
        }
        _ => true,
    }
}

/// Scan direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

fn walk<'a, I, F>(items: I, direction: Direction, step: &mut F)
where
    I: DoubleEndedIterator<Item = &'a Arc<Item>>,
    F: FnMut(&'a Arc<Item>) -> bool,
{
    match direction {
        Direction::Ascending => {
            for item in items {
                if !step(item) {
                    break;
                }
            }
        }
        Direction::Descending => {
            for item in items.rev() {
                if !step(item) {
                    break;
                }
            }
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct Keyspace {
    keys: BTreeMap<String, Arc<Item>>,
    exps: ExpirationIndex,
    indexes: BTreeMap<String, Index>,
}

impl Keyspace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Arc<Item>> {
        self.keys.get(key)
    }

    /// Insert or replace an item, returning the one it replaced.
    pub fn insert(&mut self, item: Arc<Item>) -> Option<Arc<Item>> {
        let prev = self.keys.insert(item.key.clone(), Arc::clone(&item));
        if let Some(prev) = &prev {
            self.unlink(prev);
        }
        self.exps.insert(&item);
        for index in self.indexes.values_mut() {
            index.insert(&item);
        }
        prev
    }

    /// Remove a key from every structure.
    pub fn remove(&mut self, key: &str) -> Option<Arc<Item>> {
        let prev = self.keys.remove(key)?;
        self.unlink(&prev);
        Some(prev)
    }

    /// Remove every item, keeping index definitions.
    pub fn clear(&mut self) -> Vec<Arc<Item>> {
        let items = std::mem::take(&mut self.keys).into_values().collect();
        self.exps.clear();
        for index in self.indexes.values_mut() {
            index.clear();
        }
        items
    }

    fn unlink(&mut self, item: &Arc<Item>) {
        self.exps.remove(item);
        for index in self.indexes.values_mut() {
            index.remove(item);
        }
    }

    pub fn expiration(&self) -> &ExpirationIndex {
        &self.exps
    }

    // Indexes

    pub fn has_index(&self, name: &str) -> bool {
        self.indexes.contains_key(name)
    }

    pub fn index(&self, name: &str) -> Option<&Index> {
        self.indexes.get(name)
    }

    pub fn index_names(&self) -> Vec<String> {
        self.indexes.keys().cloned().collect()
    }

    /// Fill `index` from the current items and register it.
    pub fn build_index(&mut self, mut index: Index) {
        for item in self.keys.values() {
            index.insert(item);
        }
        self.indexes.insert(index.name().to_string(), index);
    }

    /// Register an index whose contents are already in sync.
    pub(crate) fn restore_index(&mut self, index: Index) {
        self.indexes.insert(index.name().to_string(), index);
    }

    pub fn take_index(&mut self, name: &str) -> Option<Index> {
        self.indexes.remove(name)
    }

    // Scans

    /// Visit live items of `index` (`""` is the key order) between two
    /// bounds. Pivots are keys for the key order and values for secondary
    /// indexes. Returns `None` when the index does not exist.
    pub fn scan<'a, F>(
        &'a self,
        index: &str,
        lower: Bound<&str>,
        upper: Bound<&str>,
        direction: Direction,
        now: SystemTime,
        mut visit: F,
    ) -> Option<()>
    where
        F: FnMut(&'a Arc<Item>) -> bool,
    {
        let mut step = |item: &'a Arc<Item>| item.is_expired_at(now) || visit(item);

        if index.is_empty() {
            if is_valid_range(&lower, &upper) {
                let range = self.keys.range::<str, _>((lower, upper)).map(|(_, item)| item);
                walk(range, direction, &mut step);
            }
            return Some(());
        }

        let index = self.indexes.get(index)?;
        if let Some(range) = index.range(lower, upper) {
            walk(range.map(|entry| entry.item()), direction, &mut step);
        }
        Some(())
    }

    /// Every item in key order, expired or not.
    pub fn items(&self) -> impl DoubleEndedIterator<Item = &Arc<Item>> {
        self.keys.values()
    }

    /// Items from `lower` onwards, in key order, expired or not.
    pub fn items_from<'a>(&'a self, lower: Bound<&str>) -> impl Iterator<Item = &'a Arc<Item>> + use<'a> {
        self.keys
            .range::<str, _>((lower, Bound::Unbounded))
            .map(|(_, item)| item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::index::{IndexOptions, index_int};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn keys_of(ks: &Keyspace, index: &str, lo: Bound<&str>, hi: Bound<&str>, dir: Direction) -> Vec<String> {
        let mut out = Vec::new();
        ks.scan(index, lo, hi, dir, SystemTime::now(), |item| {
            out.push(item.key.clone());
            true
        })
        .expect("index exists");
        out
    }

    #[test]
    fn test_insert_replace_remove() {
        let mut ks = Keyspace::new();
        assert!(ks.insert(Item::new("a", "1").into_shared()).is_none());
        let prev = ks.insert(Item::new("a", "2").into_shared()).unwrap();
        assert_eq!(prev.value, "1");
        assert_eq!(ks.get("a").unwrap().value, "2");
        assert_eq!(ks.len(), 1);

        assert_eq!(ks.remove("a").unwrap().value, "2");
        assert!(ks.remove("a").is_none());
        assert!(ks.is_empty());
    }

    #[test]
    fn test_mutations_maintain_derived_structures() {
        let mut ks = Keyspace::new();
        ks.build_index(
            Index::new("nums", "n:*", IndexOptions::default(), vec![index_int()]).unwrap(),
        );

        let at = SystemTime::now() + Duration::from_secs(60);
        ks.insert(Item::expiring_at("n:1", "30", at).into_shared());
        ks.insert(Item::new("n:2", "20").into_shared());
        ks.insert(Item::new("other", "10").into_shared());
        assert_eq!(ks.expiration().len(), 1);
        assert_eq!(ks.index("nums").unwrap().keys(), vec!["n:2", "n:1"]);

        // Replacing drops the expiration and moves the index entry.
        ks.insert(Item::new("n:1", "5").into_shared());
        assert!(ks.expiration().is_empty());
        assert_eq!(ks.index("nums").unwrap().keys(), vec!["n:1", "n:2"]);

        ks.remove("n:2");
        assert_eq!(ks.index("nums").unwrap().keys(), vec!["n:1"]);

        let cleared = ks.clear();
        assert_eq!(cleared.len(), 2);
        assert!(ks.has_index("nums"));
        assert!(ks.index("nums").unwrap().is_empty());
    }

    #[test]
    fn test_key_scans() {
        let mut ks = Keyspace::new();
        for k in ["a", "b", "c", "d"] {
            ks.insert(Item::new(k, k).into_shared());
        }
        let asc = Direction::Ascending;
        let desc = Direction::Descending;

        assert_eq!(keys_of(&ks, "", Bound::Unbounded, Bound::Unbounded, desc), vec!["d", "c", "b", "a"]);
        assert_eq!(keys_of(&ks, "", Bound::Included("b"), Bound::Excluded("d"), asc), vec!["b", "c"]);
        assert_eq!(keys_of(&ks, "", Bound::Excluded("b"), Bound::Included("d"), desc), vec!["d", "c"]);
        assert!(keys_of(&ks, "", Bound::Included("d"), Bound::Excluded("a"), asc).is_empty());
        assert!(ks
            .scan("missing", Bound::Unbounded, Bound::Unbounded, asc, SystemTime::now(), |_| true)
            .is_none());
    }

    #[test]
    fn test_scan_skips_expired_and_stops_early() {
        let mut ks = Keyspace::new();
        let past = SystemTime::now() - Duration::from_secs(1);
        ks.insert(Item::new("a", "1").into_shared());
        ks.insert(Item::expiring_at("b", "2", past).into_shared());
        ks.insert(Item::new("c", "3").into_shared());

        let all = keys_of(&ks, "", Bound::Unbounded, Bound::Unbounded, Direction::Ascending);
        assert_eq!(all, vec!["a", "c"]);

        let mut seen = Vec::new();
        ks.scan("", Bound::Unbounded, Bound::Unbounded, Direction::Ascending, SystemTime::now(), |item| {
            seen.push(item.key.clone());
            false
        });
        assert_eq!(seen, vec!["a"]);
    }
}
