//! Secondary indexes
//!
//! An index is a named view over the items whose keys match a glob pattern,
//! ordered by a chain of `Less` comparators over the item values. Ties left
//! by the whole chain are broken by key, so every item has exactly one
//! position in the index.

use super::item::Item;
use crate::error::EmberResult;
use super::pattern::Pattern;
use std::cmp::Ordering;
use std::collections::{BTreeSet, btree_set};
use std::fmt;
use std::ops::Bound;
use std::sync::Arc;

/// Strict "a sorts before b" over two values.
pub type Less = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// Options for index creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexOptions {
    /// Match the key pattern ignoring ASCII/Unicode case.
    pub case_insensitive_key_matching: bool,
}

/// Ordering of values inside one index.
pub struct IndexOrder {
    lesses: Vec<Less>,
}

impl IndexOrder {
    pub fn new(lesses: Vec<Less>) -> Self {
        let lesses = if lesses.is_empty() {
            vec![index_binary()]
        } else {
            lesses
        };
        Self { lesses }
    }

    pub fn compare(&self, a: &str, b: &str) -> Ordering {
        for less in &self.lesses {
            if less(a, b) {
                return Ordering::Less;
            }
            if less(b, a) {
                return Ordering::Greater;
            }
        }
        Ordering::Equal
    }
}

/// Where an entry sits relative to real items that share its value.
/// Probes use `Before`/`After` so range bounds cover every key with the
/// pivot value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edge {
    Before,
    Exact,
    After,
}

#[derive(Clone)]
pub(crate) struct IndexEntry {
    item: Arc<Item>,
    order: Arc<IndexOrder>,
    edge: Edge,
}

impl IndexEntry {
    pub(crate) fn item(&self) -> &Arc<Item> {
        &self.item
    }
}

impl PartialEq for IndexEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexEntry {}

impl PartialOrd for IndexEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.order
            .compare(&self.item.value, &other.item.value)
            .then_with(|| match (self.edge, other.edge) {
                (Edge::Exact, Edge::Exact) => self.item.key.cmp(&other.item.key),
                (Edge::Before, Edge::Before) | (Edge::After, Edge::After) => Ordering::Equal,
                (Edge::Before, _) | (_, Edge::After) => Ordering::Less,
                (_, Edge::Before) | (Edge::After, _) => Ordering::Greater,
            })
    }
}

/// A named secondary index.
#[derive(Clone)]
pub struct Index {
    name: String,
    pattern: Pattern,
    options: IndexOptions,
    order: Arc<IndexOrder>,
    entries: BTreeSet<IndexEntry>,
}

impl Index {
    pub fn new(
        name: &str,
        pattern: &str,
        options: IndexOptions,
        lesses: Vec<Less>,
    ) -> EmberResult<Self> {
        Ok(Self {
            name: name.to_string(),
            pattern: Pattern::new(pattern, options.case_insensitive_key_matching)?,
            options,
            order: Arc::new(IndexOrder::new(lesses)),
            entries: BTreeSet::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn options(&self) -> IndexOptions {
        self.options
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn matches(&self, key: &str) -> bool {
        self.pattern.matches(key)
    }

    /// Add the item if its key belongs to this index.
    pub(crate) fn insert(&mut self, item: &Arc<Item>) {
        if self.matches(&item.key) {
            let entry = self.entry(Arc::clone(item), Edge::Exact);
            self.entries.insert(entry);
        }
    }

    pub(crate) fn remove(&mut self, item: &Arc<Item>) {
        if self.matches(&item.key) {
            let entry = self.entry(Arc::clone(item), Edge::Exact);
            self.entries.remove(&entry);
        }
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    /// Entries between two value bounds, in index order.
    pub(crate) fn range(
        &self,
        lower: Bound<&str>,
        upper: Bound<&str>,
    ) -> Option<btree_set::Range<'_, IndexEntry>> {
        let lower = match lower {
            Bound::Included(v) => Bound::Included(self.pivot_entry(v, Edge::Before)),
            Bound::Excluded(v) => Bound::Excluded(self.pivot_entry(v, Edge::After)),
            Bound::Unbounded => Bound::Unbounded,
        };
        let upper = match upper {
            Bound::Included(v) => Bound::Included(self.pivot_entry(v, Edge::After)),
            Bound::Excluded(v) => Bound::Excluded(self.pivot_entry(v, Edge::Before)),
            Bound::Unbounded => Bound::Unbounded,
        };

        if !super::keyspace::is_valid_range(&lower, &upper) {
            return None;
        }
        Some(self.entries.range((lower, upper)))
    }

    /// Keys in index order.
    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.item.key.clone()).collect()
    }

    fn pivot_entry(&self, value: &str, edge: Edge) -> IndexEntry {
        self.entry(Item::new("", value).into_shared(), edge)
    }

    fn entry(&self, item: Arc<Item>, edge: Edge) -> IndexEntry {
        IndexEntry {
            item,
            order: Arc::clone(&self.order),
            edge,
        }
    }
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Index")
            .field("name", &self.name)
            .field("pattern", &self.pattern.as_str())
            .field("options", &self.options)
            .field("len", &self.entries.len())
            .finish()
    }
}

// Comparators

/// Byte-wise value order.
pub fn index_binary() -> Less {
    Arc::new(|a: &str, b: &str| a.as_bytes() < b.as_bytes())
}

/// Case-insensitive string order.
pub fn index_string() -> Less {
    Arc::new(case_insensitive_less)
}

/// Signed integer order. Unparsable values sort as zero.
pub fn index_int() -> Less {
    Arc::new(|a: &str, b: &str| parse_or_zero::<i64>(a) < parse_or_zero::<i64>(b))
}

/// Unsigned integer order. Unparsable values sort as zero.
pub fn index_uint() -> Less {
    Arc::new(|a: &str, b: &str| parse_or_zero::<u64>(a) < parse_or_zero::<u64>(b))
}

/// Floating point order. Unparsable values sort as zero.
pub fn index_float() -> Less {
    Arc::new(|a: &str, b: &str| parse_or_zero::<f64>(a) < parse_or_zero::<f64>(b))
}

/// Order by the field at a dotted `path` inside JSON values.
///
/// Types sort null < false < numbers < strings < true < objects/arrays.
/// Numbers compare numerically, strings case-insensitively. Missing fields
/// and invalid documents count as null.
pub fn index_json(path: &str) -> Less {
    let path: Vec<String> = path.split('.').map(str::to_string).collect();
    Arc::new(move |a: &str, b: &str| {
        let a = json_field(a, &path);
        let b = json_field(b, &path);
        json_less(&a, &b)
    })
}

/// Reverse another comparator.
pub fn desc(less: Less) -> Less {
    Arc::new(move |a: &str, b: &str| less(b, a))
}

fn case_insensitive_less(a: &str, b: &str) -> bool {
    a.bytes()
        .map(|c| c.to_ascii_lowercase())
        .lt(b.bytes().map(|c| c.to_ascii_lowercase()))
}

fn parse_or_zero<T: std::str::FromStr + Default>(s: &str) -> T {
    s.trim().parse().unwrap_or_default()
}

fn json_field(doc: &str, path: &[String]) -> serde_json::Value {
    let Ok(mut value) = serde_json::from_str::<serde_json::Value>(doc) else {
        return serde_json::Value::Null;
    };
    for part in path {
        value = match value {
            serde_json::Value::Object(mut map) => map.remove(part).unwrap_or_default(),
            serde_json::Value::Array(mut items) => match part.parse::<usize>() {
                Ok(i) if i < items.len() => items.swap_remove(i),
                _ => serde_json::Value::Null,
            },
            _ => serde_json::Value::Null,
        };
    }
    value
}

fn json_rank(value: &serde_json::Value) -> u8 {
    use serde_json::Value;
    match value {
        Value::Null => 0,
        Value::Bool(false) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Bool(true) => 4,
        Value::Array(_) | Value::Object(_) => 5,
    }
}

fn json_less(a: &serde_json::Value, b: &serde_json::Value) -> bool {
    use serde_json::Value;
    let (ra, rb) = (json_rank(a), json_rank(b));
    if ra != rb {
        return ra < rb;
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            x.as_f64().unwrap_or_default() < y.as_f64().unwrap_or_default()
        }
        (Value::String(x), Value::String(y)) => case_insensitive_less(x, y),
        _ => a.to_string() < b.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_with(lesses: Vec<Less>, items: &[(&str, &str)]) -> Index {
        let mut index = Index::new("idx", "*", IndexOptions::default(), lesses).unwrap();
        for (k, v) in items {
            index.insert(&Item::new(*k, *v).into_shared());
        }
        index
    }

    #[test]
    fn test_default_order_breaks_ties_by_key() {
        let index = index_with(vec![], &[("b", "1"), ("a", "1"), ("c", "0")]);
        assert_eq!(index.keys(), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_numeric_and_desc_order() {
        let items = [("a", "10"), ("b", "9"), ("c", "-3")];
        assert_eq!(index_with(vec![index_int()], &items).keys(), vec!["c", "b", "a"]);
        assert_eq!(
            index_with(vec![desc(index_int())], &items).keys(),
            vec!["a", "b", "c"]
        );
        assert_eq!(index_with(vec![index_binary()], &items).keys(), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_chained_comparators() {
        let by_last = index_json("name.last");
        let by_age = index_json("age");
        let index = index_with(
            vec![by_last, by_age],
            &[
                ("1", r#"{"name":{"last":"Smith"},"age":40}"#),
                ("2", r#"{"name":{"last":"adams"},"age":30}"#),
                ("3", r#"{"name":{"last":"smith"},"age":20}"#),
            ],
        );
        assert_eq!(index.keys(), vec!["2", "3", "1"]);
    }

    #[test]
    fn test_pattern_membership() {
        let mut index = Index::new("users", "user:*", IndexOptions::default(), vec![]).unwrap();
        index.insert(&Item::new("user:1", "x").into_shared());
        index.insert(&Item::new("order:1", "x").into_shared());
        assert_eq!(index.len(), 1);

        let mut ci = Index::new(
            "users",
            "user:*",
            IndexOptions {
                case_insensitive_key_matching: true,
            },
            vec![],
        )
        .unwrap();
        ci.insert(&Item::new("USER:1", "x").into_shared());
        assert_eq!(ci.len(), 1);
    }

    #[test]
    fn test_value_ranges() {
        let index = index_with(
            vec![index_int()],
            &[("a", "1"), ("b", "2"), ("c", "2"), ("d", "3")],
        );
        let keys = |lo, hi| -> Vec<String> {
            index
                .range(lo, hi)
                .map(|it| it.map(|e| e.item().key.clone()).collect())
                .unwrap_or_default()
        };

        assert_eq!(keys(Bound::Included("2"), Bound::Included("2")), vec!["b", "c"]);
        assert_eq!(keys(Bound::Excluded("1"), Bound::Excluded("3")), vec!["b", "c"]);
        assert_eq!(keys(Bound::Unbounded, Bound::Excluded("2")), vec!["a"]);
        assert!(keys(Bound::Included("3"), Bound::Excluded("1")).is_empty());
    }

    #[test]
    fn test_remove_uses_value_and_key() {
        let a = Item::new("a", "5").into_shared();
        let mut index = index_with(vec![], &[("b", "5")]);
        index.insert(&a);
        index.remove(&a);
        assert_eq!(index.keys(), vec!["b"]);
    }
}
