//! Transactions
//!
//! A transaction holds the store lock for its whole lifetime: shared for
//! readers, exclusive for the single writer. Mutations are applied to memory
//! immediately and recorded in an undo log; commit appends the net write set
//! to the log file, rollback replays the undo log newest-first.

use crate::config::{Config, SyncPolicy};
use crate::db::{DbState, Shared, Store};
use crate::error::{EmberError, EmberResult};
use crate::storage::aof::Record;
use crate::storage::index::{Index, IndexOptions, Less};
use crate::storage::item::Item;
use crate::storage::keyspace::Direction;
use crate::storage::pattern::Pattern;
use parking_lot::{RwLockReadGuard, RwLockWriteGuard};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Options for [`Tx::set`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Whether the item expires at all.
    pub expires: bool,
    /// Time to live, counted from the `set` call.
    pub ttl: Duration,
}

impl SetOptions {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self { expires: true, ttl }
    }
}

enum Guard<'db> {
    Read(RwLockReadGuard<'db, Store>),
    Write(RwLockWriteGuard<'db, Store>),
}

impl Guard<'_> {
    fn store(&self) -> &Store {
        match self {
            Guard::Read(guard) => &**guard,
            Guard::Write(guard) => &**guard,
        }
    }
}

/// How to reverse one mutation.
enum Undo {
    /// The key did not exist.
    Absent(String),
    /// The key held this item.
    Prior(Arc<Item>),
    /// Every item before a `delete_all`.
    Cleared(Vec<Arc<Item>>),
    IndexCreated(String),
    IndexDropped(Index),
}

struct TxState<'db> {
    guard: Guard<'db>,
    undo: Vec<Undo>,
    /// Final state of every touched key, `None` for deleted.
    writes: BTreeMap<String, Option<Arc<Item>>>,
    /// `delete_all` ran; the log gets a `flushdb` ahead of the writes.
    flushed: bool,
}

impl TxState<'_> {
    fn set(&mut self, item: Arc<Item>) -> EmberResult<Option<Arc<Item>>> {
        let Guard::Write(store) = &mut self.guard else {
            return Err(EmberError::TxNotWritable);
        };
        let prior = store.keyspace.get(&item.key).cloned();
        self.undo.push(match &prior {
            Some(prior) => Undo::Prior(Arc::clone(prior)),
            None => Undo::Absent(item.key.clone()),
        });
        self.writes.insert(item.key.clone(), Some(Arc::clone(&item)));
        store.keyspace.insert(item);
        Ok(prior)
    }

    fn delete(&mut self, key: &str) -> EmberResult<Option<Arc<Item>>> {
        let Guard::Write(store) = &mut self.guard else {
            return Err(EmberError::TxNotWritable);
        };
        let Some(prior) = store.keyspace.get(key).cloned() else {
            return Ok(None);
        };
        self.undo.push(Undo::Prior(Arc::clone(&prior)));
        self.writes.insert(key.to_string(), None);
        store.keyspace.remove(key);
        Ok(Some(prior))
    }

    fn delete_all(&mut self) -> EmberResult<()> {
        let Guard::Write(store) = &mut self.guard else {
            return Err(EmberError::TxNotWritable);
        };
        let cleared = store.keyspace.clear();
        self.undo.push(Undo::Cleared(cleared));
        self.writes.clear();
        self.flushed = true;
        Ok(())
    }

    fn create_index(&mut self, index: Index) -> EmberResult<()> {
        let Guard::Write(store) = &mut self.guard else {
            return Err(EmberError::TxNotWritable);
        };
        if index.name().is_empty() || store.keyspace.has_index(index.name()) {
            return Err(EmberError::IndexExists);
        }
        self.undo.push(Undo::IndexCreated(index.name().to_string()));
        store.keyspace.build_index(index);
        Ok(())
    }

    fn drop_index(&mut self, name: &str) -> EmberResult<()> {
        let Guard::Write(store) = &mut self.guard else {
            return Err(EmberError::TxNotWritable);
        };
        if name.is_empty() {
            return Err(EmberError::InvalidOperation);
        }
        let index = store.keyspace.take_index(name).ok_or(EmberError::NotFound)?;
        self.undo.push(Undo::IndexDropped(index));
        Ok(())
    }

    fn undo_all(&mut self) {
        let Guard::Write(store) = &mut self.guard else {
            return;
        };
        let keyspace = &mut store.keyspace;
        while let Some(entry) = self.undo.pop() {
            match entry {
                Undo::Absent(key) => {
                    keyspace.remove(&key);
                }
                Undo::Prior(item) => {
                    keyspace.insert(item);
                }
                Undo::Cleared(items) => {
                    keyspace.clear();
                    for item in items {
                        keyspace.insert(item);
                    }
                }
                Undo::IndexCreated(name) => {
                    keyspace.take_index(&name);
                }
                Undo::IndexDropped(index) => keyspace.restore_index(index),
            }
        }
    }

    /// Append the net write set to the log, if there is one.
    fn persist(&mut self) -> EmberResult<()> {
        let Guard::Write(guard) = &mut self.guard else {
            return Err(EmberError::TxNotWritable);
        };
        if !self.flushed && self.writes.is_empty() {
            return Ok(());
        }
        let store: &mut Store = guard;
        let Some(log) = store.log.as_mut() else {
            return Ok(());
        };

        let mut buf = Vec::new();
        if self.flushed {
            Record::Flush.encode(&mut buf);
        }
        for (key, write) in &self.writes {
            match write {
                Some(item) => Record::set(item).encode(&mut buf),
                None => Record::Del { key: key.clone() }.encode(&mut buf),
            }
        }

        log.append(&buf).map_err(EmberError::Durability)?;
        if store.config.sync_policy == SyncPolicy::Always {
            log.sync().map_err(EmberError::Durability)?;
        } else {
            store.flushes += 1;
        }

        debug!(
            writes = self.writes.len(),
            flushed = self.flushed,
            bytes = buf.len(),
            "commit persisted"
        );
        Ok(())
    }
}

/// Marks a transaction as inside a scan for as long as it lives.
struct Iterating<'a>(&'a Cell<u32>);

impl<'a> Iterating<'a> {
    fn enter(count: &'a Cell<u32>) -> Self {
        count.set(count.get() + 1);
        Self(count)
    }
}

impl Drop for Iterating<'_> {
    fn drop(&mut self) {
        self.0.set(self.0.get() - 1);
    }
}

/// The literal part of a glob before its first wildcard.
fn literal_prefix(pattern: &str) -> &str {
    let end = pattern.find(['*', '?']).unwrap_or(pattern.len());
    &pattern[..end]
}

/// A read-only or read-write transaction.
///
/// Methods take `&self` so scan callbacks can read through the same
/// transaction. Mutating from inside a scan fails with
/// [`EmberError::TxIterating`].
pub struct Tx<'db> {
    state: RefCell<Option<TxState<'db>>>,
    writable: bool,
    managed: bool,
    iterating: Cell<u32>,
}

impl<'db> Tx<'db> {
    pub(crate) fn begin(shared: &'db Shared, writable: bool, managed: bool) -> EmberResult<Self> {
        let guard = if writable {
            Guard::Write(shared.store.write())
        } else {
            Guard::Read(shared.store.read())
        };
        if guard.store().state != DbState::Open {
            return Err(EmberError::DatabaseClosed);
        }

        Ok(Self {
            state: RefCell::new(Some(TxState {
                guard,
                undo: Vec::new(),
                writes: BTreeMap::new(),
                flushed: false,
            })),
            writable,
            managed,
            iterating: Cell::new(0),
        })
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    fn read<T>(&self, f: impl FnOnce(&Store) -> EmberResult<T>) -> EmberResult<T> {
        let state = self.state.borrow();
        let state = state.as_ref().ok_or(EmberError::TxClosed)?;
        f(state.guard.store())
    }

    fn write<T>(&self, f: impl FnOnce(&mut TxState<'db>) -> EmberResult<T>) -> EmberResult<T> {
        if self.state.borrow().is_none() {
            return Err(EmberError::TxClosed);
        }
        if !self.writable {
            return Err(EmberError::TxNotWritable);
        }
        if self.iterating.get() > 0 {
            return Err(EmberError::TxIterating);
        }
        let mut state = self.state.borrow_mut();
        let state = state.as_mut().ok_or(EmberError::TxClosed)?;
        f(state)
    }

    // Reads

    /// Value of a live key.
    pub fn get(&self, key: &str) -> EmberResult<String> {
        self.get_with(key, false)
    }

    /// Value of a key, optionally including items that expired but have not
    /// been swept yet.
    pub fn get_with(&self, key: &str, ignore_expired: bool) -> EmberResult<String> {
        self.read(|store| match store.keyspace.get(key) {
            Some(item) if ignore_expired || !item.is_expired() => Ok(item.value.clone()),
            _ => Err(EmberError::NotFound),
        })
    }

    /// Remaining time to live. `None` means the key never expires.
    pub fn ttl(&self, key: &str) -> EmberResult<Option<Duration>> {
        let now = SystemTime::now();
        self.read(|store| match store.keyspace.get(key) {
            Some(item) if !item.is_expired_at(now) => Ok(item.ttl(now)),
            _ => Err(EmberError::NotFound),
        })
    }

    /// Number of items, including expired items not yet swept.
    pub fn len(&self) -> EmberResult<usize> {
        self.read(|store| Ok(store.keyspace.len()))
    }

    pub fn is_empty(&self) -> EmberResult<bool> {
        self.len().map(|len| len == 0)
    }

    /// Names of the secondary indexes, sorted.
    pub fn indexes(&self) -> EmberResult<Vec<String>> {
        self.read(|store| Ok(store.keyspace.index_names()))
    }

    // Mutations

    /// Insert or replace a key. Returns the previous live value and whether
    /// one was replaced. A TTL reaching past the representable time range
    /// fails with [`EmberError::InvalidOperation`].
    pub fn set(
        &self,
        key: &str,
        value: &str,
        opts: Option<SetOptions>,
    ) -> EmberResult<(Option<String>, bool)> {
        self.write(|state| {
            let item = match opts {
                Some(opts) if opts.expires => {
                    let at = SystemTime::now()
                        .checked_add(opts.ttl)
                        .ok_or(EmberError::InvalidOperation)?;
                    Item::expiring_at(key, value, at)
                }
                _ => Item::new(key, value),
            };
            match state.set(item.into_shared())? {
                Some(prior) if !prior.is_expired() => Ok((Some(prior.value.clone()), true)),
                _ => Ok((None, false)),
            }
        })
    }

    /// Remove a key and return its value. An expired key is removed but
    /// reported as [`EmberError::NotFound`].
    pub fn delete(&self, key: &str) -> EmberResult<String> {
        self.write(|state| {
            let prior = state.delete(key)?.ok_or(EmberError::NotFound)?;
            if prior.is_expired() {
                return Err(EmberError::NotFound);
            }
            Ok(prior.value.clone())
        })
    }

    /// Remove every item. Index definitions are kept.
    pub fn delete_all(&self) -> EmberResult<()> {
        self.write(|state| state.delete_all())
    }

    /// Create an index over the keys matching `pattern`, ordered by `lesses`
    /// (binary value order when empty).
    pub fn create_index(&self, name: &str, pattern: &str, lesses: Vec<Less>) -> EmberResult<()> {
        self.create_index_with(name, pattern, IndexOptions::default(), lesses)
    }

    pub fn create_index_with(
        &self,
        name: &str,
        pattern: &str,
        options: IndexOptions,
        lesses: Vec<Less>,
    ) -> EmberResult<()> {
        self.write(|state| state.create_index(Index::new(name, pattern, options, lesses)?))
    }

    pub fn drop_index(&self, name: &str) -> EmberResult<()> {
        self.write(|state| state.drop_index(name))
    }

    // Scans

    fn scan<F>(
        &self,
        index: &str,
        lower: Bound<&str>,
        upper: Bound<&str>,
        direction: Direction,
        mut visit: F,
    ) -> EmberResult<()>
    where
        F: FnMut(&str, &str) -> bool,
    {
        let state = self.state.borrow();
        let state = state.as_ref().ok_or(EmberError::TxClosed)?;
        let _iterating = Iterating::enter(&self.iterating);
        state
            .guard
            .store()
            .keyspace
            .scan(index, lower, upper, direction, SystemTime::now(), |item| {
                visit(&item.key, &item.value)
            })
            .ok_or(EmberError::NotFound)
    }

    /// Visit every item of `index` in ascending order until `visit` returns
    /// `false`. The empty index name means key order.
    pub fn ascend<F>(&self, index: &str, visit: F) -> EmberResult<()>
    where
        F: FnMut(&str, &str) -> bool,
    {
        self.scan(index, Bound::Unbounded, Bound::Unbounded, Direction::Ascending, visit)
    }

    /// Visit keys matching a glob pattern in ascending key order.
    pub fn ascend_keys<F>(&self, pattern: &str, mut visit: F) -> EmberResult<()>
    where
        F: FnMut(&str, &str) -> bool,
    {
        let matcher = Pattern::new(pattern, false)?;
        let prefix = literal_prefix(pattern);
        let lower = if prefix.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Included(prefix)
        };
        self.scan("", lower, Bound::Unbounded, Direction::Ascending, |key, value| {
            if !key.starts_with(prefix) {
                return false;
            }
            !matcher.matches(key) || visit(key, value)
        })
    }

    pub fn ascend_equal<F>(&self, index: &str, pivot: &str, visit: F) -> EmberResult<()>
    where
        F: FnMut(&str, &str) -> bool,
    {
        self.scan(
            index,
            Bound::Included(pivot),
            Bound::Included(pivot),
            Direction::Ascending,
            visit,
        )
    }

    pub fn ascend_greater_or_equal<F>(&self, index: &str, pivot: &str, visit: F) -> EmberResult<()>
    where
        F: FnMut(&str, &str) -> bool,
    {
        self.scan(index, Bound::Included(pivot), Bound::Unbounded, Direction::Ascending, visit)
    }

    pub fn ascend_less_than<F>(&self, index: &str, pivot: &str, visit: F) -> EmberResult<()>
    where
        F: FnMut(&str, &str) -> bool,
    {
        self.scan(index, Bound::Unbounded, Bound::Excluded(pivot), Direction::Ascending, visit)
    }

    /// Items in `[greater_or_equal, less_than)`, ascending.
    pub fn ascend_range<F>(
        &self,
        index: &str,
        greater_or_equal: &str,
        less_than: &str,
        visit: F,
    ) -> EmberResult<()>
    where
        F: FnMut(&str, &str) -> bool,
    {
        self.scan(
            index,
            Bound::Included(greater_or_equal),
            Bound::Excluded(less_than),
            Direction::Ascending,
            visit,
        )
    }

    pub fn descend<F>(&self, index: &str, visit: F) -> EmberResult<()>
    where
        F: FnMut(&str, &str) -> bool,
    {
        self.scan(index, Bound::Unbounded, Bound::Unbounded, Direction::Descending, visit)
    }

    /// Visit keys matching a glob pattern in descending key order.
    pub fn descend_keys<F>(&self, pattern: &str, mut visit: F) -> EmberResult<()>
    where
        F: FnMut(&str, &str) -> bool,
    {
        let matcher = Pattern::new(pattern, false)?;
        let prefix = literal_prefix(pattern);
        let lower = if prefix.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Included(prefix)
        };
        // Keys above the prefix run come first and are skipped.
        self.scan("", lower, Bound::Unbounded, Direction::Descending, |key, value| {
            !key.starts_with(prefix) || !matcher.matches(key) || visit(key, value)
        })
    }

    pub fn descend_equal<F>(&self, index: &str, pivot: &str, visit: F) -> EmberResult<()>
    where
        F: FnMut(&str, &str) -> bool,
    {
        self.scan(
            index,
            Bound::Included(pivot),
            Bound::Included(pivot),
            Direction::Descending,
            visit,
        )
    }

    pub fn descend_greater_than<F>(&self, index: &str, pivot: &str, visit: F) -> EmberResult<()>
    where
        F: FnMut(&str, &str) -> bool,
    {
        self.scan(index, Bound::Excluded(pivot), Bound::Unbounded, Direction::Descending, visit)
    }

    pub fn descend_less_or_equal<F>(&self, index: &str, pivot: &str, visit: F) -> EmberResult<()>
    where
        F: FnMut(&str, &str) -> bool,
    {
        self.scan(index, Bound::Unbounded, Bound::Included(pivot), Direction::Descending, visit)
    }

    /// Items in `(greater_than, less_or_equal]`, descending.
    pub fn descend_range<F>(
        &self,
        index: &str,
        less_or_equal: &str,
        greater_than: &str,
        visit: F,
    ) -> EmberResult<()>
    where
        F: FnMut(&str, &str) -> bool,
    {
        self.scan(
            index,
            Bound::Excluded(greater_than),
            Bound::Included(less_or_equal),
            Direction::Descending,
            visit,
        )
    }

    // Completion

    /// Write the changes to the log and release the lock.
    pub fn commit(&self) -> EmberResult<()> {
        if self.state.borrow().is_none() {
            return Err(EmberError::TxClosed);
        }
        if self.managed {
            return Err(EmberError::InvalidOperation);
        }
        self.finish(true)
    }

    /// Undo every change and release the lock.
    pub fn rollback(&self) -> EmberResult<()> {
        if self.state.borrow().is_none() {
            return Err(EmberError::TxClosed);
        }
        if self.managed {
            return Err(EmberError::InvalidOperation);
        }
        self.finish(false)
    }

    pub(crate) fn finish(&self, commit: bool) -> EmberResult<()> {
        if self.iterating.get() > 0 {
            return Err(EmberError::TxIterating);
        }
        if commit && !self.writable {
            return Err(EmberError::TxNotWritable);
        }
        let Some(mut state) = self.state.borrow_mut().take() else {
            return Err(EmberError::TxClosed);
        };

        if !commit {
            state.undo_all();
            return Ok(());
        }
        let result = state.persist();
        if let Err(e) = &result {
            warn!(error = %e, "commit applied in memory but not persisted");
        }
        result
    }

    // Maintenance

    pub(crate) fn config(&self) -> EmberResult<Config> {
        self.read(|store| Ok(store.config.clone()))
    }

    /// Up to `limit` items expired at `now`, earliest first.
    pub(crate) fn expired_items(&self, now: SystemTime, limit: usize) -> EmberResult<Vec<Arc<Item>>> {
        self.read(|store| Ok(store.keyspace.expiration().expired(now, limit)))
    }

    /// Delete `key` if it is still expired at `now`.
    pub(crate) fn delete_expired(&self, key: &str, now: SystemTime) -> EmberResult<bool> {
        let expired = self.read(|store| {
            Ok(store
                .keyspace
                .get(key)
                .is_some_and(|item| item.is_expired_at(now)))
        })?;
        if !expired {
            return Ok(false);
        }
        self.write(|state| state.delete(key).map(|prior| prior.is_some()))
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        if let Some(mut state) = self.state.get_mut().take() {
            state.undo_all();
        }
    }
}
