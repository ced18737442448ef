//! Database handle
//!
//! Owns the store lock, the optional append-only log and the background
//! maintenance thread. All data access goes through [`Tx`].

use crate::background::Manager;
use crate::config::Config;
use crate::error::{EmberError, EmberResult};
use crate::storage::aof::{AppendLog, ReadError, Record, RecordReader};
use crate::storage::item::Item;
use crate::storage::keyspace::Keyspace;
use crate::transaction::Tx;
use parking_lot::{Mutex, RwLock};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// Path that opens a database without a log file.
pub const MEMORY_PATH: &str = ":memory:";

/// Bytes buffered before `save` writes a chunk.
const SAVE_CHUNK_BYTES: usize = 4 * 1024 * 1024;

/// Keys written per shared-lock section while shrinking.
const SHRINK_CHUNK: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DbState {
    Open,
    Closing,
    Closed,
}

/// Everything guarded by the store lock.
pub(crate) struct Store {
    pub(crate) keyspace: Keyspace,
    pub(crate) log: Option<AppendLog>,
    pub(crate) config: Config,
    pub(crate) state: DbState,
    pub(crate) shrinking: bool,
    /// Commits appended since open.
    pub(crate) flushes: u64,
    /// Value of `flushes` at the last background fsync.
    pub(crate) synced_flushes: u64,
    /// Log size after the last load or shrink.
    pub(crate) baseline: u64,
}

/// State shared with the background thread.
pub(crate) struct Shared {
    pub(crate) store: RwLock<Store>,
}

/// Apply one replayed record to the keyspace.
fn apply(keyspace: &mut Keyspace, record: Record, now: SystemTime) {
    match record {
        Record::Set {
            key,
            value,
            expires_at,
        } => {
            if expires_at.is_some_and(|at| at <= now) {
                keyspace.remove(&key);
            } else {
                keyspace.insert(
                    Item {
                        key,
                        value,
                        expires_at,
                    }
                    .into_shared(),
                );
            }
        }
        Record::Del { key } => {
            keyspace.remove(&key);
        }
        Record::Flush => {
            keyspace.clear();
        }
    }
}

/// Replay the log into `keyspace`. A torn final record is cut off the file.
/// Returns the log size afterwards.
fn replay(log: &mut AppendLog, keyspace: &mut Keyspace) -> EmberResult<u64> {
    let mut records = RecordReader::new(BufReader::new(log.reader()?));
    let now = SystemTime::now();
    let mut count = 0u64;

    loop {
        match records.next_record() {
            Ok(Some(record)) => {
                apply(keyspace, record, now);
                count += 1;
            }
            Ok(None) => break,
            Err(ReadError::Truncated { valid_len }) => {
                warn!(
                    path = %log.path().display(),
                    valid_len,
                    dropped = log.size() - valid_len,
                    "log ends in a partial record; truncating"
                );
                log.truncate(valid_len)?;
                break;
            }
            Err(ReadError::Corrupt { offset, reason }) => {
                warn!(path = %log.path().display(), offset, %reason, "log is corrupt");
                return Err(EmberError::Invalid);
            }
            Err(ReadError::Io(e)) => return Err(e.into()),
        }
    }

    debug!(records = count, keys = keyspace.len(), "log replayed");
    Ok(log.size())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Clears the shrinking flag when a shrink ends, however it ends.
struct ShrinkGuard<'a>(&'a Shared);

impl Drop for ShrinkGuard<'_> {
    fn drop(&mut self) {
        self.0.store.write().shrinking = false;
    }
}

impl Shared {
    /// Rewrite the log to hold only the live items.
    pub(crate) fn shrink(&self) -> EmberResult<()> {
        let (path, end) = {
            let mut store = self.store.write();
            if store.state != DbState::Open {
                return Err(EmberError::DatabaseClosed);
            }
            let Some(log) = store.log.as_ref() else {
                return Ok(());
            };
            let snapshot = (log.path().to_path_buf(), log.size());
            if store.shrinking {
                return Err(EmberError::ShrinkInProcess);
            }
            store.shrinking = true;
            snapshot
        };
        let _guard = ShrinkGuard(self);

        let tmp_path = temp_path(&path);
        let result = self.rewrite(&path, &tmp_path, end);
        if result.is_err() {
            let _ = fs::remove_file(&tmp_path);
        }
        result
    }

    fn rewrite(&self, path: &Path, tmp_path: &Path, end: u64) -> EmberResult<()> {
        let mut tmp = BufWriter::new(File::create(tmp_path)?);
        let mut pivot: Option<String> = None;
        let mut written = 0usize;

        // Snapshot the keyspace a chunk at a time so writers are not blocked
        // for the whole walk.
        loop {
            let mut buf = Vec::new();
            let mut seen = 0;
            {
                let store = self.store.read();
                if store.state != DbState::Open {
                    return Err(EmberError::DatabaseClosed);
                }
                let now = SystemTime::now();
                let lower = match &pivot {
                    Some(key) => Bound::Excluded(key.as_str()),
                    None => Bound::Unbounded,
                };
                let mut last = None;
                for item in store.keyspace.items_from(lower).take(SHRINK_CHUNK) {
                    seen += 1;
                    last = Some(&item.key);
                    if !item.is_expired_at(now) {
                        Record::set(item).encode(&mut buf);
                        written += 1;
                    }
                }
                pivot = last.cloned();
            }
            tmp.write_all(&buf)?;
            if seen < SHRINK_CHUNK {
                break;
            }
        }

        let mut store = self.store.write();
        if store.state != DbState::Open {
            return Err(EmberError::DatabaseClosed);
        }

        // Commits that landed after the snapshot started.
        let mut original = File::open(path)?;
        original.seek(SeekFrom::Start(end))?;
        let tail = io::copy(&mut original, &mut tmp)?;

        let tmp = tmp.into_inner().map_err(|e| e.into_error())?;
        tmp.sync_all()?;
        drop(tmp);

        let mut fresh = AppendLog::open(tmp_path)?;
        fs::rename(tmp_path, path)?;
        fresh.set_path(path);

        let before = store.log.as_ref().map_or(0, AppendLog::size);
        store.baseline = fresh.size();
        store.log = Some(fresh);

        debug!(
            path = %path.display(),
            before,
            after = store.baseline,
            keys = written,
            tail,
            "log shrunk"
        );
        Ok(())
    }
}

/// An embeddable ordered key-value store.
pub struct Db {
    shared: Arc<Shared>,
    manager: Mutex<Option<Manager>>,
}

impl Db {
    /// Open a database at `path`, or an in-memory one at [`MEMORY_PATH`].
    pub fn open<P: AsRef<Path>>(path: P) -> EmberResult<Self> {
        Self::open_with_config(path, Config::default())
    }

    pub fn open_with_config<P: AsRef<Path>>(path: P, config: Config) -> EmberResult<Self> {
        let path = path.as_ref();
        let mut keyspace = Keyspace::new();

        let (log, baseline) = if path == Path::new(MEMORY_PATH) {
            (None, 0)
        } else {
            let mut log = AppendLog::open(path)?;
            let size = replay(&mut log, &mut keyspace)?;
            (Some(log), size)
        };

        info!(
            path = %path.display(),
            keys = keyspace.len(),
            persistent = log.is_some(),
            sync_policy = %config.sync_policy,
            "database opened"
        );

        let shared = Arc::new(Shared {
            store: RwLock::new(Store {
                keyspace,
                log,
                config,
                state: DbState::Open,
                shrinking: false,
                flushes: 0,
                synced_flushes: 0,
                baseline,
            }),
        });
        let manager = Manager::start(Arc::clone(&shared))?;

        Ok(Self {
            shared,
            manager: Mutex::new(Some(manager)),
        })
    }

    /// Sync and close the log, drop the data and stop the background
    /// thread. Every later call fails with [`EmberError::DatabaseClosed`].
    pub fn close(&self) -> EmberResult<()> {
        let result = {
            let mut store = self.shared.store.write();
            if store.state != DbState::Open {
                return Err(EmberError::DatabaseClosed);
            }
            store.state = DbState::Closing;
            store.keyspace = Keyspace::new();
            match store.log.take() {
                Some(log) => log.sync(),
                None => Ok(()),
            }
        };

        if let Some(manager) = self.manager.lock().take() {
            manager.stop();
        }
        self.shared.store.write().state = DbState::Closed;

        info!("database closed");
        result.map_err(EmberError::from)
    }

    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }

    /// Start a transaction. A writable transaction holds the exclusive lock
    /// until it commits, rolls back or is dropped.
    pub fn begin(&self, writable: bool) -> EmberResult<Tx<'_>> {
        Tx::begin(&self.shared, writable, false)
    }

    /// Run `f` in a read-only transaction.
    pub fn view<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Tx<'_>) -> Result<T, E>,
        E: From<EmberError>,
    {
        let tx = Tx::begin(&self.shared, false, true)?;
        let result = f(&tx);
        tx.finish(false)?;
        result
    }

    /// Run `f` in a read-write transaction, committing on `Ok` and rolling
    /// back on `Err`.
    pub fn update<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Tx<'_>) -> Result<T, E>,
        E: From<EmberError>,
    {
        let tx = Tx::begin(&self.shared, true, true)?;
        match f(&tx) {
            Ok(value) => {
                tx.finish(true)?;
                Ok(value)
            }
            Err(e) => {
                tx.finish(false)?;
                Err(e)
            }
        }
    }

    /// Write every live item to `writer` as `set` records.
    pub fn save<W: Write>(&self, mut writer: W) -> EmberResult<()> {
        let store = self.shared.store.read();
        if store.state != DbState::Open {
            return Err(EmberError::DatabaseClosed);
        }

        let now = SystemTime::now();
        let mut buf = Vec::with_capacity(SAVE_CHUNK_BYTES);
        let mut count = 0usize;
        for item in store.keyspace.items() {
            if item.is_expired_at(now) {
                continue;
            }
            Record::set(item).encode(&mut buf);
            count += 1;
            if buf.len() >= SAVE_CHUNK_BYTES {
                writer.write_all(&buf)?;
                buf.clear();
            }
        }
        if !buf.is_empty() {
            writer.write_all(&buf)?;
        }
        writer.flush()?;

        debug!(keys = count, "snapshot saved");
        Ok(())
    }

    /// Replay records from `reader` into an in-memory database.
    pub fn load<R: Read>(&self, reader: R) -> EmberResult<()> {
        let mut store = self.shared.store.write();
        if store.state != DbState::Open {
            return Err(EmberError::DatabaseClosed);
        }
        if store.log.is_some() {
            return Err(EmberError::PersistenceActive);
        }

        let mut records = RecordReader::new(BufReader::new(reader));
        let now = SystemTime::now();
        loop {
            match records.next_record() {
                Ok(Some(record)) => apply(&mut store.keyspace, record, now),
                Ok(None) => break,
                Err(ReadError::Io(e)) => return Err(e.into()),
                Err(ReadError::Truncated { .. } | ReadError::Corrupt { .. }) => {
                    return Err(EmberError::Invalid);
                }
            }
        }

        debug!(keys = store.keyspace.len(), "snapshot loaded");
        Ok(())
    }

    /// Compact the log down to one record per live item.
    pub fn shrink(&self) -> EmberResult<()> {
        self.shared.shrink()
    }

    pub fn read_config(&self) -> EmberResult<Config> {
        let store = self.shared.store.read();
        if store.state != DbState::Open {
            return Err(EmberError::DatabaseClosed);
        }
        Ok(store.config.clone())
    }

    pub fn set_config(&self, config: Config) -> EmberResult<()> {
        let mut store = self.shared.store.write();
        if store.state != DbState::Open {
            return Err(EmberError::DatabaseClosed);
        }
        debug!(?config, "config updated");
        store.config = config;
        Ok(())
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        if self.shared.store.read().state == DbState::Open {
            let _ = self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EmberError;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[test]
    fn test_temp_path() {
        assert_eq!(temp_path(Path::new("/data/app.db")), PathBuf::from("/data/app.db.tmp"));
    }

    #[test]
    fn test_apply_records() {
        let mut ks = Keyspace::new();
        let now = SystemTime::now();
        let past = now - std::time::Duration::from_secs(1);

        apply(&mut ks, Record::Set { key: "a".into(), value: "1".into(), expires_at: None }, now);
        apply(&mut ks, Record::Set { key: "b".into(), value: "2".into(), expires_at: None }, now);
        apply(&mut ks, Record::Set { key: "b".into(), value: "3".into(), expires_at: Some(past) }, now);
        assert_eq!(ks.len(), 1);

        apply(&mut ks, Record::Flush, now);
        apply(&mut ks, Record::Set { key: "c".into(), value: "4".into(), expires_at: None }, now);
        apply(&mut ks, Record::Del { key: "c".into() }, now);
        assert!(ks.is_empty());
    }

    #[test]
    fn test_close_is_final() {
        let db = Db::open(MEMORY_PATH).unwrap();
        db.close().unwrap();
        assert!(matches!(db.close(), Err(EmberError::DatabaseClosed)));
        assert!(matches!(db.begin(false), Err(EmberError::DatabaseClosed)));
        assert!(matches!(db.shrink(), Err(EmberError::DatabaseClosed)));
        assert!(matches!(db.save(Vec::new()), Err(EmberError::DatabaseClosed)));
        assert!(matches!(db.read_config(), Err(EmberError::DatabaseClosed)));
    }

    #[test]
    fn test_shrink_in_memory_is_noop() {
        let db = Db::open(MEMORY_PATH).unwrap();
        db.shrink().unwrap();
    }

    #[test]
    fn test_shrink_flag_blocks_second_shrink() {
        let dir = tempdir().unwrap();
        let db = Db::open(dir.path().join("data.db")).unwrap();

        db.shared.store.write().shrinking = true;
        assert!(matches!(db.shrink(), Err(EmberError::ShrinkInProcess)));

        db.shared.store.write().shrinking = false;
        db.shrink().unwrap();
        assert!(!db.shared.store.read().shrinking);
    }

    #[test]
    fn test_shrink_resets_baseline() {
        let dir = tempdir().unwrap();
        let db = Db::open(dir.path().join("data.db")).unwrap();
        for i in 0..10 {
            db.update(|tx| tx.set("k", &i.to_string(), None).map(|_| ())).unwrap();
        }
        let grown = db.shared.store.read().log.as_ref().unwrap().size();

        db.shrink().unwrap();
        let store = db.shared.store.read();
        let size = store.log.as_ref().unwrap().size();
        assert!(size < grown);
        assert_eq!(store.baseline, size);
        assert!(!dir.path().join("data.db.tmp").exists());
    }
}
