//! Background maintenance
//!
//! One thread per open database. Every `maintenance_interval` it fsyncs the
//! log under `SyncPolicy::EverySecond`, sweeps expired items and shrinks the
//! log once it has grown past the configured threshold.

use crate::config::SyncPolicy;
use crate::db::{DbState, Shared};
use crate::error::{EmberError, EmberResult};
use crate::transaction::Tx;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::SystemTime;
use tracing::{debug, error, warn};

/// Most expired items removed in one sweep.
pub(crate) const SWEEP_BATCH_LIMIT: usize = 10_000;

enum Signal {
    Stop,
}

pub(crate) struct Manager {
    sender: Sender<Signal>,
    handle: JoinHandle<()>,
}

impl Manager {
    pub(crate) fn start(shared: Arc<Shared>) -> EmberResult<Self> {
        let (sender, receiver) = bounded(1);
        let handle = thread::Builder::new()
            .name("ember-maintenance".to_string())
            .spawn(move || maintenance_worker(shared, receiver))?;

        Ok(Self { sender, handle })
    }

    /// Signal the thread and wait for it, unless called from the thread
    /// itself.
    pub(crate) fn stop(self) {
        let _ = self.sender.try_send(Signal::Stop);
        if self.handle.thread().id() != thread::current().id() {
            let _ = self.handle.join();
        }
    }
}

fn maintenance_worker(shared: Arc<Shared>, receiver: Receiver<Signal>) {
    loop {
        let interval = shared.store.read().config.maintenance_interval;
        match receiver.recv_timeout(interval) {
            Ok(Signal::Stop) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        match tick(&shared) {
            Ok(()) => {}
            Err(EmberError::DatabaseClosed) => break,
            Err(e) => error!(error = %e, "background maintenance failed"),
        }
    }
    debug!("maintenance thread stopped");
}

/// One maintenance pass. A failed fsync is logged and does not hold up the
/// sweep or the shrink.
pub(crate) fn tick(shared: &Shared) -> EmberResult<()> {
    match sync_log(shared) {
        Ok(()) => {}
        Err(EmberError::DatabaseClosed) => return Err(EmberError::DatabaseClosed),
        Err(e) => error!(error = %e, "background fsync failed"),
    }
    sweep_expired(shared)?;
    if shrink_due(shared)? {
        match shared.shrink() {
            Ok(()) | Err(EmberError::ShrinkInProcess) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn sync_log(shared: &Shared) -> EmberResult<()> {
    let mut store = shared.store.write();
    if store.state != DbState::Open {
        return Err(EmberError::DatabaseClosed);
    }
    if store.config.sync_policy != SyncPolicy::EverySecond || store.flushes == store.synced_flushes {
        return Ok(());
    }
    if let Some(log) = &store.log {
        log.sync()?;
    }
    store.synced_flushes = store.flushes;
    Ok(())
}

/// Delete expired items in one write transaction and report them. Keys are
/// reported whenever they left memory, even if the commit did not reach the
/// log.
fn sweep_expired(shared: &Shared) -> EmberResult<()> {
    let tx = Tx::begin(shared, true, true)?;
    let config = tx.config()?;
    let now = SystemTime::now();

    let mut removed = Vec::new();
    for item in tx.expired_items(now, SWEEP_BATCH_LIMIT)? {
        if let Some(hook) = &config.on_expired_sync {
            if let Err(e) = hook(&item.key, &item.value, &tx) {
                warn!(key = %item.key, error = %e, "expiration deferred by callback");
                continue;
            }
        }
        // The callback may have replaced or removed the key.
        if tx.delete_expired(&item.key, now)? {
            removed.push(item.key.clone());
        }
    }
    let committed = tx.finish(true);
    drop(tx);

    let in_memory = matches!(committed, Ok(()) | Err(EmberError::Durability(_)));
    if in_memory && !removed.is_empty() {
        debug!(count = removed.len(), "expired items swept");
        if let Some(on_expired) = &config.on_expired {
            on_expired(removed);
        }
    }
    committed
}

fn shrink_due(shared: &Shared) -> EmberResult<bool> {
    let store = shared.store.read();
    if store.state != DbState::Open {
        return Err(EmberError::DatabaseClosed);
    }
    let Some(log) = &store.log else {
        return Ok(false);
    };
    Ok(!store.config.auto_shrink_disabled
        && !store.shrinking
        && log.size() > store.config.shrink_threshold(store.baseline))
}
