//! In-process [`KvStore`].
//!
//! A single mutex over an ordered map makes every operation linearizable.
//! Change notifications are emitted while that lock is held, so each watcher
//! observes changes in exactly the order they were applied.
//!
//! Watchers are grouped by key in a `DashMap`; each subscription is drained by
//! its own forwarding task which also enforces cancellation. Watchers are
//! unregistered automatically when their task exits (RAII guard).

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;

use super::watch_stream::deliver;
use super::ChangeEvent;
use super::KeyValue;
use super::KvStore;
use super::WatchStream;
use crate::StoreError;
use crate::StoreResult;
use crate::WatchConfig;

/// Internal watcher state
#[derive(Debug)]
struct Watcher {
    id: u64,
    sender: mpsc::UnboundedSender<ChangeEvent>,
}

struct MemoryStoreInner {
    data: Mutex<BTreeMap<Bytes, Bytes>>,

    /// Watchers grouped by key
    watchers: DashMap<Bytes, Vec<Watcher>>,

    /// Next watcher ID (monotonically increasing)
    next_id: AtomicU64,

    closed: AtomicBool,

    /// Fired on close so live subscriptions end with an error
    shutdown: CancellationToken,

    config: WatchConfig,
}

impl std::fmt::Debug for MemoryStoreInner {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("MemoryStoreInner")
            .field("keys", &self.data.lock().len())
            .field("watched_keys", &self.watchers.len())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl MemoryStoreInner {
    /// Must be called with the `data` lock held to preserve per-key ordering.
    fn notify(
        &self,
        key: &Bytes,
        event: ChangeEvent,
    ) {
        if let Some(watchers) = self.watchers.get(key) {
            for watcher in watchers.iter() {
                // receiver gone means the forwarding task is exiting; its guard cleans up
                let _ = watcher.sender.send(event.clone());
            }

            trace!(
                key = ?key,
                event = ?event,
                watchers = watchers.len(),
                "Event dispatched"
            );
        }
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

/// Unregisters a watcher when its forwarding task ends
struct WatcherGuard {
    id: u64,
    key: Bytes,
    inner: Arc<MemoryStoreInner>,
}

impl Drop for WatcherGuard {
    fn drop(&mut self) {
        self.inner.watchers.remove_if_mut(&self.key, |_key, watchers| {
            watchers.retain(|w| w.id != self.id);
            watchers.is_empty()
        });
        trace!(watcher_id = self.id, key = ?self.key, "Watcher unregistered");
    }
}

/// Linearizable in-memory key-value store
///
/// Cloning is cheap; clones share the same data, so a test can keep one handle
/// to play the out-of-band configuration writer while a [`crate::Registry`]
/// owns another.
///
/// # Example
///
/// ```ignore
/// let store = MemoryStore::new();
/// let registry = Registry::with_store(store.clone());
/// store.put(b"/config/db.url", Bytes::from("postgres://db")).await?;
/// ```
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryStoreInner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_config(WatchConfig::default())
    }

    pub fn with_config(config: WatchConfig) -> Self {
        Self {
            inner: Arc::new(MemoryStoreInner {
                data: Mutex::new(BTreeMap::new()),
                watchers: DashMap::new(),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                config,
            }),
        }
    }

    /// Get the number of active watchers for a specific key
    ///
    /// This is primarily for testing and monitoring purposes.
    pub fn watcher_count(
        &self,
        key: &[u8],
    ) -> usize {
        self.inner.watchers.get(key).map(|w| w.len()).unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn register_watcher(
        &self,
        key: Bytes,
    ) -> (WatcherGuard, mpsc::UnboundedReceiver<ChangeEvent>) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();

        self.inner.watchers.entry(key.clone()).or_default().push(Watcher { id, sender });
        trace!(watcher_id = id, key = ?key, "Watcher registered");

        let guard = WatcherGuard {
            id,
            key,
            inner: Arc::clone(&self.inner),
        };
        (guard, receiver)
    }
}

#[async_trait::async_trait]
impl KvStore for MemoryStore {
    async fn get(
        &self,
        key: &[u8],
    ) -> StoreResult<Option<Bytes>> {
        self.inner.ensure_open()?;
        Ok(self.inner.data.lock().get(key).cloned())
    }

    async fn put(
        &self,
        key: &[u8],
        value: Bytes,
    ) -> StoreResult<()> {
        self.inner.ensure_open()?;
        let key = Bytes::copy_from_slice(key);

        let mut data = self.inner.data.lock();
        data.insert(key.clone(), value.clone());
        self.inner.notify(&key, ChangeEvent::Set(value));
        Ok(())
    }

    async fn put_if_absent(
        &self,
        key: &[u8],
        value: Bytes,
    ) -> StoreResult<bool> {
        self.inner.ensure_open()?;

        let mut data = self.inner.data.lock();
        if data.contains_key(key) {
            return Ok(false);
        }

        let key = Bytes::copy_from_slice(key);
        data.insert(key.clone(), value.clone());
        self.inner.notify(&key, ChangeEvent::Set(value));
        Ok(true)
    }

    async fn delete(
        &self,
        key: &[u8],
    ) -> StoreResult<()> {
        self.inner.ensure_open()?;

        let mut data = self.inner.data.lock();
        if let Some((key, _)) = data.remove_entry(key) {
            self.inner.notify(&key, ChangeEvent::Removed);
        }
        Ok(())
    }

    async fn get_prefix(
        &self,
        prefix: &[u8],
    ) -> StoreResult<Vec<KeyValue>> {
        self.inner.ensure_open()?;

        let data = self.inner.data.lock();
        let start = Bytes::copy_from_slice(prefix);
        Ok(data
            .range(start..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| KeyValue {
                key: k.clone(),
                value: v.clone(),
            })
            .collect())
    }

    async fn watch(
        &self,
        key: &[u8],
        cancel: CancellationToken,
    ) -> StoreResult<WatchStream> {
        self.inner.ensure_open()?;

        let (guard, mut source) = self.register_watcher(Bytes::copy_from_slice(key));
        let (tx, stream) = WatchStream::channel(self.inner.config.watcher_buffer_size);
        let shutdown = self.inner.shutdown.clone();

        tokio::spawn(async move {
            let _guard = guard;
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!("watch cancelled by subscriber");
                        break;
                    }
                    _ = shutdown.cancelled() => {
                        let _ = tx.send(Err(StoreError::Closed)).await;
                        break;
                    }
                    _ = tx.closed() => {
                        debug!("watch stream dropped by subscriber");
                        break;
                    }
                    event = source.recv() => match event {
                        Some(event) => {
                            if !deliver(&tx, Ok(event), &cancel).await {
                                break;
                            }
                        }
                        None => {
                            let _ = tx.send(Err(StoreError::Closed)).await;
                            break;
                        }
                    },
                }
            }
        });

        Ok(stream)
    }

    async fn close(&self) -> StoreResult<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.shutdown.cancel();
        self.inner.watchers.clear();
        debug!("memory store closed");
        Ok(())
    }
}
