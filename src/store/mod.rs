//! Key-value store seam.
//!
//! The registry never talks to a concrete store directly; it goes through
//! [`KvStore`], which captures exactly the capabilities the coordination layer
//! consumes: point reads and writes, prefix scans, an atomic create-if-absent
//! and a per-key watch.
//!
//! # Implementations
//!
//! - [`EtcdStore`]: remote access over the etcd v3 gRPC API
//! - [`MemoryStore`]: in-process store, used as a test double or for embedded setups

mod etcd;
mod memory;
mod watch_stream;

pub use etcd::*;
pub use memory::*;
pub use watch_stream::*;

#[cfg(test)]
mod mock_etcd;

use bytes::Bytes;
#[cfg(test)]
use mockall::automock;
use tokio_util::sync::CancellationToken;

use crate::StoreResult;

/// A key and its value as returned by prefix scans
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: Bytes,
    pub value: Bytes,
}

/// Change notification delivered by a watch subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// The key was created or updated; carries the new value
    Set(Bytes),
    /// The key was deleted
    Removed,
}

/// Capabilities the registry needs from a linearizable key-value store.
///
/// All keys passed here are physical keys (already namespaced).
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync` and safe for concurrent use by many callers.
#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Point read. `Ok(None)` when the key is absent.
    async fn get(
        &self,
        key: &[u8],
    ) -> StoreResult<Option<Bytes>>;

    /// Unconditional write
    async fn put(
        &self,
        key: &[u8],
        value: Bytes,
    ) -> StoreResult<()>;

    /// Writes `value` only if `key` does not exist at write time.
    ///
    /// Returns `true` when the write happened and `false` when the key already
    /// existed, in which case nothing was written. The check and the write are a
    /// single atomic store operation.
    async fn put_if_absent(
        &self,
        key: &[u8],
        value: Bytes,
    ) -> StoreResult<bool>;

    /// Deletes a key. Deleting an absent key succeeds.
    async fn delete(
        &self,
        key: &[u8],
    ) -> StoreResult<()>;

    /// All entries whose key starts with `prefix`, ascending by key
    async fn get_prefix(
        &self,
        prefix: &[u8],
    ) -> StoreResult<Vec<KeyValue>>;

    /// Subscribes to future changes of a single key.
    ///
    /// The subscription is active when this returns: every change committed
    /// afterwards is delivered in commit order. The stream ends without error
    /// once `cancel` fires, and ends with one `Err` if the store connection
    /// fails or the store is closed.
    async fn watch(
        &self,
        key: &[u8],
        cancel: CancellationToken,
    ) -> StoreResult<WatchStream>;

    /// Releases the connection. Later calls fail with [`crate::StoreError::Closed`].
    async fn close(&self) -> StoreResult<()>;
}
