//! Registration and configuration coordination.
//!
//! [`Registry`] is the entry point: it owns the store connection and exposes
//! - registration: [`register`](Registry::register), [`unregister`](Registry::unregister),
//!   [`list_registered_keys`](Registry::list_registered_keys),
//!   [`registered_path`](Registry::registered_path)
//! - configuration: [`get_config`](Registry::get_config), [`watch`](Registry::watch)
//! - lifecycle: [`close`](Registry::close)
//!
//! The registry keeps no state of its own besides the store handle. Every
//! operation is a direct call to the store, so concurrent callers sharing one
//! registry (or clones of it) see the store's linearizable order.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;

use crate::errors::StoreResultExt;
use crate::keys::config_key;
use crate::keys::registration_key;
use crate::keys::strip_registration_prefix;
use crate::utils::OpTimer;
use crate::EtcdStore;
use crate::Error;
use crate::KvStore;
use crate::RegistryConfig;
use crate::Result;
use crate::StoreConfig;
use crate::StoreError;
use crate::WatchStream;
use crate::REGISTERED_KEY_PREFIX;

/// Coordination layer over a shared key-value store
///
/// Cloning is cheap and clones share the same connection; closing one clone
/// closes the connection for all of them.
///
/// # Example
/// ```no_run
/// use d_registry::ChangeEvent;
/// use d_registry::Error;
/// use d_registry::Registry;
/// use tokio_util::sync::CancellationToken;
/// use futures::StreamExt;
///
/// # async fn run() -> d_registry::Result<()> {
/// let registry = Registry::new(vec!["http://127.0.0.1:2379".into()]).await?;
///
/// registry.register("svc-a", "/bin/svc-a").await?;
/// let keys = registry.list_registered_keys().await?;
/// println!("registered: {keys:?}");
///
/// let cancel = CancellationToken::new();
/// let mut changes = registry.watch("db.url", cancel.clone()).await?;
/// while let Some(event) = changes.next().await {
///     let event = event.map_err(|source| Error::Store {
///         op: "watch",
///         key: "db.url".into(),
///         source,
///     })?;
///     match event {
///         ChangeEvent::Set(value) => println!("db.url = {}", String::from_utf8_lossy(&value)),
///         ChangeEvent::Removed => println!("db.url removed"),
///     }
/// }
///
/// registry.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct Registry<S: KvStore = EtcdStore> {
    store: Arc<ArcSwapOption<S>>,
}

impl<S: KvStore> Clone for Registry<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: KvStore> std::fmt::Debug for Registry<S> {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Registry").field("closed", &self.is_closed()).finish()
    }
}

impl Registry<EtcdStore> {
    /// Connects to the given store endpoints with default settings
    /// (5 second dial timeout).
    ///
    /// # Errors
    /// - [`Error::Config`] if `endpoints` is empty
    /// - [`Error::Connect`] if no endpoint can be reached within the dial timeout
    pub async fn new(endpoints: Vec<String>) -> Result<Self> {
        let config = RegistryConfig {
            store: StoreConfig::with_endpoints(endpoints),
            ..RegistryConfig::default()
        };
        Self::connect(&config).await
    }

    /// Validates `config` and opens the store connection.
    ///
    /// Construction failures are returned, never retried.
    pub async fn connect(config: &RegistryConfig) -> Result<Self> {
        let config = config.clone().validate()?;

        let store = EtcdStore::connect(&config.store, &config.watch)
            .await
            .map_err(|source| Error::Connect {
                endpoints: config.store.endpoints.clone(),
                source,
            })?;

        Ok(Self::with_store(store))
    }
}

impl<S: KvStore> Registry<S> {
    /// Wraps an already connected store
    pub fn with_store(store: S) -> Self {
        Self {
            store: Arc::new(ArcSwapOption::from_pointee(store)),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.store.load().is_none()
    }

    fn store(
        &self,
        op: &'static str,
        key: &str,
    ) -> Result<Arc<S>> {
        self.store.load_full().ok_or_else(|| Error::Store {
            op,
            key: key.to_string(),
            source: StoreError::Closed,
        })
    }

    /// Binds `key` to `file_path` unless `key` is already registered.
    ///
    /// The existence check and the write are one atomic store operation, so of
    /// several concurrent callers registering the same key exactly one wins.
    ///
    /// # Errors
    /// - [`Error::KeyConflict`] if the key is already registered; nothing is written
    /// - [`Error::Store`] if the store is unreachable; nothing is written
    pub async fn register(
        &self,
        key: &str,
        file_path: &str,
    ) -> Result<()> {
        let _timer = OpTimer::new("registry::register", key);
        let store = self.store("register", key)?;

        let created = store
            .put_if_absent(
                registration_key(key).as_bytes(),
                Bytes::copy_from_slice(file_path.as_bytes()),
            )
            .await
            .context("register", key)?;

        if !created {
            debug!("register rejected, key {:?} already registered", key);
            return Err(Error::KeyConflict(key.to_string()));
        }

        info!("registered {:?} -> {:?}", key, file_path);
        Ok(())
    }

    /// Removes the registration for `key`. Removing an absent registration succeeds.
    pub async fn unregister(
        &self,
        key: &str,
    ) -> Result<()> {
        let _timer = OpTimer::new("registry::unregister", key);
        let store = self.store("unregister", key)?;

        store.delete(registration_key(key).as_bytes()).await.context("unregister", key)?;

        info!("unregistered {:?}", key);
        Ok(())
    }

    /// All currently registered logical keys, in store order (ascending by key).
    pub async fn list_registered_keys(&self) -> Result<Vec<String>> {
        let _timer = OpTimer::new("registry::list_registered_keys", REGISTERED_KEY_PREFIX);
        let store = self.store("list_registered_keys", REGISTERED_KEY_PREFIX)?;

        let entries = store
            .get_prefix(REGISTERED_KEY_PREFIX.as_bytes())
            .await
            .context("list_registered_keys", REGISTERED_KEY_PREFIX)?;

        Ok(entries
            .iter()
            .filter_map(|kv| strip_registration_prefix(&kv.key))
            .map(|key| String::from_utf8_lossy(key).into_owned())
            .collect())
    }

    /// File path bound to `key`
    ///
    /// # Errors
    /// - [`Error::KeyNotFound`] if `key` is not registered
    pub async fn registered_path(
        &self,
        key: &str,
    ) -> Result<String> {
        let _timer = OpTimer::new("registry::registered_path", key);
        let store = self.store("registered_path", key)?;

        match store.get(registration_key(key).as_bytes()).await.context("registered_path", key)? {
            Some(path) => Ok(String::from_utf8_lossy(&path).into_owned()),
            None => Err(Error::KeyNotFound(key.to_string())),
        }
    }

    /// Current configuration payload for `key`.
    ///
    /// An entry stored with an empty payload is returned as empty bytes.
    ///
    /// # Errors
    /// - [`Error::KeyNotFound`] if no entry exists for `key`
    /// - [`Error::Store`] if the store is unreachable
    pub async fn get_config(
        &self,
        key: &str,
    ) -> Result<Bytes> {
        let _timer = OpTimer::new("registry::get_config", key);
        let store = self.store("get_config", key)?;

        store
            .get(config_key(key).as_bytes())
            .await
            .context("get_config", key)?
            .ok_or_else(|| Error::KeyNotFound(key.to_string()))
    }

    /// Subscribes to future changes of the configuration entry for `key`.
    ///
    /// Past values are not replayed. The stream runs until `cancel` fires (then
    /// ends without error) or the store connection is lost (then yields one
    /// `Err` and ends). Re-subscribing after a failure is left to the caller.
    pub async fn watch(
        &self,
        key: &str,
        cancel: CancellationToken,
    ) -> Result<WatchStream> {
        let _timer = OpTimer::new("registry::watch", key);
        let store = self.store("watch", key)?;

        let stream = store.watch(config_key(key).as_bytes(), cancel).await.context("watch", key)?;

        debug!("watching config {:?}", key);
        Ok(stream)
    }

    /// Releases the store connection.
    ///
    /// The connection is released exactly once; further calls are no-ops.
    /// Every operation issued afterwards fails with [`StoreError::Closed`] and
    /// active watches end with that error.
    pub async fn close(&self) -> Result<()> {
        match self.store.swap(None) {
            Some(store) => {
                store.close().await.context("close", "")?;
                info!("registry closed");
                Ok(())
            }
            None => Ok(()),
        }
    }
}
