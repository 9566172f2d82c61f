//! # d-registry
//!
//! Thin coordination layer over a linearizable key-value store (etcd v3).
//!
//! Cooperating processes use it to
//! - claim a logical key and bind it to a file path, at most once per key
//! - enumerate which keys are currently registered
//! - read configuration values and watch them for changes
//!
//! Registrations and configuration entries live in disjoint namespaces of the
//! same store (see [`REGISTERED_KEY_PREFIX`] and [`CONFIG_KEY_PREFIX`]), so the
//! same logical key may be both registered and configured.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use d_registry::Registry;
//!
//! #[tokio::main]
//! async fn main() -> d_registry::Result<()> {
//!     let registry = Registry::new(vec!["http://127.0.0.1:2379".to_string()]).await?;
//!
//!     registry.register("svc-a", "/bin/svc-a").await?;
//!     for key in registry.list_registered_keys().await? {
//!         println!("registered: {key}");
//!     }
//!
//!     let url = registry.get_config("db.url").await?;
//!     println!("db.url = {}", String::from_utf8_lossy(&url));
//!
//!     registry.close().await
//! }
//! ```
//!
//! ## Stores
//!
//! [`Registry`] is generic over [`KvStore`]. [`EtcdStore`] is the default;
//! [`MemoryStore`] runs in-process and is what the tests use.

mod config;
mod constants;
mod errors;
mod keys;
mod proto;
mod registry;
mod store;
mod utils;

pub use config::*;
pub use constants::CONFIG_KEY_PREFIX;
pub use constants::REGISTERED_KEY_PREFIX;
pub use errors::*;
pub use keys::*;
pub use registry::*;
pub use store::*;
