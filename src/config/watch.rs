use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;
use tracing::warn;

use crate::Error;
use crate::Result;

/// Configuration for configuration-key watch subscriptions
///
/// # Configuration Example
///
/// ```toml
/// [watch]
/// watcher_buffer_size = 16
/// ```
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WatchConfig {
    /// Buffer size of the channel between the store subscription and the
    /// caller's [`crate::WatchStream`]
    ///
    /// A full buffer applies backpressure to the subscription; events are
    /// never dropped.
    ///
    /// **Default**: 16
    #[serde(default = "default_watcher_buffer_size")]
    pub watcher_buffer_size: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            watcher_buffer_size: default_watcher_buffer_size(),
        }
    }
}

impl WatchConfig {
    /// Validates watch configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.watcher_buffer_size == 0 {
            return Err(Error::Config(ConfigError::Message(
                "watch.watcher_buffer_size must be greater than 0".into(),
            )));
        }

        if self.watcher_buffer_size > 1000 {
            warn!(
                "watch.watcher_buffer_size ({}) is very large for a per-key subscription",
                self.watcher_buffer_size
            );
        }

        Ok(())
    }
}

const fn default_watcher_buffer_size() -> usize {
    16
}
