use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::constants::DEFAULT_DIAL_TIMEOUT_MS;
use crate::constants::DEFAULT_ENDPOINT;
use crate::constants::DEFAULT_REQUEST_TIMEOUT_MS;
use crate::utils::is_tls_endpoint;
use crate::Error;
use crate::Result;

/// Connection parameters for the backing key-value store
///
/// # Configuration Example
///
/// ```toml
/// [store]
/// endpoints = ["http://etcd1:2379", "http://etcd2:2379"]
/// dial_timeout_ms = 5000
/// request_timeout_ms = 3000
/// ```
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StoreConfig {
    /// Store member addresses. `host:port` entries get an `http://` scheme;
    /// `https://` addresses are rejected.
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,

    /// Maximum time to establish the connection at construction
    /// Default: 5 seconds
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,

    /// Deadline for each unary store request (get/put/delete/scan/txn)
    /// Default: 3 seconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// TCP keepalive duration for idle connections
    #[serde(default = "default_tcp_keepalive_secs")]
    pub tcp_keepalive_secs: u64,

    /// Interval for HTTP/2 keepalive pings
    #[serde(default = "default_http2_keepalive_interval_secs")]
    pub http2_keepalive_interval_secs: u64,

    /// Timeout for HTTP/2 keepalive pings
    #[serde(default = "default_http2_keepalive_timeout_secs")]
    pub http2_keepalive_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            dial_timeout_ms: default_dial_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            tcp_keepalive_secs: default_tcp_keepalive_secs(),
            http2_keepalive_interval_secs: default_http2_keepalive_interval_secs(),
            http2_keepalive_timeout_secs: default_http2_keepalive_timeout_secs(),
        }
    }
}

impl StoreConfig {
    /// Config pointing at the given endpoints, every other field defaulted
    pub fn with_endpoints(endpoints: Vec<String>) -> Self {
        Self {
            endpoints,
            ..Self::default()
        }
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(Error::Config(ConfigError::Message(
                "store.endpoints must contain at least one address".into(),
            )));
        }

        if let Some(blank) = self.endpoints.iter().find(|e| e.trim().is_empty()) {
            return Err(Error::Config(ConfigError::Message(format!(
                "store.endpoints contains a blank address: {blank:?}"
            ))));
        }

        if let Some(tls) = self.endpoints.iter().find(|e| is_tls_endpoint(e)) {
            return Err(Error::Config(ConfigError::Message(format!(
                "store.endpoints contains a TLS address, only plaintext endpoints are supported: {tls:?}"
            ))));
        }

        if self.dial_timeout_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "store.dial_timeout_ms must be greater than 0".into(),
            )));
        }

        if self.request_timeout_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "store.request_timeout_ms must be greater than 0".into(),
            )));
        }

        Ok(())
    }
}

fn default_endpoints() -> Vec<String> {
    vec![DEFAULT_ENDPOINT.to_string()]
}
const fn default_dial_timeout_ms() -> u64 {
    DEFAULT_DIAL_TIMEOUT_MS
}
const fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}
const fn default_tcp_keepalive_secs() -> u64 {
    300
}
const fn default_http2_keepalive_interval_secs() -> u64 {
    60
}
const fn default_http2_keepalive_timeout_secs() -> u64 {
    20
}
