//! Registry error hierarchy
//!
//! [`StoreError`] describes failures of the underlying key-value store and is
//! surfaced verbatim; [`Error`] is what registry operations return and wraps
//! store failures with the operation and logical key that triggered them.

use std::time::Duration;

use config::ConfigError;

pub type Result<T> = std::result::Result<T, Error>;

/// Result alias used by [`crate::KvStore`] implementations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Store was unreachable, timed out or rejected the request
    #[error("{op} failed for key {key:?}: {source}")]
    Store {
        op: &'static str,
        key: String,
        #[source]
        source: StoreError,
    },

    /// `register` on a key that already has a registration
    #[error("Key {0:?} is already registered")]
    KeyConflict(String),

    /// Read of a key that has no value. Never reported as an empty payload.
    #[error("Key {0:?} not found")]
    KeyNotFound(String),

    /// Configuration loading or validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// No store endpoint could be reached at construction time
    #[error("Failed to connect to store endpoints {endpoints:?}: {source}")]
    Connect {
        endpoints: Vec<String>,
        #[source]
        source: StoreError,
    },
}

impl Error {
    /// True when the failure came from the store rather than the registry contract
    pub fn is_store_error(&self) -> bool {
        matches!(self, Error::Store { .. } | Error::Connect { .. })
    }

    /// Underlying store failure, if any
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            Error::Store { source, .. } | Error::Connect { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Connection was released via `close()`
    #[error("Store connection closed")]
    Closed,

    /// Unary request exceeded its deadline
    #[error("Store request timed out after {0:?}")]
    Timeout(Duration),

    /// Store could not be reached or ended a stream unexpectedly
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Store cancelled a watch on its side (compaction, member shutdown)
    #[error("Watch canceled by store: {0}")]
    WatchCanceled(String),

    /// Malformed endpoint address
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// gRPC status code errors
    #[error(transparent)]
    Status(#[from] Box<tonic::Status>),

    /// gRPC transport layer errors
    #[error(transparent)]
    Transport(#[from] Box<tonic::transport::Error>),
}

impl StoreError {
    pub fn is_closed(&self) -> bool {
        matches!(self, StoreError::Closed)
    }
}

impl From<tonic::Status> for StoreError {
    fn from(status: tonic::Status) -> Self {
        StoreError::Status(Box::new(status))
    }
}

impl From<tonic::transport::Error> for StoreError {
    fn from(err: tonic::transport::Error) -> Self {
        StoreError::Transport(Box::new(err))
    }
}

/// Attaches operation and logical key context to store failures
pub(crate) trait StoreResultExt<T> {
    fn context(
        self,
        op: &'static str,
        key: &str,
    ) -> Result<T>;
}

impl<T> StoreResultExt<T> for StoreResult<T> {
    fn context(
        self,
        op: &'static str,
        key: &str,
    ) -> Result<T> {
        self.map_err(|source| Error::Store {
            op,
            key: key.to_string(),
            source,
        })
    }
}
