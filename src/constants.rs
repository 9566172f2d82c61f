// -
// Store namespaces

/// Physical key prefix for registrations (`/registered/{key}` -> file path)
pub const REGISTERED_KEY_PREFIX: &str = "/registered/";

/// Physical key prefix for configuration entries (`/config/{key}` -> payload)
pub const CONFIG_KEY_PREFIX: &str = "/config/";

// -
// Store connection defaults

pub(crate) const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:2379";

/// Dial timeout used when establishing the store connection
pub(crate) const DEFAULT_DIAL_TIMEOUT_MS: u64 = 5000;

pub(crate) const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 3000;

/// Operations taking at least this long are logged at `warn` under the `timing` target
pub(crate) const SLOW_OPERATION_MS: u64 = 1000;

/// Environment variable prefix for configuration overrides (`REGISTRY__STORE__ENDPOINTS`)
pub(crate) const ENV_PREFIX: &str = "REGISTRY";
