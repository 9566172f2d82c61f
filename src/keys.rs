//! Key namespace encoding.
//!
//! Logical keys are caller chosen strings. They are stored under one of two
//! disjoint prefixes so the same logical key can name a registration and a
//! configuration entry at the same time without collision.
//!
//! Callers must not use logical keys that rely on escaping the prefix
//! boundary (e.g. `"../config/x"`); this is documented, not enforced.

use crate::constants::CONFIG_KEY_PREFIX;
use crate::constants::REGISTERED_KEY_PREFIX;

/// Physical store key for a registration.
///
/// # Examples
/// ```
/// assert_eq!(d_registry::registration_key("svc-a"), "/registered/svc-a");
/// ```
#[inline]
pub fn registration_key(key: &str) -> String {
    format!("{REGISTERED_KEY_PREFIX}{key}")
}

/// Physical store key for a configuration entry.
///
/// # Examples
/// ```
/// assert_eq!(d_registry::config_key("db.url"), "/config/db.url");
/// ```
#[inline]
pub fn config_key(key: &str) -> String {
    format!("{CONFIG_KEY_PREFIX}{key}")
}

/// Recover the logical key from a physical registration key.
///
/// Returns `None` when `physical` does not live in the registration namespace.
#[inline]
pub fn strip_registration_prefix(physical: &[u8]) -> Option<&[u8]> {
    physical.strip_prefix(REGISTERED_KEY_PREFIX.as_bytes())
}
