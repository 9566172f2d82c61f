use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;
use tracing::warn;

use crate::constants::SLOW_OPERATION_MS;

/// Times one store or registry operation on a single key.
///
/// On drop the elapsed time is emitted under the `timing` target together with
/// the operation and key; operations slower than [`SLOW_OPERATION_MS`] are
/// reported at `warn` so a slow registration or config read can be traced back
/// to the key that caused it.
pub(crate) struct OpTimer {
    start: Instant,
    op: &'static str,
    key: String,
}

impl OpTimer {
    pub(crate) fn new(
        op: &'static str,
        key: impl AsRef<[u8]>,
    ) -> Self {
        Self {
            start: Instant::now(),
            op,
            key: String::from_utf8_lossy(key.as_ref()).into_owned(),
        }
    }

    #[cfg(test)]
    pub(crate) fn op(&self) -> &'static str {
        self.op
    }

    #[cfg(test)]
    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub(crate) fn is_slow(&self) -> bool {
        self.elapsed() >= Duration::from_millis(SLOW_OPERATION_MS)
    }
}

impl Drop for OpTimer {
    fn drop(&mut self) {
        let elapsed_ms = self.elapsed().as_millis() as u64;
        if self.is_slow() {
            warn!(target: "timing", op = self.op, key = %self.key, elapsed_ms, "slow operation");
        } else {
            trace!(target: "timing", op = self.op, key = %self.key, elapsed_ms, "operation finished");
        }
    }
}
