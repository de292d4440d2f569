//! Runtime knobs for dbCheck.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Default per-batch document ceiling.
pub const BATCH_DOCS: u64 = 5_000;
/// Default per-batch byte ceiling.
pub const BATCH_BYTES: u64 = 20_000_000;
/// Default upper bound for the write-conflict backoff sleep (milliseconds).
const CONFLICT_BACKOFF_MAX_MS: u64 = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DbCheckConfig {
    /// System-wide ceiling on documents hashed by one batch.
    pub batch_docs: u64,
    /// System-wide ceiling on bytes hashed by one batch.
    pub batch_bytes: u64,
    /// Longest sleep between write-conflict retries.
    pub conflict_backoff_max: Duration,
}

impl Default for DbCheckConfig {
    fn default() -> Self {
        Self {
            batch_docs: BATCH_DOCS,
            batch_bytes: BATCH_BYTES,
            conflict_backoff_max: Duration::from_millis(CONFLICT_BACKOFF_MAX_MS),
        }
    }
}

impl DbCheckConfig {
    /// Defaults overridden by `HOLO_DBCHECK_*` environment variables.
    pub fn from_env() -> Self {
        Self {
            batch_docs: read_env_u64("HOLO_DBCHECK_BATCH_DOCS", BATCH_DOCS),
            batch_bytes: read_env_u64("HOLO_DBCHECK_BATCH_BYTES", BATCH_BYTES),
            conflict_backoff_max: Duration::from_millis(read_env_u64(
                "HOLO_DBCHECK_CONFLICT_BACKOFF_MAX_MS",
                CONFLICT_BACKOFF_MAX_MS,
            )),
        }
        .normalized()
    }

    /// Clamp ceilings so a batch always makes progress.
    pub fn normalized(mut self) -> Self {
        self.batch_docs = self.batch_docs.max(1);
        self.batch_bytes = self.batch_bytes.max(1);
        self
    }
}

/// Read an env var as u64 with a default.
pub(crate) fn read_env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| u64::from_str(v.trim()).ok())
        .unwrap_or(default)
}
