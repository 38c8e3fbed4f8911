//! Engine configuration
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Default capacity given to a tanker that was never registered.
pub const DEFAULT_TANKER_CAPACITY: u64 = 10_000;

/// Exponential backoff for read paths that hit a transient store failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(25),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (zero based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    db_path: Option<PathBuf>,
    default_tanker_capacity: u64,
    read_retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            default_tanker_capacity: DEFAULT_TANKER_CAPACITY,
            read_retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }
    /// Persist to `path`; without one the database is temporary.
    pub fn set_db_path(mut self, path: impl AsRef<Path>) -> Self {
        self.db_path = Some(path.as_ref().to_path_buf());
        self
    }
    pub fn set_default_tanker_capacity(mut self, liters: u64) -> Self {
        self.default_tanker_capacity = liters;
        self
    }
    pub fn set_read_retry(mut self, policy: RetryPolicy) -> Self {
        self.read_retry = policy;
        self
    }
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }
    pub fn default_tanker_capacity(&self) -> u64 {
        self.default_tanker_capacity
    }
    pub fn read_retry(&self) -> &RetryPolicy {
        &self.read_retry
    }
    pub fn open_db(&self) -> anyhow::Result<Arc<sled::Db>> {
        let config = match &self.db_path {
            Some(path) => sled::Config::new().path(path),
            None => sled::Config::new().temporary(true),
        };
        Ok(Arc::new(config.open()?))
    }
}
