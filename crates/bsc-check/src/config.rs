//! Run configuration.

use bsc_error::{CheckError, Result};
use bsc_search::DEFAULT_BATCH_ITEMS;
use std::time::Duration;

/// Retries per block group when no `--retries` is given.
pub const DEFAULT_RETRIES: u32 = 2;
/// Upper bound accepted for `--retries`.
pub const MAX_RETRIES: u32 = 100;
/// Pause before a non-frozen retry.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Options of one check run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckConfig {
    /// Extra attempts for a block group that looks corrupted.
    pub retries: u32,
    /// Freeze the filesystem for the final retry of a group.
    pub freeze: bool,
    /// Pause before each retry that does not freeze.
    pub retry_delay: Duration,
    /// Items requested per tree search call.
    pub batch_items: u32,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            retries: DEFAULT_RETRIES,
            freeze: false,
            retry_delay: DEFAULT_RETRY_DELAY,
            batch_items: DEFAULT_BATCH_ITEMS,
        }
    }
}

impl CheckConfig {
    pub fn validate(&self) -> Result<()> {
        if self.retries > MAX_RETRIES {
            return Err(CheckError::Usage(format!(
                "--retries must be between 0 and {MAX_RETRIES}, got {}",
                self.retries
            )));
        }
        if self.batch_items == 0 {
            return Err(CheckError::Usage("search batch size must be non-zero".into()));
        }
        Ok(())
    }
}
