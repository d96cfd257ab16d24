use std::time::Duration;

use crate::error::{PipelineError, Result};

pub const DEFAULT_CHUNK_SIZE: usize = 20;
pub const DEFAULT_CONCURRENCY: usize = 3;
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_MAX_RETRIES: u32 = 2;
const MAX_RETRIES_LIMIT: u32 = 2;

/// Tunables for a batch prediction run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Students per classifier request.
    pub chunk_size: usize,
    /// Chunk requests allowed in flight at once.
    pub concurrency: usize,
    /// Per-attempt deadline for a classifier call.
    pub timeout: Duration,
    /// Retries after the first failed attempt of a chunk.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub initial_backoff: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff: Duration::from_millis(250),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(invalid("chunk size must be at least 1"));
        }
        if self.concurrency == 0 {
            return Err(invalid("concurrency must be at least 1"));
        }
        if self.timeout.is_zero() {
            return Err(invalid("classifier timeout must be positive"));
        }
        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(invalid(&format!(
                "at most {MAX_RETRIES_LIMIT} retries per chunk are allowed"
            )));
        }
        Ok(())
    }

    /// Backoff before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        self.initial_backoff * 2u32.saturating_pow(retry.saturating_sub(1))
    }
}

fn invalid(reason: &str) -> PipelineError {
    PipelineError::InvalidConfig {
        reason: reason.to_string(),
    }
}
