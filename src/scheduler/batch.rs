//! Batched enqueueing for cache warming.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const MIN_BATCH_SIZE: usize = 5;
pub const MAX_BATCH_SIZE: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchConfig {
    /// Keys per batch; a batch must finish before the next one is submitted.
    pub batch_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { batch_size: 10 }
    }
}

impl BatchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(MIN_BATCH_SIZE..=MAX_BATCH_SIZE).contains(&self.batch_size) {
            return Err(Error::invalid_config(
                "scheduler.batch.batch_size",
                format!(
                    "{} is outside [{}, {}]",
                    self.batch_size, MIN_BATCH_SIZE, MAX_BATCH_SIZE
                ),
            ));
        }
        Ok(())
    }
}

/// Result of [`super::RefreshScheduler::enqueue_batch`].
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub batches: usize,
    pub successes: Vec<String>,
    pub failures: Vec<(String, String)>,
    /// Keys not submitted: a refresh was already outstanding or the scheduler was closed.
    pub skipped: Vec<String>,
    /// Keys whose job was cancelled or abandoned by shutdown.
    pub interrupted: Vec<String>,
    pub execution_time: Duration,
}

impl BatchReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accepted(&self) -> usize {
        self.successes.len() + self.failures.len() + self.interrupted.len()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failures.is_empty() && self.interrupted.is_empty()
    }

    pub fn success_rate(&self) -> f64 {
        let accepted = self.accepted();
        if accepted == 0 {
            0.0
        } else {
            self.successes.len() as f64 / accepted as f64
        }
    }
}
