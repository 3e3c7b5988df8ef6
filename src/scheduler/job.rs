use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::task::AbortHandle;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_outstanding(&self) -> bool {
        matches!(self, JobState::Queued | JobState::Running)
    }
}

/// Read-only view of an outstanding refresh job.
#[derive(Debug, Clone)]
pub struct RefreshJob {
    pub id: Uuid,
    pub key: String,
    /// 1 for the first try; incremented for every consecutive failure of the same key.
    pub attempt: u32,
    pub state: JobState,
    pub enqueued_at: Instant,
}

impl RefreshJob {
    pub fn age(&self) -> Duration {
        self.enqueued_at.elapsed()
    }
}

/// How a job ended, as seen by whoever waits on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Failed(String),
    /// Still queued when shutdown began; never ran.
    Cancelled,
    /// Still running when the shutdown drain timed out; result discarded.
    Abandoned,
}

pub(crate) struct JobSlot {
    pub(crate) id: Uuid,
    pub(crate) attempt: u32,
    pub(crate) state: JobState,
    pub(crate) enqueued_at: Instant,
    pub(crate) abort: Option<AbortHandle>,
}

impl JobSlot {
    pub(crate) fn new(attempt: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            attempt,
            state: JobState::Queued,
            enqueued_at: Instant::now(),
            abort: None,
        }
    }

    pub(crate) fn view(&self, key: &str) -> RefreshJob {
        RefreshJob {
            id: self.id,
            key: key.to_string(),
            attempt: self.attempt,
            state: self.state,
            enqueued_at: self.enqueued_at,
        }
    }
}
