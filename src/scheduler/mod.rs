//! Background refresh scheduling.
//!
//! # Refresh Scheduler
//!
//! A bounded pool of background refresh jobs with per-key deduplication:
//!
//! - At most one job per key is QUEUED or RUNNING; a second `enqueue` for that key is a
//!   no-op that returns `false`.
//! - At most `clamp(base_concurrency * pressure_factor, min, max)` jobs run at once. The
//!   pressure factor is pushed in by the pressure monitor after every sample.
//! - A failed job is logged, counted, and forgotten; the next STALE read retries it.
//! - `shutdown` stops intake, cancels queued jobs, waits for running ones up to a timeout
//!   and aborts whatever is left.
//!
//! ```rust
//! use smart_cache::scheduler::{RefreshScheduler, SchedulerConfig};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let scheduler = RefreshScheduler::standalone(SchedulerConfig::default()).unwrap();
//! assert!(scheduler.enqueue("quote:AAPL", || async { Ok(()) }));
//! // still outstanding, so the duplicate is dropped
//! assert!(!scheduler.enqueue("quote:AAPL", || async { Ok(()) }));
//! # }
//! ```

mod batch;
mod gate;
mod job;

pub use batch::{BatchConfig, BatchReport, MAX_BATCH_SIZE, MIN_BATCH_SIZE};
pub use job::{JobOutcome, JobState, RefreshJob};

use crate::telemetry::{names, noop_sink, Metrics, StatsRecorder};
use crate::{Error, Result};
use gate::ConcurrencyGate;
use job::JobSlot;
use serde::{Deserialize, Serialize};
use lru::LruCache;
use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

/// Keys whose consecutive-failure count is remembered; the least recently failed are
/// forgotten first.
pub(crate) const MAX_TRACKED_FAILURES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    pub base_concurrency: usize,
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    pub batch: BatchConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            base_concurrency: 10,
            min_concurrency: 2,
            max_concurrency: 16,
            batch: BatchConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_concurrency(mut self, n: usize) -> Self {
        self.base_concurrency = n;
        self
    }

    pub fn with_bounds(mut self, min: usize, max: usize) -> Self {
        self.min_concurrency = min;
        self.max_concurrency = max;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch = self.batch.with_batch_size(size);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_concurrency == 0 {
            return Err(Error::invalid_config(
                "scheduler.base_concurrency",
                "must be at least 1",
            ));
        }
        if self.min_concurrency == 0 {
            return Err(Error::invalid_config(
                "scheduler.min_concurrency",
                "must be at least 1",
            ));
        }
        if self.min_concurrency > self.max_concurrency {
            return Err(Error::invalid_config(
                "scheduler.min_concurrency",
                format!(
                    "min ({}) must not exceed max ({})",
                    self.min_concurrency, self.max_concurrency
                ),
            ));
        }
        self.batch.validate()
    }

    /// Concurrency ceiling for a given pressure factor.
    ///
    /// The ceiling gates job starts only. Jobs already RUNNING when the factor drops keep
    /// going, so right after a sample raises pressure `active` can sit above the new limit
    /// until enough of them finish.
    pub fn effective_limit(&self, pressure_factor: f64) -> usize {
        let factor = if pressure_factor.is_finite() {
            pressure_factor.clamp(0.0, 1.0)
        } else {
            1.0
        };
        let scaled = (self.base_concurrency as f64 * factor).floor() as usize;
        scaled.clamp(self.min_concurrency, self.max_concurrency)
    }
}

/// Point-in-time view of the scheduler, in the spirit of a runtime signals snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSignals {
    pub limit: usize,
    pub active: usize,
    pub queued: usize,
    pub peak_active: usize,
    pub pressure_factor: f64,
    pub accepting: bool,
}

/// Result of draining the scheduler.
#[derive(Debug, Clone, Default)]
pub struct DrainReport {
    /// Every job finished (or was cancelled) before the timeout.
    pub drained: bool,
    pub completed: u64,
    pub cancelled: u64,
    pub abandoned: Vec<String>,
    pub elapsed: Duration,
}

struct Inner {
    config: SchedulerConfig,
    jobs: Mutex<HashMap<String, JobSlot>>,
    failures: Mutex<LruCache<String, u32>>,
    gate: Arc<ConcurrencyGate>,
    pressure_factor: AtomicU64,
    accepting: AtomicBool,
    idle: Notify,
    cancelled: AtomicU64,
    metrics: Metrics,
    stats: Arc<StatsRecorder>,
}

impl Inner {
    fn jobs(&self) -> MutexGuard<'_, HashMap<String, JobSlot>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn failures(&self) -> MutexGuard<'_, LruCache<String, u32>> {
        self.failures.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record_failure(&self, key: &str) {
        let mut failures = self.failures();
        let count = failures.get(key).copied().unwrap_or(0);
        failures.put(key.to_string(), count + 1);
    }

    fn set_state(&self, key: &str, id: Uuid, state: JobState) -> u32 {
        let mut jobs = self.jobs();
        match jobs.get_mut(key) {
            Some(slot) if slot.id == id => {
                slot.state = state;
                slot.attempt
            }
            _ => 0,
        }
    }

    fn finish(&self, key: &str, id: Uuid) {
        let now_idle = {
            let mut jobs = self.jobs();
            if jobs.get(key).map(|s| s.id == id).unwrap_or(false) {
                jobs.remove(key);
            }
            jobs.is_empty()
        };
        if now_idle {
            self.idle.notify_waiters();
        }
    }

    fn publish_active(&self) {
        let active = self.stats.active_tasks.load(Ordering::Relaxed);
        self.metrics.gauge(names::ACTIVE_TASKS_COUNT, active as f64);
    }
}

/// Removes the key from the in-flight map however the job task ends: completion, early
/// return, panic or abort.
struct InFlightGuard {
    inner: Arc<Inner>,
    key: String,
    id: Uuid,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.finish(&self.key, self.id);
    }
}

/// Keeps `active_tasks` honest for the RUNNING phase.
struct RunningGuard<'a> {
    inner: &'a Inner,
}

impl<'a> RunningGuard<'a> {
    fn enter(inner: &'a Inner) -> Self {
        inner.stats.active_tasks.fetch_add(1, Ordering::Relaxed);
        StatsRecorder::bump(&inner.stats.refresh_started);
        inner.metrics.incr(names::BACKGROUND_TASK_STARTED);
        inner.publish_active();
        Self { inner }
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.inner.stats.active_tasks.fetch_sub(1, Ordering::Relaxed);
        self.inner.publish_active();
    }
}

/// Bounded, deduplicating pool of background refresh jobs. Cheap to clone.
#[derive(Clone)]
pub struct RefreshScheduler {
    inner: Arc<Inner>,
}

impl RefreshScheduler {
    pub fn new(config: SchedulerConfig, metrics: Metrics, stats: Arc<StatsRecorder>) -> Result<Self> {
        config.validate()?;
        let limit = config.effective_limit(1.0);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                jobs: Mutex::new(HashMap::new()),
                failures: Mutex::new(LruCache::new(
                    NonZeroUsize::new(MAX_TRACKED_FAILURES).unwrap_or(NonZeroUsize::MIN),
                )),
                gate: Arc::new(ConcurrencyGate::new(limit)),
                pressure_factor: AtomicU64::new(1.0_f64.to_bits()),
                accepting: AtomicBool::new(true),
                idle: Notify::new(),
                cancelled: AtomicU64::new(0),
                metrics,
                stats,
            }),
        })
    }

    /// Scheduler with its own stats and no metrics sink.
    pub fn standalone(config: SchedulerConfig) -> Result<Self> {
        Self::new(
            config,
            Metrics::new("refresh_scheduler", noop_sink()),
            Arc::new(StatsRecorder::new()),
        )
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Submit a refresh for `key`. Returns `false` without running anything when a job for
    /// the key is already outstanding, the scheduler is shutting down, or there is no
    /// Tokio runtime to run on.
    pub fn enqueue<F, Fut>(&self, key: impl Into<String>, refresh_fn: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.submit(key.into(), refresh_fn).is_some()
    }

    fn submit<F, Fut>(&self, key: String, refresh_fn: F) -> Option<oneshot::Receiver<JobOutcome>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        if !self.is_accepting() {
            debug!(key = %key, "scheduler closed, refresh not accepted");
            return None;
        }
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(key = %key, "no tokio runtime available, refresh not scheduled");
                return None;
            }
        };

        let attempt = self.inner.failures().peek(&key).copied().unwrap_or(0) + 1;
        let (done_tx, done_rx) = oneshot::channel();

        let mut jobs = self.inner.jobs();
        if jobs.contains_key(&key) {
            debug!(key = %key, "refresh already outstanding");
            return None;
        }
        // checked again under the lock so a concurrent shutdown cannot miss this job
        if !self.is_accepting() {
            return None;
        }
        let slot = JobSlot::new(attempt);
        let id = slot.id;
        jobs.insert(key.clone(), slot);

        let task = handle.spawn(run_job(
            Arc::clone(&self.inner),
            key.clone(),
            id,
            refresh_fn,
            done_tx,
        ));
        if let Some(slot) = jobs.get_mut(&key) {
            slot.abort = Some(task.abort_handle());
        }
        debug!(key = %key, job_id = %id, attempt, "refresh queued");
        Some(done_rx)
    }

    /// Refresh many keys in batches of `batch.batch_size`. Each batch shares the normal
    /// concurrency ceiling and must finish before the next one is submitted.
    pub async fn enqueue_batch<F, Fut>(&self, keys: Vec<String>, refresh_fn: F) -> BatchReport
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let started = Instant::now();
        let refresh_fn = Arc::new(refresh_fn);
        let mut report = BatchReport::new();

        for chunk in keys.chunks(self.inner.config.batch.batch_size) {
            if !self.is_accepting() {
                report.skipped.extend(chunk.iter().cloned());
                continue;
            }
            report.batches += 1;

            let mut pending = Vec::with_capacity(chunk.len());
            for key in chunk {
                let f = Arc::clone(&refresh_fn);
                let k = key.clone();
                match self.submit(key.clone(), move || (*f)(k)) {
                    Some(done) => pending.push((key.clone(), done)),
                    None => report.skipped.push(key.clone()),
                }
            }

            let outcomes = futures::future::join_all(pending.into_iter().map(
                |(key, done)| async move { (key, done.await.unwrap_or(JobOutcome::Abandoned)) },
            ))
            .await;

            for (key, outcome) in outcomes {
                match outcome {
                    JobOutcome::Succeeded => report.successes.push(key),
                    JobOutcome::Failed(reason) => report.failures.push((key, reason)),
                    JobOutcome::Cancelled | JobOutcome::Abandoned => report.interrupted.push(key),
                }
            }
        }

        report.execution_time = started.elapsed();
        report
    }

    /// Apply a new pressure factor; recomputes the concurrency ceiling.
    pub fn set_pressure_factor(&self, factor: f64) {
        let factor = if factor.is_finite() {
            factor.clamp(0.0, 1.0)
        } else {
            1.0
        };
        self.inner
            .pressure_factor
            .store(factor.to_bits(), Ordering::Relaxed);
        let limit = self.inner.config.effective_limit(factor);
        if limit != self.inner.gate.limit() {
            debug!(limit, factor, "refresh concurrency limit changed");
        }
        self.inner.gate.set_limit(limit);
    }

    pub fn pressure_factor(&self) -> f64 {
        f64::from_bits(self.inner.pressure_factor.load(Ordering::Relaxed))
    }

    pub fn current_limit(&self) -> usize {
        self.inner.gate.limit()
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }

    pub fn is_outstanding(&self, key: &str) -> bool {
        self.inner.jobs().contains_key(key)
    }

    pub fn job(&self, key: &str) -> Option<RefreshJob> {
        self.inner.jobs().get(key).map(|slot| slot.view(key))
    }

    pub fn outstanding(&self) -> usize {
        self.inner.jobs().len()
    }

    pub fn signals(&self) -> SchedulerSignals {
        let queued = self
            .inner
            .jobs()
            .values()
            .filter(|s| s.state == JobState::Queued)
            .count();
        SchedulerSignals {
            limit: self.inner.gate.limit(),
            active: self.inner.gate.active(),
            queued,
            peak_active: self.inner.gate.peak(),
            pressure_factor: self.pressure_factor(),
            accepting: self.is_accepting(),
        }
    }

    /// Stop intake, cancel queued jobs and wait up to `timeout` for running ones. Jobs still
    /// running afterwards are aborted and reported as abandoned. Always returns.
    pub async fn shutdown(&self, timeout: Duration) -> DrainReport {
        let started = Instant::now();
        let completed_before = self.completed_total();
        let cancelled_before = self.inner.cancelled.load(Ordering::Relaxed);

        self.inner.accepting.store(false, Ordering::SeqCst);
        self.inner.gate.close();

        let drained = tokio::time::timeout(timeout, self.wait_idle()).await.is_ok();
        let mut abandoned = Vec::new();
        if !drained {
            let jobs = self.inner.jobs();
            for (key, slot) in jobs.iter() {
                if let Some(abort) = &slot.abort {
                    abort.abort();
                }
                warn!(
                    component = %self.inner.metrics.component(),
                    key = %key,
                    job_id = %slot.id,
                    state = ?slot.state,
                    "refresh job incomplete on shutdown"
                );
                abandoned.push(key.clone());
            }
            abandoned.sort();
        }

        DrainReport {
            drained,
            completed: self.completed_total().saturating_sub(completed_before),
            cancelled: self
                .inner
                .cancelled
                .load(Ordering::Relaxed)
                .saturating_sub(cancelled_before),
            abandoned,
            elapsed: started.elapsed(),
        }
    }

    fn completed_total(&self) -> u64 {
        let stats = self.inner.stats.snapshot();
        stats.refresh_completed + stats.refresh_failed
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.jobs().is_empty() {
                return;
            }
            notified.await;
        }
    }
}

async fn run_job<F, Fut>(
    inner: Arc<Inner>,
    key: String,
    id: Uuid,
    refresh_fn: F,
    done: oneshot::Sender<JobOutcome>,
) where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let _in_flight = InFlightGuard {
        inner: Arc::clone(&inner),
        key: key.clone(),
        id,
    };

    let Some(permit) = inner.gate.acquire().await else {
        inner.cancelled.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, job_id = %id, "queued refresh cancelled by shutdown");
        let _ = done.send(JobOutcome::Cancelled);
        return;
    };

    let attempt = inner.set_state(&key, id, JobState::Running);
    let outcome = {
        let _running = RunningGuard::enter(&inner);
        let result = refresh_fn().await;
        drop(permit);
        result
    };

    match outcome {
        Ok(()) => {
            inner.set_state(&key, id, JobState::Succeeded);
            inner.failures().pop(&key);
            StatsRecorder::bump(&inner.stats.refresh_completed);
            inner.metrics.incr(names::BACKGROUND_TASK_COMPLETED);
            debug!(key = %key, job_id = %id, "refresh succeeded");
            let _ = done.send(JobOutcome::Succeeded);
        }
        Err(e) => {
            inner.set_state(&key, id, JobState::Failed);
            inner.record_failure(&key);
            StatsRecorder::bump(&inner.stats.refresh_failed);
            inner.metrics.incr(names::BACKGROUND_TASK_FAILED);
            warn!(key = %key, job_id = %id, attempt, error = %e, "background refresh failed");
            let _ = done.send(JobOutcome::Failed(e.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn scheduler(config: SchedulerConfig) -> RefreshScheduler {
        RefreshScheduler::standalone(config).unwrap()
    }

    #[test]
    fn test_config_defaults_and_limits() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.base_concurrency, 10);
        assert_eq!(cfg.effective_limit(1.0), 10);
        assert_eq!(cfg.effective_limit(0.25), 2);
        assert_eq!(cfg.effective_limit(0.0), 2);
        assert_eq!(cfg.effective_limit(f64::NAN), 10);

        let wide = SchedulerConfig::new().with_base_concurrency(40);
        assert_eq!(wide.effective_limit(1.0), 16);
        assert_eq!(wide.effective_limit(0.25), 10);
    }

    #[test]
    fn test_config_validation() {
        assert!(SchedulerConfig::new().with_bounds(8, 4).validate().is_err());
        assert!(SchedulerConfig::new().with_base_concurrency(0).validate().is_err());
        assert!(SchedulerConfig::new().with_bounds(0, 4).validate().is_err());
        assert!(SchedulerConfig::new().with_batch_size(3).validate().is_err());
    }

    #[test]
    fn test_enqueue_without_runtime_is_rejected() {
        let s = scheduler(SchedulerConfig::default());
        assert!(!s.enqueue("k", || async { Ok(()) }));
        assert_eq!(s.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_dedup_runs_once() {
        let s = scheduler(SchedulerConfig::default());
        let runs = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let r = runs.clone();
        assert!(s.enqueue("k", move || async move {
            r.fetch_add(1, Ordering::SeqCst);
            let _ = release_rx.await;
            Ok(())
        }));
        let r = runs.clone();
        assert!(!s.enqueue("k", move || async move {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        assert!(s.is_outstanding("k"));
        assert_eq!(s.job("k").map(|j| j.attempt), Some(1));

        // let the job start before releasing it
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(s.job("k").map(|j| j.state), Some(JobState::Running));
        assert!(!s.enqueue("k", || async { Ok(()) }));

        release_tx.send(()).unwrap();
        let report = s.shutdown(Duration::from_secs(1)).await;
        assert!(report.drained);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!s.is_outstanding("k"));
    }

    #[tokio::test]
    async fn test_key_free_again_after_failure() {
        let s = scheduler(SchedulerConfig::default());
        let (tx, rx) = oneshot::channel();
        let done = s
            .submit("k".to_string(), || async {
                Err(Error::Refresh {
                    key: "k".into(),
                    message: "boom".into(),
                })
            })
            .unwrap();
        assert_eq!(
            done.await.unwrap(),
            JobOutcome::Failed("Refresh of 'k' failed: boom".into())
        );
        // give the task a moment to drop its in-flight guard
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!s.is_outstanding("k"));

        assert!(s.enqueue("k", move || async move {
            let _ = tx.send(());
            Ok(())
        }));
        assert_eq!(s.job("k").map(|j| j.attempt), Some(2));
        rx.await.unwrap();
    }

    #[test]
    fn test_failure_counts_are_bounded() {
        let s = RefreshScheduler::standalone(SchedulerConfig::default()).unwrap();
        for i in 0..MAX_TRACKED_FAILURES + 100 {
            s.inner.record_failure(&format!("k{}", i));
        }
        s.inner.record_failure("k0");
        let failures = s.inner.failures();
        assert_eq!(failures.len(), MAX_TRACKED_FAILURES);
        assert_eq!(failures.peek("k1"), None);
        assert_eq!(failures.peek("k0"), Some(&1));
        assert_eq!(failures.peek(&format!("k{}", MAX_TRACKED_FAILURES + 99)), Some(&1));
    }

    #[tokio::test]
    async fn test_pressure_factor_moves_limit() {
        let s = scheduler(SchedulerConfig::new().with_base_concurrency(16));
        assert_eq!(s.current_limit(), 16);
        s.set_pressure_factor(0.25);
        assert_eq!(s.current_limit(), 4);
        assert_eq!(s.pressure_factor(), 0.25);
        s.set_pressure_factor(7.0);
        assert_eq!(s.current_limit(), 16);
        assert_eq!(s.signals().pressure_factor, 1.0);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work_and_is_repeatable() {
        let s = scheduler(SchedulerConfig::default());
        let first = s.shutdown(Duration::from_millis(50)).await;
        assert!(first.drained);
        assert!(!s.enqueue("k", || async { Ok(()) }));
        let second = s.shutdown(Duration::from_millis(50)).await;
        assert!(second.drained);
        assert!(second.abandoned.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_queued_jobs() {
        let s = scheduler(SchedulerConfig::new().with_base_concurrency(1).with_bounds(1, 1));
        let (release_tx, release_rx) = oneshot::channel::<()>();
        assert!(s.enqueue("running", move || async move {
            let _ = release_rx.await;
            Ok(())
        }));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(s.enqueue("queued", || async { Ok(()) }));
        assert_eq!(s.job("queued").map(|j| j.state), Some(JobState::Queued));

        let s2 = s.clone();
        let drain = tokio::spawn(async move { s2.shutdown(Duration::from_secs(1)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        release_tx.send(()).unwrap();

        let report = drain.await.unwrap();
        assert!(report.drained);
        assert_eq!(report.cancelled, 1);
        assert_eq!(report.completed, 1);
    }

    #[tokio::test]
    async fn test_batch_processes_all_keys() {
        let s = scheduler(SchedulerConfig::new().with_batch_size(5));
        let keys: Vec<String> = (0..12).map(|i| format!("k{}", i)).collect();
        let report = s
            .enqueue_batch(keys, |key: String| async move {
                if key == "k7" {
                    Err(Error::Refresh {
                        key,
                        message: "boom".into(),
                    })
                } else {
                    Ok(())
                }
            })
            .await;
        assert_eq!(report.batches, 3);
        assert_eq!(report.successes.len(), 11);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "k7");
        assert!(report.skipped.is_empty());
    }
}
