//! Resource pressure monitoring and the throttle factor derived from it.
//!
//! The monitor samples memory and CPU utilisation on a timer, combines them with the
//! cache's own hit and refresh-error rates, and publishes an immutable
//! [`PressureSnapshot`]. Readers load the current snapshot without locking; each sample
//! replaces it wholesale.
//!
//! # Throttle curve
//!
//! ```text
//! factor
//!  1.0 ┤━━━━━━━━━━━━━━┓
//!      │              ┃╲
//!      │              ┃  ╲
//! floor┤              ┃    ━━━━━━━━━
//!      └──────────────┸────┸────────▶ ratio
//!                threshold critical
//! ```
//!
//! Memory and CPU each get a factor from their own threshold/critical pair; the lower one
//! wins. A snapshot older than twice the sampling interval means "unknown pressure" and
//! yields 1.0: refusing to refresh is worse than occasionally over-refreshing.

mod sampler;

pub use sampler::{PressureSampler, ProcSampler, StaticSampler};

use crate::scheduler::RefreshScheduler;
use crate::telemetry::{names, Metrics, StatsRecorder};
use crate::{Error, Result};
use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PressureConfig {
    /// Run the background sampling loop. When off, `sample` can still be driven manually.
    pub enabled: bool,
    pub memory_interval_ms: u64,
    pub cpu_interval_ms: u64,
    pub memory_threshold: f64,
    pub memory_critical: f64,
    pub cpu_threshold: f64,
    pub cpu_critical: f64,
    pub floor_factor: f64,
}

impl Default for PressureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            memory_interval_ms: 30_000,
            cpu_interval_ms: 60_000,
            memory_threshold: 0.85,
            memory_critical: 0.90,
            cpu_threshold: 0.80,
            cpu_critical: 0.95,
            floor_factor: 0.25,
        }
    }
}

impl PressureConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_intervals(mut self, memory: Duration, cpu: Duration) -> Self {
        self.memory_interval_ms = memory.as_millis() as u64;
        self.cpu_interval_ms = cpu.as_millis() as u64;
        self
    }

    pub fn with_memory_thresholds(mut self, threshold: f64, critical: f64) -> Self {
        self.memory_threshold = threshold;
        self.memory_critical = critical;
        self
    }

    pub fn with_cpu_thresholds(mut self, threshold: f64, critical: f64) -> Self {
        self.cpu_threshold = threshold;
        self.cpu_critical = critical;
        self
    }

    pub fn with_floor_factor(mut self, floor: f64) -> Self {
        self.floor_factor = floor;
        self
    }

    pub fn memory_interval(&self) -> Duration {
        Duration::from_millis(self.memory_interval_ms)
    }

    pub fn cpu_interval(&self) -> Duration {
        Duration::from_millis(self.cpu_interval_ms)
    }

    /// Age beyond which the latest snapshot no longer counts.
    pub fn stale_after(&self) -> Duration {
        self.memory_interval() * 2
    }

    pub fn validate(&self) -> Result<()> {
        if self.memory_interval_ms == 0 {
            return Err(Error::invalid_config("pressure.memory_interval_ms", "must be > 0"));
        }
        if self.cpu_interval_ms == 0 {
            return Err(Error::invalid_config("pressure.cpu_interval_ms", "must be > 0"));
        }
        check_pair("pressure.memory", self.memory_threshold, self.memory_critical)?;
        check_pair("pressure.cpu", self.cpu_threshold, self.cpu_critical)?;
        if !(self.floor_factor > 0.0 && self.floor_factor <= 1.0) {
            return Err(Error::invalid_config(
                "pressure.floor_factor",
                format!("{} must lie in (0, 1]", self.floor_factor),
            ));
        }
        Ok(())
    }

    /// Throttle factor for a snapshot: the lower of the memory and CPU factors.
    pub fn throttle_factor(&self, snapshot: &PressureSnapshot) -> f64 {
        let memory = ramp(
            snapshot.memory_ratio,
            self.memory_threshold,
            self.memory_critical,
            self.floor_factor,
        );
        let cpu = ramp(
            snapshot.cpu_ratio,
            self.cpu_threshold,
            self.cpu_critical,
            self.floor_factor,
        );
        memory.min(cpu)
    }
}

fn check_pair(prefix: &str, threshold: f64, critical: f64) -> Result<()> {
    if !(threshold > 0.0 && threshold <= 1.0) {
        return Err(Error::invalid_config(
            &format!("{}_threshold", prefix),
            format!("{} must lie in (0, 1]", threshold),
        ));
    }
    if !(critical > threshold && critical <= 1.0) {
        return Err(Error::invalid_config(
            &format!("{}_critical", prefix),
            format!("{} must lie in ({}, 1]", critical, threshold),
        ));
    }
    Ok(())
}

/// Linear ramp from 1.0 at `threshold` down to `floor` at `critical` and beyond.
pub fn ramp(ratio: f64, threshold: f64, critical: f64, floor: f64) -> f64 {
    if !ratio.is_finite() || ratio <= threshold {
        return 1.0;
    }
    let progress = ((ratio - threshold) / (critical - threshold)).min(1.0);
    1.0 - progress * (1.0 - floor)
}

/// One immutable pressure reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PressureSnapshot {
    pub memory_ratio: f64,
    pub cpu_ratio: f64,
    /// Share of refresh jobs that failed since the previous sample.
    pub error_rate: f64,
    /// Share of reads that hit since the previous sample.
    pub hit_rate: f64,
    pub sampled_at: Instant,
}

impl PressureSnapshot {
    pub fn age(&self) -> Duration {
        Instant::now().saturating_duration_since(self.sampled_at)
    }
}

/// The latest snapshot together with its age.
#[derive(Debug, Clone, Copy)]
pub struct PressureReading {
    pub snapshot: PressureSnapshot,
    pub age: Duration,
    /// Older than twice the sampling interval; treat as unknown pressure.
    pub stale: bool,
}

#[derive(Debug, Default)]
struct SampleWindow {
    hits: u64,
    misses: u64,
    completed: u64,
    failed: u64,
    cpu: Option<(f64, Instant)>,
    traffic_seen: bool,
}

pub struct PressureMonitor {
    config: PressureConfig,
    sampler: Arc<dyn PressureSampler>,
    stats: Arc<StatsRecorder>,
    latest: ArcSwapOption<PressureSnapshot>,
    window: Mutex<SampleWindow>,
    metrics: Metrics,
}

impl PressureMonitor {
    pub fn new(
        config: PressureConfig,
        sampler: Arc<dyn PressureSampler>,
        stats: Arc<StatsRecorder>,
        metrics: Metrics,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            sampler,
            stats,
            latest: ArcSwapOption::empty(),
            window: Mutex::new(SampleWindow::default()),
            metrics,
        })
    }

    pub fn config(&self) -> &PressureConfig {
        &self.config
    }

    fn window(&self) -> MutexGuard<'_, SampleWindow> {
        self.window.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take a sample and publish it.
    ///
    /// If the sampler fails, the previous snapshot is kept (and returned) and a warning is
    /// logged; `None` only when there has never been a successful sample.
    pub async fn sample(&self) -> Option<PressureSnapshot> {
        let previous = self.latest.load_full();

        let memory = match self.sampler.memory_ratio().await {
            Ok(v) => v,
            Err(e) => return self.keep_previous(previous, &e),
        };

        let cpu_due = {
            let w = self.window();
            match w.cpu {
                Some((_, at)) => at.elapsed() >= self.config.cpu_interval(),
                None => true,
            }
        };
        let cpu = if cpu_due {
            match self.sampler.cpu_ratio().await {
                Ok(v) => {
                    self.window().cpu = Some((v, Instant::now()));
                    v
                }
                Err(e) => return self.keep_previous(previous, &e),
            }
        } else {
            self.window().cpu.map(|(v, _)| v).unwrap_or(0.0)
        };

        let counters = self.stats.snapshot();
        let (hit_rate, error_rate) = {
            let mut w = self.window();
            let hits = counters.hits.saturating_sub(w.hits);
            let misses = counters.misses.saturating_sub(w.misses);
            let completed = counters.refresh_completed.saturating_sub(w.completed);
            let failed = counters.refresh_failed.saturating_sub(w.failed);
            w.hits = counters.hits;
            w.misses = counters.misses;
            w.completed = counters.refresh_completed;
            w.failed = counters.refresh_failed;

            let hit_rate = if hits + misses > 0 {
                w.traffic_seen = true;
                hits as f64 / (hits + misses) as f64
            } else {
                previous.as_ref().map(|p| p.hit_rate).unwrap_or(0.0)
            };
            let error_rate = if completed + failed > 0 {
                failed as f64 / (completed + failed) as f64
            } else {
                previous.as_ref().map(|p| p.error_rate).unwrap_or(0.0)
            };
            (hit_rate, error_rate)
        };

        let snapshot = PressureSnapshot {
            memory_ratio: memory.clamp(0.0, 1.0),
            cpu_ratio: cpu.clamp(0.0, 1.0),
            error_rate,
            hit_rate,
            sampled_at: Instant::now(),
        };
        self.latest.store(Some(Arc::new(snapshot)));
        debug!(
            sampler = self.sampler.name(),
            memory = snapshot.memory_ratio,
            cpu = snapshot.cpu_ratio,
            hit_rate = snapshot.hit_rate,
            error_rate = snapshot.error_rate,
            "pressure sampled"
        );
        Some(snapshot)
    }

    fn keep_previous(
        &self,
        previous: Option<Arc<PressureSnapshot>>,
        err: &Error,
    ) -> Option<PressureSnapshot> {
        match previous {
            Some(prev) => {
                warn!(
                    sampler = self.sampler.name(),
                    error = %err,
                    age_ms = prev.age().as_millis() as u64,
                    "pressure sampling failed, reusing last snapshot"
                );
                Some(*prev)
            }
            None => {
                warn!(
                    sampler = self.sampler.name(),
                    error = %err,
                    "pressure sampling failed and no earlier snapshot exists"
                );
                None
            }
        }
    }

    pub fn latest(&self) -> Option<PressureReading> {
        self.latest.load_full().map(|snapshot| {
            let age = snapshot.age();
            PressureReading {
                snapshot: *snapshot,
                age,
                stale: age > self.config.stale_after(),
            }
        })
    }

    /// Factor in `[floor, 1]` to apply to the refresh concurrency. 1.0 when nothing has
    /// been sampled yet or the last sample is too old.
    pub fn current_throttle_factor(&self) -> f64 {
        match self.latest() {
            Some(reading) if !reading.stale => self.config.throttle_factor(&reading.snapshot),
            Some(reading) => {
                debug!(
                    age_ms = reading.age.as_millis() as u64,
                    "pressure snapshot overdue, assuming no pressure"
                );
                1.0
            }
            None => 1.0,
        }
    }

    /// Hit rate of the most recent window that saw reads; `None` before any traffic.
    pub fn recent_hit_rate(&self) -> Option<f64> {
        if !self.window().traffic_seen {
            return None;
        }
        self.latest.load_full().map(|s| s.hit_rate)
    }

    /// Sample once and push the resulting factor into the scheduler.
    pub async fn tick(&self, scheduler: &RefreshScheduler) -> f64 {
        self.sample().await;
        let factor = self.current_throttle_factor();
        scheduler.set_pressure_factor(factor);
        self.metrics.gauge(names::THROTTLE_FACTOR, factor);
        factor
    }

    /// Run [`Self::tick`] every memory interval until `shutdown` flips to `true` or its
    /// sender goes away.
    pub fn spawn(
        self: &Arc<Self>,
        scheduler: RefreshScheduler,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.config.memory_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        monitor.tick(&scheduler).await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(component = %monitor.metrics.component(), "pressure monitor stopped");
        })
    }
}
