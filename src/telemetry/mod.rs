//! Metrics emission and runtime statistics.
//!
//! The orchestrator writes named counters and gauges to a [`MetricsSink`]; it never reads
//! them back. Every name is prefixed with the component identity (`"{component}.{name}"`)
//! so several orchestrators can share one sink.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`MetricsSink`] | Trait for metric destinations |
//! | [`NoopMetricsSink`] | Default sink, discards everything |
//! | [`InMemoryMetricsSink`] | Keeps totals in memory, for tests and diagnostics |
//! | [`TracingMetricsSink`] | Emits each update as a `tracing` event |
//! | [`CacheStats`] | Point-in-time counter snapshot |

mod stats;

pub use stats::{CacheStats, StatsRecorder};

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub mod names {
    pub const BACKGROUND_TASK_STARTED: &str = "background_task_started";
    pub const BACKGROUND_TASK_COMPLETED: &str = "background_task_completed";
    pub const BACKGROUND_TASK_FAILED: &str = "background_task_failed";
    pub const ACTIVE_TASKS_COUNT: &str = "active_tasks_count";
    pub const CACHE_HIT: &str = "cache_hit";
    pub const CACHE_MISS: &str = "cache_miss";
    pub const CACHE_STALE: &str = "cache_stale";
    pub const REFRESH_SUPERSEDED: &str = "refresh_superseded";
    pub const THROTTLE_FACTOR: &str = "throttle_factor";
}

/// Write-only metrics destination.
pub trait MetricsSink: Send + Sync {
    fn increment(&self, name: &str, by: u64);
    fn gauge(&self, name: &str, value: f64);
}

/// Discards everything.
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn increment(&self, _: &str, _: u64) {}
    fn gauge(&self, _: &str, _: f64) {}
}

pub fn noop_sink() -> Arc<dyn MetricsSink> {
    Arc::new(NoopMetricsSink)
}

/// In-memory sink for testing.
#[derive(Default)]
pub struct InMemoryMetricsSink {
    counters: RwLock<HashMap<String, u64>>,
    gauges: RwLock<HashMap<String, f64>>,
}

impl InMemoryMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    pub fn gauge_value(&self, name: &str) -> Option<f64> {
        self.gauges
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .copied()
    }

    pub fn counter_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .counters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn clear(&self) {
        self.counters.write().unwrap_or_else(|e| e.into_inner()).clear();
        self.gauges.write().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl MetricsSink for InMemoryMetricsSink {
    fn increment(&self, name: &str, by: u64) {
        let mut counters = self.counters.write().unwrap_or_else(|e| e.into_inner());
        *counters.entry(name.to_string()).or_insert(0) += by;
    }

    fn gauge(&self, name: &str, value: f64) {
        self.gauges
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), value);
    }
}

/// Emits each update as a `tracing` event at TRACE level under the `metrics` target.
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn increment(&self, name: &str, by: u64) {
        tracing::trace!(target: "metrics", metric = %name, by, "counter");
    }

    fn gauge(&self, name: &str, value: f64) {
        tracing::trace!(target: "metrics", metric = %name, value, "gauge");
    }
}

/// A sink bound to a component identity; prefixes every metric name.
#[derive(Clone)]
pub struct Metrics {
    component: Arc<str>,
    sink: Arc<dyn MetricsSink>,
}

impl Metrics {
    pub fn new(component: impl Into<String>, sink: Arc<dyn MetricsSink>) -> Self {
        let component: String = component.into();
        Self {
            component: Arc::from(component),
            sink,
        }
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn qualified(&self, name: &str) -> String {
        format!("{}.{}", self.component, name)
    }

    pub fn incr(&self, name: &str) {
        self.sink.increment(&self.qualified(name), 1);
    }

    pub fn gauge(&self, name: &str, value: f64) {
        self.sink.gauge(&self.qualified(name), value);
    }
}
