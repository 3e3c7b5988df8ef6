//! Sources of memory and CPU utilisation.

use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Reports resource utilisation as ratios in `[0, 1]`.
#[async_trait]
pub trait PressureSampler: Send + Sync {
    async fn memory_ratio(&self) -> Result<f64>;
    async fn cpu_ratio(&self) -> Result<f64>;
    fn name(&self) -> &'static str;
}

/// Linux sampler backed by `/proc/meminfo` and `/proc/loadavg`.
///
/// Memory is `1 - MemAvailable / MemTotal`. CPU is the one-minute load average divided by
/// the available parallelism, capped at 1.
#[derive(Debug, Clone)]
pub struct ProcSampler {
    meminfo_path: String,
    loadavg_path: String,
}

impl Default for ProcSampler {
    fn default() -> Self {
        Self {
            meminfo_path: "/proc/meminfo".to_string(),
            loadavg_path: "/proc/loadavg".to_string(),
        }
    }
}

impl ProcSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read from alternative files (containers with a remapped procfs, tests).
    pub fn with_paths(meminfo: impl Into<String>, loadavg: impl Into<String>) -> Self {
        Self {
            meminfo_path: meminfo.into(),
            loadavg_path: loadavg.into(),
        }
    }
}

fn parse_error(details: impl Into<String>) -> Error {
    Error::runtime_with_context(
        "unable to parse pressure sample",
        ErrorContext::new()
            .with_details(details)
            .with_source("proc_sampler"),
    )
}

pub(crate) fn parse_meminfo(content: &str) -> Result<f64> {
    let field = |name: &str| -> Option<f64> {
        content
            .lines()
            .find(|l| l.starts_with(name))
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|v| v.parse::<f64>().ok())
    };
    let total = field("MemTotal:").ok_or_else(|| parse_error("MemTotal missing"))?;
    let available = field("MemAvailable:").ok_or_else(|| parse_error("MemAvailable missing"))?;
    if total <= 0.0 {
        return Err(parse_error("MemTotal is zero"));
    }
    Ok((1.0 - available / total).clamp(0.0, 1.0))
}

pub(crate) fn parse_loadavg(content: &str, cpus: usize) -> Result<f64> {
    let one_minute = content
        .split_whitespace()
        .next()
        .and_then(|v| v.parse::<f64>().ok())
        .ok_or_else(|| parse_error("load average missing"))?;
    Ok((one_minute / cpus.max(1) as f64).clamp(0.0, 1.0))
}

#[async_trait]
impl PressureSampler for ProcSampler {
    async fn memory_ratio(&self) -> Result<f64> {
        let content = tokio::fs::read_to_string(&self.meminfo_path).await?;
        parse_meminfo(&content)
    }

    async fn cpu_ratio(&self) -> Result<f64> {
        let content = tokio::fs::read_to_string(&self.loadavg_path).await?;
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        parse_loadavg(&content, cpus)
    }

    fn name(&self) -> &'static str {
        "proc"
    }
}

/// Sampler with externally set readings; can be told to fail. For tests and simulations.
#[derive(Debug)]
pub struct StaticSampler {
    memory: AtomicU64,
    cpu: AtomicU64,
    failing: AtomicBool,
}

impl StaticSampler {
    pub fn new(memory_ratio: f64, cpu_ratio: f64) -> Self {
        Self {
            memory: AtomicU64::new(memory_ratio.to_bits()),
            cpu: AtomicU64::new(cpu_ratio.to_bits()),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_memory(&self, ratio: f64) {
        self.memory.store(ratio.to_bits(), Ordering::Relaxed);
    }

    pub fn set_cpu(&self, ratio: f64) {
        self.cpu.store(ratio.to_bits(), Ordering::Relaxed);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    fn read(&self, cell: &AtomicU64) -> Result<f64> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(Error::runtime_with_context(
                "sampler unavailable",
                ErrorContext::new().with_source("static_sampler"),
            ));
        }
        Ok(f64::from_bits(cell.load(Ordering::Relaxed)))
    }
}

impl Default for StaticSampler {
    fn default() -> Self {
        Self::new(0.0, 0.0)
    }
}

#[async_trait]
impl PressureSampler for StaticSampler {
    async fn memory_ratio(&self) -> Result<f64> {
        self.read(&self.memory)
    }

    async fn cpu_ratio(&self) -> Result<f64> {
        self.read(&self.cpu)
    }

    fn name(&self) -> &'static str {
        "static"
    }
}
