//! The cache orchestrator facade.
//!
//! # Read path
//!
//! ```text
//! lookup(key)
//!   store miss / undecodable ──▶ Miss
//!   classify(entry, now)         (layered store, not FRESH: re-read the shared tier)
//!     EXPIRED ──▶ Miss
//!     STALE   ──▶ Stale { value } + enqueue refresh (fire and forget)
//!     FRESH   ──▶ Fresh(value)
//! ```
//!
//! # Write path
//!
//! `put` resolves TTL and refresh ratio through the strategy table, stamps the entry with the
//! current time and overwrites whatever was stored. The market flag and hit rate the caller
//! passed are kept on the entry; its refresh resolves against them again unless the market
//! provider or the pressure monitor has a live value.
//!
//! A background refresh commits only if the entry it was triggered for is still the current
//! one in the authoritative tier; if a `put` (or `invalidate`) landed while it was fetching,
//! the refreshed value is discarded and counted as superseded.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`CacheOrchestrator`] | Public facade, cheap to clone |
//! | [`CacheOrchestratorBuilder`] | Wires store, source, clock, sampler and metrics |
//! | [`CacheLookup`] | Detailed read outcome |

mod builder;
mod lookup;

pub use builder::{CacheOrchestratorBuilder, DEFAULT_MEMORY_ENTRIES};
pub use lookup::CacheLookup;

use crate::clock::Clock;
use crate::config::OrchestratorConfig;
use crate::freshness::{classify, Freshness};
use crate::lifecycle::{LifecycleManager, ShutdownReport};
use crate::pressure::PressureMonitor;
use crate::scheduler::{BatchReport, RefreshScheduler, SchedulerSignals};
use crate::source::{MarketStatusProvider, RefreshSource};
use crate::store::{BackingStore, CacheEntry};
use crate::strategy::{Strategy, StrategyContext, StrategyTable};
use crate::telemetry::{names, CacheStats, Metrics, StatsRecorder};
use crate::{Error, ErrorContext, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub(crate) const WRITE_STRIPES: usize = 64;

/// Bounds every cached value type must satisfy.
pub trait CacheValue: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Only the write stamp of a stored entry; lets commits check for a newer write without
/// decoding the value.
#[derive(Deserialize)]
struct EntryStamp {
    stored_at_ms: u64,
}

pub(crate) struct Shared<V> {
    pub(crate) config: OrchestratorConfig,
    pub(crate) table: StrategyTable,
    pub(crate) store: Arc<dyn BackingStore>,
    pub(crate) source: Option<Arc<dyn RefreshSource<V>>>,
    pub(crate) market: Option<Arc<dyn MarketStatusProvider>>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) scheduler: RefreshScheduler,
    pub(crate) monitor: Arc<PressureMonitor>,
    pub(crate) stats: Arc<StatsRecorder>,
    pub(crate) metrics: Metrics,
    pub(crate) write_locks: Vec<tokio::sync::Mutex<()>>,
}

impl<V: CacheValue> Shared<V> {
    fn write_lock(&self, key: &str) -> &tokio::sync::Mutex<()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.write_locks[(hasher.finish() as usize) % self.write_locks.len()]
    }

    /// Fill in signals the caller left out: market status from the provider, hit rate from
    /// the pressure monitor.
    fn complete_context(&self, strategy: Strategy, mut ctx: StrategyContext) -> StrategyContext {
        match strategy {
            Strategy::MarketAware if ctx.market_open.is_none() => {
                ctx.market_open = self.market.as_ref().map(|m| m.is_market_open());
            }
            Strategy::Adaptive if ctx.hit_rate.is_none() => {
                ctx.hit_rate = self.monitor.recent_hit_rate();
            }
            _ => {}
        }
        ctx
    }

    /// Context a refresh resolves against: live signals from the market provider and the
    /// pressure monitor win, the signals pinned on the entry fill the gaps.
    fn refresh_context(&self, strategy: Strategy, pinned: StrategyContext) -> StrategyContext {
        let mut ctx = pinned;
        match strategy {
            Strategy::MarketAware => {
                if let Some(market) = &self.market {
                    ctx.market_open = Some(market.is_market_open());
                }
            }
            Strategy::Adaptive => {
                if let Some(rate) = self.monitor.recent_hit_rate() {
                    ctx.hit_rate = Some(rate);
                }
            }
            _ => {}
        }
        ctx
    }

    fn build_entry(
        &self,
        key: &str,
        value: V,
        strategy: Strategy,
        resolved: &StrategyContext,
        pinned: &StrategyContext,
    ) -> CacheEntry<V> {
        let resolution = self.table.resolve(strategy, resolved);
        CacheEntry::new(key, value, strategy, resolution, self.clock.now_ms())
            .with_pinned_context(pinned)
    }

    async fn write(&self, entry: &CacheEntry<V>) -> Result<()> {
        let bytes = entry.encode()?;
        self.store.set(&entry.key, bytes, entry.ttl()).await
    }

    fn decode(&self, key: &str, bytes: &[u8]) -> Option<CacheEntry<V>> {
        match CacheEntry::<V>::decode(bytes) {
            Ok(entry) => Some(entry),
            Err(e) => {
                StatsRecorder::bump(&self.stats.errors);
                warn!(
                    component = %self.metrics.component(),
                    key = %key,
                    error = %e,
                    "undecodable cache entry treated as miss"
                );
                None
            }
        }
    }

    async fn read(&self, key: &str) -> Result<Option<CacheEntry<V>>> {
        Ok(self
            .store
            .get(key)
            .await?
            .and_then(|bytes| self.decode(key, &bytes)))
    }

    /// Read `key` and classify it. A layered store may answer from a local copy that lags
    /// the shared tier; a copy that is no longer fresh is re-read from the shared tier.
    async fn read_classified(&self, key: &str) -> Result<Option<(CacheEntry<V>, Freshness)>> {
        let Some(entry) = self.read(key).await? else {
            return Ok(None);
        };
        let freshness = classify(&entry, self.clock.now_ms());
        if freshness == Freshness::Fresh || !self.store.is_layered() {
            return Ok(Some((entry, freshness)));
        }
        let newer = self
            .store
            .get_authoritative(key)
            .await?
            .and_then(|bytes| self.decode(key, &bytes));
        Ok(newer.map(|e| {
            if e.stored_at_ms != entry.stored_at_ms {
                debug!(key = %key, "local copy superseded by shared tier");
            }
            let freshness = classify(&e, self.clock.now_ms());
            (e, freshness)
        }))
    }

    /// Write stamp of the authoritative copy of `key`.
    async fn current_stamp(&self, key: &str) -> Result<Option<u64>> {
        Ok(self
            .store
            .get_authoritative(key)
            .await?
            .and_then(|bytes| serde_json::from_slice::<EntryStamp>(&bytes).ok())
            .map(|s| s.stored_at_ms))
    }

    fn source(&self) -> Result<&Arc<dyn RefreshSource<V>>> {
        self.source.as_ref().ok_or_else(|| {
            Error::configuration_with_context(
                "no refresh source configured",
                ErrorContext::new()
                    .with_details("register one with CacheOrchestratorBuilder::with_source")
                    .with_source("cache_orchestrator"),
            )
        })
    }

    async fn fetch(&self, key: &str) -> Result<V> {
        self.source()?
            .fetch(key)
            .await
            .map_err(|e| Error::refresh(key, &e))
    }

    /// Fetch `key` from the source and store it, provided the entry still carries the
    /// write stamp `observed` (`None`: the key was absent). `pinned` carries the signals the
    /// original writer supplied.
    async fn refresh(
        &self,
        key: String,
        strategy: Strategy,
        pinned: StrategyContext,
        observed: Option<u64>,
    ) -> Result<()> {
        let value = self.fetch(&key).await?;

        let _guard = self.write_lock(&key).lock().await;
        let current = self.current_stamp(&key).await?;
        if current != observed {
            StatsRecorder::bump(&self.stats.refresh_superseded);
            self.metrics.incr(names::REFRESH_SUPERSEDED);
            debug!(
                key = %key,
                observed = ?observed,
                current = ?current,
                "refresh result discarded, entry changed meanwhile"
            );
            return Ok(());
        }
        let resolved = self.refresh_context(strategy, pinned);
        let entry = self.build_entry(&key, value, strategy, &resolved, &pinned);
        self.write(&entry).await?;
        debug!(key = %key, ttl_ms = entry.ttl_ms, "entry refreshed");
        Ok(())
    }

    fn record_hit(&self, stale: bool) {
        StatsRecorder::bump(&self.stats.hits);
        self.metrics.incr(names::CACHE_HIT);
        if stale {
            StatsRecorder::bump(&self.stats.stale_hits);
            self.metrics.incr(names::CACHE_STALE);
        }
    }

    fn record_miss(&self, expired: bool) {
        StatsRecorder::bump(&self.stats.misses);
        self.metrics.incr(names::CACHE_MISS);
        if expired {
            StatsRecorder::bump(&self.stats.expired);
        }
    }
}

/// Stale-while-revalidate cache facade with per-entry freshness strategies.
///
/// Clones share the same store, scheduler and lifecycle.
pub struct CacheOrchestrator<V> {
    shared: Arc<Shared<V>>,
    lifecycle: Arc<LifecycleManager>,
}

impl<V> Clone for CacheOrchestrator<V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            lifecycle: Arc::clone(&self.lifecycle),
        }
    }
}

impl<V: CacheValue> CacheOrchestrator<V> {
    pub fn builder(config: OrchestratorConfig) -> CacheOrchestratorBuilder<V> {
        CacheOrchestratorBuilder::new(config)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.shared.config
    }

    pub fn strategy_table(&self) -> &StrategyTable {
        &self.shared.table
    }

    /// Read `key`, serving STALE values and scheduling their refresh in the background.
    ///
    /// Only backing-store failures are returned as errors; nothing from the refresh
    /// machinery ever reaches the caller.
    pub async fn lookup(&self, key: &str) -> Result<CacheLookup<V>> {
        let shared = &self.shared;
        let (entry, freshness) = match shared.read_classified(key).await {
            Ok(Some(found)) => found,
            Ok(None) => {
                shared.record_miss(false);
                return Ok(CacheLookup::Miss);
            }
            Err(e) => {
                StatsRecorder::bump(&shared.stats.errors);
                return Err(e);
            }
        };

        match freshness {
            Freshness::Fresh => {
                shared.record_hit(false);
                Ok(CacheLookup::Fresh(entry.value))
            }
            Freshness::Stale => {
                shared.record_hit(true);
                let refresh_enqueued = self.schedule_refresh(&entry);
                Ok(CacheLookup::Stale {
                    value: entry.value,
                    refresh_enqueued,
                })
            }
            Freshness::Expired => {
                shared.record_miss(true);
                Ok(CacheLookup::Miss)
            }
        }
    }

    /// `Some(value)` for FRESH and STALE entries, `None` otherwise.
    pub async fn get(&self, key: &str) -> Result<Option<V>> {
        Ok(self.lookup(key).await?.into_value())
    }

    fn schedule_refresh(&self, entry: &CacheEntry<V>) -> bool {
        if self.shared.source.is_none() {
            debug!(key = %entry.key, "stale entry served, no refresh source configured");
            return false;
        }
        let shared = Arc::clone(&self.shared);
        let key = entry.key.clone();
        let strategy = entry.strategy;
        let observed = entry.stored_at_ms;
        let pinned = entry.pinned_context();
        self.shared.scheduler.enqueue(entry.key.clone(), move || async move {
            shared.refresh(key, strategy, pinned, Some(observed)).await
        })
    }

    /// Store `value` under `key`, replacing any existing entry.
    pub async fn put(
        &self,
        key: &str,
        value: V,
        strategy: Strategy,
        ctx: StrategyContext,
    ) -> Result<()> {
        let shared = &self.shared;
        let resolved = shared.complete_context(strategy, ctx);
        let entry = shared.build_entry(key, value, strategy, &resolved, &ctx);
        let _guard = shared.write_lock(key).lock().await;
        if let Err(e) = shared.write(&entry).await {
            StatsRecorder::bump(&shared.stats.errors);
            return Err(e);
        }
        StatsRecorder::bump(&shared.stats.puts);
        debug!(key = %key, strategy = %strategy, ttl_ms = entry.ttl_ms, "entry stored");
        Ok(())
    }

    /// Read-through: serve cached values like [`Self::lookup`]; on a miss fetch from the
    /// refresh source in the caller's task, store the result and return it.
    pub async fn get_or_load(
        &self,
        key: &str,
        strategy: Strategy,
        ctx: StrategyContext,
    ) -> Result<V> {
        if let Some(value) = self.lookup(key).await?.into_value() {
            return Ok(value);
        }
        let value = self.shared.fetch(key).await?;
        self.put(key, value.clone(), strategy, ctx).await?;
        Ok(value)
    }

    /// Remove `key`. Returns whether an entry was present.
    pub async fn invalidate(&self, key: &str) -> Result<bool> {
        let _guard = self.shared.write_lock(key).lock().await;
        self.shared.store.delete(key).await
    }

    /// Populate `keys` from the refresh source, batch by batch, through the refresh
    /// scheduler. Keys already being refreshed are skipped.
    pub async fn warm(
        &self,
        keys: Vec<String>,
        strategy: Strategy,
        ctx: StrategyContext,
    ) -> Result<BatchReport> {
        self.shared.source()?;
        let shared = Arc::clone(&self.shared);
        let report = self
            .shared
            .scheduler
            .enqueue_batch(keys, move |key: String| {
                let shared = Arc::clone(&shared);
                async move {
                    let observed = shared.current_stamp(&key).await?;
                    shared.refresh(key, strategy, ctx, observed).await
                }
            })
            .await;
        debug!(
            batches = report.batches,
            succeeded = report.successes.len(),
            failed = report.failures.len(),
            skipped = report.skipped.len(),
            "cache warm finished"
        );
        Ok(report)
    }

    pub fn stats(&self) -> CacheStats {
        self.shared.stats.snapshot()
    }

    pub fn scheduler_signals(&self) -> SchedulerSignals {
        self.shared.scheduler.signals()
    }

    pub fn scheduler(&self) -> &RefreshScheduler {
        &self.shared.scheduler
    }

    pub fn pressure_monitor(&self) -> &Arc<PressureMonitor> {
        &self.shared.monitor
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    /// Stop background work, waiting at most `timeout` for running refreshes. Safe to call
    /// more than once; later calls return the first report immediately.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        self.lifecycle.shutdown(timeout).await
    }
}
