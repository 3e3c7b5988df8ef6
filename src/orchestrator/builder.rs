use super::{CacheOrchestrator, CacheValue, Shared, WRITE_STRIPES};
use crate::clock::{Clock, SystemClock};
use crate::config::OrchestratorConfig;
use crate::lifecycle::{LifecycleManager, MonitorTask};
use crate::pressure::{PressureMonitor, PressureSampler, ProcSampler};
use crate::scheduler::RefreshScheduler;
use crate::source::{MarketStatusProvider, RefreshSource};
use crate::store::{BackingStore, MemoryStore};
use crate::strategy::StrategyTable;
use crate::telemetry::{noop_sink, Metrics, MetricsSink, StatsRecorder};
use crate::Result;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

/// Entries kept by the default in-process store.
pub const DEFAULT_MEMORY_ENTRIES: usize = 10_000;

/// Builder for [`CacheOrchestrator`].
///
/// Only the configuration is required. Defaults: an in-process [`MemoryStore`], no refresh
/// source (STALE reads are served but not refreshed), no market-status provider (MARKET_AWARE
/// resolves as open), a no-op metrics sink, the system clock and the `/proc` sampler.
pub struct CacheOrchestratorBuilder<V> {
    config: OrchestratorConfig,
    store: Option<Arc<dyn BackingStore>>,
    source: Option<Arc<dyn RefreshSource<V>>>,
    market: Option<Arc<dyn MarketStatusProvider>>,
    sink: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
    sampler: Arc<dyn PressureSampler>,
}

impl<V: CacheValue> CacheOrchestratorBuilder<V> {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            store: None,
            source: None,
            market: None,
            sink: noop_sink(),
            clock: Arc::new(SystemClock),
            sampler: Arc::new(ProcSampler::new()),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn BackingStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_source(mut self, source: impl RefreshSource<V> + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    pub fn with_market_status(mut self, market: Arc<dyn MarketStatusProvider>) -> Self {
        self.market = Some(market);
        self
    }

    pub fn with_metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_sampler(mut self, sampler: Arc<dyn PressureSampler>) -> Self {
        self.sampler = sampler;
        self
    }

    /// Validate the configuration and assemble the orchestrator.
    ///
    /// When pressure monitoring is enabled and a Tokio runtime is available, the sampling
    /// loop is started here and stopped by [`CacheOrchestrator::shutdown`].
    pub fn build(self) -> Result<CacheOrchestrator<V>> {
        self.config.validate()?;
        let table = StrategyTable::new(self.config.strategies)?;

        let stats = Arc::new(StatsRecorder::new());
        let metrics = Metrics::new(self.config.component.clone(), self.sink);
        let scheduler =
            RefreshScheduler::new(self.config.scheduler, metrics.clone(), Arc::clone(&stats))?;
        let monitor = Arc::new(PressureMonitor::new(
            self.config.pressure,
            self.sampler,
            Arc::clone(&stats),
            metrics.clone(),
        )?);
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new(DEFAULT_MEMORY_ENTRIES)));

        let lifecycle = LifecycleManager::new(
            self.config.component.clone(),
            scheduler.clone(),
            self.config.shutdown_timeout(),
        );
        if self.config.pressure.enabled {
            if tokio::runtime::Handle::try_current().is_ok() {
                let (stop, rx) = watch::channel(false);
                let handle = monitor.spawn(scheduler.clone(), rx);
                lifecycle.attach_monitor(MonitorTask { stop, handle });
            } else {
                debug!(
                    component = %self.config.component,
                    "no tokio runtime, pressure monitor not started"
                );
            }
        }

        info!(
            component = %self.config.component,
            store = store.name(),
            refresh_source = self.source.is_some(),
            "cache orchestrator ready"
        );

        Ok(CacheOrchestrator {
            shared: Arc::new(Shared {
                config: self.config,
                table,
                store,
                source: self.source,
                market: self.market,
                clock: self.clock,
                scheduler,
                monitor,
                stats,
                metrics,
                write_locks: (0..WRITE_STRIPES)
                    .map(|_| tokio::sync::Mutex::new(()))
                    .collect(),
            }),
            lifecycle: Arc::new(lifecycle),
        })
    }
}
