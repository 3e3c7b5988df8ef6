//! End-to-end behaviour of the orchestrator: read/write paths, background refresh,
//! pressure throttling and shutdown.

use smart_cache::pressure::{PressureConfig, StaticSampler};
use smart_cache::scheduler::SchedulerConfig;
use smart_cache::source::StaticMarketStatus;
use smart_cache::strategy::StrategyConfigs;
use smart_cache::telemetry::InMemoryMetricsSink;
use smart_cache::{
    source_fn, BackingStore, CacheEntry, CacheLookup, CacheOrchestrator, ManualClock,
    MemoryStore, OrchestratorConfig, Strategy, StrategyContext, StrategyTable, TieredStore,
};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::field::{Field, Visit};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;

fn quiet_config() -> OrchestratorConfig {
    OrchestratorConfig::new()
        .with_component("quotes")
        .with_pressure(PressureConfig::new().with_enabled(false))
}

async fn wait_until_idle(cache: &CacheOrchestrator<String>) {
    for _ in 0..200 {
        if cache.scheduler().outstanding() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("refresh jobs did not finish");
}

/// Counts events whose message contains a needle.
struct MessageCounter {
    needle: &'static str,
    hits: Arc<AtomicUsize>,
}

struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{:?}", value);
        }
    }
}

impl<S: tracing::Subscriber> Layer<S> for MessageCounter {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor(String::new());
        event.record(&mut visitor);
        if visitor.0.contains(self.needle) {
            self.hits.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[tokio::test]
async fn scenario_a_stale_then_expired() {
    let clock = Arc::new(ManualClock::new(10_000));
    let cache: CacheOrchestrator<String> = CacheOrchestrator::builder(quiet_config())
        .with_clock(clock.clone())
        .build()
        .unwrap();

    cache
        .put("x", "v".into(), Strategy::Strong, StrategyContext::new())
        .await
        .unwrap();

    clock.advance(Duration::from_millis(4_000));
    assert!(matches!(
        cache.lookup("x").await.unwrap(),
        CacheLookup::Stale { .. }
    ));

    clock.advance(Duration::from_millis(1_100));
    assert_eq!(cache.lookup("x").await.unwrap(), CacheLookup::Miss);
    assert_eq!(cache.stats().expired, 1);
}

#[tokio::test]
async fn scenario_b_put_then_get_is_fresh_without_refresh() {
    let cache: CacheOrchestrator<String> = CacheOrchestrator::builder(quiet_config())
        .with_source(source_fn(|_key: String| async {
            Ok::<_, anyhow::Error>("fetched".to_string())
        }))
        .build()
        .unwrap();

    cache
        .put("x", "v1".into(), Strategy::Strong, StrategyContext::new())
        .await
        .unwrap();
    assert_eq!(
        cache.lookup("x").await.unwrap(),
        CacheLookup::Fresh("v1".to_string())
    );
    assert_eq!(cache.scheduler().outstanding(), 0);
    assert_eq!(cache.stats().refresh_started, 0);
}

#[test]
fn scenario_c_closed_market_tolerates_longer_staleness() {
    let table = StrategyTable::new(StrategyConfigs::default()).unwrap();
    let closed = table.resolve(
        Strategy::MarketAware,
        &StrategyContext::new().with_market_open(false),
    );
    let open = table.resolve(
        Strategy::MarketAware,
        &StrategyContext::new().with_market_open(true),
    );
    assert_eq!(closed.ttl, Duration::from_secs(1800));
    assert_eq!(closed.refresh_threshold_ratio, 0.1);
    assert_eq!(open.ttl, Duration::from_secs(30));
    assert_eq!(open.refresh_threshold_ratio, 0.3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_d_concurrent_stale_reads_refresh_once() {
    let clock = Arc::new(ManualClock::new(0));
    let fetches = Arc::new(AtomicUsize::new(0));
    let counter = fetches.clone();
    let cache: CacheOrchestrator<String> = CacheOrchestrator::builder(quiet_config())
        .with_clock(clock.clone())
        .with_source(source_fn(move |key: String| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, anyhow::Error>(format!("{}-new", key))
            }
        }))
        .build()
        .unwrap();

    cache
        .put("hot", "old".into(), Strategy::Weak, StrategyContext::new())
        .await
        .unwrap();
    clock.advance(Duration::from_secs(250));

    let readers: Vec<_> = (0..20)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.lookup("hot").await.unwrap() })
        })
        .collect();

    let mut enqueued = 0;
    for reader in readers {
        match reader.await.unwrap() {
            CacheLookup::Stale {
                value,
                refresh_enqueued,
            } => {
                assert_eq!(value, "old");
                if refresh_enqueued {
                    enqueued += 1;
                }
            }
            other => panic!("expected a stale read, got {:?}", other),
        }
    }
    wait_until_idle(&cache).await;

    assert_eq!(enqueued, 1);
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
    assert_eq!(cache.get("hot").await.unwrap(), Some("hot-new".to_string()));
    assert_eq!(cache.stats().stale_hits, 20);
}

#[tokio::test]
async fn scenario_e_shutdown_abandons_slow_refresh() {
    let hits = Arc::new(AtomicUsize::new(0));
    let subscriber = tracing_subscriber::registry().with(MessageCounter {
        needle: "incomplete on shutdown",
        hits: hits.clone(),
    });
    let _default = tracing::subscriber::set_default(subscriber);

    let clock = Arc::new(ManualClock::new(0));
    let cache: CacheOrchestrator<String> = CacheOrchestrator::builder(quiet_config())
        .with_clock(clock.clone())
        .with_source(source_fn(|_key: String| async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok::<_, anyhow::Error>("late".to_string())
        }))
        .build()
        .unwrap();

    cache
        .put("slow", "v".into(), Strategy::Strong, StrategyContext::new())
        .await
        .unwrap();
    clock.advance(Duration::from_secs(4));
    assert!(matches!(
        cache.lookup("slow").await.unwrap(),
        CacheLookup::Stale {
            refresh_enqueued: true,
            ..
        }
    ));
    tokio::time::sleep(Duration::from_millis(10)).await;

    let started = Instant::now();
    let report = cache.shutdown(Duration::from_millis(100)).await;
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_millis(400), "took {:?}", elapsed);
    assert!(!report.drained);
    assert_eq!(report.abandoned, vec!["slow".to_string()]);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // the abandoned result never lands
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(cache.get("slow").await.unwrap(), Some("v".to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrency_ceiling_under_memory_pressure() {
    let sink = Arc::new(InMemoryMetricsSink::new());
    let cache: CacheOrchestrator<String> = CacheOrchestrator::builder(
        OrchestratorConfig::new()
            .with_component("pressured")
            .with_scheduler(SchedulerConfig::new().with_base_concurrency(16).with_bounds(2, 16)),
    )
    .with_sampler(Arc::new(StaticSampler::new(0.9, 0.1)))
    .with_metrics_sink(sink.clone())
    .build()
    .unwrap();

    for _ in 0..100 {
        if cache.scheduler().current_limit() == 4 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(cache.scheduler().current_limit(), 4);
    assert_eq!(sink.gauge_value("pressured.throttle_factor"), Some(0.25));

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    for i in 0..20 {
        let running = running.clone();
        let peak = peak.clone();
        assert!(cache.scheduler().enqueue(format!("k{}", i), move || async move {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }));
    }
    wait_until_idle(&cache).await;

    let ceiling = (16.0 * 0.25) as usize;
    assert!(peak.load(Ordering::SeqCst) <= ceiling);
    assert!(cache.scheduler_signals().peak_active <= ceiling);
    assert_eq!(cache.stats().refresh_completed, 20);

    cache.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn shutdown_twice_returns_immediately() {
    let cache: CacheOrchestrator<String> = CacheOrchestrator::builder(OrchestratorConfig::new())
        .with_sampler(Arc::new(StaticSampler::default()))
        .build()
        .unwrap();

    let first = cache.shutdown(Duration::from_secs(1)).await;
    assert!(first.drained);

    let started = Instant::now();
    let second = cache.shutdown(Duration::from_secs(1)).await;
    assert!(started.elapsed() < Duration::from_millis(50));
    assert_eq!(first, second);
    assert!(!cache.scheduler().is_accepting());
}

#[tokio::test]
async fn failed_refresh_never_reaches_the_reader() {
    let clock = Arc::new(ManualClock::new(0));
    let cache: CacheOrchestrator<String> = CacheOrchestrator::builder(quiet_config())
        .with_clock(clock.clone())
        .with_source(source_fn(|key: String| async move {
            Err::<String, _>(anyhow::anyhow!("upstream down for {}", key))
        }))
        .build()
        .unwrap();

    cache
        .put("k", "v".into(), Strategy::Strong, StrategyContext::new())
        .await
        .unwrap();
    clock.advance(Duration::from_secs(4));

    assert_eq!(cache.get("k").await.unwrap(), Some("v".to_string()));
    wait_until_idle(&cache).await;
    assert_eq!(cache.stats().refresh_failed, 1);

    // the next stale read retries
    assert!(matches!(
        cache.lookup("k").await.unwrap(),
        CacheLookup::Stale {
            refresh_enqueued: true,
            ..
        }
    ));
    wait_until_idle(&cache).await;
    assert_eq!(cache.stats().refresh_failed, 2);
    assert_eq!(cache.get("k").await.unwrap(), Some("v".to_string()));
}

#[tokio::test]
async fn adaptive_ttl_follows_observed_hit_rate() {
    let store = Arc::new(MemoryStore::new(64));
    let cache: CacheOrchestrator<String> = CacheOrchestrator::builder(quiet_config())
        .with_store(store.clone())
        .with_sampler(Arc::new(StaticSampler::default()))
        .build()
        .unwrap();

    cache
        .put("seed", "v".into(), Strategy::Weak, StrategyContext::new())
        .await
        .unwrap();
    for _ in 0..3 {
        cache.get("seed").await.unwrap();
    }
    cache.pressure_monitor().sample().await.unwrap();
    assert_eq!(cache.pressure_monitor().recent_hit_rate(), Some(1.0));

    cache
        .put("a", "v".into(), Strategy::Adaptive, StrategyContext::new())
        .await
        .unwrap();
    let entry = CacheEntry::<String>::decode(&store.get("a").await.unwrap().unwrap()).unwrap();
    assert_eq!(entry.ttl(), Duration::from_secs(198));

    // an explicit hit rate wins over the observed one
    cache
        .put(
            "b",
            "v".into(),
            Strategy::Adaptive,
            StrategyContext::new().with_hit_rate(0.0),
        )
        .await
        .unwrap();
    let entry = CacheEntry::<String>::decode(&store.get("b").await.unwrap().unwrap()).unwrap();
    assert_eq!(entry.ttl(), Duration::from_secs(162));
}

#[tokio::test]
async fn tiered_store_shares_entries_between_instances() {
    let shared: Arc<dyn BackingStore> = Arc::new(MemoryStore::new(256));
    let market = Arc::new(StaticMarketStatus::new(false));
    let make = |shared: Arc<dyn BackingStore>| -> CacheOrchestrator<u64> {
        CacheOrchestrator::builder(quiet_config())
            .with_store(Arc::new(TieredStore::new(
                Arc::new(MemoryStore::new(16)),
                shared,
            )))
            .with_market_status(market.clone())
            .build()
            .unwrap()
    };
    let writer = make(shared.clone());
    let reader = make(shared.clone());

    writer
        .put("AAPL", 101, Strategy::MarketAware, StrategyContext::new())
        .await
        .unwrap();
    assert_eq!(reader.get("AAPL").await.unwrap(), Some(101));

    assert!(writer.invalidate("AAPL").await.unwrap());
    assert_eq!(shared.get("AAPL").await.unwrap(), None);
}

#[tokio::test]
async fn promoted_copy_does_not_hide_newer_shared_write() {
    let clock = Arc::new(ManualClock::new(0));
    let shared: Arc<dyn BackingStore> = Arc::new(MemoryStore::new(256));
    let make = || -> CacheOrchestrator<u64> {
        CacheOrchestrator::builder(quiet_config())
            .with_store(Arc::new(TieredStore::new(
                Arc::new(MemoryStore::new(16)),
                shared.clone(),
            )))
            .with_clock(clock.clone())
            .build()
            .unwrap()
    };
    let writer = make();
    let reader = make();

    writer
        .put("x", 1, Strategy::Strong, StrategyContext::new())
        .await
        .unwrap();
    assert_eq!(reader.get("x").await.unwrap(), Some(1));

    // the reader's promoted copy is now expired, the writer's new value is fresh
    clock.advance(Duration::from_secs(6));
    writer
        .put("x", 2, Strategy::Strong, StrategyContext::new())
        .await
        .unwrap();
    assert_eq!(reader.lookup("x").await.unwrap(), CacheLookup::Fresh(2));

    // same when the local copy is only stale
    clock.advance(Duration::from_secs(4));
    writer
        .put("x", 3, Strategy::Strong, StrategyContext::new())
        .await
        .unwrap();
    assert_eq!(reader.lookup("x").await.unwrap(), CacheLookup::Fresh(3));
    assert_eq!(reader.stats().stale_hits, 0);
}
