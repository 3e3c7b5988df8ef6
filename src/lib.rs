//! # smart-cache
//!
//! Smart cache orchestrator: decides per entry how long a value stays fresh, refreshes
//! stale values in the background while still serving them, and throttles that background
//! work when the host is under memory or CPU pressure.
//!
//! ## Overview
//!
//! The orchestrator sits in front of any key-value store (a single in-process LRU, or a
//! fast local tier backed by a slower shared one). Callers `put` values with a freshness
//! [`Strategy`]; `get` classifies the stored entry as FRESH, STALE or EXPIRED and, for STALE
//! entries, returns the value immediately and hands a refresh to a bounded, deduplicating
//! worker pool (stale-while-revalidate).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use smart_cache::{source_fn, CacheOrchestrator, OrchestratorConfig, Strategy, StrategyContext};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> smart_cache::Result<()> {
//!     let cache: CacheOrchestrator<f64> = CacheOrchestrator::builder(OrchestratorConfig::default())
//!         .with_source(source_fn(|_symbol: String| async move {
//!             // fetch the latest quote for `symbol`
//!             Ok::<_, anyhow::Error>(101.25)
//!         }))
//!         .build()?;
//!
//!     cache.put("AAPL", 101.0, Strategy::MarketAware, StrategyContext::new()).await?;
//!     if let Some(price) = cache.get("AAPL").await? {
//!         println!("AAPL {}", price);
//!     }
//!
//!     cache.shutdown(Duration::from_secs(30)).await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`strategy`] | Strategy table: TTL and refresh ratio per strategy |
//! | [`freshness`] | FRESH / STALE / EXPIRED classification |
//! | [`scheduler`] | Bounded, deduplicating background refresh pool |
//! | [`pressure`] | Memory/CPU sampling and the throttle factor |
//! | [`orchestrator`] | The public facade |
//! | [`lifecycle`] | Graceful shutdown |
//! | [`store`] | Backing stores and the stored entry format |
//! | [`telemetry`] | Metrics sinks and runtime statistics |
//! | [`config`] | Configuration loading and validation |

pub mod clock;
pub mod config;
pub mod freshness;
pub mod lifecycle;
pub mod orchestrator;
pub mod pressure;
pub mod scheduler;
pub mod source;
pub mod store;
pub mod strategy;
pub mod telemetry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::OrchestratorConfig;
pub use freshness::Freshness;
pub use lifecycle::{LifecycleManager, LifecycleState, ShutdownReport};
pub use orchestrator::{CacheLookup, CacheOrchestrator, CacheOrchestratorBuilder, CacheValue};
pub use pressure::{PressureConfig, PressureMonitor, PressureSnapshot};
pub use scheduler::{BatchReport, RefreshScheduler, SchedulerConfig};
pub use source::{source_fn, MarketStatusProvider, RefreshSource};
pub use store::{BackingStore, CacheEntry, MemoryStore, TieredStore};
pub use strategy::{Strategy, StrategyContext, StrategyTable};
pub use telemetry::{CacheStats, MetricsSink};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
