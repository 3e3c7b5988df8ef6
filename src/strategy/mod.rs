//! Freshness strategies: classification of a cache entry into a TTL and a refresh ratio.
//!
//! # Strategy Table
//!
//! | Strategy | TTL | Ratio | Intended data |
//! |----------|-----|-------|---------------|
//! | [`Strategy::Strong`] | 5s | 0.3 | must never be more than a few seconds stale |
//! | [`Strategy::Weak`] | 300s | 0.2 | tolerates minutes of staleness |
//! | [`Strategy::MarketAware`] | 30s open / 1800s closed | 0.3 / 0.1 | prices, quotes |
//! | [`Strategy::Adaptive`] | 180s within [30s, 3600s] | 0.25 | follows the recent hit rate |
//!
//! Resolution is a pure function of the table and a [`StrategyContext`]; the table never
//! mutates after construction.
//!
//! ```rust
//! use smart_cache::strategy::{Strategy, StrategyConfigs, StrategyContext, StrategyTable};
//!
//! let table = StrategyTable::new(StrategyConfigs::default()).unwrap();
//! let closed = table.resolve(Strategy::MarketAware, &StrategyContext::new().with_market_open(false));
//! assert_eq!(closed.ttl.as_secs(), 1800);
//! ```

mod config;

pub use config::{AdaptiveConfig, FixedStrategyConfig, MarketAwareConfig, StrategyConfigs};

use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Freshness strategy of a cache entry. Chosen by the caller and immutable per entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Strong,
    Weak,
    MarketAware,
    Adaptive,
}

impl Strategy {
    pub const ALL: [Strategy; 4] = [
        Strategy::Strong,
        Strategy::Weak,
        Strategy::MarketAware,
        Strategy::Adaptive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Strong => "strong",
            Strategy::Weak => "weak",
            Strategy::MarketAware => "market_aware",
            Strategy::Adaptive => "adaptive",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "strong" => Ok(Strategy::Strong),
            "weak" => Ok(Strategy::Weak),
            "market_aware" => Ok(Strategy::MarketAware),
            "adaptive" => Ok(Strategy::Adaptive),
            _ => Err(Error::configuration_with_context(
                format!("unknown cache strategy '{}'", s),
                ErrorContext::new()
                    .with_details("expected one of: strong, weak, market_aware, adaptive")
                    .with_source("strategy_table"),
            )),
        }
    }
}

/// Signals consulted while resolving a strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StrategyContext {
    /// MARKET_AWARE: whether the market is currently open.
    pub market_open: Option<bool>,
    /// ADAPTIVE: recent hit rate in `[0, 1]`.
    pub hit_rate: Option<f64>,
    /// ADAPTIVE: TTL produced by the previous evaluation, the starting point of the nudge.
    pub previous_ttl: Option<Duration>,
}

impl StrategyContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_market_open(mut self, open: bool) -> Self {
        self.market_open = Some(open);
        self
    }

    pub fn with_hit_rate(mut self, hit_rate: f64) -> Self {
        self.hit_rate = Some(hit_rate);
        self
    }

    pub fn with_previous_ttl(mut self, ttl: Duration) -> Self {
        self.previous_ttl = Some(ttl);
        self
    }
}

/// Output of [`StrategyTable::resolve`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resolution {
    pub ttl: Duration,
    pub refresh_threshold_ratio: f64,
}

/// Validated, read-only strategy table.
#[derive(Debug, Clone)]
pub struct StrategyTable {
    configs: StrategyConfigs,
}

impl StrategyTable {
    /// Validates the table. Invalid bounds are a startup failure, never corrected.
    pub fn new(configs: StrategyConfigs) -> Result<Self> {
        configs.validate()?;
        Ok(Self { configs })
    }

    pub fn configs(&self) -> &StrategyConfigs {
        &self.configs
    }

    pub fn resolve(&self, strategy: Strategy, ctx: &StrategyContext) -> Resolution {
        match strategy {
            Strategy::Strong => fixed(&self.configs.strong),
            Strategy::Weak => fixed(&self.configs.weak),
            Strategy::MarketAware => {
                let cfg = &self.configs.market_aware;
                // Unknown market status resolves like an open market: the shorter TTL.
                if ctx.market_open.unwrap_or(true) {
                    Resolution {
                        ttl: Duration::from_secs(cfg.open_ttl_secs),
                        refresh_threshold_ratio: cfg.open_ratio,
                    }
                } else {
                    Resolution {
                        ttl: Duration::from_secs(cfg.closed_ttl_secs),
                        refresh_threshold_ratio: cfg.closed_ratio,
                    }
                }
            }
            Strategy::Adaptive => {
                let cfg = &self.configs.adaptive;
                Resolution {
                    ttl: adaptive_ttl(cfg, ctx.previous_ttl, ctx.hit_rate),
                    refresh_threshold_ratio: cfg.update_threshold_ratio,
                }
            }
        }
    }
}

fn fixed(cfg: &FixedStrategyConfig) -> Resolution {
    Resolution {
        ttl: Duration::from_secs(cfg.ttl_secs),
        refresh_threshold_ratio: cfg.update_threshold_ratio,
    }
}

/// One ADAPTIVE evaluation.
///
/// Starting from `previous` (or the base TTL), the TTL is scaled by
/// `1 + step * (2 * hit_rate - 1)`: a perfect hit rate lengthens it by `step`, a zero hit
/// rate shortens it by `step`, 0.5 leaves it alone. The result is clamped to `[min, max]`.
pub fn adaptive_ttl(cfg: &AdaptiveConfig, previous: Option<Duration>, hit_rate: Option<f64>) -> Duration {
    let min = Duration::from_secs(cfg.min_ttl_secs);
    let max = Duration::from_secs(cfg.max_ttl_secs);
    let start = previous
        .unwrap_or(Duration::from_secs(cfg.base_ttl_secs))
        .clamp(min, max);

    let Some(rate) = hit_rate.filter(|r| r.is_finite()) else {
        return start;
    };
    let rate = rate.clamp(0.0, 1.0);
    let factor = 1.0 + cfg.adjustment_step * (2.0 * rate - 1.0);
    let nudged = Duration::from_millis((start.as_millis() as f64 * factor).round() as u64);
    nudged.clamp(min, max)
}
