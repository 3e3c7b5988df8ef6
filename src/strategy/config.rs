//! Per-strategy parameters.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Parameters for the fixed-TTL strategies (STRONG and WEAK).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FixedStrategyConfig {
    pub ttl_secs: u64,
    pub update_threshold_ratio: f64,
}

impl FixedStrategyConfig {
    pub fn new(ttl_secs: u64, update_threshold_ratio: f64) -> Self {
        Self {
            ttl_secs,
            update_threshold_ratio,
        }
    }

    pub fn strong() -> Self {
        Self::new(5, 0.3)
    }

    pub fn weak() -> Self {
        Self::new(300, 0.2)
    }

    fn validate(&self, path: &str) -> Result<()> {
        check_ttl(&format!("{}.ttl_secs", path), self.ttl_secs)?;
        check_ratio(
            &format!("{}.update_threshold_ratio", path),
            self.update_threshold_ratio,
        )
    }
}

/// Open/closed parameter pair selected by the market-open signal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MarketAwareConfig {
    pub open_ttl_secs: u64,
    pub closed_ttl_secs: u64,
    pub open_ratio: f64,
    pub closed_ratio: f64,
}

impl Default for MarketAwareConfig {
    fn default() -> Self {
        Self {
            open_ttl_secs: 30,
            closed_ttl_secs: 1800,
            open_ratio: 0.3,
            closed_ratio: 0.1,
        }
    }
}

impl MarketAwareConfig {
    pub fn with_open(mut self, ttl_secs: u64, ratio: f64) -> Self {
        self.open_ttl_secs = ttl_secs;
        self.open_ratio = ratio;
        self
    }

    pub fn with_closed(mut self, ttl_secs: u64, ratio: f64) -> Self {
        self.closed_ttl_secs = ttl_secs;
        self.closed_ratio = ratio;
        self
    }

    fn validate(&self, path: &str) -> Result<()> {
        check_ttl(&format!("{}.open_ttl_secs", path), self.open_ttl_secs)?;
        check_ttl(&format!("{}.closed_ttl_secs", path), self.closed_ttl_secs)?;
        check_ratio(&format!("{}.open_ratio", path), self.open_ratio)?;
        check_ratio(&format!("{}.closed_ratio", path), self.closed_ratio)
    }
}

/// Hit-rate driven TTL bounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdaptiveConfig {
    pub base_ttl_secs: u64,
    pub min_ttl_secs: u64,
    pub max_ttl_secs: u64,
    pub update_threshold_ratio: f64,
    /// Largest relative TTL change applied per evaluation (0.1 = ±10%).
    pub adjustment_step: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            base_ttl_secs: 180,
            min_ttl_secs: 30,
            max_ttl_secs: 3600,
            update_threshold_ratio: 0.25,
            adjustment_step: 0.1,
        }
    }
}

impl AdaptiveConfig {
    pub fn with_bounds(mut self, min_ttl_secs: u64, base_ttl_secs: u64, max_ttl_secs: u64) -> Self {
        self.min_ttl_secs = min_ttl_secs;
        self.base_ttl_secs = base_ttl_secs;
        self.max_ttl_secs = max_ttl_secs;
        self
    }

    pub fn with_adjustment_step(mut self, step: f64) -> Self {
        self.adjustment_step = step;
        self
    }

    fn validate(&self, path: &str) -> Result<()> {
        check_ttl(&format!("{}.min_ttl_secs", path), self.min_ttl_secs)?;
        if self.min_ttl_secs > self.max_ttl_secs {
            return Err(Error::invalid_config(
                &format!("{}.min_ttl_secs", path),
                format!(
                    "min ({}) must not exceed max ({})",
                    self.min_ttl_secs, self.max_ttl_secs
                ),
            ));
        }
        if self.base_ttl_secs < self.min_ttl_secs || self.base_ttl_secs > self.max_ttl_secs {
            return Err(Error::invalid_config(
                &format!("{}.base_ttl_secs", path),
                format!(
                    "base ({}) must lie within [{}, {}]",
                    self.base_ttl_secs, self.min_ttl_secs, self.max_ttl_secs
                ),
            ));
        }
        check_ratio(
            &format!("{}.update_threshold_ratio", path),
            self.update_threshold_ratio,
        )?;
        check_ratio(&format!("{}.adjustment_step", path), self.adjustment_step)
    }
}

/// The full strategy table. One section per [`super::Strategy`] variant; any other
/// section name is rejected when deserializing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StrategyConfigs {
    pub strong: FixedStrategyConfig,
    pub weak: FixedStrategyConfig,
    pub market_aware: MarketAwareConfig,
    pub adaptive: AdaptiveConfig,
}

impl Default for StrategyConfigs {
    fn default() -> Self {
        Self {
            strong: FixedStrategyConfig::strong(),
            weak: FixedStrategyConfig::weak(),
            market_aware: MarketAwareConfig::default(),
            adaptive: AdaptiveConfig::default(),
        }
    }
}

impl StrategyConfigs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_strong(mut self, cfg: FixedStrategyConfig) -> Self {
        self.strong = cfg;
        self
    }

    pub fn with_weak(mut self, cfg: FixedStrategyConfig) -> Self {
        self.weak = cfg;
        self
    }

    pub fn with_market_aware(mut self, cfg: MarketAwareConfig) -> Self {
        self.market_aware = cfg;
        self
    }

    pub fn with_adaptive(mut self, cfg: AdaptiveConfig) -> Self {
        self.adaptive = cfg;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.strong.validate("strategies.strong")?;
        self.weak.validate("strategies.weak")?;
        self.market_aware.validate("strategies.market_aware")?;
        self.adaptive.validate("strategies.adaptive")
    }
}

fn check_ttl(field: &str, ttl_secs: u64) -> Result<()> {
    if ttl_secs == 0 {
        return Err(Error::invalid_config(field, "TTL must be greater than zero"));
    }
    Ok(())
}

pub(crate) fn check_ratio(field: &str, ratio: f64) -> Result<()> {
    if !(ratio > 0.0 && ratio < 1.0) {
        return Err(Error::invalid_config(
            field,
            format!("ratio {} must lie strictly between 0 and 1", ratio),
        ));
    }
    Ok(())
}
