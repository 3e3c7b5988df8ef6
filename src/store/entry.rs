//! Stored cache entry with freshness metadata.

use crate::strategy::{Resolution, Strategy, StrategyContext};
use crate::Result;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;

/// A value plus the metadata the freshness evaluator needs.
///
/// `stored_at_ms`, `ttl_ms`, `strategy` and `refresh_threshold_ratio` are fixed when the
/// entry is written; a refresh writes a new entry rather than mutating this one.
///
/// `market_open` and `hit_rate` are the signals the writer passed explicitly. They travel
/// with the entry so its background refresh resolves against the same inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<V> {
    pub key: String,
    pub value: V,
    pub stored_at_ms: u64,
    pub ttl_ms: u64,
    pub strategy: Strategy,
    pub refresh_threshold_ratio: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_open: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hit_rate: Option<f64>,
}

impl<V> CacheEntry<V> {
    pub fn new(
        key: impl Into<String>,
        value: V,
        strategy: Strategy,
        resolution: Resolution,
        now_ms: u64,
    ) -> Self {
        Self {
            key: key.into(),
            value,
            stored_at_ms: now_ms,
            ttl_ms: (resolution.ttl.as_millis() as u64).max(1),
            strategy,
            refresh_threshold_ratio: resolution.refresh_threshold_ratio,
            market_open: None,
            hit_rate: None,
        }
    }

    /// Keep the caller-supplied signals of `ctx`.
    pub fn with_pinned_context(mut self, ctx: &StrategyContext) -> Self {
        self.market_open = ctx.market_open;
        self.hit_rate = ctx.hit_rate;
        self
    }

    /// Context a refresh of this entry starts from: the pinned signals, with the entry's own
    /// TTL as the previous one.
    pub fn pinned_context(&self) -> StrategyContext {
        StrategyContext {
            market_open: self.market_open,
            hit_rate: self.hit_rate,
            previous_ttl: Some(self.ttl()),
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn expires_at_ms(&self) -> u64 {
        self.stored_at_ms.saturating_add(self.ttl_ms)
    }

    /// Time since the write; zero if `now_ms` precedes it (clock skew between writers).
    pub fn age(&self, now_ms: u64) -> Duration {
        Duration::from_millis(now_ms.saturating_sub(self.stored_at_ms))
    }
}

impl<V: Serialize> CacheEntry<V> {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl<V: DeserializeOwned> CacheEntry<V> {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
