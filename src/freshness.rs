//! Freshness evaluation: FRESH, STALE or EXPIRED from an entry's metadata and the time.
//!
//! ```text
//! remaining = 1 - elapsed / ttl
//!
//!   remaining <= 0              EXPIRED  (not served; a miss)
//!   remaining <= refresh ratio  STALE    (served, refresh triggered)
//!   otherwise                   FRESH
//! ```
//!
//! A remaining fraction exactly equal to the refresh ratio counts as STALE.

use crate::store::CacheEntry;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    Fresh,
    Stale,
    Expired,
}

impl Freshness {
    /// Whether the value may be returned to a caller.
    pub fn is_servable(&self) -> bool {
        !matches!(self, Freshness::Expired)
    }

    pub fn needs_refresh(&self) -> bool {
        matches!(self, Freshness::Stale)
    }
}

/// Fraction of the TTL still remaining at `now_ms`; `1.0` right after the write, `<= 0.0`
/// once expired. A `now_ms` before the write (skew) counts as no time elapsed.
pub fn remaining_fraction(stored_at_ms: u64, ttl_ms: u64, now_ms: u64) -> f64 {
    if ttl_ms == 0 {
        return 0.0;
    }
    let elapsed = now_ms.saturating_sub(stored_at_ms) as f64;
    1.0 - elapsed / ttl_ms as f64
}

/// Classify raw metadata. Pure; safe to call from any thread.
pub fn classify_parts(stored_at_ms: u64, ttl_ms: u64, threshold_ratio: f64, now_ms: u64) -> Freshness {
    let remaining = remaining_fraction(stored_at_ms, ttl_ms, now_ms);
    if remaining <= 0.0 {
        Freshness::Expired
    } else if remaining <= threshold_ratio {
        Freshness::Stale
    } else {
        Freshness::Fresh
    }
}

pub fn classify<V>(entry: &CacheEntry<V>, now_ms: u64) -> Freshness {
    classify_parts(
        entry.stored_at_ms,
        entry.ttl_ms,
        entry.refresh_threshold_ratio,
        now_ms,
    )
}
