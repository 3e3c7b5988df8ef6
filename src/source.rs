//! Caller-supplied collaborators: the refresh source and the market-status provider.

use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

/// Repopulates a key. Invoked from the bounded worker pool for background refreshes and
/// synchronously by `get_or_load` on a miss.
///
/// Any timeout is the source's own business; the orchestrator imposes none.
#[async_trait]
pub trait RefreshSource<V>: Send + Sync {
    async fn fetch(&self, key: &str) -> anyhow::Result<V>;
}

/// Adapts an async closure `Fn(String) -> Future<Output = anyhow::Result<V>>`.
pub struct FnSource<F> {
    f: F,
}

pub fn source_fn<F>(f: F) -> FnSource<F> {
    FnSource { f }
}

#[async_trait]
impl<V, F, Fut> RefreshSource<V> for FnSource<F>
where
    V: Send + 'static,
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<V>> + Send,
{
    async fn fetch(&self, key: &str) -> anyhow::Result<V> {
        (self.f)(key.to_string()).await
    }
}

/// Answers "is the market open right now". Polled on every MARKET_AWARE resolution, so it
/// should be cheap.
pub trait MarketStatusProvider: Send + Sync {
    fn is_market_open(&self) -> bool;
}

impl<F> MarketStatusProvider for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_market_open(&self) -> bool {
        self()
    }
}

/// Market status flipped explicitly by the application (e.g. from an exchange calendar feed).
#[derive(Debug)]
pub struct StaticMarketStatus {
    open: AtomicBool,
}

impl StaticMarketStatus {
    pub fn new(open: bool) -> Self {
        Self {
            open: AtomicBool::new(open),
        }
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::Relaxed);
    }
}

impl MarketStatusProvider for StaticMarketStatus {
    fn is_market_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_fn_source_passes_key() {
        let source = source_fn(|key: String| async move {
            Ok::<_, anyhow::Error>(format!("value-of-{}", key))
        });
        assert_eq!(source.fetch("abc").await.unwrap(), "value-of-abc");
    }

    #[tokio::test]
    async fn test_fn_source_error() {
        let source = source_fn(|_key: String| async move {
            Err::<u32, anyhow::Error>(anyhow::anyhow!("upstream unavailable"))
        });
        let err = source.fetch("abc").await.unwrap_err();
        assert_eq!(err.to_string(), "upstream unavailable");
    }

    #[test]
    fn test_static_market_status() {
        let status = StaticMarketStatus::new(true);
        assert!(status.is_market_open());
        status.set_open(false);
        assert!(!status.is_market_open());
    }

    #[test]
    fn test_closure_market_status() {
        let provider: Arc<dyn MarketStatusProvider> = Arc::new(|| false);
        assert!(!provider.is_market_open());
    }
}
