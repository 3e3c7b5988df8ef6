//! Backing store implementations.

use crate::Result;
use async_trait::async_trait;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Key-value store the orchestrator reads from and writes to.
///
/// Values are opaque bytes. `ttl` is a retention hint: a store may drop the value after
/// it, but must not serve it past it.
///
/// Implementations report their own failures as [`crate::Error::Store`], built with
/// [`crate::Error::store_with_context`].
#[async_trait]
pub trait BackingStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Read from the tier every instance writes to, skipping faster copies that may lag
    /// behind it. Single-tier stores read normally.
    async fn get_authoritative(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.get(key).await
    }

    /// Whether `get` may answer from a copy older than [`Self::get_authoritative`] would.
    fn is_layered(&self) -> bool {
        false
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<bool>;
    async fn clear(&self) -> Result<()>;
    async fn len(&self) -> Result<usize>;
    fn name(&self) -> &'static str;
}

struct StoredBytes {
    data: Vec<u8>,
    expires_at: Instant,
}

impl StoredBytes {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Bounded in-process store, least-recently-used eviction. Suitable as the fast local tier.
pub struct MemoryStore {
    entries: Arc<Mutex<LruCache<String, StoredBytes>>>,
}

impl MemoryStore {
    pub fn new(max_entries: usize) -> Self {
        let cap = NonZeroUsize::new(max_entries.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Arc::new(Mutex::new(LruCache::new(cap))),
        }
    }

    pub fn capacity(&self) -> usize {
        self.lock().cap().get()
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, StoredBytes>> {
        // The LRU stays structurally valid even if a holder panicked.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl BackingStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut entries = self.lock();
        let hit = match entries.get(key) {
            Some(stored) if !stored.is_expired() => Some(stored.data.clone()),
            Some(_) => None,
            None => return Ok(None),
        };
        if hit.is_none() {
            entries.pop(key);
        }
        Ok(hit)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let mut entries = self.lock();
        entries.put(
            key.to_string(),
            StoredBytes {
                data: value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.lock().pop(key).is_some())
    }

    async fn clear(&self) -> Result<()> {
        self.lock().clear();
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.lock().iter().filter(|(_, e)| !e.is_expired()).count())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Store that keeps nothing; every read is a miss.
pub struct NullStore;

impl NullStore {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NullStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackingStore for NullStore {
    async fn get(&self, _: &str) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
    async fn set(&self, _: &str, _: Vec<u8>, _: Duration) -> Result<()> {
        Ok(())
    }
    async fn delete(&self, _: &str) -> Result<bool> {
        Ok(false)
    }
    async fn clear(&self) -> Result<()> {
        Ok(())
    }
    async fn len(&self) -> Result<usize> {
        Ok(0)
    }
    fn name(&self) -> &'static str {
        "null"
    }
}
