//! Two-tier store: fast local tier in front of a slower shared tier.

use super::backend::BackingStore;
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Reads the local tier first and falls back to the shared tier, promoting shared hits
/// into the local tier. Writes and deletes go to both tiers.
///
/// A promoted copy can lag behind writes other instances make to the shared tier. The
/// orchestrator re-reads through [`BackingStore::get_authoritative`] whenever the local copy
/// is no longer fresh, and checks refresh commits against the shared tier only.
pub struct TieredStore {
    local: Arc<dyn BackingStore>,
    shared: Arc<dyn BackingStore>,
    promotion_ttl: Duration,
}

impl TieredStore {
    pub fn new(local: Arc<dyn BackingStore>, shared: Arc<dyn BackingStore>) -> Self {
        Self {
            local,
            shared,
            promotion_ttl: Duration::from_secs(60),
        }
    }

    /// Upper bound on how long a shared-tier hit is kept in the local tier.
    pub fn with_promotion_ttl(mut self, ttl: Duration) -> Self {
        self.promotion_ttl = ttl;
        self
    }

    pub fn local(&self) -> &Arc<dyn BackingStore> {
        &self.local
    }

    pub fn shared(&self) -> &Arc<dyn BackingStore> {
        &self.shared
    }

    fn shared_error(&self, op: &str, key: Option<&str>, err: Error) -> Error {
        let mut ctx = ErrorContext::new()
            .with_details(err.to_string())
            .with_source("tiered_store");
        if let Some(key) = key {
            ctx = ctx.with_field_path(key);
        }
        Error::store_with_context(
            format!("shared tier '{}' failed to {}", self.shared.name(), op),
            ctx,
        )
    }

    async fn read_shared(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.shared
            .get(key)
            .await
            .map_err(|e| self.shared_error("read", Some(key), e))
    }
}

#[async_trait]
impl BackingStore for TieredStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(hit) = self.local.get(key).await? {
            return Ok(Some(hit));
        }
        match self.read_shared(key).await? {
            Some(hit) => {
                debug!(key = %key, tier = self.shared.name(), "promoting shared-tier hit");
                self.local.set(key, hit.clone(), self.promotion_ttl).await?;
                Ok(Some(hit))
            }
            None => Ok(None),
        }
    }

    /// Reads the shared tier and replaces the local copy with what it finds there.
    async fn get_authoritative(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.read_shared(key).await? {
            Some(hit) => {
                self.local.set(key, hit.clone(), self.promotion_ttl).await?;
                Ok(Some(hit))
            }
            None => {
                self.local.delete(key).await?;
                Ok(None)
            }
        }
    }

    fn is_layered(&self) -> bool {
        true
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        self.local.set(key, value.clone(), ttl).await?;
        self.shared
            .set(key, value, ttl)
            .await
            .map_err(|e| self.shared_error("write", Some(key), e))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let local = self.local.delete(key).await?;
        let shared = self
            .shared
            .delete(key)
            .await
            .map_err(|e| self.shared_error("delete", Some(key), e))?;
        Ok(local || shared)
    }

    async fn clear(&self) -> Result<()> {
        self.local.clear().await?;
        self.shared
            .clear()
            .await
            .map_err(|e| self.shared_error("clear", None, e))
    }

    async fn len(&self) -> Result<usize> {
        self.shared
            .len()
            .await
            .map_err(|e| self.shared_error("count", None, e))
    }

    fn name(&self) -> &'static str {
        "tiered"
    }
}
