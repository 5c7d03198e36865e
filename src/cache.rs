//! Response cache: avoids repeat paid analyses for identical transcripts.
//!
//! Pluggable backends behind one trait. Redis when configured, an in-process
//! TTL cache otherwise, and a no-op backend when caching is disabled. Cache
//! unavailability is a degraded-performance condition: the analyzer treats
//! every cache error as a miss and carries on.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::AsyncCommands;
use sha2::{Digest, Sha256};

use crate::config::CacheSettings;
use crate::error::{ParleyError, Result};
use crate::llm::analysis::ChatAnalysis;

const KEY_PREFIX: &str = "llm:cache:";

/// Deterministic cache key over (transcript content, analysis kind, model).
///
/// A model change invalidates the cache naturally since the key changes.
pub fn fingerprint(transcript: &str, kind: &str, model: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(transcript.as_bytes());
    hasher.update(b"\0");
    hasher.update(kind.as_bytes());
    hasher.update(b"\0");
    hasher.update(model.as_bytes());
    let digest = hasher.finalize();

    let mut hex = String::with_capacity(KEY_PREFIX.len() + 16);
    hex.push_str(KEY_PREFIX);
    // First 8 bytes are plenty of key space and keep keys short
    for byte in &digest[..8] {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

/// Pluggable cache backend.
#[async_trait]
pub trait ResponseCache: Send + Sync {
    /// Look up a cached analysis. `Ok(None)` is a miss.
    async fn get(&self, key: &str) -> Result<Option<ChatAnalysis>>;

    /// Store an analysis with a time-to-live.
    async fn set(&self, key: &str, value: &ChatAnalysis, ttl: Duration) -> Result<()>;
}

/// Backend used when caching is disabled: always miss, never store.
#[derive(Debug, Clone, Default)]
pub struct NoopCache;

#[async_trait]
impl ResponseCache for NoopCache {
    async fn get(&self, _key: &str) -> Result<Option<ChatAnalysis>> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: &ChatAnalysis, _ttl: Duration) -> Result<()> {
        Ok(())
    }
}

/// In-process TTL cache.
///
/// The TTL is fixed at construction; the per-call `ttl` argument is ignored
/// (the analyzer always passes the configured value anyway).
#[derive(Clone)]
pub struct MemoryCache {
    inner: moka::future::Cache<String, ChatAnalysis>,
}

impl MemoryCache {
    pub fn new(max_entries: u64, ttl: Duration) -> Self {
        Self {
            inner: moka::future::Cache::builder()
                .max_capacity(max_entries)
                .time_to_live(ttl)
                .build(),
        }
    }
}

#[async_trait]
impl ResponseCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<ChatAnalysis>> {
        Ok(self.inner.get(key).await)
    }

    async fn set(&self, key: &str, value: &ChatAnalysis, _ttl: Duration) -> Result<()> {
        self.inner.insert(key.to_string(), value.clone()).await;
        Ok(())
    }
}

/// Redis-backed cache for multi-process deployments.
#[derive(Clone)]
pub struct RedisCache {
    manager: ConnectionManager,
}

impl RedisCache {
    /// Connect to Redis. Fails fast; callers decide how to degrade.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| ParleyError::CacheUnavailable(format!("invalid redis URL: {e}")))?;

        let config = ConnectionManagerConfig::new()
            .set_connection_timeout(Duration::from_secs(5))
            .set_response_timeout(Duration::from_secs(5));

        let manager = ConnectionManager::new_with_config(client, config)
            .await
            .map_err(|e| ParleyError::CacheUnavailable(format!("redis connect failed: {e}")))?;

        Ok(Self { manager })
    }
}

#[async_trait]
impl ResponseCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<ChatAnalysis>> {
        let mut conn = self.manager.clone();
        let data: Option<String> = conn
            .get(key)
            .await
            .map_err(|e| ParleyError::CacheUnavailable(format!("redis GET failed: {e}")))?;

        match data {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &ChatAnalysis, ttl: Duration) -> Result<()> {
        let payload = serde_json::to_string(value)?;
        let mut conn = self.manager.clone();
        conn.set_ex::<_, _, ()>(key, payload, ttl.as_secs())
            .await
            .map_err(|e| ParleyError::CacheUnavailable(format!("redis SET failed: {e}")))?;
        Ok(())
    }
}

/// Select a cache backend from configuration.
///
/// Redis when a URL is configured; if the connection fails the batch still
/// runs, degraded to no caching. In-process cache otherwise; no-op when
/// caching is disabled.
pub async fn from_settings(settings: &CacheSettings) -> Arc<dyn ResponseCache> {
    if !settings.enabled {
        tracing::info!("response cache disabled");
        return Arc::new(NoopCache);
    }

    if let Some(url) = &settings.redis_url {
        match RedisCache::connect(url).await {
            Ok(cache) => {
                tracing::info!("response cache backed by redis");
                return Arc::new(cache);
            }
            Err(e) => {
                tracing::warn!(error = %e, "redis unavailable, running without cache");
                return Arc::new(NoopCache);
            }
        }
    }

    tracing::info!(
        max_entries = settings.max_entries,
        ttl_secs = settings.ttl_secs,
        "response cache backed by in-process store"
    );
    Arc::new(MemoryCache::new(
        settings.max_entries,
        Duration::from_secs(settings.ttl_secs),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::analysis::test_fixtures;
    use crate::llm::analysis::parse_axis;

    fn sample_analysis() -> ChatAnalysis {
        ChatAnalysis {
            cx: parse_axis(test_fixtures::CX_JSON).unwrap(),
            product: parse_axis(test_fixtures::PRODUCT_JSON).unwrap(),
            sales: parse_axis(test_fixtures::SALES_JSON).unwrap(),
            qa: parse_axis(test_fixtures::QA_JSON).unwrap(),
        }
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let a = fingerprint("transcript", "full", "model-a");
        let b = fingerprint("transcript", "full", "model-a");
        assert_eq!(a, b);
        assert!(a.starts_with(KEY_PREFIX));
    }

    #[test]
    fn test_fingerprint_varies_with_inputs() {
        let base = fingerprint("transcript", "full", "model-a");
        assert_ne!(base, fingerprint("other transcript", "full", "model-a"));
        assert_ne!(base, fingerprint("transcript", "cx", "model-a"));
        assert_ne!(base, fingerprint("transcript", "full", "model-b"));
    }

    #[tokio::test]
    async fn test_memory_cache_round_trip() {
        let cache = MemoryCache::new(100, Duration::from_secs(3600));
        let key = fingerprint("t", "full", "m");

        assert!(cache.get(&key).await.unwrap().is_none());

        cache
            .set(&key, &sample_analysis(), Duration::from_secs(3600))
            .await
            .unwrap();

        let hit = cache.get(&key).await.unwrap().unwrap();
        assert_eq!(hit.product.products_mentioned.len(), 2);
    }

    #[tokio::test]
    async fn test_noop_cache_never_hits() {
        let cache = NoopCache;
        let key = fingerprint("t", "full", "m");
        cache
            .set(&key, &sample_analysis(), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(cache.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_factory_disabled_selects_noop() {
        let settings = CacheSettings {
            enabled: false,
            ..CacheSettings::default()
        };
        let cache = from_settings(&settings).await;
        let key = fingerprint("t", "full", "m");
        cache
            .set(&key, &sample_analysis(), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(cache.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_factory_unreachable_redis_degrades_to_noop() {
        let settings = CacheSettings {
            enabled: true,
            redis_url: Some("redis://127.0.0.1:1/".to_string()),
            ..CacheSettings::default()
        };
        // Must not error; the batch runs without caching.
        let cache = from_settings(&settings).await;
        let key = fingerprint("t", "full", "m");
        assert!(cache.get(&key).await.unwrap().is_none());
    }
}
