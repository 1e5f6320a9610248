//! Dual-backend catalog cache.
//!
//! The durable tier (Redis) is optional and guarded by a circuit breaker;
//! the in-memory tier always runs and absorbs every durable failure, so
//! cache trouble degrades service to slower fetches, never to errors.
//! Writes go to both tiers; reads prefer the durable tier and fall back
//! to memory on a miss, an error, or an open breaker.

pub mod breaker;
pub mod memory;
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::config::CacheSettings;
use crate::error::{FetchError, FetchResult};

pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use memory::MemoryCache;
pub use redis::RedisBackend;

/// Cache facade the engine talks to. Cheap to share behind an `Arc`.
pub struct CatalogCache {
    durable: Option<RedisBackend>,
    memory: MemoryCache,
    breaker: CircuitBreaker,
    ttl: Duration,
    /// Upper bound on any single durable operation, so a hung backend
    /// costs a bounded delay instead of a stalled request.
    op_timeout: Duration,
}

impl CatalogCache {
    /// Build the cache from settings. When the durable tier is enabled a
    /// startup PING decides whether it participates: an unreachable
    /// backend demotes the process to memory-only mode rather than
    /// failing startup.
    pub async fn new(settings: &CacheSettings) -> Self {
        let durable = if settings.use_redis {
            match Self::probe_redis(settings).await {
                Ok(backend) => {
                    info!(host = %settings.redis_host, port = settings.redis_port,
                        "durable cache connected");
                    Some(backend)
                }
                Err(e) => {
                    warn!(error = %e, "durable cache unreachable, running memory-only");
                    None
                }
            }
        } else {
            info!("durable cache disabled, running memory-only");
            None
        };

        Self {
            durable,
            memory: MemoryCache::new(settings.capacity),
            breaker: CircuitBreaker::new(settings.breaker.clone()),
            ttl: settings.ttl,
            op_timeout: settings.op_timeout,
        }
    }

    async fn probe_redis(settings: &CacheSettings) -> FetchResult<RedisBackend> {
        let backend = RedisBackend::connect(&settings.redis_url())?;
        tokio::time::timeout(settings.op_timeout, backend.ping())
            .await
            .map_err(|_| FetchError::CacheUnavailable("startup ping timed out".into()))??;
        Ok(backend)
    }

    /// Memory-only cache, mostly for embedding and tests.
    pub fn memory_only(capacity: usize, ttl: Duration) -> Self {
        Self {
            durable: None,
            memory: MemoryCache::new(capacity),
            breaker: CircuitBreaker::default(),
            ttl,
            op_timeout: Duration::from_secs(2),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Which tier currently serves as primary, for health reporting.
    pub fn backend_label(&self) -> &'static str {
        match &self.durable {
            Some(_) if matches!(self.breaker.state(), CircuitState::Closed) => "redis",
            Some(_) => "redis (degraded)",
            None => "memory",
        }
    }

    pub fn breaker_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Look up a catalog. Never returns an error: every durable failure
    /// is recorded on the breaker and downgraded to a memory lookup.
    pub async fn get(&self, key: &str) -> Option<Arc<Catalog>> {
        if let Some(backend) = self.admitted_backend() {
            match self.guarded(backend.get(key)).await {
                Ok(Some(catalog)) => {
                    debug!(key, "durable cache hit");
                    return Some(Arc::new(catalog));
                }
                Ok(None) => {
                    // Fall through: an entry written while the breaker was
                    // open may only exist in memory.
                }
                Err(e) => {
                    warn!(key, error = %e, "durable cache read failed");
                }
            }
        }
        self.memory.get(key)
    }

    /// Store a catalog in both tiers under the configured TTL. Write
    /// failures are non-fatal; the fetched data is still returned to the
    /// caller and the memory tier keeps a copy.
    pub async fn put(&self, key: &str, catalog: Arc<Catalog>) {
        self.put_with_ttl(key, catalog, self.ttl).await;
    }

    /// Store a catalog under an explicit TTL instead of the store default.
    pub async fn put_with_ttl(&self, key: &str, catalog: Arc<Catalog>, ttl: Duration) {
        self.memory.put(key, Arc::clone(&catalog), ttl);

        if let Some(backend) = self.admitted_backend() {
            let ttl_secs = ttl.as_secs().max(1);
            if let Err(e) = self.guarded(backend.put(key, &catalog, ttl_secs)).await {
                warn!(key, error = %e, "durable cache write failed");
            }
        }
    }

    /// Drop one key from both tiers. True if either tier held it.
    pub async fn delete(&self, key: &str) -> bool {
        let mut removed = self.memory.delete(key);

        if let Some(backend) = self.admitted_backend() {
            match self.guarded(backend.delete(key)).await {
                Ok(d) => removed |= d,
                Err(e) => warn!(key, error = %e, "durable cache delete failed"),
            }
        }
        removed
    }

    /// Clear entries matching a glob pattern from both tiers. Returns the
    /// larger per-tier count, since both tiers hold the same logical
    /// entries. Like the other operations this absorbs durable failures;
    /// the memory tier is always cleared.
    pub async fn clear(&self, pattern: &str) -> usize {
        let memory_removed = self.memory.clear_pattern(pattern);

        let mut durable_removed = 0;
        if let Some(backend) = self.admitted_backend() {
            match self.guarded(backend.clear_pattern(pattern)).await {
                Ok(n) => durable_removed = n,
                Err(e) => warn!(pattern, error = %e, "durable cache clear failed"),
            }
        }
        memory_removed.max(durable_removed)
    }

    /// The durable backend, if configured and admitted by the breaker.
    fn admitted_backend(&self) -> Option<&RedisBackend> {
        let backend = self.durable.as_ref()?;
        if self.breaker.try_acquire() {
            Some(backend)
        } else {
            debug!("circuit breaker open, skipping durable cache");
            None
        }
    }

    /// Run one durable operation under the op timeout and report the
    /// outcome to the breaker.
    async fn guarded<T>(
        &self,
        op: impl std::future::Future<Output = FetchResult<T>>,
    ) -> FetchResult<T> {
        let result = match tokio::time::timeout(self.op_timeout, op).await {
            Ok(r) => r,
            Err(_) => Err(FetchError::CacheUnavailable(format!(
                "operation timed out after {:?}",
                self.op_timeout
            ))),
        };
        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(_) => self.breaker.record_failure(),
        }
        result
    }
}
