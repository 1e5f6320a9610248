//! Durable cache backend on Redis.
//!
//! Catalogs are stored as JSON strings under their cache key with a
//! server-side TTL (`SETEX`), so expiry needs no sweeper. The connection
//! is a lazily initialized [`ConnectionManager`] that reconnects on its
//! own; callers clone it per operation.
//!
//! [`ConnectionManager`]: redis::aio::ConnectionManager

use redis::aio::ConnectionManager;
use redis::Client;
use tokio::sync::OnceCell;
use tracing::{trace, warn};

use crate::catalog::Catalog;
use crate::error::{FetchError, FetchResult};

/// Redis-backed catalog store.
#[derive(Clone)]
pub struct RedisBackend {
    client: Client,
    connection: OnceCell<ConnectionManager>,
}

impl RedisBackend {
    /// Build a backend from a `redis://`/`rediss://` connection URL. The
    /// URL is validated here; the network connection is made on first use.
    pub fn connect(url: &str) -> FetchResult<Self> {
        let client = Client::open(url)?;
        Ok(Self {
            client,
            connection: OnceCell::new(),
        })
    }

    async fn connection(&self) -> FetchResult<ConnectionManager> {
        trace!("acquiring redis connection manager");
        let manager = self
            .connection
            .get_or_try_init(|| {
                trace!("initializing redis connection manager");
                self.client.get_connection_manager()
            })
            .await?;
        Ok(manager.clone())
    }

    /// Round-trip a PING. Used once at startup to decide whether the
    /// durable tier participates at all.
    pub async fn ping(&self) -> FetchResult<()> {
        let mut con = self.connection().await?;
        redis::cmd("PING").query_async::<()>(&mut con).await?;
        Ok(())
    }

    /// Read one catalog. A stored value that no longer decodes is deleted
    /// and reported as a miss.
    pub async fn get(&self, key: &str) -> FetchResult<Option<Catalog>> {
        let mut con = self.connection().await?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut con)
            .await?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        match serde_json::from_str::<Catalog>(&raw) {
            Ok(catalog) => Ok(Some(catalog)),
            Err(e) => {
                warn!(key, error = %e, "dropping undecodable cache value");
                let _ = redis::cmd("DEL")
                    .arg(key)
                    .query_async::<i64>(&mut con)
                    .await;
                Ok(None)
            }
        }
    }

    /// Write one catalog with a server-side TTL.
    pub async fn put(&self, key: &str, catalog: &Catalog, ttl_secs: u64) -> FetchResult<()> {
        let payload = serde_json::to_string(catalog)
            .map_err(|e| FetchError::CacheUnavailable(format!("encode failed: {e}")))?;
        let mut con = self.connection().await?;
        redis::cmd("SETEX")
            .arg(key)
            .arg(ttl_secs)
            .arg(payload)
            .query_async::<()>(&mut con)
            .await?;
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> FetchResult<bool> {
        let mut con = self.connection().await?;
        let deleted: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut con)
            .await?;
        Ok(deleted > 0)
    }

    /// Delete every key matching the glob pattern. Uses cursored SCAN so
    /// large keyspaces are walked without blocking the server.
    pub async fn clear_pattern(&self, pattern: &str) -> FetchResult<usize> {
        let mut con = self.connection().await?;
        let mut cursor: u64 = 0;
        let mut removed = 0usize;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut con)
                .await?;
            if !keys.is_empty() {
                let mut del = redis::cmd("DEL");
                for key in &keys {
                    del.arg(key);
                }
                let deleted: i64 = del.query_async(&mut con).await?;
                removed += deleted as usize;
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(removed)
    }
}
