//! Egress identity rotation.
//!
//! An identity pairs a proxy endpoint (or direct egress) with a browser
//! user-agent string. The rotator hands identities out round-robin,
//! tracks consecutive failures per identity, retires identities that keep
//! failing or get blocked outright, and can reinstate the whole pool when
//! credentials are renewed.
//!
//! Identity state is atomic, so outcome reports for different identities
//! never contend on a shared lock.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::config::RotatorSettings;
use crate::error::{FetchError, FetchResult};

/// Fallback user agents, a spread of current desktop and mobile browsers.
pub const DEFAULT_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:123.0) Gecko/20100101 Firefox/123.0",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_3_1 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (iPad; CPU OS 17_3_1 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Mobile/15E148 Safari/604.1",
];

/// One egress identity. Never removed from the pool within a process
/// lifetime; retirement only excludes it from selection, keeping the
/// failure history visible for audit until the next pool refresh.
#[derive(Debug)]
pub struct Identity {
    /// Absent means direct egress without a proxy.
    pub proxy_endpoint: Option<String>,
    pub user_agent: String,
    consecutive_failures: AtomicU32,
    /// Unix seconds of retirement; 0 while active.
    retired_at: AtomicI64,
}

impl Identity {
    fn new(proxy_endpoint: Option<String>, user_agent: String) -> Self {
        Self {
            proxy_endpoint,
            user_agent,
            consecutive_failures: AtomicU32::new(0),
            retired_at: AtomicI64::new(0),
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn is_retired(&self) -> bool {
        self.retired_at.load(Ordering::Relaxed) != 0
    }

    pub fn retired_at(&self) -> Option<DateTime<Utc>> {
        let ts = self.retired_at.load(Ordering::Relaxed);
        if ts == 0 {
            None
        } else {
            DateTime::from_timestamp(ts, 0)
        }
    }

    /// Short label for logs.
    pub fn label(&self) -> &str {
        self.proxy_endpoint.as_deref().unwrap_or("direct")
    }

    fn retire_now(&self) {
        // Keep the first retirement timestamp if two reports race.
        let _ = self.retired_at.compare_exchange(
            0,
            Utc::now().timestamp(),
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }

    fn reinstate(&self) {
        self.retired_at.store(0, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }
}

/// Round-robin identity pool with failure-driven retirement.
pub struct IdentityRotator {
    pool: Vec<Arc<Identity>>,
    cursor: AtomicUsize,
    retire_threshold: u32,
    min_healthy: usize,
}

impl IdentityRotator {
    /// Build the pool. Each configured proxy becomes one identity with a
    /// user agent assigned round-robin from the user-agent list; with no
    /// proxies, every user agent becomes a direct-egress identity.
    pub fn new(settings: &RotatorSettings) -> Self {
        let user_agents: Vec<String> = if settings.user_agents.is_empty() {
            DEFAULT_USER_AGENTS.iter().map(|s| s.to_string()).collect()
        } else {
            settings.user_agents.clone()
        };

        let pool: Vec<Arc<Identity>> = if settings.proxies.is_empty() {
            user_agents
                .iter()
                .map(|ua| Arc::new(Identity::new(None, ua.clone())))
                .collect()
        } else {
            settings
                .proxies
                .iter()
                .enumerate()
                .map(|(i, proxy)| {
                    let ua = user_agents[i % user_agents.len()].clone();
                    Arc::new(Identity::new(Some(proxy.clone()), ua))
                })
                .collect()
        };

        info!(
            identities = pool.len(),
            proxied = !settings.proxies.is_empty(),
            "identity pool initialized"
        );

        Self {
            pool,
            cursor: AtomicUsize::new(0),
            retire_threshold: settings.retire_threshold.max(1),
            min_healthy: settings.min_healthy,
        }
    }

    /// Select the next qualified identity round-robin. Every probe
    /// consumes one cursor tick, so retired identities do not funnel
    /// extra traffic onto their neighbors and selection stays within the
    /// ceil(N/M)+1 fairness bound.
    pub fn acquire(&self) -> FetchResult<Arc<Identity>> {
        let len = self.pool.len();
        if len == 0 {
            return Err(FetchError::PoolExhausted);
        }
        for _ in 0..len {
            let slot = self.cursor.fetch_add(1, Ordering::Relaxed) % len;
            let identity = &self.pool[slot];
            if self.qualifies(identity) {
                return Ok(Arc::clone(identity));
            }
        }
        // Concurrent acquires can advance the cursor past qualified slots
        // mid-scan; sweep once before declaring exhaustion.
        self.pool
            .iter()
            .find(|i| self.qualifies(i))
            .cloned()
            .ok_or(FetchError::PoolExhausted)
    }

    /// Record the outcome of one attempt under this identity. Success
    /// clears the failure streak; reaching the retirement threshold
    /// retires the identity.
    pub fn report_outcome(&self, identity: &Identity, success: bool) {
        if success {
            identity.consecutive_failures.store(0, Ordering::Relaxed);
            return;
        }
        let failures = identity.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= self.retire_threshold && !identity.is_retired() {
            warn!(
                identity = identity.label(),
                failures, "identity reached failure threshold, retiring"
            );
            identity.retire_now();
        }
    }

    /// Retire immediately regardless of the failure count. Used when the
    /// target actively blocked this identity.
    pub fn retire(&self, identity: &Identity) {
        if !identity.is_retired() {
            warn!(identity = identity.label(), "retiring blocked identity");
            identity.retire_now();
        }
    }

    /// Reinstate every identity: clears retirement and failure streaks.
    /// Represents renewal of proxy/user-agent credentials.
    pub fn refresh_pool(&self) {
        for identity in &self.pool {
            identity.reinstate();
        }
        info!(identities = self.pool.len(), "identity pool refreshed");
    }

    /// Whether the pool has degraded enough that the caller should
    /// refresh it before retrying an acquire.
    pub fn needs_refresh(&self) -> bool {
        self.qualified_count() < self.min_healthy.max(1)
    }

    pub fn qualified_count(&self) -> usize {
        self.pool.iter().filter(|i| self.qualifies(i)).count()
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    /// Full pool, retired identities included, for health reporting.
    pub fn identities(&self) -> &[Arc<Identity>] {
        &self.pool
    }

    fn qualifies(&self, identity: &Identity) -> bool {
        !identity.is_retired() && identity.consecutive_failures() < self.retire_threshold
    }
}
