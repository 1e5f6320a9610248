//! Fetch orchestration.
//!
//! The engine ties the layers together: consult the cache, and on a miss
//! drive the structured-API strategy with retry and backoff, falling back
//! to browser automation, under identities handed out by the rotator.
//! Successful catalogs are written back to the cache before being
//! returned.
//!
//! Concurrent requests for the same cache key share one upstream fetch.
//! The shared fetch runs in a spawned task, so a caller that times out or
//! disconnects does not cancel it for the other waiters.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::cache::CatalogCache;
use crate::catalog::{Catalog, CatalogRequest};
use crate::config::EngineSettings;
use crate::error::{FetchError, FetchResult};
use crate::fetch::CatalogFetcher;
use crate::rotation::{Identity, IdentityRotator};

/// One step in the per-request state machine. Collected into a trace so
/// callers and tests can see exactly which path a request took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    CacheCheck,
    /// Joined another request's in-flight fetch instead of going
    /// upstream.
    JoinedFlight,
    /// Structured-API attempt, 1-based.
    StructuredAttempt(u32),
    /// Browser-automation attempt, 1-based.
    AutomationAttempt(u32),
    Store,
    Done,
    Failed,
}

/// Result of one orchestrated fetch.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub catalog: Arc<Catalog>,
    pub cache_hit: bool,
    /// Transition trace, `CacheCheck` first.
    pub states: Vec<FetchState>,
}

/// Message shared with every caller joined on one in-flight fetch: the
/// result plus the transition trace of the flight itself.
type FlightMsg = (Result<Arc<Catalog>, FetchError>, Vec<FetchState>);

/// The fetch-and-cache engine. Cheap to clone; all clones share the same
/// cache, rotator, and in-flight table.
#[derive(Clone)]
pub struct FetchEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    cache: CatalogCache,
    rotator: IdentityRotator,
    api: Arc<dyn CatalogFetcher>,
    browser: Arc<dyn CatalogFetcher>,
    attempt_budget: u32,
    attempt_timeout: Duration,
    backoff_base_ms: u64,
    flights: DashMap<String, broadcast::Sender<FlightMsg>>,
}

impl FetchEngine {
    pub fn new(
        cache: CatalogCache,
        rotator: IdentityRotator,
        api: Arc<dyn CatalogFetcher>,
        browser: Arc<dyn CatalogFetcher>,
        settings: &EngineSettings,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                cache,
                rotator,
                api,
                browser,
                attempt_budget: settings.attempt_budget.max(1),
                attempt_timeout: settings.attempt_timeout,
                backoff_base_ms: settings.backoff_base_ms,
                flights: DashMap::new(),
            }),
        }
    }

    pub fn cache(&self) -> &CatalogCache {
        &self.inner.cache
    }

    pub fn rotator(&self) -> &IdentityRotator {
        &self.inner.rotator
    }

    /// Fetch one catalog: cache first, then the strategy ladder.
    pub async fn fetch(&self, request: &CatalogRequest) -> FetchResult<FetchOutcome> {
        let request = request.normalized();
        let key = request.cache_key();
        let mut states = vec![FetchState::CacheCheck];

        if request.force_refresh {
            // Forced refresh skips the cache read and the in-flight
            // join, and never registers a joinable flight of its own.
            let mut flight_states = Vec::new();
            let catalog = self
                .inner
                .run_strategies(&request, &mut flight_states)
                .await?;
            self.inner.cache.put(&key, Arc::clone(&catalog)).await;
            flight_states.push(FetchState::Store);
            states.extend(flight_states);
            states.push(FetchState::Done);
            return Ok(FetchOutcome {
                catalog,
                cache_hit: false,
                states,
            });
        }

        loop {
            if let Some(catalog) = self.inner.cache.get(&key).await {
                debug!(key = %key, "cache hit");
                states.push(FetchState::Done);
                return Ok(FetchOutcome {
                    catalog,
                    cache_hit: true,
                    states,
                });
            }

            enum Role {
                Leader(broadcast::Sender<FlightMsg>),
                Joiner(broadcast::Receiver<FlightMsg>),
            }

            let role = match self.inner.flights.entry(key.clone()) {
                Entry::Occupied(existing) => Role::Joiner(existing.get().subscribe()),
                Entry::Vacant(vacant) => {
                    let (tx, _rx) = broadcast::channel(1);
                    vacant.insert(tx.clone());
                    Role::Leader(tx)
                }
            };

            match role {
                Role::Joiner(mut rx) => {
                    debug!(key = %key, "joining in-flight fetch");
                    match rx.recv().await {
                        Ok((Ok(catalog), flight_states)) => {
                            states.push(FetchState::JoinedFlight);
                            // The flight's own transitions ride along in
                            // the broadcast, so a joiner's trace shows
                            // what the shared fetch actually did.
                            states.extend(flight_states);
                            states.push(FetchState::Done);
                            return Ok(FetchOutcome {
                                catalog,
                                cache_hit: false,
                                states,
                            });
                        }
                        Ok((Err(e), _flight_states)) => return Err(e),
                        // The flight completed between our map lookup and
                        // the subscribe. Its result, if any, is in the
                        // cache now; start over from the cache check.
                        Err(_) => continue,
                    }
                }
                Role::Leader(tx) => {
                    let mut rx = tx.subscribe();
                    let inner = Arc::clone(&self.inner);
                    let flight_key = key.clone();
                    let flight_request = request.clone();
                    tokio::spawn(async move {
                        let mut flight_states = Vec::new();
                        let result = match inner
                            .run_strategies(&flight_request, &mut flight_states)
                            .await
                        {
                            Ok(catalog) => {
                                inner.cache.put(&flight_key, Arc::clone(&catalog)).await;
                                flight_states.push(FetchState::Store);
                                Ok(catalog)
                            }
                            Err(e) => Err(e),
                        };
                        // Deregister before broadcasting so a caller that
                        // misses the message finds the cached value, or
                        // no flight, never a spent sender.
                        inner.flights.remove(&flight_key);
                        let _ = tx.send((result, flight_states));
                    });

                    return match rx.recv().await {
                        Ok((Ok(catalog), flight_states)) => {
                            states.extend(flight_states);
                            states.push(FetchState::Done);
                            Ok(FetchOutcome {
                                catalog,
                                cache_hit: false,
                                states,
                            })
                        }
                        Ok((Err(e), _flight_states)) => Err(e),
                        Err(_) => Err(FetchError::UpstreamUnavailable(
                            "fetch task aborted before completion".into(),
                        )),
                    };
                }
            }
        }
    }
}

enum StrategyKind {
    Structured,
    Automation,
}

impl StrategyKind {
    fn state(&self, attempt: u32) -> FetchState {
        match self {
            StrategyKind::Structured => FetchState::StructuredAttempt(attempt),
            StrategyKind::Automation => FetchState::AutomationAttempt(attempt),
        }
    }
}

impl EngineInner {
    /// The strategy ladder: structured API first, browser automation on
    /// exhaustion. Pool exhaustion short-circuits; both strategies draw
    /// from the same pool, so the fallback cannot do better.
    async fn run_strategies(
        &self,
        request: &CatalogRequest,
        states: &mut Vec<FetchState>,
    ) -> FetchResult<Arc<Catalog>> {
        let api_err = match self
            .run_strategy(&*self.api, StrategyKind::Structured, request, states)
            .await
        {
            Ok(catalog) => return Ok(catalog),
            Err(FetchError::PoolExhausted) => return Err(FetchError::PoolExhausted),
            Err(e) => e,
        };
        info!(
            url = %request.target_url,
            error = %api_err,
            "structured strategy exhausted, falling back to automation"
        );

        let automation_err = match self
            .run_strategy(&*self.browser, StrategyKind::Automation, request, states)
            .await
        {
            Ok(catalog) => return Ok(catalog),
            Err(FetchError::PoolExhausted) => return Err(FetchError::PoolExhausted),
            Err(e) => e,
        };

        states.push(FetchState::Failed);
        warn!(
            url = %request.target_url,
            api = %api_err,
            automation = %automation_err,
            states = ?states,
            "both fetch strategies exhausted"
        );
        Err(FetchError::FetchFailed {
            api: api_err.to_string(),
            automation: automation_err.to_string(),
        })
    }

    /// Run one strategy up to the attempt budget. The whole budget runs
    /// under one identity unless the target blocks it, in which case the
    /// blocked identity is retired and the next attempt draws a fresh
    /// one.
    async fn run_strategy(
        &self,
        fetcher: &dyn CatalogFetcher,
        kind: StrategyKind,
        request: &CatalogRequest,
        states: &mut Vec<FetchState>,
    ) -> FetchResult<Arc<Catalog>> {
        let mut identity = self.acquire_identity()?;
        let mut last_err: Option<FetchError> = None;

        for attempt in 1..=self.attempt_budget {
            if attempt > 1 {
                self.backoff(attempt).await;
            }
            states.push(kind.state(attempt));

            match self.attempt(fetcher, request, &identity).await {
                Ok(catalog) => {
                    self.rotator.report_outcome(&identity, true);
                    debug!(
                        strategy = fetcher.name(),
                        attempt,
                        products = catalog.total_products,
                        "fetch attempt succeeded"
                    );
                    return Ok(Arc::new(catalog));
                }
                Err(e) => {
                    self.rotator.report_outcome(&identity, false);
                    warn!(
                        strategy = fetcher.name(),
                        attempt,
                        identity = identity.label(),
                        error = %e,
                        "fetch attempt failed"
                    );
                    let blocked = matches!(e, FetchError::BlockedByTarget(_));
                    if blocked {
                        self.rotator.retire(&identity);
                    }
                    let retryable = e.is_retryable();
                    last_err = Some(e);
                    if !retryable {
                        break;
                    }
                    if blocked {
                        identity = match self.acquire_identity() {
                            Ok(fresh) => fresh,
                            Err(e) => {
                                last_err = Some(e);
                                break;
                            }
                        };
                    }
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| FetchError::UpstreamUnavailable("no attempts were made".into())))
    }

    async fn attempt(
        &self,
        fetcher: &dyn CatalogFetcher,
        request: &CatalogRequest,
        identity: &Identity,
    ) -> FetchResult<Catalog> {
        let timeout_ms = self.attempt_timeout.as_millis() as u64;
        match tokio::time::timeout(self.attempt_timeout, fetcher.fetch(request, identity)).await {
            Ok(result) => result,
            Err(_) => Err(fetcher.timeout_error(timeout_ms)),
        }
    }

    /// Acquire an identity, refreshing the pool once if it has degraded
    /// below the configured minimum.
    fn acquire_identity(&self) -> FetchResult<Arc<Identity>> {
        match self.rotator.acquire() {
            Ok(identity) => Ok(identity),
            Err(e) => {
                if self.rotator.needs_refresh() {
                    info!("identity pool degraded below minimum, refreshing");
                    self.rotator.refresh_pool();
                    self.rotator.acquire()
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Exponential backoff with jitter before retry attempts.
    async fn backoff(&self, attempt: u32) {
        let exp = self
            .backoff_base_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(2)));
        let jitter = rand::thread_rng().gen_range(0..=self.backoff_base_ms.max(2) / 2);
        tokio::time::sleep(Duration::from_millis(exp + jitter)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Product;
    use crate::config::RotatorSettings;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn sample_catalog(url: &str, label: &str) -> Catalog {
        Catalog::new(
            url,
            "stub",
            vec![Product::new(label)],
            HashMap::new(),
        )
    }

    struct StubFetcher {
        name: &'static str,
        script: Mutex<VecDeque<FetchResult<Catalog>>>,
        calls: AtomicUsize,
        identities_seen: Mutex<Vec<String>>,
        delay: Duration,
    }

    impl StubFetcher {
        fn new(name: &'static str, script: Vec<FetchResult<Catalog>>) -> Arc<Self> {
            Arc::new(Self {
                name,
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
                identities_seen: Mutex::new(Vec::new()),
                delay: Duration::ZERO,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn identities_seen(&self) -> Vec<String> {
            self.identities_seen.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl CatalogFetcher for StubFetcher {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn fetch(
            &self,
            request: &CatalogRequest,
            identity: &Identity,
        ) -> FetchResult<Catalog> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.identities_seen
                .lock()
                .unwrap()
                .push(identity.label().to_string());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(sample_catalog(&request.target_url, "default")))
        }
    }

    fn engine_with(
        api: Arc<StubFetcher>,
        browser: Arc<StubFetcher>,
        proxies: &[&str],
    ) -> FetchEngine {
        let cache = CatalogCache::memory_only(64, Duration::from_secs(300));
        let rotator = IdentityRotator::new(&RotatorSettings {
            proxies: proxies.iter().map(|s| s.to_string()).collect(),
            user_agents: Vec::new(),
            retire_threshold: 3,
            min_healthy: 1,
        });
        let settings = EngineSettings {
            attempt_budget: 2,
            attempt_timeout: Duration::from_secs(5),
            backoff_base_ms: 1,
        };
        FetchEngine::new(cache, rotator, api, browser, &settings)
    }

    fn unavailable() -> FetchResult<Catalog> {
        Err(FetchError::UpstreamUnavailable("connection refused".into()))
    }

    #[tokio::test]
    async fn test_cache_hit_is_terminal() {
        let api = StubFetcher::new("menu-api", vec![]);
        let browser = StubFetcher::new("browser", vec![]);
        let engine = engine_with(Arc::clone(&api), Arc::clone(&browser), &[]);

        let request = CatalogRequest::new("dutchie.com/dispensary/example");
        let key = request.cache_key();
        let cached = Arc::new(sample_catalog("https://dutchie.com/dispensary/example", "seeded"));
        engine.cache().put(&key, Arc::clone(&cached)).await;

        let outcome = engine.fetch(&request).await.unwrap();
        assert!(outcome.cache_hit);
        assert!(Arc::ptr_eq(&outcome.catalog, &cached));
        assert_eq!(outcome.states, vec![FetchState::CacheCheck, FetchState::Done]);
        assert_eq!(api.calls(), 0);
        assert_eq!(browser.calls(), 0);
    }

    #[tokio::test]
    async fn test_cold_fetch_uses_structured_strategy_once() {
        let api = StubFetcher::new("menu-api", vec![]);
        let browser = StubFetcher::new("browser", vec![]);
        let engine = engine_with(Arc::clone(&api), Arc::clone(&browser), &[]);

        let request = CatalogRequest::new("dutchie.com/dispensary/example");
        let outcome = engine.fetch(&request).await.unwrap();

        assert!(!outcome.cache_hit);
        assert_eq!(api.calls(), 1);
        assert_eq!(browser.calls(), 0);
        assert_eq!(
            outcome.states,
            vec![
                FetchState::CacheCheck,
                FetchState::StructuredAttempt(1),
                FetchState::Store,
                FetchState::Done,
            ]
        );
        // The result is now cached under the derived key.
        assert!(engine.cache().get(&request.cache_key()).await.is_some());
    }

    #[tokio::test]
    async fn test_fallback_records_outcomes_per_identity() {
        let api = StubFetcher::new("menu-api", vec![unavailable(), unavailable()]);
        let browser = StubFetcher::new("browser", vec![]);
        let engine = engine_with(
            Arc::clone(&api),
            Arc::clone(&browser),
            &["http://p1:1", "http://p2:1", "http://p3:1"],
        );

        let request = CatalogRequest::new("dutchie.com/dispensary/example");
        let outcome = engine.fetch(&request).await.unwrap();

        assert_eq!(api.calls(), 2);
        assert_eq!(browser.calls(), 1);
        assert_eq!(
            outcome.states,
            vec![
                FetchState::CacheCheck,
                FetchState::StructuredAttempt(1),
                FetchState::StructuredAttempt(2),
                FetchState::AutomationAttempt(1),
                FetchState::Store,
                FetchState::Done,
            ]
        );

        // Both structured attempts ran under one identity, which now
        // carries the failure streak; the automation identity is clean.
        let identities = engine.rotator().identities();
        assert_eq!(identities[0].consecutive_failures(), 2);
        assert_eq!(identities[1].consecutive_failures(), 0);
        let api_ids = api.identities_seen();
        assert_eq!(api_ids[0], api_ids[1]);
        assert_ne!(api_ids[0], browser.identities_seen()[0]);
    }

    #[tokio::test]
    async fn test_rejection_aborts_structured_budget() {
        let api = StubFetcher::new(
            "menu-api",
            vec![Err(FetchError::UpstreamRejected("bad schema".into()))],
        );
        let browser = StubFetcher::new("browser", vec![]);
        let engine = engine_with(Arc::clone(&api), Arc::clone(&browser), &[]);

        let request = CatalogRequest::new("dutchie.com/dispensary/example");
        let outcome = engine.fetch(&request).await.unwrap();

        // Rejection is not retryable: one api call, then straight to the
        // browser.
        assert_eq!(api.calls(), 1);
        assert_eq!(browser.calls(), 1);
        assert_eq!(
            outcome.states,
            vec![
                FetchState::CacheCheck,
                FetchState::StructuredAttempt(1),
                FetchState::AutomationAttempt(1),
                FetchState::Store,
                FetchState::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_block_retires_identity_and_retries_under_fresh_one() {
        let api = StubFetcher::new(
            "menu-api",
            vec![Err(FetchError::BlockedByTarget("interstitial".into()))],
        );
        let browser = StubFetcher::new("browser", vec![]);
        let engine = engine_with(
            Arc::clone(&api),
            Arc::clone(&browser),
            &["http://p1:1", "http://p2:1"],
        );

        let request = CatalogRequest::new("dutchie.com/dispensary/example");
        let outcome = engine.fetch(&request).await.unwrap();
        assert!(!outcome.cache_hit);

        let api_ids = api.identities_seen();
        assert_eq!(api_ids.len(), 2);
        assert_ne!(api_ids[0], api_ids[1]);
        assert!(engine.rotator().identities()[0].is_retired());
    }

    #[tokio::test]
    async fn test_both_strategies_exhausted_surfaces_fetch_failed() {
        let api = StubFetcher::new("menu-api", vec![unavailable(), unavailable()]);
        let browser = StubFetcher::new(
            "browser",
            vec![
                Err(FetchError::RenderTimeout(100)),
                Err(FetchError::Driver("tab crashed".into())),
            ],
        );
        let engine = engine_with(Arc::clone(&api), Arc::clone(&browser), &[]);

        let request = CatalogRequest::new("dutchie.com/dispensary/example");
        let err = engine.fetch(&request).await.unwrap_err();
        match err {
            FetchError::FetchFailed { api, automation } => {
                assert!(api.contains("connection refused"));
                assert!(automation.contains("tab crashed"));
            }
            other => panic!("expected FetchFailed, got {other:?}"),
        }
        // Nothing was cached.
        assert!(engine.cache().get(&request.cache_key()).await.is_none());
    }

    #[tokio::test]
    async fn test_exhausted_ladder_ends_trace_with_failed() {
        let api = StubFetcher::new("menu-api", vec![unavailable(), unavailable()]);
        let browser = StubFetcher::new("browser", vec![unavailable(), unavailable()]);
        let engine = engine_with(Arc::clone(&api), Arc::clone(&browser), &[]);

        let request = CatalogRequest::new("dutchie.com/dispensary/example");
        let mut states = Vec::new();
        let err = engine
            .inner
            .run_strategies(&request, &mut states)
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::FetchFailed { .. }));
        assert_eq!(
            states,
            vec![
                FetchState::StructuredAttempt(1),
                FetchState::StructuredAttempt(2),
                FetchState::AutomationAttempt(1),
                FetchState::AutomationAttempt(2),
                FetchState::Failed,
            ]
        );
    }

    #[tokio::test]
    async fn test_forced_refresh_bypasses_cached_entry() {
        let api = StubFetcher::new("menu-api", vec![]);
        let browser = StubFetcher::new("browser", vec![]);
        let engine = engine_with(Arc::clone(&api), Arc::clone(&browser), &[]);

        let mut request = CatalogRequest::new("dutchie.com/dispensary/example");
        let key = request.cache_key();
        let stale = Arc::new(sample_catalog("https://dutchie.com/dispensary/example", "stale"));
        engine.cache().put(&key, stale).await;

        request.force_refresh = true;
        let outcome = engine.fetch(&request).await.unwrap();

        assert!(!outcome.cache_hit);
        assert_eq!(api.calls(), 1);
        assert_eq!(outcome.catalog.products[0].name, "default");
        // The stored entry was replaced.
        let now_cached = engine.cache().get(&key).await.unwrap();
        assert_eq!(now_cached.products[0].name, "default");
    }

    #[tokio::test]
    async fn test_attempt_timeout_maps_through_strategy() {
        let api = Arc::new(StubFetcher {
            name: "menu-api",
            script: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            identities_seen: Mutex::new(Vec::new()),
            delay: Duration::from_millis(250),
        });
        let browser = StubFetcher::new("browser", vec![unavailable(), unavailable()]);

        let cache = CatalogCache::memory_only(8, Duration::from_secs(60));
        let rotator = IdentityRotator::new(&RotatorSettings::default());
        let settings = EngineSettings {
            attempt_budget: 1,
            attempt_timeout: Duration::from_millis(20),
            backoff_base_ms: 1,
        };
        let engine = FetchEngine::new(cache, rotator, Arc::clone(&api) as _, browser, &settings);

        let request = CatalogRequest::new("dutchie.com/dispensary/example");
        let err = engine.fetch(&request).await.unwrap_err();
        match err {
            FetchError::FetchFailed { api: api_msg, .. } => {
                assert!(api_msg.contains("timed out"), "got: {api_msg}");
            }
            other => panic!("expected FetchFailed, got {other:?}"),
        }
    }
}
