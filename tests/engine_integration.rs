//! End-to-end engine behavior through the public API:
//! cache lifecycle, request coalescing, strategy fallback, and
//! identity handling, all against scripted fetch sources.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use trellis::cache::CatalogCache;
use trellis::catalog::{Catalog, CatalogRequest, Product};
use trellis::config::{EngineSettings, RotatorSettings};
use trellis::error::{FetchError, FetchResult};
use trellis::fetch::CatalogFetcher;
use trellis::orchestrator::{FetchEngine, FetchState};
use trellis::rotation::{Identity, IdentityRotator};

// ── Scripted sources ──

enum SourceOutcome {
    Products(Vec<Product>),
    Failure(FetchError),
}

/// A fetch strategy with a fixed outcome, an optional artificial delay,
/// and a call counter.
struct ScriptedSource {
    label: &'static str,
    outcome: SourceOutcome,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedSource {
    fn ok(label: &'static str, products: Vec<Product>) -> Self {
        Self {
            label,
            outcome: SourceOutcome::Products(products),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    fn fail(label: &'static str, error: FetchError) -> Self {
        Self {
            label,
            outcome: SourceOutcome::Failure(error),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CatalogFetcher for ScriptedSource {
    fn name(&self) -> &'static str {
        self.label
    }

    async fn fetch(&self, request: &CatalogRequest, _identity: &Identity) -> FetchResult<Catalog> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.outcome {
            SourceOutcome::Products(products) => Ok(Catalog::new(
                request.target_url.clone(),
                self.label,
                products.clone(),
                HashMap::new(),
            )),
            SourceOutcome::Failure(error) => Err(error.clone()),
        }
    }
}

fn sample_products() -> Vec<Product> {
    let mut flower = Product::new("Blue Dream");
    flower.category = Some("flower".to_string());
    flower.regular_price = Some(45.0);
    vec![flower]
}

fn engine(
    api: Arc<ScriptedSource>,
    browser: Arc<ScriptedSource>,
    ttl: Duration,
) -> FetchEngine {
    let cache = CatalogCache::memory_only(64, ttl);
    let rotator = IdentityRotator::new(&RotatorSettings::default());
    let settings = EngineSettings {
        attempt_budget: 1,
        attempt_timeout: Duration::from_secs(5),
        backoff_base_ms: 1,
    };
    FetchEngine::new(cache, rotator, api, browser, &settings)
}

fn request(url: &str) -> CatalogRequest {
    CatalogRequest::new(url)
}

// ── Coalescing ──

#[tokio::test]
async fn test_concurrent_fetches_share_one_flight() {
    let api = Arc::new(
        ScriptedSource::ok("menu-api", sample_products())
            .with_delay(Duration::from_millis(100)),
    );
    let browser = Arc::new(ScriptedSource::fail(
        "browser",
        FetchError::UpstreamUnavailable("no browser in test".into()),
    ));
    let engine = engine(Arc::clone(&api), browser, Duration::from_secs(300));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .fetch(&request("dutchie.com/dispensary/green-leaf"))
                .await
        }));
    }

    let mut catalogs = Vec::new();
    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        catalogs.push(outcome.catalog);
    }

    // One upstream call serves all eight callers, and they all see the
    // same catalog allocation.
    assert_eq!(api.calls(), 1);
    for pair in catalogs.windows(2) {
        assert!(Arc::ptr_eq(&pair[0], &pair[1]));
    }
}

#[tokio::test]
async fn test_joined_caller_inherits_flight_trace() {
    let api = Arc::new(
        ScriptedSource::ok("menu-api", sample_products())
            .with_delay(Duration::from_millis(100)),
    );
    let browser = Arc::new(ScriptedSource::fail(
        "browser",
        FetchError::UpstreamUnavailable("no browser in test".into()),
    ));
    let engine = engine(Arc::clone(&api), browser, Duration::from_secs(300));

    let first = {
        let engine = engine.clone();
        tokio::spawn(
            async move { engine.fetch(&request("dutchie.com/dispensary/green-leaf")).await },
        )
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = engine
        .fetch(&request("dutchie.com/dispensary/green-leaf"))
        .await
        .unwrap();
    let first = first.await.unwrap().unwrap();

    assert_eq!(api.calls(), 1);

    // Whichever caller joined carries the shared flight's transitions in
    // its own trace, not just the join marker.
    let outcomes = [first, second];
    let joined: Vec<_> = outcomes
        .iter()
        .filter(|o| o.states.contains(&FetchState::JoinedFlight))
        .collect();
    assert_eq!(joined.len(), 1);
    let trace = &joined[0].states;
    assert!(trace.contains(&FetchState::StructuredAttempt(1)), "got: {trace:?}");
    assert!(trace.contains(&FetchState::Store), "got: {trace:?}");
    assert_eq!(trace.last(), Some(&FetchState::Done));
}

#[tokio::test]
async fn test_joined_callers_share_the_failure() {
    let api = Arc::new(
        ScriptedSource::fail(
            "menu-api",
            FetchError::UpstreamUnavailable("connection refused".into()),
        )
        .with_delay(Duration::from_millis(80)),
    );
    let browser = Arc::new(ScriptedSource::fail(
        "browser",
        FetchError::UpstreamUnavailable("tab crashed".into()),
    ));
    let engine = engine(Arc::clone(&api), Arc::clone(&browser), Duration::from_secs(300));

    let first = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.fetch(&request("dutchie.com/dispensary/down")).await })
    };
    let second = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.fetch(&request("dutchie.com/dispensary/down")).await })
    };

    let (first, second) = (first.await.unwrap(), second.await.unwrap());
    assert!(matches!(first, Err(FetchError::FetchFailed { .. })));
    assert!(matches!(second, Err(FetchError::FetchFailed { .. })));

    // Both callers rode one flight: one api attempt, one browser attempt.
    assert_eq!(api.calls() + browser.calls(), 2);
}

#[tokio::test]
async fn test_forced_refresh_skips_cache_and_flights() {
    let api = Arc::new(ScriptedSource::ok("menu-api", sample_products()));
    let browser = Arc::new(ScriptedSource::fail(
        "browser",
        FetchError::UpstreamUnavailable("no browser in test".into()),
    ));
    let engine = engine(Arc::clone(&api), browser, Duration::from_secs(300));

    engine
        .fetch(&request("dutchie.com/dispensary/green-leaf"))
        .await
        .unwrap();
    assert_eq!(api.calls(), 1);

    let mut forced = request("dutchie.com/dispensary/green-leaf");
    forced.force_refresh = true;
    let outcome = engine.fetch(&forced).await.unwrap();
    assert_eq!(api.calls(), 2);
    assert!(!outcome.cache_hit);

    // The forced result replaced the cached entry.
    let outcome = engine
        .fetch(&request("dutchie.com/dispensary/green-leaf"))
        .await
        .unwrap();
    assert!(outcome.cache_hit);
    assert_eq!(api.calls(), 2);
}

// ── Cache lifecycle ──

#[tokio::test]
async fn test_entries_expire_after_ttl() {
    let api = Arc::new(ScriptedSource::ok("menu-api", sample_products()));
    let browser = Arc::new(ScriptedSource::fail(
        "browser",
        FetchError::UpstreamUnavailable("no browser in test".into()),
    ));
    let engine = engine(
        Arc::clone(&api),
        browser,
        Duration::from_millis(50),
    );

    let target = request("dutchie.com/dispensary/green-leaf");
    engine.fetch(&target).await.unwrap();
    let outcome = engine.fetch(&target).await.unwrap();
    assert!(outcome.cache_hit);
    assert_eq!(api.calls(), 1);

    tokio::time::sleep(Duration::from_millis(80)).await;
    let outcome = engine.fetch(&target).await.unwrap();
    assert!(!outcome.cache_hit);
    assert_eq!(api.calls(), 2);
}

#[tokio::test]
async fn test_clear_pattern_forces_refetch() {
    let api = Arc::new(ScriptedSource::ok("menu-api", sample_products()));
    let browser = Arc::new(ScriptedSource::fail(
        "browser",
        FetchError::UpstreamUnavailable("no browser in test".into()),
    ));
    let engine = engine(Arc::clone(&api), browser, Duration::from_secs(300));

    engine
        .fetch(&request("dutchie.com/dispensary/green-leaf"))
        .await
        .unwrap();
    engine
        .fetch(&request("dutchie.com/dispensary/high-tide"))
        .await
        .unwrap();
    assert_eq!(api.calls(), 2);

    let cleared = engine.cache().clear("dispensary:*").await;
    assert_eq!(cleared, 2);

    let outcome = engine
        .fetch(&request("dutchie.com/dispensary/green-leaf"))
        .await
        .unwrap();
    assert!(!outcome.cache_hit);
    assert_eq!(api.calls(), 3);
}

// ── Strategy fallback ──

#[tokio::test]
async fn test_structured_failure_falls_back_to_automation() {
    let api = Arc::new(ScriptedSource::fail(
        "menu-api",
        FetchError::UpstreamUnavailable("connection refused".into()),
    ));
    let browser = Arc::new(ScriptedSource::ok("browser", sample_products()));
    let engine = engine(api, Arc::clone(&browser), Duration::from_secs(300));

    let outcome = engine
        .fetch(&request("dutchie.com/dispensary/green-leaf"))
        .await
        .unwrap();

    assert_eq!(outcome.catalog.source, "browser");
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
async fn test_blocked_identity_is_retired_from_pool() {
    let api = Arc::new(ScriptedSource::fail(
        "menu-api",
        FetchError::BlockedByTarget("access denied".into()),
    ));
    let browser = Arc::new(ScriptedSource::ok("browser", sample_products()));

    let cache = CatalogCache::memory_only(64, Duration::from_secs(300));
    let rotator = IdentityRotator::new(&RotatorSettings {
        proxies: vec![
            "http://proxy-1:8080".to_string(),
            "http://proxy-2:8080".to_string(),
            "http://proxy-3:8080".to_string(),
        ],
        user_agents: Vec::new(),
        retire_threshold: 1,
        min_healthy: 1,
    });
    let settings = EngineSettings {
        attempt_budget: 1,
        attempt_timeout: Duration::from_secs(5),
        backoff_base_ms: 1,
    };
    let engine = FetchEngine::new(cache, rotator, api, browser, &settings);

    engine
        .fetch(&request("dutchie.com/dispensary/green-leaf"))
        .await
        .unwrap();

    let retired: usize = engine
        .rotator()
        .identities()
        .iter()
        .filter(|identity| identity.is_retired())
        .count();
    assert_eq!(retired, 1);
}
