//! Source fetch strategies.
//!
//! Two interchangeable strategies produce the same normalized [`Catalog`]:
//! a structured-API fetcher that talks to the storefront's GraphQL
//! endpoint directly, and a browser-automation fetcher that renders the
//! storefront and scrapes the result. The orchestrator is strategy
//! agnostic; it only sees this trait.

pub mod api;
pub mod browser;
pub mod driver;

use async_trait::async_trait;

use crate::catalog::{Catalog, CatalogRequest};
use crate::error::{FetchError, FetchResult};
use crate::rotation::Identity;

pub use api::MenuApiFetcher;
pub use browser::BrowserFetcher;
pub use driver::{BrowserDriver, BrowserSession, ChromiumDriver};

/// One fetch strategy. A single call is one attempt: retries, backoff and
/// strategy fallback belong to the orchestrator.
#[async_trait]
pub trait CatalogFetcher: Send + Sync {
    /// Strategy label used in logs and catalog metadata.
    fn name(&self) -> &'static str;

    /// Fetch the catalog once under the given egress identity.
    async fn fetch(&self, request: &CatalogRequest, identity: &Identity) -> FetchResult<Catalog>;

    /// How an expired attempt deadline is classified for this strategy.
    fn timeout_error(&self, elapsed_ms: u64) -> FetchError {
        FetchError::UpstreamUnavailable(format!("attempt timed out after {elapsed_ms}ms"))
    }
}
