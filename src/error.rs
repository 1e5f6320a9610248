//! Error taxonomy for the fetch-and-cache engine.
//!
//! Transient failures are absorbed by the layer that can act on them
//! (cache fallback, identity rotation, retry budgets); only exhaustion of
//! every fallback path surfaces to the caller. Surfaced errors map onto
//! the standardized JSON envelope rendered by the REST layer.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// Result alias for engine operations.
pub type FetchResult<T> = std::result::Result<T, FetchError>;

/// All errors that can surface from the engine. `Clone` so a shared
/// in-flight fetch can hand the same failure to every joined caller.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// The durable cache backend failed. Recovered locally by the memory
    /// fallback; never reaches a caller.
    #[error("cache backend unavailable: {0}")]
    CacheUnavailable(String),

    /// No identity in the pool qualifies for selection.
    #[error("identity pool exhausted: no healthy proxy/user-agent pairing available")]
    PoolExhausted,

    /// The upstream structured endpoint rejected the request outright
    /// (authentication or schema error). Not retryable on this strategy.
    #[error("upstream rejected request: {0}")]
    UpstreamRejected(String),

    /// The upstream structured endpoint could not be reached or answered
    /// with a server error. Retryable within the attempt budget.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The browser session did not finish rendering within the attempt
    /// timeout. Retryable within the attempt budget.
    #[error("render timed out after {0}ms")]
    RenderTimeout(u64),

    /// The storefront detected the automated session and served a block
    /// page. The identity in use is retired; the retry runs under a
    /// fresh one.
    #[error("blocked by target: {0}")]
    BlockedByTarget(String),

    /// Browser/session plumbing failure (launch, page creation, script
    /// evaluation). Treated like an unavailable upstream.
    #[error("browser driver error: {0}")]
    Driver(String),

    /// Terminal failure: both strategies exhausted their budgets. Carries
    /// the last error from each for diagnostics.
    #[error("all fetch strategies failed; api: {api}; automation: {automation}")]
    FetchFailed { api: String, automation: String },
}

impl FetchError {
    /// HTTP status code the REST layer renders for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            FetchError::PoolExhausted => 503,
            FetchError::RenderTimeout(_) => 504,
            FetchError::UpstreamRejected(_)
            | FetchError::UpstreamUnavailable(_)
            | FetchError::BlockedByTarget(_)
            | FetchError::Driver(_)
            | FetchError::FetchFailed { .. } => 502,
            FetchError::CacheUnavailable(_) => 500,
        }
    }

    /// Whether another attempt of the same strategy may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::UpstreamUnavailable(_)
                | FetchError::RenderTimeout(_)
                | FetchError::BlockedByTarget(_)
                | FetchError::Driver(_)
        )
    }

    /// Build the standardized error envelope for REST rendering.
    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            status: "error",
            code: self.status_code(),
            message: self.to_string(),
            timestamp: Utc::now(),
        }
    }
}

impl From<redis::RedisError> for FetchError {
    fn from(e: redis::RedisError) -> Self {
        FetchError::CacheUnavailable(e.to_string())
    }
}

/// Standardized failure envelope:
/// `{"status":"error","code":502,"message":"...","timestamp":"..."}`.
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub status: &'static str,
    pub code: u16,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}
