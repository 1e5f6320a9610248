//! Configuration loading and resolution.
//!
//! Every knob is env-var backed with a default, so the binary runs with
//! zero configuration: memory-only cache, direct egress, public menu
//! API endpoint.

use std::time::Duration;

use crate::cache::BreakerConfig;

/// Default GraphQL endpoint for the structured-API strategy.
pub const DEFAULT_GRAPHQL_URL: &str = "https://dutchie.com/graphql";

/// Cache tier settings.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Enable the durable Redis tier. The memory tier always runs.
    pub use_redis: bool,
    pub redis_host: String,
    pub redis_port: u16,
    pub redis_password: Option<String>,
    pub redis_ssl: bool,
    /// Entry cap for the memory tier.
    pub capacity: usize,
    pub ttl: Duration,
    /// Deadline for a single durable-tier operation.
    pub op_timeout: Duration,
    pub breaker: BreakerConfig,
}

impl CacheSettings {
    /// Connection URL for the durable tier.
    pub fn redis_url(&self) -> String {
        let scheme = if self.redis_ssl { "rediss" } else { "redis" };
        match &self.redis_password {
            Some(password) => format!(
                "{scheme}://:{password}@{}:{}/",
                self.redis_host, self.redis_port
            ),
            None => format!("{scheme}://{}:{}/", self.redis_host, self.redis_port),
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            use_redis: false,
            redis_host: "localhost".to_string(),
            redis_port: 6379,
            redis_password: None,
            redis_ssl: false,
            capacity: 1000,
            ttl: Duration::from_secs(1800),
            op_timeout: Duration::from_secs(2),
            breaker: BreakerConfig::default(),
        }
    }
}

/// Egress identity pool settings.
#[derive(Debug, Clone)]
pub struct RotatorSettings {
    /// Proxy endpoints; empty means direct connections only.
    pub proxies: Vec<String>,
    /// User-agent strings; empty falls back to the built-in set.
    pub user_agents: Vec<String>,
    /// Failures before an identity is retired from rotation.
    pub retire_threshold: u32,
    /// Pool is regenerated when fewer identities remain qualified.
    pub min_healthy: usize,
}

impl Default for RotatorSettings {
    fn default() -> Self {
        Self {
            proxies: Vec::new(),
            user_agents: Vec::new(),
            retire_threshold: 3,
            min_healthy: 1,
        }
    }
}

/// Fetch orchestration settings.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Attempts per strategy before falling through to the next.
    pub attempt_budget: u32,
    /// Deadline for a single fetch attempt.
    pub attempt_timeout: Duration,
    /// Base delay for exponential backoff between attempts.
    pub backoff_base_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            attempt_budget: 2,
            attempt_timeout: Duration::from_secs(30),
            backoff_base_ms: 500,
        }
    }
}

/// Full runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub graphql_endpoint: String,
    pub cache: CacheSettings,
    pub rotator: RotatorSettings,
    pub engine: EngineSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8000,
            graphql_endpoint: DEFAULT_GRAPHQL_URL.to_string(),
            cache: CacheSettings::default(),
            rotator: RotatorSettings::default(),
            engine: EngineSettings::default(),
        }
    }
}

impl Config {
    /// Load configuration from the environment.
    pub fn from_env() -> Self {
        let cache = CacheSettings {
            use_redis: read_env_bool("USE_REDIS", false),
            redis_host: read_env_string("REDIS_HOST")
                .unwrap_or_else(|| "localhost".to_string()),
            redis_port: read_env_u16("REDIS_PORT", 6379),
            redis_password: read_env_string("REDIS_PASSWORD").filter(|v| !v.is_empty()),
            redis_ssl: read_env_bool("REDIS_SSL", false),
            capacity: read_env_usize("TRELLIS_CACHE_CAPACITY", 1000),
            ttl: Duration::from_secs(read_env_u64("TRELLIS_CACHE_TTL_SECS", 1800)),
            ..CacheSettings::default()
        };

        let rotator = RotatorSettings {
            proxies: read_env_list("TRELLIS_PROXIES"),
            ..RotatorSettings::default()
        };

        let engine = EngineSettings {
            attempt_timeout: Duration::from_secs(read_env_u64(
                "TRELLIS_ATTEMPT_TIMEOUT_SECS",
                30,
            )),
            ..EngineSettings::default()
        };

        Config {
            port: read_env_u16("TRELLIS_PORT", 8000),
            graphql_endpoint: read_env_string("TRELLIS_GRAPHQL_URL")
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_GRAPHQL_URL.to_string()),
            cache,
            rotator,
            engine,
        }
    }
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().map(|v| v.trim().to_string())
}

fn read_env_bool(name: &str, default_value: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(default_value)
}

fn read_env_u16(name: &str, default_value: u16) -> u16 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u16>().ok())
        .unwrap_or(default_value)
}

fn read_env_u64(name: &str, default_value: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default_value)
}

fn read_env_usize(name: &str, default_value: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default_value)
}

/// Comma-separated list, entries trimmed, empties dropped.
fn read_env_list(name: &str) -> Vec<String> {
    std::env::var(name)
        .ok()
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
