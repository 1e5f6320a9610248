//! Circuit breaker guarding the durable cache backend.
//!
//! Consecutive backend failures trip the breaker open; while open, every
//! durable operation is skipped without touching the network and the
//! in-memory fallback serves alone. After a cooldown a single probe
//! operation is admitted: success closes the breaker, failure re-opens it
//! for another full cooldown.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Breaker tuning knobs.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker open.
    pub failure_threshold: u32,
    /// How long the breaker stays open before admitting a probe.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open { until: Instant },
    HalfOpen { since: Instant },
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
}

/// Shared breaker; all methods take `&self` and are safe to call from any
/// task.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
            }),
        }
    }

    /// Ask permission to run one durable operation.
    ///
    /// Returns false while the breaker is open or while another probe is
    /// already in flight. A stale probe (its task cancelled before
    /// reporting) is replaced once a full cooldown has elapsed, so the
    /// breaker cannot wedge half-open forever.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.lock();
        let now = Instant::now();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open { until } => {
                if now >= until {
                    inner.state = CircuitState::HalfOpen { since: now };
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen { since } => {
                if now >= since + self.config.cooldown {
                    inner.state = CircuitState::HalfOpen { since: now };
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Report a successful durable operation.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        if !matches!(inner.state, CircuitState::Closed) {
            tracing::info!("durable cache recovered, closing circuit breaker");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
    }

    /// Report a failed durable operation.
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        let now = Instant::now();
        match inner.state {
            CircuitState::HalfOpen { .. } => {
                // Probe failed, re-open for another full cooldown.
                inner.state = CircuitState::Open {
                    until: now + self.config.cooldown,
                };
                tracing::warn!(
                    cooldown_secs = self.config.cooldown.as_secs(),
                    "durable cache probe failed, circuit breaker re-opened"
                );
            }
            CircuitState::Closed | CircuitState::Open { .. } => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold
                    && matches!(inner.state, CircuitState::Closed)
                {
                    inner.state = CircuitState::Open {
                        until: now + self.config.cooldown,
                    };
                    tracing::warn!(
                        failures = inner.consecutive_failures,
                        cooldown_secs = self.config.cooldown.as_secs(),
                        "durable cache circuit breaker opened"
                    );
                }
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        // Lock holders never panic, so poisoning cannot happen in practice;
        // recover rather than propagate if it ever does.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
