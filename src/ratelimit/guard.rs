//! Fail-open guard around the window store.
//!
//! A rate limiter must never be the reason every request fails. Each store
//! call gets a hard deadline; consecutive failures trip a circuit breaker,
//! after which no store calls are attempted until a cooldown has passed and
//! a single probe succeeds. While the store is out, policies that fail open
//! admit everything and policies that fail closed reject.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::backend::WindowStore;
use super::key::RateLimitKey;
use super::policy::{FailureMode, RateLimitPolicy};
use super::window::Decision;
use crate::clock::Clock;
use crate::error::StoreError;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Store calls flow normally
    Closed = 0,
    /// Store calls are skipped
    Open = 1,
    /// One probe call is in flight
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

/// Configuration for the guard.
#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// Deadline for a single store call
    pub timeout: Duration,
    /// Consecutive failures before the breaker opens
    pub failure_threshold: u32,
    /// How long the breaker stays open before probing
    pub cooldown: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(50),
            failure_threshold: 5,
            cooldown: Duration::from_secs(5),
        }
    }
}

/// What the breaker lets a caller do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    /// Call the store as usual
    Call,
    /// Call the store as the single recovery probe
    Probe,
    /// Do not call the store
    Skip,
}

/// Lock-free consecutive-failure circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    /// When the breaker last opened or last handed out a probe
    opened_at_millis: AtomicU64,
    failure_threshold: u32,
    cooldown_millis: u64,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: AtomicU8::new(CircuitState::Closed as u8),
            consecutive_failures: AtomicU32::new(0),
            opened_at_millis: AtomicU64::new(0),
            failure_threshold: failure_threshold.max(1),
            cooldown_millis: u64::try_from(cooldown.as_millis()).unwrap_or(u64::MAX),
            clock,
        }
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Decide whether the caller may touch the store.
    ///
    /// Once the cooldown has elapsed exactly one caller per cooldown period
    /// wins the probe; a probe that never reports back is replaced after
    /// another cooldown.
    pub fn acquire(&self) -> Permit {
        if self.state() == CircuitState::Closed {
            return Permit::Call;
        }

        let now = self.clock.now_millis();
        let opened_at = self.opened_at_millis.load(Ordering::Acquire);
        if now.saturating_sub(opened_at) < self.cooldown_millis {
            return Permit::Skip;
        }

        match self.opened_at_millis.compare_exchange(
            opened_at,
            now,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                self.state.store(CircuitState::HalfOpen as u8, Ordering::Release);
                Permit::Probe
            }
            Err(_) => Permit::Skip,
        }
    }

    /// Record a successful store call.
    pub fn record_success(&self, permit: Permit) {
        match permit {
            Permit::Probe => {
                self.consecutive_failures.store(0, Ordering::Release);
                self.state.store(CircuitState::Closed as u8, Ordering::Release);
                info!("Window store recovered, rate limiting is enforced again");
            }
            Permit::Call => {
                if self.state() == CircuitState::Closed {
                    self.consecutive_failures.store(0, Ordering::Release);
                }
            }
            Permit::Skip => {}
        }
    }

    /// Record a failed store call. Returns true if this failure opened the
    /// breaker.
    pub fn record_failure(&self, permit: Permit) -> bool {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;

        match permit {
            Permit::Probe => {
                self.opened_at_millis
                    .store(self.clock.now_millis(), Ordering::Release);
                self.state.store(CircuitState::Open as u8, Ordering::Release);
                true
            }
            Permit::Call if failures >= self.failure_threshold => {
                // Late failures from calls admitted before the trip must not
                // restart the cooldown. The timestamp is written before the
                // state flips so no reader sees Open with a stale time.
                if self.state() != CircuitState::Closed {
                    return false;
                }
                self.opened_at_millis
                    .store(self.clock.now_millis(), Ordering::Release);
                self.state
                    .compare_exchange(
                        CircuitState::Closed as u8,
                        CircuitState::Open as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
            }
            _ => false,
        }
    }

}

/// Wraps a [`WindowStore`] so that its failures never reach callers.
pub struct FailOpenGuard<S> {
    store: S,
    breaker: CircuitBreaker,
    config: GuardConfig,
    clock: Arc<dyn Clock>,
}

impl<S: WindowStore> FailOpenGuard<S> {
    pub fn new(store: S, config: GuardConfig, clock: Arc<dyn Clock>) -> Self {
        let breaker =
            CircuitBreaker::new(config.failure_threshold, config.cooldown, Arc::clone(&clock));
        Self {
            store,
            breaker,
            config,
            clock,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Evaluate `key` under `policy`, absorbing store failures.
    pub async fn evaluate(&self, key: &RateLimitKey, policy: &RateLimitPolicy) -> Decision {
        let permit = self.breaker.acquire();
        if permit == Permit::Skip {
            debug!(key = %key, "Circuit open, skipping window store");
            return self.degraded(policy);
        }

        let call = self
            .store
            .evaluate_window(key, policy.window_millis(), policy.max_requests());
        let result = match tokio::time::timeout(self.config.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.config.timeout)),
        };

        match result {
            Ok(outcome) => {
                self.breaker.record_success(permit);
                Decision::from_outcome(&outcome, policy)
            }
            Err(e) => {
                warn!(
                    error = %e,
                    store = self.store.name(),
                    key = %key,
                    probe = permit == Permit::Probe,
                    "Window store call failed, rate limit not enforced for this request"
                );
                if self.breaker.record_failure(permit) {
                    error!(
                        store = self.store.name(),
                        failures = self.breaker.consecutive_failures(),
                        cooldown_ms = self.config.cooldown.as_millis() as u64,
                        "Window store circuit opened, rate limiting is NOT being enforced"
                    );
                }
                self.degraded(policy)
            }
        }
    }

    fn degraded(&self, policy: &RateLimitPolicy) -> Decision {
        let now = self.clock.now_millis();
        match policy.failure_mode() {
            FailureMode::Open => Decision::unenforced(policy, now),
            FailureMode::Closed => {
                let cooldown = u64::try_from(self.config.cooldown.as_millis()).unwrap_or(u64::MAX);
                Decision::unavailable(policy, now, cooldown)
            }
        }
    }
}
