//! Admission entry point.

use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, trace};

use super::backend::WindowStore;
use super::guard::{FailOpenGuard, GuardConfig};
use super::key::{AdmissionRequest, KeyBuilder};
use super::policy::RateLimitPolicy;
use super::rules::PolicyRegistry;
use super::window::Decision;
use crate::clock::Clock;

/// The rate limiter.
///
/// Holds no authoritative state of its own: the policy registry is
/// read-only between reloads and all counting happens in the store. Safe
/// to share across tasks behind an `Arc`.
pub struct Limiter<S> {
    registry: RwLock<Arc<PolicyRegistry>>,
    keys: KeyBuilder,
    guard: FailOpenGuard<S>,
}

impl<S: WindowStore> Limiter<S> {
    /// Create a limiter with the default key prefix.
    pub fn new(
        registry: PolicyRegistry,
        store: S,
        guard_config: GuardConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::with_key_builder(registry, store, guard_config, clock, KeyBuilder::default())
    }

    /// Create a limiter with a custom key builder.
    pub fn with_key_builder(
        registry: PolicyRegistry,
        store: S,
        guard_config: GuardConfig,
        clock: Arc<dyn Clock>,
        keys: KeyBuilder,
    ) -> Self {
        Self {
            registry: RwLock::new(Arc::new(registry)),
            keys,
            guard: FailOpenGuard::new(store, guard_config, clock),
        }
    }

    /// Decide whether a request may proceed.
    ///
    /// The store call is the only await point; everything else is in-memory.
    pub async fn admit(&self, request: &AdmissionRequest) -> Decision {
        let policy = self.policy_for(request);
        let key = self.keys.build_key(request, &policy);

        trace!(
            key = %key,
            policy = policy.id(),
            "Checking rate limit"
        );

        let decision = self.guard.evaluate(&key, &policy).await;

        if !decision.allowed {
            debug!(
                key = %key,
                policy = policy.id(),
                limit = decision.limit,
                retry_after_ms = decision.retry_after_millis,
                "Rate limit exceeded"
            );
        }

        decision
    }

    /// The policy that governs a request.
    pub fn policy_for(&self, request: &AdmissionRequest) -> Arc<RateLimitPolicy> {
        self.registry
            .read()
            .match_route(&request.route, &request.method)
    }

    /// Replace the policy registry wholesale.
    ///
    /// Evaluations already in flight finish under the policy they matched;
    /// later ones see the new registry.
    pub fn reload(&self, registry: PolicyRegistry) {
        let rules = registry.len();
        *self.registry.write() = Arc::new(registry);
        info!(rules = rules, "Rate limit policies replaced");
    }
}
