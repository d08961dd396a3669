//! Rate limiting policies, keys and the sliding window decision path.

mod backend;
mod guard;
mod key;
mod limiter;
mod policy;
mod rules;
mod window;

pub use backend::WindowStore;
pub use guard::{CircuitBreaker, CircuitState, FailOpenGuard, GuardConfig, Permit};
pub use key::{
    AdmissionRequest, KeyBuilder, RateLimitKey, ANONYMOUS, DEFAULT_KEY_PREFIX, UNKNOWN_IP,
};
pub use limiter::Limiter;
pub use policy::{FailureMode, KeyStrategy, RateLimitPolicy};
pub use rules::{PolicyDocument, PolicyEntry, PolicyRegistry, RouteRule};
pub use window::{Decision, WindowLog, WindowOutcome};
