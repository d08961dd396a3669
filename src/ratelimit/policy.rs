//! Rate limit policies.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{RatewardenError, Result};

/// Default request ceiling for routes with no configured policy.
pub const DEFAULT_MAX_REQUESTS: u32 = 100;
/// Default window for routes with no configured policy.
pub const DEFAULT_WINDOW_MILLIS: u64 = 60_000;

/// How the discriminator part of a rate limit key is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// Client IP, preferring the first forwarded-for hop
    #[default]
    Ip,
    /// Authenticated identity plus IP
    IdentityAndIp,
    /// Authenticated identity only
    IdentityOnly,
}

/// What to do when the window store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Admit the request
    #[default]
    Open,
    /// Reject the request
    Closed,
}

impl fmt::Display for KeyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KeyStrategy::Ip => "ip",
            KeyStrategy::IdentityAndIp => "identity_and_ip",
            KeyStrategy::IdentityOnly => "identity_only",
        };
        f.write_str(name)
    }
}

/// An immutable rate limit policy.
///
/// Policies are created when the registry is built and shared by `Arc`
/// across every request that matches them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitPolicy {
    id: String,
    window_millis: u64,
    max_requests: u32,
    key_strategy: KeyStrategy,
    failure_mode: FailureMode,
}

impl RateLimitPolicy {
    /// Create a validated policy.
    ///
    /// Fails if the window or the request ceiling is zero.
    pub fn new(
        id: impl Into<String>,
        window_millis: u64,
        max_requests: u32,
        key_strategy: KeyStrategy,
        failure_mode: FailureMode,
    ) -> Result<Self> {
        let id = id.into();
        if window_millis == 0 {
            return Err(RatewardenError::Config(format!(
                "policy '{}': window_millis must be greater than zero",
                id
            )));
        }
        if max_requests == 0 {
            return Err(RatewardenError::Config(format!(
                "policy '{}': max_requests must be greater than zero",
                id
            )));
        }

        Ok(Self {
            id,
            window_millis,
            max_requests,
            key_strategy,
            failure_mode,
        })
    }

    /// The conservative policy applied to unmatched routes.
    pub fn fallback() -> Self {
        Self {
            id: "default".to_string(),
            window_millis: DEFAULT_WINDOW_MILLIS,
            max_requests: DEFAULT_MAX_REQUESTS,
            key_strategy: KeyStrategy::Ip,
            failure_mode: FailureMode::Open,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn window_millis(&self) -> u64 {
        self.window_millis
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_millis)
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    pub fn key_strategy(&self) -> KeyStrategy {
        self.key_strategy
    }

    pub fn failure_mode(&self) -> FailureMode {
        self.failure_mode
    }
}

impl fmt::Display for RateLimitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} per {}ms, by {})",
            self.id, self.max_requests, self.window_millis, self.key_strategy
        )
    }
}
