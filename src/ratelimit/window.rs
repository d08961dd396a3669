//! Sliding window log.
//!
//! Every admitted request leaves one timestamped entry. An evaluation prunes
//! entries older than the window, counts what is left and admits the request
//! only if the count is below the ceiling. Because the window always trails
//! "now", a caller cannot double its quota by straddling a boundary the way
//! it can with fixed windows.
//!
//! The Redis adapter runs the same steps inside a Lua script; this module is
//! the in-process rendition and the place where raw outcomes become
//! [`Decision`]s.

use serde::Serialize;
use std::collections::VecDeque;

use super::policy::RateLimitPolicy;

/// Raw result of one atomic window evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOutcome {
    /// Whether an entry was inserted for this request
    pub allowed: bool,
    /// Admissions left in the window after this evaluation
    pub remaining: u32,
    /// Oldest surviving entry after this evaluation
    pub oldest_millis: Option<u64>,
    /// The store's clock at evaluation time
    pub now_millis: u64,
}

/// Ordered log of admitted-request timestamps for one key.
#[derive(Debug, Clone, Default)]
pub struct WindowLog {
    entries: VecDeque<u64>,
}

impl WindowLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prune, count, and conditionally insert in one step.
    ///
    /// Callers must hold exclusive access to the log for the whole call.
    pub fn evaluate(&mut self, now: u64, window_millis: u64, max_requests: u32) -> WindowOutcome {
        let window_start = now.saturating_sub(window_millis);
        while matches!(self.entries.front(), Some(&ts) if ts < window_start) {
            self.entries.pop_front();
        }

        let count = self.entries.len();
        let max = max_requests as usize;

        if count < max {
            // Keep the log sorted even if the clock stepped backwards.
            let pos = self.entries.partition_point(|&ts| ts <= now);
            self.entries.insert(pos, now);

            WindowOutcome {
                allowed: true,
                remaining: (max - count - 1) as u32,
                oldest_millis: self.entries.front().copied(),
                now_millis: now,
            }
        } else {
            WindowOutcome {
                allowed: false,
                remaining: 0,
                oldest_millis: self.entries.front().copied(),
                now_millis: now,
            }
        }
    }

    /// Number of entries currently held, expired or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True once every entry has left the window.
    pub fn is_expired(&self, now: u64, window_millis: u64) -> bool {
        match self.entries.back() {
            Some(&newest) => newest.saturating_add(window_millis) <= now,
            None => true,
        }
    }
}

/// The limiter's answer for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub allowed: bool,
    /// Request ceiling of the governing policy
    pub limit: u32,
    pub remaining: u32,
    /// Epoch milliseconds at which the oldest counted request leaves the window
    pub reset_at: u64,
    /// Zero when allowed; always positive when denied
    pub retry_after_millis: u64,
}

impl Decision {
    /// Turn a store outcome into a decision under `policy`.
    pub fn from_outcome(outcome: &WindowOutcome, policy: &RateLimitPolicy) -> Self {
        let window = policy.window_millis();
        let now = outcome.now_millis;

        if outcome.allowed {
            let reset_at = outcome
                .oldest_millis
                .map(|oldest| oldest.saturating_add(window))
                .unwrap_or_else(|| now.saturating_add(window));
            Self {
                allowed: true,
                limit: policy.max_requests(),
                remaining: outcome.remaining,
                reset_at,
                retry_after_millis: 0,
            }
        } else {
            let retry_after = outcome
                .oldest_millis
                .map(|oldest| oldest.saturating_add(window).saturating_sub(now))
                .unwrap_or(window)
                .max(1);
            Self {
                allowed: false,
                limit: policy.max_requests(),
                remaining: 0,
                reset_at: now.saturating_add(retry_after),
                retry_after_millis: retry_after,
            }
        }
    }

    /// Admit without consulting the store.
    pub fn unenforced(policy: &RateLimitPolicy, now: u64) -> Self {
        Self {
            allowed: true,
            limit: policy.max_requests(),
            remaining: policy.max_requests(),
            reset_at: now.saturating_add(policy.window_millis()),
            retry_after_millis: 0,
        }
    }

    /// Reject because the store is unavailable and the policy fails closed.
    pub fn unavailable(policy: &RateLimitPolicy, now: u64, retry_after_millis: u64) -> Self {
        let retry_after = retry_after_millis.max(1);
        Self {
            allowed: false,
            limit: policy.max_requests(),
            remaining: 0,
            reset_at: now.saturating_add(retry_after),
            retry_after_millis: retry_after,
        }
    }

    /// Retry delay in whole seconds, rounded up.
    pub fn retry_after_secs(&self) -> u64 {
        self.retry_after_millis.div_ceil(1000)
    }
}
