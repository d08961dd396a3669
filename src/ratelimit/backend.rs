//! Window store trait for abstracting shared and in-process stores.

use async_trait::async_trait;
use std::sync::Arc;

use super::key::RateLimitKey;
use super::window::WindowOutcome;
use crate::error::StoreError;

/// A store able to run the sliding window evaluation atomically.
///
/// Implementations must make prune, count, insert and decide indivisible
/// with respect to every other caller evaluating the same key, and must take
/// "now" from their own clock rather than the caller's.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Evaluate one request against the window for `key`.
    async fn evaluate_window(
        &self,
        key: &RateLimitKey,
        window_millis: u64,
        max_requests: u32,
    ) -> Result<WindowOutcome, StoreError>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

#[async_trait]
impl<S: WindowStore + ?Sized> WindowStore for Arc<S> {
    async fn evaluate_window(
        &self,
        key: &RateLimitKey,
        window_millis: u64,
        max_requests: u32,
    ) -> Result<WindowOutcome, StoreError> {
        (**self).evaluate_window(key, window_millis, max_requests).await
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

#[async_trait]
impl<S: WindowStore + ?Sized> WindowStore for Box<S> {
    async fn evaluate_window(
        &self,
        key: &RateLimitKey,
        window_millis: u64,
        max_requests: u32,
    ) -> Result<WindowOutcome, StoreError> {
        (**self).evaluate_window(key, window_millis, max_requests).await
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}
