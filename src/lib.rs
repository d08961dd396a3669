//! Ratewarden - Distributed Sliding Window Rate Limiter
//!
//! This crate decides whether an inbound API call may proceed under a
//! per-route policy. Counting happens in a shared store (Redis) through a
//! single atomic script, so the limit holds across any number of stateless
//! server processes. When the store is unreachable the limiter fails open
//! behind a circuit breaker instead of rejecting all traffic.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod reload;
pub mod response;
pub mod store;
