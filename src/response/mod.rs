//! HTTP-facing side of the limiter: headers, status and rejection body.

mod applier;

pub use applier::{
    apply_decision, Admission, Rejection, RejectionBody, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING,
    X_RATELIMIT_RESET,
};
