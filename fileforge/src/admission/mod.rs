//! Admission gate guarding entry into the conversion pipeline.

mod rate_limiter;

pub use rate_limiter::{ANONYMOUS_CLIENT, RateDecision, RateLimiter, RateLimiterConfig};
