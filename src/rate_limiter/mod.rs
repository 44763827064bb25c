//! Adaptive rate limiting against an undisclosed upstream limit.
//!
//! This module implements admission control plus an AIMD-style estimator:
//! - Admits a request only while fewer than `current_rate` requests started in
//!   the last second are still in flight
//! - On a 429, lowers the rate to the observed rate minus headroom
//! - On other responses, raises the rate by one, slowly, up to
//!   `max_rate × (1 − headroom)`
//!
//! Convergence is deliberately slow: a wasted 429 costs more than running a
//! little below the real limit.

mod limiter;
mod window;

pub use limiter::{Admission, LimiterSettings, RateLimiter, RateSnapshot};
