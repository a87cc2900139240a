//! Middleware for observability and admission control.
//!
//! This module provides:
//! - Gate outcome logging (client id, gate stage)
//! - Token-bucket rate limiting per client

pub mod logging;
pub mod rate_limit;

pub use logging::log_gate_outcome;
pub use rate_limit::{
    rate_limit_middleware, Admission, ClientId, ClientLimiter, RateLimitConfig, RateLimitState,
    SweeperHandle, MIN_REQUESTS_PER_SECOND,
};
