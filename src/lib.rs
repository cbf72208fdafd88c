//! Tollgate - Request Rate Throttling
//!
//! This crate decides, for every inbound request, whether the caller is within the
//! throttling policy of the route category it is hitting. Counters live in a shared Redis
//! store so limits hold across instances; when the store is unconfigured or unreachable the
//! decision is made by an in-process counter instead, and the request is never failed
//! because of the limiter itself.

pub mod config;
pub mod error;
pub mod ratelimit;

pub use config::TollgateConfig;
pub use error::{Result, TollgateError};
pub use ratelimit::{Category, Decision, RateLimiter, RequestContext};
