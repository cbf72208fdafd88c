//! Rate limiting logic and state management.

mod backend;
mod clock;
mod counter;
mod decision;
mod distributed;
mod identifier;
mod limiter;
mod policy;
pub mod routes;

pub use backend::CounterBackend;
pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::{local_key, CounterEntry, LocalCounter};
pub use decision::{
    parse_reset_header, parse_retry_after, ActionOutcome, BackendKind, Decision, Rejection,
    RejectionBody, LIMIT_HEADER, REMAINING_HEADER, RESET_HEADER,
};
pub use distributed::RedisCounter;
pub use identifier::{Identifier, RequestContext, Scope, FORWARDED_FOR_HEADER, REAL_IP_HEADER};
pub use limiter::RateLimiter;
pub use policy::{Category, PolicyRegistry, RateLimitPolicy};
