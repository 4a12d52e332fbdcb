//! Failsafe mechanisms: retry with backoff, rate limiting, health probing

mod health;
mod rate_limiter;
mod retry;

pub use health::{HealthReporter, HealthStatus, HealthTracker, ProbeMetrics};
pub use rate_limiter::{Admission, RateLimiter};
pub use retry::{Exhausted, RetryPolicy, backoff_delay, with_retry};
