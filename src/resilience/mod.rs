pub mod backoff;
pub mod breaker;
pub mod retry;

pub use backoff::{degradation_level, retry_backoff, BackoffPolicy, DegradationLevel};
pub use breaker::{Admission, BreakerRegistry, CircuitBreaker, CircuitState, CircuitStatus};
pub use retry::{retry_with_breaker, CallStats};
