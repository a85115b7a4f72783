use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use super::backoff::{degradation_level, BackoffPolicy, DegradationLevel};
use super::breaker::CircuitBreaker;
use crate::error::{CoordError, Result};

/// Success and failure counts for one class of external calls.
#[derive(Debug, Default)]
pub struct CallStats {
    calls: AtomicU64,
    failures: AtomicU64,
}

impl CallStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, ok: bool) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn error_rate(&self) -> f64 {
        let calls = self.calls();
        if calls == 0 {
            return 0.0;
        }
        self.failures.load(Ordering::Relaxed) as f64 / calls as f64
    }

    pub fn level(&self) -> DegradationLevel {
        degradation_level(self.error_rate())
    }
}

/// Run `operation` through `breaker`, retrying retryable errors on the backoff
/// schedule. An open circuit fails fast with `CircuitOpen`. Cancellation during
/// a backoff wait returns `Cancelled(None)`.
///
/// `operation` receives the 1-based attempt number.
pub async fn retry_with_breaker<T, F, Fut>(
    breaker: &CircuitBreaker,
    policy: &BackoffPolicy,
    cancel: &CancellationToken,
    stats: Option<&CallStats>,
    mut operation: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        let admission = breaker.admit()?;
        match operation(attempt).await {
            Ok(value) => {
                admission.success();
                if let Some(stats) = stats {
                    stats.record(true);
                }
                return Ok(value);
            }
            Err(e) => {
                admission.failure();
                if let Some(stats) = stats {
                    stats.record(false);
                }
                if !e.is_retryable() || !policy.should_retry(attempt) {
                    error!(
                        dependency = breaker.dependency(),
                        attempts = attempt,
                        error = %e,
                        "Operation failed permanently"
                    );
                    return Err(e);
                }
                let delay = policy.delay(attempt);
                warn!(
                    dependency = breaker.dependency(),
                    attempt,
                    max_attempts = policy.max_attempts(),
                    ?delay,
                    error = %e,
                    "Operation failed, retrying"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(CoordError::Cancelled(None)),
                    _ = sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}
