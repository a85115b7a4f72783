use std::fmt;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::BackoffConfig;

/// Exponential delay: `base * 2^(attempt-1)`. Attempt 0 is treated as 1.
pub fn retry_backoff(attempt: u32, base: u64) -> u64 {
    let exponent = attempt.max(1) - 1;
    let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
    base.saturating_mul(factor)
}

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    base_ms: u64,
    max_ms: u64,
    max_attempts: u32,
    jitter: bool,
}

impl BackoffPolicy {
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            base_ms: config.base_ms,
            max_ms: config.max_ms,
            max_attempts: config.max_attempts,
            jitter: config.jitter,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether another attempt may follow attempt number `attempt` (1-based).
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Capped delay before the attempt after `attempt`. With jitter the delay is
    /// drawn from `[d/2, d]`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let capped = retry_backoff(attempt, self.base_ms).min(self.max_ms);
        let millis = if self.jitter && capped > 1 {
            rand::thread_rng().gen_range(capped / 2..=capped)
        } else {
            capped
        };
        Duration::from_millis(millis)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(&BackoffConfig::default())
    }
}

/// Severity derived from an observed error rate. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DegradationLevel {
    Normal,
    Elevated,
    Degraded,
    Critical,
}

impl fmt::Display for DegradationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DegradationLevel::Normal => write!(f, "normal"),
            DegradationLevel::Elevated => write!(f, "elevated"),
            DegradationLevel::Degraded => write!(f, "degraded"),
            DegradationLevel::Critical => write!(f, "critical"),
        }
    }
}

/// Map an error rate in `[0, 1]` to a level. Higher rates never map to a less
/// severe level. NaN is treated as critical.
pub fn degradation_level(error_rate: f64) -> DegradationLevel {
    if error_rate.is_nan() || error_rate >= 0.5 {
        DegradationLevel::Critical
    } else if error_rate >= 0.25 {
        DegradationLevel::Degraded
    } else if error_rate >= 0.05 {
        DegradationLevel::Elevated
    } else {
        DegradationLevel::Normal
    }
}
