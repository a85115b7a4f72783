use rand::Rng;
use std::time::Duration;

/// Random wait within the configured range, so peers do not start rounds in lockstep.
pub fn random_election_timeout(min_ms: u64, max_ms: u64) -> Duration {
    let mut rng = rand::thread_rng();
    let timeout_ms = rng.gen_range(min_ms..=max_ms.max(min_ms));
    Duration::from_millis(timeout_ms)
}
