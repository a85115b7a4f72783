use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::BreakerConfig;
use crate::error::{CoordError, Result};
use crate::store::{get_json, put_json, KvStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    /// Calls pass through.
    #[default]
    Closed,
    /// Calls are rejected until the cool-down elapses.
    Open,
    /// Limited probes decide between closing and reopening.
    HalfOpen,
}

impl fmt::Display for CircuitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitStatus::Closed => write!(f, "closed"),
            CircuitStatus::Open => write!(f, "open"),
            CircuitStatus::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CircuitState {
    pub status: CircuitStatus,
    pub consecutive_failures: u32,
    /// Milliseconds timestamp of the last transition to `Open`.
    pub opened_at: Option<u64>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    in_flight_probes: u32,
    /// Bumped on every transition so a probe from an earlier half-open
    /// period cannot free a slot in the current one.
    epoch: u64,
}

/// A call admitted by [`CircuitBreaker::admit`]. Settle it with `success` or
/// `failure`; dropping it unsettled frees its half-open probe slot without
/// recording a result.
#[must_use = "an admission should be settled with success() or failure()"]
#[derive(Debug)]
pub struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    probe_epoch: Option<u64>,
    settled: bool,
}

impl Admission<'_> {
    pub fn is_probe(&self) -> bool {
        self.probe_epoch.is_some()
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Some(epoch) = self.probe_epoch {
            self.breaker.release_probe(epoch);
        }
    }
}

/// Per-dependency breaker: CLOSED → OPEN → HALF_OPEN → CLOSED.
pub struct CircuitBreaker {
    dependency: String,
    settings: BreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerInner>,
    rejections: AtomicU64,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("dependency", &self.dependency)
            .field("state", &self.inner.lock().state)
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(dependency: impl Into<String>, settings: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self::from_state(dependency, settings, clock, CircuitState::default())
    }

    pub fn from_state(
        dependency: impl Into<String>,
        settings: BreakerConfig,
        clock: Arc<dyn Clock>,
        state: CircuitState,
    ) -> Self {
        Self {
            dependency: dependency.into(),
            settings,
            clock,
            inner: Mutex::new(BreakerInner {
                state,
                in_flight_probes: 0,
                epoch: 0,
            }),
            rejections: AtomicU64::new(0),
        }
    }

    /// Restore counters saved with [`CircuitBreaker::persist`], or start closed.
    pub fn load(
        dependency: impl Into<String>,
        settings: BreakerConfig,
        clock: Arc<dyn Clock>,
        store: &dyn KvStore,
    ) -> Result<Self> {
        let dependency = dependency.into();
        let state = get_json(store, &store_key(&dependency))?.unwrap_or_default();
        Ok(Self::from_state(dependency, settings, clock, state))
    }

    pub fn persist(&self, store: &dyn KvStore) -> Result<()> {
        put_json(store, &store_key(&self.dependency), &self.state())
    }

    pub fn dependency(&self) -> &str {
        &self.dependency
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state.clone()
    }

    pub fn status(&self) -> CircuitStatus {
        self.inner.lock().state.status
    }

    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// Admit a call or fail fast with `CircuitOpen`.
    ///
    /// Half-open admits a probe only while `in_flight_probes < max_probes`.
    /// The caller must report the outcome; prefer [`CircuitBreaker::admit`]
    /// when the call can be abandoned.
    pub fn allow(&self) -> Result<()> {
        self.try_admit().map(|_| ())
    }

    /// Like [`CircuitBreaker::allow`], returning a guard that reports the outcome.
    pub fn admit(&self) -> Result<Admission<'_>> {
        let probe_epoch = self.try_admit()?;
        Ok(Admission {
            breaker: self,
            probe_epoch,
            settled: false,
        })
    }

    /// `Some(epoch)` when the admitted call holds a half-open probe slot.
    fn try_admit(&self) -> Result<Option<u64>> {
        let mut inner = self.inner.lock();
        if inner.state.status == CircuitStatus::Open {
            let opened_at = inner.state.opened_at.unwrap_or(0);
            let now = self.clock.now_ms();
            if now.saturating_sub(opened_at) >= self.settings.cooldown_ms {
                self.transition(&mut inner, CircuitStatus::HalfOpen);
            }
        }

        match inner.state.status {
            CircuitStatus::Closed => Ok(None),
            CircuitStatus::HalfOpen if inner.in_flight_probes < self.settings.max_probes => {
                inner.in_flight_probes += 1;
                Ok(Some(inner.epoch))
            }
            CircuitStatus::HalfOpen | CircuitStatus::Open => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                Err(CoordError::CircuitOpen(self.dependency.clone()))
            }
        }
    }

    fn release_probe(&self, epoch: u64) {
        let mut inner = self.inner.lock();
        if inner.epoch == epoch && inner.state.status == CircuitStatus::HalfOpen {
            inner.in_flight_probes = inner.in_flight_probes.saturating_sub(1);
            tracing::debug!(dependency = %self.dependency, "Abandoned probe released");
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state.status {
            CircuitStatus::Closed => inner.state.consecutive_failures = 0,
            CircuitStatus::HalfOpen => {
                info!(dependency = %self.dependency, "Probe succeeded");
                self.transition(&mut inner, CircuitStatus::Closed);
            }
            // Late result from a call admitted before the circuit opened.
            CircuitStatus::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.state.consecutive_failures = inner.state.consecutive_failures.saturating_add(1);
        match inner.state.status {
            CircuitStatus::Closed => {
                if inner.state.consecutive_failures >= self.settings.failure_threshold {
                    warn!(
                        dependency = %self.dependency,
                        failures = inner.state.consecutive_failures,
                        threshold = self.settings.failure_threshold,
                        "Failure threshold reached"
                    );
                    self.transition(&mut inner, CircuitStatus::Open);
                }
            }
            CircuitStatus::HalfOpen => {
                warn!(dependency = %self.dependency, "Probe failed");
                self.transition(&mut inner, CircuitStatus::Open);
            }
            CircuitStatus::Open => {}
        }
    }

    /// Force the breaker closed, clearing counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitStatus::Closed);
    }

    fn transition(&self, inner: &mut BreakerInner, next: CircuitStatus) {
        let previous = inner.state.status;
        inner.state.status = next;
        inner.in_flight_probes = 0;
        inner.epoch += 1;
        match next {
            CircuitStatus::Closed => {
                inner.state.consecutive_failures = 0;
                inner.state.opened_at = None;
            }
            CircuitStatus::Open => inner.state.opened_at = Some(self.clock.now_ms()),
            CircuitStatus::HalfOpen => {}
        }
        if previous != next {
            info!(
                dependency = %self.dependency,
                %previous,
                %next,
                "Circuit breaker transitioned"
            );
        }
    }
}

fn store_key(dependency: &str) -> String {
    format!("breaker-{dependency}")
}

/// Breakers keyed by dependency name, created on first use. With a store,
/// counters survive restarts: breakers load on creation and `persist_all`
/// writes them back.
pub struct BreakerRegistry {
    settings: BreakerConfig,
    clock: Arc<dyn Clock>,
    store: Option<Arc<dyn KvStore>>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(settings: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings,
            clock,
            store: None,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn get(&self, dependency: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .lock()
            .entry(dependency.to_string())
            .or_insert_with(|| Arc::new(self.create(dependency)))
            .clone()
    }

    fn create(&self, dependency: &str) -> CircuitBreaker {
        let Some(store) = &self.store else {
            return CircuitBreaker::new(dependency, self.settings.clone(), self.clock.clone());
        };
        CircuitBreaker::load(
            dependency,
            self.settings.clone(),
            self.clock.clone(),
            store.as_ref(),
        )
        .unwrap_or_else(|e| {
            warn!(dependency, error = %e, "Could not load breaker state, starting closed");
            CircuitBreaker::new(dependency, self.settings.clone(), self.clock.clone())
        })
    }

    pub fn reset_all(&self) {
        for breaker in self.breakers.lock().values() {
            breaker.reset();
        }
    }

    pub fn persist_all(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let breakers: Vec<_> = self.breakers.lock().values().cloned().collect();
        for breaker in breakers {
            breaker.persist(store.as_ref())?;
        }
        Ok(())
    }

    pub fn states(&self) -> Vec<(String, CircuitState)> {
        let mut states: Vec<_> = self
            .breakers
            .lock()
            .iter()
            .map(|(name, b)| (name.clone(), b.state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }
}
