//! Deterministic replay.
//!
//! Selection is keyed by `(idempotency_key, version)`, never by arrival time:
//! for every key the highest version wins, and the winners are applied in
//! ascending `(version, key)` order. Events at or below the watermark of the
//! state being replayed onto are already applied and are skipped (`<=`).

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::error::{CoordError, Result};
use crate::replay::event::{Event, ReplayedState};

/// Accept iff `key` has not been seen.
pub fn idempotency_check(key: &str, seen: &HashSet<String>) -> bool {
    !seen.contains(key)
}

/// Highest-version event per key, sorted ascending by `(version, key)`.
///
/// Two events with the same key and version but different payloads are a
/// producer bug and reject the whole input, whatever versions arrive around
/// them. With several such pairs the lowest `(version, key)` is reported.
pub fn select_final_events(events: &[Event]) -> Result<Vec<&Event>> {
    let mut payloads: HashMap<(&str, u64), &Event> = HashMap::with_capacity(events.len());
    let mut conflict: Option<(u64, &str)> = None;
    for event in events {
        let id = (event.idempotency_key.as_str(), event.version);
        match payloads.entry(id) {
            Entry::Occupied(first) => {
                let found = (event.version, id.0);
                if first.get().payload != event.payload && conflict.map_or(true, |c| found < c) {
                    conflict = Some(found);
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(event);
            }
        }
    }
    if let Some((version, key)) = conflict {
        return Err(CoordError::ConflictingEventVersion {
            key: key.to_string(),
            version,
        });
    }

    let mut latest: HashMap<&str, &Event> = HashMap::with_capacity(payloads.len());
    for ((key, version), event) in payloads {
        match latest.get(key) {
            Some(current) if current.version >= version => {}
            _ => {
                latest.insert(key, event);
            }
        }
    }

    let mut selected: Vec<&Event> = latest.into_values().collect();
    selected.sort_by(|a, b| {
        a.version
            .cmp(&b.version)
            .then_with(|| a.idempotency_key.cmp(&b.idempotency_key))
    });
    Ok(selected)
}

/// Rebuild state from `events` on top of `base`. Pure: the same event multiset
/// yields the same state in any delivery order.
pub fn replay(events: &[Event], base: &ReplayedState) -> Result<ReplayedState> {
    replay_with_cancel(events, base, &CancellationToken::new())
}

/// Like [`replay`], but stops between events once `cancel` fires and returns
/// `Cancelled` carrying the state reached so far.
pub fn replay_with_cancel(
    events: &[Event],
    base: &ReplayedState,
    cancel: &CancellationToken,
) -> Result<ReplayedState> {
    let selected = select_final_events(events)?;
    let watermark = base.watermark;
    let mut state = base.clone();
    for event in selected {
        if cancel.is_cancelled() {
            return Err(CoordError::Cancelled(Some(Box::new(state))));
        }
        if event.version <= watermark {
            continue;
        }
        state.apply(event);
    }
    Ok(state)
}

/// Fails with `ReplayDivergence` when two replays of the same events disagree.
pub fn check_convergence(local: &ReplayedState, remote: &ReplayedState) -> Result<()> {
    let (l, r) = (local.digest(), remote.digest());
    if l == r {
        return Ok(());
    }
    tracing::error!(local = %l, remote = %r, "Replay divergence");
    Err(CoordError::ReplayDivergence {
        local: l,
        remote: r,
    })
}

/// Per-batch counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Keys applied for the first time.
    pub applied: u64,
    /// Already-applied keys that received a newer version.
    pub superseded: u64,
    /// Redundant copies: lower versions within the batch and re-deliveries of applied events.
    pub duplicates: u64,
    /// Unapplied events at or below the watermark.
    pub stale: u64,
}

#[derive(Debug, Default)]
pub struct ReplayStats {
    applied: AtomicU64,
    superseded: AtomicU64,
    duplicates: AtomicU64,
    stale: AtomicU64,
    conflicts: AtomicU64,
}

impl ReplayStats {
    fn record(&self, outcome: &BatchOutcome) {
        self.applied.fetch_add(outcome.applied, Ordering::Relaxed);
        self.superseded
            .fetch_add(outcome.superseded, Ordering::Relaxed);
        self.duplicates
            .fetch_add(outcome.duplicates, Ordering::Relaxed);
        self.stale.fetch_add(outcome.stale, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BatchOutcome {
        BatchOutcome {
            applied: self.applied.load(Ordering::Relaxed),
            superseded: self.superseded.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
        }
    }

    pub fn conflicts(&self) -> u64 {
        self.conflicts.load(Ordering::Relaxed)
    }
}

/// Stateful replay shared by concurrent consumers.
///
/// `seen` is held for a whole batch so batches apply one after another. The
/// state lock is taken per event, so readers observe each key's final event
/// entirely or not at all.
#[derive(Debug, Default)]
pub struct ReplayEngine {
    seen: Mutex<HashSet<String>>,
    state: RwLock<ReplayedState>,
    stats: ReplayStats,
}

impl ReplayEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(state: ReplayedState) -> Self {
        let engine = Self::new();
        engine.restore(state);
        engine
    }

    pub fn snapshot(&self) -> ReplayedState {
        self.state.read().clone()
    }

    pub fn watermark(&self) -> u64 {
        self.state.read().watermark
    }

    pub fn stats(&self) -> &ReplayStats {
        &self.stats
    }

    pub fn has_seen(&self, key: &str) -> bool {
        !idempotency_check(key, &self.seen.lock())
    }

    /// Replace the current state, e.g. after loading a checkpoint.
    pub fn restore(&self, state: ReplayedState) {
        let mut seen = self.seen.lock();
        *seen = state.versions.keys().cloned().collect();
        *self.state.write() = state;
    }

    pub fn apply_batch(&self, events: &[Event]) -> Result<BatchOutcome> {
        self.apply(events, &CancellationToken::new())
    }

    /// Apply a batch, checking `cancel` between events. A cancelled batch stays
    /// partially applied; `Cancelled` carries the state reached.
    pub fn apply(&self, events: &[Event], cancel: &CancellationToken) -> Result<BatchOutcome> {
        let selected = match select_final_events(events) {
            Ok(selected) => selected,
            Err(e) => {
                self.stats.conflicts.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        let mut seen = self.seen.lock();
        let watermark = self.state.read().watermark;
        let mut outcome = BatchOutcome {
            duplicates: (events.len() - selected.len()) as u64,
            ..Default::default()
        };

        for event in selected {
            if cancel.is_cancelled() {
                self.stats.record(&outcome);
                tracing::info!(applied = outcome.applied, "Replay cancelled");
                return Err(CoordError::Cancelled(Some(Box::new(self.snapshot()))));
            }

            let key_seen = !idempotency_check(&event.idempotency_key, &seen);
            if event.version <= watermark {
                if key_seen {
                    outcome.duplicates += 1;
                } else {
                    outcome.stale += 1;
                }
                continue;
            }

            self.state.write().apply(event);
            if key_seen {
                outcome.superseded += 1;
            } else {
                seen.insert(event.idempotency_key.clone());
                outcome.applied += 1;
            }
        }

        self.stats.record(&outcome);
        tracing::debug!(
            applied = outcome.applied,
            superseded = outcome.superseded,
            duplicates = outcome.duplicates,
            stale = outcome.stale,
            "Applied event batch"
        );
        Ok(outcome)
    }
}
