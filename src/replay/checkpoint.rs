//! Interval checkpoints of replay progress.
//!
//! A checkpoint at sequence `s` covers every event with `version <= s`, so
//! recovery replays only the tail above `s`. Checkpoints are append-only; the
//! event log they are cut from is append-only too and shares their lock, so a
//! checkpoint write never interleaves with an append to the same stream.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{CoordError, Result};
use crate::replay::engine::{replay, BatchOutcome, ReplayEngine};
use crate::replay::event::{Event, ReplayedState};
use crate::store::{get_json, put_json, KvStore};

/// True iff `sequence` sits exactly on an interval multiple (100, 200, ...).
/// Sequence 0 and a zero interval never checkpoint.
pub fn should_checkpoint(sequence: u64, interval: u64) -> bool {
    interval > 0 && sequence >= interval && sequence % interval == 0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub stream: String,
    pub sequence: u64,
    pub snapshot: ReplayedState,
    /// Digest of `snapshot` at write time.
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Checkpoint covering every event with `version <= sequence`.
    pub fn new(stream: impl Into<String>, sequence: u64, snapshot: ReplayedState) -> Self {
        Self {
            stream: stream.into(),
            sequence,
            checksum: snapshot.digest(),
            snapshot,
            created_at: Utc::now(),
        }
    }

    pub fn verify(&self) -> Result<()> {
        if self.snapshot.digest() != self.checksum {
            return Err(CoordError::ChecksumMismatch {
                sequence: self.sequence,
            });
        }
        Ok(())
    }
}

/// Replay only events above the checkpoint onto its snapshot.
pub fn rebuild_from_checkpoint(checkpoint: &Checkpoint, tail: &[Event]) -> Result<ReplayedState> {
    let tail: Vec<Event> = tail
        .iter()
        .filter(|e| e.version > checkpoint.sequence)
        .cloned()
        .collect();
    replay(&tail, &checkpoint.snapshot)
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CheckpointIndex {
    sequences: Vec<u64>,
}

#[derive(Debug, Default)]
struct StreamInner {
    log: Vec<Event>,
    index: CheckpointIndex,
    latest: Option<Checkpoint>,
}

/// Writes checkpoints for one stream through a key-value store and keeps the
/// stream's event log.
pub struct CheckpointManager {
    stream: String,
    interval: u64,
    store: Arc<dyn KvStore>,
    inner: Mutex<StreamInner>,
}

impl std::fmt::Debug for CheckpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointManager")
            .field("stream", &self.stream)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl CheckpointManager {
    /// Open the stream, loading its checkpoint index and latest checkpoint.
    pub fn open(stream: impl Into<String>, interval: u64, store: Arc<dyn KvStore>) -> Result<Self> {
        if interval == 0 {
            return Err(CoordError::InvalidConfig(
                "checkpoint interval must be positive".into(),
            ));
        }
        let stream = stream.into();
        let index: CheckpointIndex =
            get_json(store.as_ref(), &index_key(&stream))?.unwrap_or_default();
        let latest = match index.sequences.last() {
            Some(&seq) => {
                let cp: Option<Checkpoint> =
                    get_json(store.as_ref(), &checkpoint_key(&stream, seq))?;
                if let Some(cp) = &cp {
                    cp.verify()?;
                }
                cp
            }
            None => None,
        };
        tracing::debug!(
            stream = %stream,
            checkpoints = index.sequences.len(),
            latest = latest.as_ref().map(|c| c.sequence),
            "Opened checkpoint stream"
        );

        Ok(Self {
            stream,
            interval,
            store,
            inner: Mutex::new(StreamInner {
                log: Vec::new(),
                index,
                latest,
            }),
        })
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn interval(&self) -> u64 {
        self.interval
    }

    /// Append events to the stream's log. Events are never removed.
    pub fn append(&self, events: &[Event]) {
        self.inner.lock().log.extend_from_slice(events);
    }

    pub fn log_len(&self) -> usize {
        self.inner.lock().log.len()
    }

    /// Events above `sequence`, in log order.
    pub fn tail_after(&self, sequence: u64) -> Vec<Event> {
        self.inner
            .lock()
            .log
            .iter()
            .filter(|e| e.version > sequence)
            .cloned()
            .collect()
    }

    pub fn latest(&self) -> Option<Checkpoint> {
        self.inner.lock().latest.clone()
    }

    pub fn sequences(&self) -> Vec<u64> {
        self.inner.lock().index.sequences.clone()
    }

    /// Load and verify the checkpoint written at `sequence`.
    pub fn load(&self, sequence: u64) -> Result<Option<Checkpoint>> {
        let cp: Option<Checkpoint> =
            get_json(self.store.as_ref(), &checkpoint_key(&self.stream, sequence))?;
        if let Some(cp) = &cp {
            cp.verify()?;
        }
        Ok(cp)
    }

    /// Next sequence that triggers a checkpoint.
    pub fn next_boundary(&self) -> u64 {
        let last = self.inner.lock().latest.as_ref().map_or(0, |c| c.sequence);
        (last / self.interval + 1) * self.interval
    }

    /// Write a checkpoint at every interval multiple between the latest
    /// checkpoint and `state.watermark` (inclusive). A boundary equal to the
    /// watermark takes `state` itself; lower ones are cut from the logged events.
    pub fn observe(&self, state: &ReplayedState) -> Result<Option<Checkpoint>> {
        let mut inner = self.inner.lock();
        let last = inner.latest.as_ref().map_or(0, |c| c.sequence);
        let first = (last / self.interval + 1) * self.interval;
        if state.watermark < first {
            return Ok(None);
        }

        let base = inner
            .latest
            .as_ref()
            .map(|c| c.snapshot.clone())
            .unwrap_or_default();
        let top = state.watermark / self.interval * self.interval;
        let mut staged = Vec::new();
        for boundary in (first..=top).step_by(self.interval as usize) {
            let snapshot = if boundary == state.watermark {
                state.clone()
            } else {
                let upto: Vec<Event> = inner
                    .log
                    .iter()
                    .filter(|e| e.version > last && e.version <= boundary)
                    .cloned()
                    .collect();
                replay(&upto, &base)?
            };
            staged.push(Checkpoint::new(self.stream.clone(), boundary, snapshot));
        }
        self.persist(&mut inner, staged)?;
        Ok(inner.latest.clone())
    }

    /// State to fall back to: the latest checkpoint's snapshot, or empty.
    pub fn rollback(&self) -> ReplayedState {
        self.latest().map(|c| c.snapshot).unwrap_or_default()
    }

    /// Latest checkpoint plus the logged tail above it.
    pub fn recover(&self) -> Result<ReplayedState> {
        let inner = self.inner.lock();
        recover_from(&inner)
    }

    /// Apply `events` through `engine` as one unit.
    ///
    /// On success the events are appended to the log and a checkpoint is
    /// written at every interval multiple the batch crossed, each holding
    /// exactly the events at or below it. On failure (conflicting versions,
    /// cancellation) the engine is reset to the latest checkpoint plus the
    /// logged tail, so no part of the batch stays applied. A failed checkpoint
    /// write rolls the engine back to where it was before the batch.
    pub fn apply_or_rollback(
        &self,
        engine: &ReplayEngine,
        events: &[Event],
        cancel: &CancellationToken,
    ) -> Result<BatchOutcome> {
        let mut inner = self.inner.lock();
        let before = engine.snapshot();

        match engine.apply(events, cancel) {
            Ok(outcome) => {
                let written = self
                    .crossed_checkpoints(&inner, &before, events, engine.watermark())
                    .and_then(|staged| self.persist(&mut inner, staged));
                if let Err(e) = written {
                    tracing::warn!(
                        stream = %self.stream,
                        error = %e,
                        watermark = before.watermark,
                        "Checkpoint write failed, batch rolled back"
                    );
                    engine.restore(before);
                    return Err(e);
                }
                inner.log.extend_from_slice(events);
                Ok(outcome)
            }
            Err(e) => {
                let restored = recover_from(&inner).unwrap_or_else(|_| before.clone());
                tracing::warn!(
                    stream = %self.stream,
                    error = %e,
                    watermark = restored.watermark,
                    "Batch failed, rolled back to checkpoint"
                );
                engine.restore(restored.clone());
                match e {
                    CoordError::Cancelled(_) => Err(CoordError::Cancelled(Some(Box::new(restored)))),
                    other => Err(other),
                }
            }
        }
    }

    fn crossed_checkpoints(
        &self,
        inner: &StreamInner,
        before: &ReplayedState,
        events: &[Event],
        watermark: u64,
    ) -> Result<Vec<Checkpoint>> {
        let last = inner.latest.as_ref().map_or(0, |c| c.sequence);
        let floor = last.max(before.watermark);
        let boundaries: BTreeSet<u64> = events
            .iter()
            .filter(|e| e.version > floor)
            .map(|e| e.version.div_ceil(self.interval) * self.interval)
            .filter(|b| *b <= watermark)
            .collect();

        boundaries
            .into_iter()
            .map(|boundary| -> Result<Checkpoint> {
                let upto: Vec<Event> = events
                    .iter()
                    .filter(|e| e.version <= boundary)
                    .cloned()
                    .collect();
                let snapshot = replay(&upto, before)?;
                Ok(Checkpoint::new(self.stream.clone(), boundary, snapshot))
            })
            .collect()
    }

    /// Store checkpoint bodies first, then the index in one put. Nothing is
    /// referenced, in the store or in memory, until the index write succeeds.
    fn persist(&self, inner: &mut StreamInner, staged: Vec<Checkpoint>) -> Result<()> {
        if staged.is_empty() {
            return Ok(());
        }
        for checkpoint in &staged {
            put_json(
                self.store.as_ref(),
                &checkpoint_key(&self.stream, checkpoint.sequence),
                checkpoint,
            )?;
        }
        let mut index = CheckpointIndex {
            sequences: inner.index.sequences.clone(),
        };
        index.sequences.extend(staged.iter().map(|c| c.sequence));
        put_json(self.store.as_ref(), &index_key(&self.stream), &index)?;

        inner.index = index;
        for checkpoint in staged {
            tracing::info!(
                stream = %self.stream,
                sequence = checkpoint.sequence,
                on_boundary = should_checkpoint(checkpoint.sequence, self.interval),
                "Checkpoint written"
            );
            inner.latest = Some(checkpoint);
        }
        Ok(())
    }
}

fn recover_from(inner: &StreamInner) -> Result<ReplayedState> {
    match &inner.latest {
        Some(cp) => rebuild_from_checkpoint(cp, &inner.log),
        None => replay(&inner.log, &ReplayedState::default()),
    }
}

fn checkpoint_key(stream: &str, sequence: u64) -> String {
    format!("{stream}-checkpoint-{sequence:020}")
}

fn index_key(stream: &str) -> String {
    format!("{stream}-checkpoint-index")
}
