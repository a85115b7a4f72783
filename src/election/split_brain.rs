use std::sync::atomic::{AtomicU64, Ordering};

use crate::election::state::LeaderState;
use crate::election::vote::NodeId;
use crate::error::{CoordError, Result};

/// True iff more than one state claims leadership.
pub fn detect_split_brain(states: &[LeaderState]) -> bool {
    states.iter().filter(|s| s.is_leader).count() > 1
}

/// Inspects leadership claims gathered from several nodes.
///
/// A detection is fatal to automated action: `inspect` returns
/// `SplitBrainDetected` so the caller routes it to an operator.
#[derive(Debug, Default)]
pub struct SplitBrainDetector {
    detections: AtomicU64,
}

impl SplitBrainDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inspect(&self, states: &[LeaderState]) -> Result<()> {
        if !detect_split_brain(states) {
            return Ok(());
        }

        let mut leaders: Vec<NodeId> = states
            .iter()
            .filter(|s| s.is_leader)
            .map(|s| s.node_id.clone())
            .collect();
        leaders.sort();
        leaders.dedup();
        let term = states
            .iter()
            .filter(|s| s.is_leader)
            .map(|s| s.term)
            .max()
            .unwrap_or(0);

        self.detections.fetch_add(1, Ordering::Relaxed);
        tracing::error!(term, leaders = ?leaders, "Split brain detected");
        Err(CoordError::SplitBrainDetected { term, leaders })
    }

    pub fn detections(&self) -> u64 {
        self.detections.load(Ordering::Relaxed)
    }
}
