use thiserror::Error;

use crate::replay::ReplayedState;

#[derive(Error, Debug)]
pub enum CoordError {
    #[error("Quorum not reached in term {term}: {votes} of {needed} votes")]
    QuorumNotReached { term: u64, votes: u64, needed: u64 },

    #[error("Split brain detected in term {term}: leaders {leaders:?}")]
    SplitBrainDetected { term: u64, leaders: Vec<String> },

    #[error("Circuit open for dependency {0}")]
    CircuitOpen(String),

    #[error("Replay divergence: local digest {local}, remote digest {remote}")]
    ReplayDivergence { local: String, remote: String },

    #[error("Conflicting payloads for event {key} at version {version}")]
    ConflictingEventVersion { key: String, version: u64 },

    /// Work was cancelled. Replays carry the state reached so far.
    #[error("Operation cancelled")]
    Cancelled(Option<Box<ReplayedState>>),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Checkpoint {sequence} failed checksum verification")]
    ChecksumMismatch { sequence: u64 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoordError {
    /// Errors that local recovery (backoff, retry, checkpoint fallback) may absorb.
    /// Split brain and divergence always go to an operator.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordError::QuorumNotReached { .. }
                | CoordError::Transport(_)
                | CoordError::Store(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CoordError>;
