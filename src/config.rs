use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::election::quorum::QuorumPolicy;
use crate::error::{CoordError, Result};

/// Election round and lease settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionConfig {
    /// Upper bound on one vote collection round. Votes received by then are counted.
    pub round_timeout_ms: u64,
    /// Lease length installed on the winner.
    pub lease_ttl_ms: u64,
    /// Threshold applied to the tally.
    pub quorum_policy: QuorumPolicy,
    /// Rounds attempted before giving up with `QuorumNotReached`.
    pub max_rounds: u32,
    /// Lower and upper bounds of the randomized wait between lease checks.
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            round_timeout_ms: 200,
            lease_ttl_ms: 3_000,
            quorum_policy: QuorumPolicy::Majority,
            max_rounds: 5,
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Sequence interval between checkpoints (100 → 100, 200, ...).
    pub interval: u64,
    /// Logical stream the checkpoints belong to; used as the store key prefix.
    pub stream: String,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval: 100,
            stream: "default".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit (inclusive).
    pub failure_threshold: u32,
    /// Time spent open before a half-open probe is allowed.
    pub cooldown_ms: u64,
    /// Concurrent probes admitted while half-open.
    pub max_probes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 1_000,
            max_probes: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub max_ms: u64,
    pub max_attempts: u32,
    /// Randomize each delay within `[delay/2, delay]`.
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 100,
            max_ms: 10_000,
            max_attempts: 5,
            jitter: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub node_id: String,
    /// Other voting members; the local node is implied.
    pub peers: Vec<String>,
    pub election: ElectionConfig,
    pub checkpoint: CheckpointConfig,
    pub breaker: BreakerConfig,
    pub backoff: BackoffConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            node_id: "n1".to_string(),
            peers: Vec::new(),
            election: ElectionConfig::default(),
            checkpoint: CheckpointConfig::default(),
            breaker: BreakerConfig::default(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    pub fn with_peer(mut self, node_id: impl Into<String>) -> Self {
        self.peers.push(node_id.into());
        self
    }

    /// Voting members including the local node.
    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(CoordError::InvalidConfig("node_id must not be empty".into()));
        }
        if self.peers.iter().any(|p| p == &self.node_id) {
            return Err(CoordError::InvalidConfig(format!(
                "node {} lists itself as a peer",
                self.node_id
            )));
        }
        let mut distinct = std::collections::HashSet::with_capacity(self.peers.len());
        if let Some(dup) = self.peers.iter().find(|p| !distinct.insert(p.as_str())) {
            return Err(CoordError::InvalidConfig(format!("peer {dup} listed twice")));
        }
        if self.checkpoint.interval == 0 {
            return Err(CoordError::InvalidConfig(
                "checkpoint interval must be positive".into(),
            ));
        }
        if self.breaker.failure_threshold == 0 || self.breaker.max_probes == 0 {
            return Err(CoordError::InvalidConfig(
                "breaker threshold and max_probes must be positive".into(),
            ));
        }
        if self.election.election_timeout_min_ms > self.election.election_timeout_max_ms {
            return Err(CoordError::InvalidConfig(
                "election timeout min exceeds max".into(),
            ));
        }
        if self.election.max_rounds == 0 {
            return Err(CoordError::InvalidConfig("max_rounds must be positive".into()));
        }
        Ok(())
    }
}
