//! Quorum thresholds.
//!
//! Every threshold here is inclusive: a tally equal to the required count
//! certifies the decision.

use std::fmt;

use serde::{Deserialize, Serialize};

/// `votes >= floor(total/2) + 1`. For 5 nodes, 3 votes qualify.
pub fn vote_quorum(votes: u64, total_nodes: u64) -> bool {
    votes >= majority(total_nodes)
}

pub fn majority(total_nodes: u64) -> u64 {
    total_nodes / 2 + 1
}

/// Faulty nodes a cluster of `total_nodes` tolerates: `floor((n-1)/3)`.
/// 7 nodes tolerate 2.
pub fn byzantine_tolerance(total_nodes: u64) -> u64 {
    total_nodes.saturating_sub(1) / 3
}

/// `approved / total`, clamped to `[0, 1]`. Zero participants yield 0.
///
/// A raw ratio above 1 means non-participants were counted as approvals
/// upstream; it is logged and clamped.
pub fn approval_ratio(approved: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    if approved > total {
        tracing::warn!(approved, total, "Approval count exceeds participants");
    }
    (approved as f64 / total as f64).clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuorumHealth {
    Weak,
    Adequate,
    Strong,
}

impl fmt::Display for QuorumHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuorumHealth::Weak => write!(f, "weak"),
            QuorumHealth::Adequate => write!(f, "adequate"),
            QuorumHealth::Strong => write!(f, "strong"),
        }
    }
}

/// `>= 0.90` strong, `>= 0.66` adequate, otherwise weak.
pub fn quorum_health(ratio: f64) -> QuorumHealth {
    if ratio >= 0.90 {
        QuorumHealth::Strong
    } else if ratio >= 0.66 {
        QuorumHealth::Adequate
    } else {
        QuorumHealth::Weak
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuorumPolicy {
    /// `floor(n/2) + 1`
    #[default]
    Majority,
    /// `floor(2n/3) + 1`
    Supermajority,
    /// `n - floor((n-1)/3)`: survives the tolerated number of faulty voters.
    Byzantine,
}

impl QuorumPolicy {
    pub fn required(&self, total_nodes: u64) -> u64 {
        match self {
            QuorumPolicy::Majority => majority(total_nodes),
            QuorumPolicy::Supermajority => total_nodes * 2 / 3 + 1,
            QuorumPolicy::Byzantine => total_nodes - byzantine_tolerance(total_nodes),
        }
    }
}

impl fmt::Display for QuorumPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuorumPolicy::Majority => write!(f, "majority"),
            QuorumPolicy::Supermajority => write!(f, "supermajority"),
            QuorumPolicy::Byzantine => write!(f, "byzantine"),
        }
    }
}

/// Quorum check bound to a cluster size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuorumCalculator {
    policy: QuorumPolicy,
    total_nodes: u64,
}

impl QuorumCalculator {
    pub fn new(policy: QuorumPolicy, total_nodes: u64) -> Self {
        Self {
            policy,
            total_nodes,
        }
    }

    pub fn policy(&self) -> QuorumPolicy {
        self.policy
    }

    pub fn total_nodes(&self) -> u64 {
        self.total_nodes
    }

    pub fn required(&self) -> u64 {
        self.policy.required(self.total_nodes)
    }

    pub fn is_met(&self, votes: u64) -> bool {
        votes >= self.required()
    }

    pub fn health(&self, votes: u64) -> QuorumHealth {
        quorum_health(approval_ratio(votes, self.total_nodes))
    }
}
