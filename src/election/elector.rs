use std::collections::BTreeMap;

use crate::election::quorum::{QuorumCalculator, QuorumHealth};
use crate::election::state::{lease_renew, LeaderState};
use crate::election::term::Term;
use crate::election::vote::{FilteredVotes, NodeId, Vote, VoteFilter};
use crate::error::{CoordError, Result};

/// Pick the candidate with the strictly highest vote count. Ties go to the
/// lexicographically smallest node id. Returns `LeaderState::no_leader()` when
/// there are no candidates or the best count is below `min_votes`.
///
/// The returned state carries term 0 and no lease; callers stamp both.
pub fn elect_leader(
    candidates: &[NodeId],
    tally: &BTreeMap<NodeId, u64>,
    min_votes: u64,
) -> LeaderState {
    let mut best: Option<(&NodeId, u64)> = None;
    for candidate in candidates {
        let votes = tally.get(candidate).copied().unwrap_or(0);
        best = match best {
            None => Some((candidate, votes)),
            Some((id, count)) if votes > count || (votes == count && candidate < id) => {
                Some((candidate, votes))
            }
            keep => keep,
        };
    }

    match best {
        Some((id, votes)) if votes >= min_votes => LeaderState {
            node_id: id.clone(),
            term: 0,
            is_leader: true,
            lease_expiry: 0,
        },
        _ => LeaderState::no_leader(),
    }
}

/// Outcome of a completed round.
#[derive(Debug, Clone, PartialEq)]
pub struct ElectionOutcome {
    /// Winner's state with term and lease installed.
    pub leader: LeaderState,
    pub votes_for_leader: u64,
    pub required: u64,
    /// Votes that survived filtering.
    pub counted: u64,
    pub stale: u64,
    pub health: QuorumHealth,
    pub tally: BTreeMap<NodeId, u64>,
}

/// Concludes election rounds: filter, tally, quorum check, winner, lease.
#[derive(Debug, Clone, Copy)]
pub struct LeaderElector {
    quorum: QuorumCalculator,
    lease_ttl_ms: u64,
}

impl LeaderElector {
    pub fn new(quorum: QuorumCalculator, lease_ttl_ms: u64) -> Self {
        Self {
            quorum,
            lease_ttl_ms,
        }
    }

    pub fn quorum(&self) -> &QuorumCalculator {
        &self.quorum
    }

    pub fn lease_ttl_ms(&self) -> u64 {
        self.lease_ttl_ms
    }

    /// Filter `votes` against `term` and conclude the round.
    pub fn elect(&self, term: Term, votes: &[Vote], now: u64) -> Result<ElectionOutcome> {
        let filtered = VoteFilter::new(term).apply(votes);
        self.conclude(term, &filtered, now)
    }

    pub fn conclude(
        &self,
        term: Term,
        filtered: &FilteredVotes,
        now: u64,
    ) -> Result<ElectionOutcome> {
        let tally = filtered.tally();
        let candidates: Vec<NodeId> = tally.keys().cloned().collect();
        let required = self.quorum.required();
        let best = tally.values().copied().max().unwrap_or(0);

        let winner = elect_leader(&candidates, &tally, required);
        if !winner.has_leader() {
            tracing::debug!(term, votes = best, needed = required, "Quorum not reached");
            return Err(CoordError::QuorumNotReached {
                term,
                votes: best,
                needed: required,
            });
        }

        let votes_for_leader = tally.get(&winner.node_id).copied().unwrap_or(0);
        let leader = lease_renew(
            &LeaderState { term, ..winner },
            self.lease_ttl_ms,
            now,
        );
        tracing::info!(
            leader = %leader.node_id,
            term,
            votes = votes_for_leader,
            needed = required,
            stale = filtered.stale,
            "Leader elected"
        );

        Ok(ElectionOutcome {
            votes_for_leader,
            required,
            counted: filtered.accepted.len() as u64,
            stale: filtered.stale,
            health: self.quorum.health(votes_for_leader),
            tally,
            leader,
        })
    }
}
