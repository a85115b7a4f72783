use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::election::term::Term;

pub type NodeId = String;

/// A ballot cast by `voter_id` for `candidate_id` in `term`. Immutable once cast.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Vote {
    pub candidate_id: NodeId,
    pub voter_id: NodeId,
    pub term: Term,
}

impl Vote {
    pub fn new(candidate_id: impl Into<NodeId>, voter_id: impl Into<NodeId>, term: Term) -> Self {
        Self {
            candidate_id: candidate_id.into(),
            voter_id: voter_id.into(),
            term,
        }
    }
}

/// Keep only votes cast in `current_term`. Older and newer terms are dropped.
pub fn filter_votes(votes: &[Vote], current_term: Term) -> Vec<Vote> {
    votes
        .iter()
        .filter(|v| v.term == current_term)
        .cloned()
        .collect()
}

/// Result of filtering one round's ballots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilteredVotes {
    /// One vote per voter, in arrival order.
    pub accepted: Vec<Vote>,
    /// Votes from a lower term.
    pub stale: u64,
    /// Votes from a higher term; the highest such term is kept in `highest_future_term`.
    pub future: u64,
    pub highest_future_term: Option<Term>,
    /// Second, different votes from a voter that already voted this term.
    pub equivocations: u64,
}

impl FilteredVotes {
    pub fn tally(&self) -> BTreeMap<NodeId, u64> {
        tally(&self.accepted)
    }
}

/// Filters a round's votes against the current term and enforces one counted
/// vote per voter. The first vote received from a voter is the one counted.
#[derive(Debug, Clone, Copy)]
pub struct VoteFilter {
    current_term: Term,
}

impl VoteFilter {
    pub fn new(current_term: Term) -> Self {
        Self { current_term }
    }

    pub fn apply(&self, votes: &[Vote]) -> FilteredVotes {
        let mut out = FilteredVotes::default();
        let mut by_voter: HashMap<&str, &Vote> = HashMap::new();

        for vote in votes {
            if vote.term < self.current_term {
                out.stale += 1;
                tracing::debug!(
                    voter = %vote.voter_id,
                    vote_term = vote.term,
                    current_term = self.current_term,
                    "Dropped stale vote"
                );
                continue;
            }
            if vote.term > self.current_term {
                out.future += 1;
                out.highest_future_term = out.highest_future_term.max(Some(vote.term));
                continue;
            }
            match by_voter.get(vote.voter_id.as_str()) {
                Some(existing) => {
                    if existing.candidate_id != vote.candidate_id {
                        out.equivocations += 1;
                        tracing::warn!(
                            voter = %vote.voter_id,
                            term = vote.term,
                            first = %existing.candidate_id,
                            second = %vote.candidate_id,
                            "Voter cast conflicting votes in one term"
                        );
                    }
                }
                None => {
                    by_voter.insert(vote.voter_id.as_str(), vote);
                    out.accepted.push(vote.clone());
                }
            }
        }
        out
    }
}

/// Count votes per candidate.
pub fn tally(votes: &[Vote]) -> BTreeMap<NodeId, u64> {
    let mut counts = BTreeMap::new();
    for vote in votes {
        *counts.entry(vote.candidate_id.clone()).or_insert(0) += 1;
    }
    counts
}
