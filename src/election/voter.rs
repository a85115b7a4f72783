use serde::{Deserialize, Serialize};

use crate::election::term::{RoundId, Term};
use crate::election::vote::{NodeId, Vote};

/// Vote solicitation sent to a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub round: RoundId,
    pub term: Term,
    pub candidate_id: NodeId,
}

/// Peer reply. `vote` is `None` when the vote was refused; `term` is the
/// voter's term after handling the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub voter_id: NodeId,
    pub term: Term,
    pub vote: Option<Vote>,
}

/// Durable record of the vote cast in `term`, restored on restart so a node
/// never grants two candidates the same term.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ballot {
    pub term: Term,
    pub voted_for: Option<NodeId>,
}

/// Voting side of a node: at most one granted vote per term.
#[derive(Debug, Clone)]
pub struct VoterState {
    pub node_id: NodeId,
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
}

impl VoterState {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            current_term: 0,
            voted_for: None,
        }
    }

    /// Restore from a persisted ballot. A ballot from an older term carries no vote.
    pub fn restore(&mut self, term: Term, ballot: Option<Ballot>) {
        self.current_term = term;
        self.voted_for = None;
        if let Some(ballot) = ballot {
            if ballot.term >= term {
                self.current_term = ballot.term;
                self.voted_for = ballot.voted_for;
            }
        }
    }

    pub fn ballot(&self) -> Ballot {
        Ballot {
            term: self.current_term,
            voted_for: self.voted_for.clone(),
        }
    }

    /// Handle a vote request
    pub fn handle_vote_request(&mut self, req: &VoteRequest) -> VoteResponse {
        if req.term > self.current_term {
            self.current_term = req.term;
            self.voted_for = None;
        }

        let granted = if req.term < self.current_term {
            false
        } else {
            match &self.voted_for {
                Some(existing) => existing == &req.candidate_id,
                None => {
                    self.voted_for = Some(req.candidate_id.clone());
                    true
                }
            }
        };

        tracing::debug!(
            node_id = %self.node_id,
            candidate = %req.candidate_id,
            term = req.term,
            granted,
            "Vote request handled"
        );

        VoteResponse {
            voter_id: self.node_id.clone(),
            term: self.current_term,
            vote: granted.then(|| Vote::new(req.candidate_id.clone(), self.node_id.clone(), req.term)),
        }
    }
}
