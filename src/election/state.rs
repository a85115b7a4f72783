use std::fmt;

use serde::{Deserialize, Serialize};

use crate::election::term::Term;
use crate::election::vote::NodeId;

/// Local node role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::Candidate => write!(f, "candidate"),
            Role::Leader => write!(f, "leader"),
        }
    }
}

/// Leadership as seen by one node.
///
/// `node_id` names the leader for `term`; an empty `node_id` means no leader.
/// `lease_expiry` is an absolute timestamp in milliseconds after which the
/// lease must be renewed or leadership given up.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LeaderState {
    pub node_id: NodeId,
    pub term: Term,
    pub is_leader: bool,
    pub lease_expiry: u64,
}

impl LeaderState {
    pub fn no_leader() -> Self {
        Self::default()
    }

    pub fn has_leader(&self) -> bool {
        !self.node_id.is_empty()
    }

    pub fn role(&self) -> Role {
        if self.is_leader {
            Role::Leader
        } else {
            Role::Follower
        }
    }
}

/// `now < lease_expiry`. A lease expiring exactly at `now` is no longer valid.
pub fn is_lease_valid(state: &LeaderState, now: u64) -> bool {
    now < state.lease_expiry
}

/// Extend the lease to `now + ttl`.
pub fn lease_renew(state: &LeaderState, ttl: u64, now: u64) -> LeaderState {
    LeaderState {
        lease_expiry: now.saturating_add(ttl),
        ..state.clone()
    }
}

/// Combine a local and a remote view, keeping the higher term. On equal terms
/// the local view stands.
pub fn merge_state(local: &LeaderState, remote: &LeaderState) -> LeaderState {
    if remote.term > local.term {
        remote.clone()
    } else {
        local.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leader(id: &str, term: Term, expiry: u64) -> LeaderState {
        LeaderState {
            node_id: id.to_string(),
            term,
            is_leader: true,
            lease_expiry: expiry,
        }
    }

    #[test]
    fn test_no_leader_is_empty() {
        let state = LeaderState::no_leader();
        assert_eq!(state.node_id, "");
        assert!(!state.has_leader());
        assert_eq!(state.role(), Role::Follower);
    }

    #[test]
    fn test_lease_boundary_is_exclusive() {
        let state = leader("n1", 3, 1_300);
        assert!(is_lease_valid(&state, 1_299));
        assert!(!is_lease_valid(&state, 1_300));
        assert!(!is_lease_valid(&state, 1_301));
    }

    #[test]
    fn test_lease_renew_adds_ttl() {
        let state = leader("n1", 3, 0);
        let renewed = lease_renew(&state, 300, 1_000);
        assert_eq!(renewed.lease_expiry, 1_300);
        assert_eq!(renewed.term, 3);
        assert!(is_lease_valid(&renewed, 1_000));
    }

    #[test]
    fn test_merge_keeps_higher_term() {
        let local = leader("n1", 4, 10);
        let remote = leader("n2", 5, 20);
        assert_eq!(merge_state(&local, &remote), remote);
        assert_eq!(merge_state(&remote, &local), remote);

        let same_term = leader("n3", 4, 99);
        assert_eq!(merge_state(&local, &same_term), local);
    }

    #[test]
    fn test_role_display() {
        assert_eq!(Role::Leader.to_string(), "leader");
        assert_eq!(Role::Candidate.to_string(), "candidate");
    }
}
