pub mod elector;
pub mod quorum;
pub mod split_brain;
pub mod state;
pub mod term;
pub mod timer;
pub mod vote;
pub mod voter;

pub use elector::{elect_leader, ElectionOutcome, LeaderElector};
pub use quorum::{
    approval_ratio, byzantine_tolerance, quorum_health, vote_quorum, QuorumCalculator,
    QuorumHealth, QuorumPolicy,
};
pub use split_brain::{detect_split_brain, SplitBrainDetector};
pub use state::{is_lease_valid, lease_renew, merge_state, LeaderState, Role};
pub use term::{increment_term, RoundId, Term, TermClock};
pub use vote::{filter_votes, tally, FilteredVotes, NodeId, Vote, VoteFilter};
pub use voter::{Ballot, VoteRequest, VoteResponse, VoterState};
