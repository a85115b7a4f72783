use std::collections::VecDeque;
use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Election epoch. Compared as an integer everywhere, including after deserialization.
pub type Term = u64;

/// Identifies one election round so the term is advanced once per round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoundId(Uuid);

impl RoundId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RoundId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Next term. Always exactly one above the input.
pub fn increment_term(term: Term) -> Term {
    term + 1
}

/// Rounds remembered for idempotent advancement.
const ROUND_HISTORY: usize = 64;

#[derive(Debug)]
struct TermInner {
    current: Term,
    rounds: VecDeque<(RoundId, Term)>,
}

/// Monotonic term counter shared by every task acting for the local node.
#[derive(Debug)]
pub struct TermClock {
    inner: Mutex<TermInner>,
}

impl TermClock {
    pub fn new(start: Term) -> Self {
        Self {
            inner: Mutex::new(TermInner {
                current: start,
                rounds: VecDeque::with_capacity(ROUND_HISTORY),
            }),
        }
    }

    pub fn current(&self) -> Term {
        self.inner.lock().current
    }

    /// Advance the term for `round`. Repeating the call for a round that already
    /// advanced the clock returns that round's term instead of skipping one.
    pub fn advance(&self, round: RoundId) -> Term {
        let mut inner = self.inner.lock();
        if let Some((_, term)) = inner.rounds.iter().find(|(id, _)| *id == round) {
            return *term;
        }
        inner.current = increment_term(inner.current);
        let term = inner.current;
        if inner.rounds.len() == ROUND_HISTORY {
            inner.rounds.pop_front();
        }
        inner.rounds.push_back((round, term));
        tracing::debug!(term = inner.current, round = %round, "Advanced term");
        inner.current
    }

    /// Adopt a higher term seen from a peer. Lower or equal terms are ignored.
    /// Returns true when the clock moved.
    pub fn observe(&self, term: Term) -> bool {
        let mut inner = self.inner.lock();
        if term > inner.current {
            inner.current = term;
            true
        } else {
            false
        }
    }
}

impl Default for TermClock {
    fn default() -> Self {
        Self::new(0)
    }
}
