use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::config::CoordinatorConfig;
use crate::election::timer::random_election_timeout;
use crate::election::{
    is_lease_valid, lease_renew, merge_state, Ballot, ElectionOutcome, LeaderElector, LeaderState,
    NodeId, QuorumCalculator, Role, RoundId, SplitBrainDetector, Term, TermClock, VoteFilter,
    VoteRequest, VoteResponse, VoterState,
};
use crate::error::{CoordError, Result};
use crate::replay::{
    check_convergence, BatchOutcome, CheckpointManager, Event, ReplayEngine, ReplayedState,
};
use crate::resilience::{retry_with_breaker, BackoffPolicy, BreakerRegistry, CallStats, DegradationLevel};
use crate::store::{get_json, put_json, KvStore};
use crate::transport::{Heartbeat, HeartbeatAck, PeerHandler, PeerTransport};

/// Conditions that need an operator. Local recovery never resolves these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Escalation {
    SplitBrain { term: Term, leaders: Vec<NodeId> },
    ReplayDivergence { local: String, remote: String },
}

impl Escalation {
    pub fn to_error(&self) -> CoordError {
        match self {
            Escalation::SplitBrain { term, leaders } => CoordError::SplitBrainDetected {
                term: *term,
                leaders: leaders.clone(),
            },
            Escalation::ReplayDivergence { local, remote } => CoordError::ReplayDivergence {
                local: local.clone(),
                remote: remote.clone(),
            },
        }
    }
}

/// One node of the coordinator: elections, leases, replay and checkpoints.
pub struct Coordinator {
    config: CoordinatorConfig,
    clock: Arc<dyn Clock>,
    transport: Arc<dyn PeerTransport>,
    store: Arc<dyn KvStore>,
    terms: TermClock,
    voter: Mutex<VoterState>,
    leader: RwLock<LeaderState>,
    campaigning: AtomicBool,
    elector: LeaderElector,
    detector: SplitBrainDetector,
    breakers: BreakerRegistry,
    backoff: BackoffPolicy,
    peer_calls: CallStats,
    engine: ReplayEngine,
    checkpoints: CheckpointManager,
    escalations: mpsc::Sender<Escalation>,
    halted: Mutex<Option<Escalation>>,
}

impl Coordinator {
    /// Build a coordinator, restoring its term, breaker counters and latest
    /// checkpoint from `store`. The receiver yields escalations.
    pub fn new(
        config: CoordinatorConfig,
        clock: Arc<dyn Clock>,
        transport: Arc<dyn PeerTransport>,
        store: Arc<dyn KvStore>,
    ) -> Result<(Self, mpsc::Receiver<Escalation>)> {
        config.validate()?;

        let stored_term: Term = get_json(store.as_ref(), &term_key(&config.node_id))?.unwrap_or(0);
        let ballot: Option<Ballot> = get_json(store.as_ref(), &ballot_key(&config.node_id))?;
        let quorum = QuorumCalculator::new(
            config.election.quorum_policy,
            config.cluster_size() as u64,
        );
        let checkpoints = CheckpointManager::open(
            config.checkpoint.stream.clone(),
            config.checkpoint.interval,
            store.clone(),
        )?;
        let engine = ReplayEngine::from_state(checkpoints.recover()?);
        let mut voter = VoterState::new(config.node_id.clone());
        voter.restore(stored_term, ballot);
        let start_term = voter.current_term;
        let (tx, rx) = mpsc::channel(16);

        tracing::info!(
            node_id = %config.node_id,
            peers = config.peers.len(),
            term = start_term,
            quorum = quorum.required(),
            policy = %quorum.policy(),
            watermark = engine.watermark(),
            "Coordinator initialized"
        );

        let coordinator = Self {
            elector: LeaderElector::new(quorum, config.election.lease_ttl_ms),
            breakers: BreakerRegistry::new(config.breaker.clone(), clock.clone())
                .with_store(store.clone()),
            backoff: BackoffPolicy::new(&config.backoff),
            terms: TermClock::new(start_term),
            voter: Mutex::new(voter),
            leader: RwLock::new(LeaderState::no_leader()),
            campaigning: AtomicBool::new(false),
            detector: SplitBrainDetector::new(),
            peer_calls: CallStats::new(),
            engine,
            checkpoints,
            escalations: tx,
            halted: Mutex::new(None),
            config,
            clock,
            transport,
            store,
        };
        Ok((coordinator, rx))
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn term(&self) -> Term {
        self.terms.current()
    }

    pub fn leader_state(&self) -> LeaderState {
        self.leader.read().clone()
    }

    pub fn role(&self) -> Role {
        if self.holds_lease() {
            Role::Leader
        } else if self.campaigning.load(Ordering::SeqCst) {
            Role::Candidate
        } else {
            Role::Follower
        }
    }

    /// True while this node leads with an unexpired lease.
    pub fn holds_lease(&self) -> bool {
        let leader = self.leader.read();
        leader.is_leader
            && leader.node_id == self.config.node_id
            && is_lease_valid(&leader, self.clock.now_ms())
    }

    pub fn engine(&self) -> &ReplayEngine {
        &self.engine
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub fn split_brain_detections(&self) -> u64 {
        self.detector.detections()
    }

    /// Health of peer calls, from their observed error rate.
    pub fn degradation(&self) -> DegradationLevel {
        self.peer_calls.level()
    }

    pub fn halted(&self) -> Option<Escalation> {
        self.halted.lock().clone()
    }

    /// Operator acknowledgement of a split brain; automated elections resume.
    pub fn resume(&self) {
        if self.halted.lock().take().is_some() {
            tracing::info!(node_id = %self.config.node_id, "Automated action resumed");
        }
    }

    /// One election round: advance the term, vote for self, solicit peers
    /// concurrently and conclude with the votes received before the round
    /// timeout.
    pub async fn run_election_round(&self, cancel: &CancellationToken) -> Result<ElectionOutcome> {
        self.ensure_active()?;
        self.campaigning.store(true, Ordering::SeqCst);
        let result = self.campaign(cancel).await;
        self.campaigning.store(false, Ordering::SeqCst);
        result
    }

    async fn campaign(&self, cancel: &CancellationToken) -> Result<ElectionOutcome> {
        let round = RoundId::new();
        let term = self.terms.advance(round);
        self.persist_term(term);

        let request = VoteRequest {
            round,
            term,
            candidate_id: self.config.node_id.clone(),
        };
        let mut votes = Vec::with_capacity(self.config.cluster_size());
        votes.extend(self.cast_vote(&request).vote);

        tracing::info!(node_id = %self.config.node_id, term, round = %round, "Starting election");

        let transport = self.transport.clone();
        let replies = self
            .fan_out(cancel, move |peer| {
                let transport = transport.clone();
                let request = request.clone();
                async move { transport.request_vote(peer, request).await }
            })
            .await?;

        let mut highest = term;
        for (_, response) in replies {
            highest = highest.max(response.term);
            votes.extend(response.vote);
        }

        let filtered = VoteFilter::new(term).apply(&votes);
        highest = highest.max(filtered.highest_future_term.unwrap_or(term));
        if highest > term {
            self.adopt_term(highest, "higher term seen during election");
            return Err(CoordError::QuorumNotReached {
                term,
                votes: filtered.tally().get(&self.config.node_id).copied().unwrap_or(0),
                needed: self.elector.quorum().required(),
            });
        }

        let now = self.clock.now_ms();
        let outcome = self.elector.conclude(term, &filtered, now)?;
        let is_self = outcome.leader.node_id == self.config.node_id;
        let view = LeaderState {
            is_leader: is_self,
            ..outcome.leader.clone()
        };

        {
            let mut leader = self.leader.write();
            if self.terms.current() != term || leader.term > term {
                tracing::debug!(term, "Round superseded before it concluded");
                return Err(CoordError::QuorumNotReached {
                    term,
                    votes: outcome.votes_for_leader,
                    needed: outcome.required,
                });
            }
            *leader = view;
        }

        if is_self {
            tracing::info!(
                node_id = %self.config.node_id,
                term,
                votes = outcome.votes_for_leader,
                health = %outcome.health,
                "Became leader"
            );
            self.recover()?;
            // Announce the lease before peers time out and start their own rounds.
            if let Err(e) = self.renew_lease(cancel).await {
                tracing::warn!(term, error = %e, "Initial heartbeat failed");
            }
        }
        Ok(outcome)
    }

    /// Run rounds until one elects a leader, at most `max_rounds` times.
    /// Each retry uses a fresh term and waits on the backoff schedule.
    pub async fn elect_with_retry(&self, cancel: &CancellationToken) -> Result<ElectionOutcome> {
        let max_rounds = self.config.election.max_rounds;
        let mut attempt = 1;
        loop {
            match self.run_election_round(cancel).await {
                Ok(outcome) => return Ok(outcome),
                Err(e @ CoordError::QuorumNotReached { .. }) if attempt < max_rounds => {
                    let delay = self.backoff.delay(attempt);
                    tracing::warn!(
                        node_id = %self.config.node_id,
                        attempt,
                        max_rounds,
                        ?delay,
                        error = %e,
                        "Election round failed, backing off"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(CoordError::Cancelled(None)),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Extend the lease when a quorum acknowledges the heartbeat. An expired
    /// lease or a higher term from a peer ends leadership.
    ///
    /// Returns whether the lease was renewed.
    pub async fn renew_lease(&self, cancel: &CancellationToken) -> Result<bool> {
        let current = self.leader_state();
        if !current.is_leader || current.node_id != self.config.node_id {
            return Ok(false);
        }
        let now = self.clock.now_ms();
        if !is_lease_valid(&current, now) {
            self.step_down(current.term, "lease expired");
            return Ok(false);
        }

        let ttl = self.elector.lease_ttl_ms();
        let beat = Heartbeat {
            term: current.term,
            leader_id: self.config.node_id.clone(),
            lease_expiry: now.saturating_add(ttl),
        };
        let transport = self.transport.clone();
        let acks = self
            .fan_out(cancel, move |peer| {
                let transport = transport.clone();
                let beat = beat.clone();
                async move { transport.heartbeat(peer, beat).await }
            })
            .await?;

        let highest = acks.iter().map(|(_, ack)| ack.term).max().unwrap_or(0);
        if highest > current.term {
            self.adopt_term(highest, "peer acknowledged a higher term");
            return Ok(false);
        }

        let accepted = 1 + acks.iter().filter(|(_, ack)| ack.accepted).count() as u64;
        if !self.elector.quorum().is_met(accepted) {
            tracing::warn!(
                node_id = %self.config.node_id,
                term = current.term,
                accepted,
                needed = self.elector.quorum().required(),
                "Lease renewal lacked quorum"
            );
            return Ok(false);
        }

        let mut leader = self.leader.write();
        if leader.term != current.term || !leader.is_leader {
            return Ok(false);
        }
        *leader = lease_renew(&leader, ttl, now);
        tracing::debug!(term = leader.term, lease_expiry = leader.lease_expiry, "Lease renewed");
        Ok(true)
    }

    /// Give up leadership and forget the leader of older terms. A leader that
    /// steps down resets its peer breakers for the next term.
    pub fn step_down(&self, term: Term, reason: &str) {
        let was_leader = {
            let mut leader = self.leader.write();
            let was_leader = leader.is_leader;
            if was_leader {
                tracing::info!(
                    node_id = %self.config.node_id,
                    term = leader.term,
                    reason,
                    "Stepping down"
                );
            }
            if term > leader.term {
                *leader = LeaderState {
                    term,
                    ..LeaderState::no_leader()
                };
            } else {
                leader.is_leader = false;
            }
            was_leader
        };
        if !was_leader {
            return;
        }
        self.breakers.reset_all();
        if let Err(e) = self.breakers.persist_all() {
            tracing::warn!(error = %e, "Failed to persist breaker state");
        }
    }

    /// Fold a peer's view into ours. The higher term wins; on equal terms our
    /// view stands.
    pub fn merge_view(&self, remote: &LeaderState) -> LeaderState {
        let local = self.leader_state();
        let merged = merge_state(&local, remote);
        if merged.term > local.term {
            self.adopt_term(merged.term, "merged a newer leader view");
            let view = LeaderState {
                is_leader: merged.is_leader && merged.node_id == self.config.node_id,
                ..merged
            };
            let mut leader = self.leader.write();
            if view.term >= leader.term {
                *leader = view.clone();
            }
            return view;
        }
        local
    }

    /// Check leadership claims from peers against ours. Claims whose lease
    /// has expired are ignored. A detection halts automated elections and is
    /// escalated.
    pub fn check_split_brain(&self, peer_views: &[LeaderState]) -> Result<()> {
        let now = self.clock.now_ms();
        let views: Vec<LeaderState> = std::iter::once(self.leader_state())
            .chain(peer_views.iter().cloned())
            .filter(|v| !v.is_leader || is_lease_valid(v, now))
            .collect();

        if let Err(e) = self.detector.inspect(&views) {
            if let CoordError::SplitBrainDetected { term, leaders } = &e {
                let escalation = Escalation::SplitBrain {
                    term: *term,
                    leaders: leaders.clone(),
                };
                *self.halted.lock() = Some(escalation.clone());
                self.escalate(escalation);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Apply an event batch and write any checkpoints it crosses. A failed
    /// batch leaves no partial state behind.
    pub fn ingest(&self, events: &[Event], cancel: &CancellationToken) -> Result<BatchOutcome> {
        self.checkpoints.apply_or_rollback(&self.engine, events, cancel)
    }

    /// Fetch events above our watermark from `peer` and apply them.
    pub async fn catch_up(&self, peer: &str, cancel: &CancellationToken) -> Result<BatchOutcome> {
        let breaker = self.breakers.get(peer);
        let after = self.engine.watermark();
        let transport = self.transport.clone();
        let events = retry_with_breaker(
            &breaker,
            &self.backoff,
            cancel,
            Some(&self.peer_calls),
            |_| {
                let transport = transport.clone();
                let peer = peer.to_string();
                async move { transport.fetch_events(peer, after).await }
            },
        )
        .await?;
        tracing::info!(peer, after, fetched = events.len(), "Fetched events from peer");
        self.ingest(&events, cancel)
    }

    /// Rebuild replay state from the latest checkpoint plus the logged tail.
    pub fn recover(&self) -> Result<ReplayedState> {
        let state = self.checkpoints.recover()?;
        self.engine.restore(state.clone());
        tracing::info!(
            node_id = %self.config.node_id,
            watermark = state.watermark,
            applied = state.applied,
            checkpoint = self.checkpoints.latest().map(|c| c.sequence),
            "Recovered replay state"
        );
        Ok(state)
    }

    /// Compare our replayed state with a peer's. Divergence is escalated.
    pub fn verify_convergence(&self, remote: &ReplayedState) -> Result<()> {
        let local = self.engine.snapshot();
        if let Err(e) = check_convergence(&local, remote) {
            if let CoordError::ReplayDivergence { local, remote } = &e {
                self.escalate(Escalation::ReplayDivergence {
                    local: local.clone(),
                    remote: remote.clone(),
                });
            }
            return Err(e);
        }
        Ok(())
    }

    /// Main loop: leaders renew their lease, followers without a live leader
    /// start elections. Returns when `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let election = &self.config.election;
        let heartbeat = Duration::from_millis((election.lease_ttl_ms / 3).max(1));

        loop {
            let wait = if self.holds_lease() {
                heartbeat
            } else {
                random_election_timeout(
                    election.election_timeout_min_ms,
                    election.election_timeout_max_ms,
                )
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            if self.halted().is_some() {
                tracing::debug!(node_id = %self.config.node_id, "Halted, waiting for operator");
                continue;
            }

            let leader = self.leader_state();
            let result = if leader.is_leader && leader.node_id == self.config.node_id {
                self.renew_lease(&cancel).await.map(|_| ())
            } else if leader.has_leader() && is_lease_valid(&leader, self.clock.now_ms()) {
                Ok(())
            } else {
                self.elect_with_retry(&cancel).await.map(|_| ())
            };

            match result {
                Ok(()) => {}
                Err(CoordError::Cancelled(_)) => break,
                Err(e) => tracing::warn!(node_id = %self.config.node_id, error = %e, "Coordinator step failed"),
            }
        }

        tracing::info!(node_id = %self.config.node_id, "Coordinator stopping");
        self.breakers.persist_all()
    }

    /// Call every peer concurrently through its breaker. Replies arriving after
    /// the round timeout are dropped; failures are counted and skipped.
    async fn fan_out<T, F, Fut>(&self, cancel: &CancellationToken, call: F) -> Result<Vec<(NodeId, T)>>
    where
        T: Send + 'static,
        F: Fn(NodeId) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let round_timeout = Duration::from_millis(self.config.election.round_timeout_ms);
        let (tx, mut rx) = mpsc::channel(self.config.peers.len().max(1));

        for peer in &self.config.peers {
            let breaker = self.breakers.get(peer);
            let call = call(peer.clone());
            let peer = peer.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let admission = match breaker.admit() {
                    Ok(admission) => admission,
                    Err(e) => {
                        tracing::debug!(peer = %peer, error = %e, "Skipping peer");
                        return;
                    }
                };
                let result = match tokio::time::timeout(round_timeout, call).await {
                    Ok(result) => result,
                    Err(_) => Err(CoordError::Transport(format!("{peer} timed out"))),
                };
                match &result {
                    Ok(_) => admission.success(),
                    Err(_) => admission.failure(),
                }
                let _ = tx.send((peer, result)).await;
            });
        }
        drop(tx);

        let deadline = tokio::time::sleep(round_timeout);
        tokio::pin!(deadline);
        let mut replies = Vec::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(CoordError::Cancelled(None)),
                _ = &mut deadline => {
                    tracing::warn!(received = replies.len(), "Round timed out, using replies received");
                    break;
                }
                message = rx.recv() => match message {
                    Some((peer, Ok(reply))) => {
                        self.peer_calls.record(true);
                        replies.push((peer, reply));
                    }
                    Some((peer, Err(e))) => {
                        self.peer_calls.record(false);
                        tracing::warn!(peer = %peer, error = %e, "Peer call failed");
                    }
                    None => break,
                }
            }
        }
        Ok(replies)
    }

    fn ensure_active(&self) -> Result<()> {
        match self.halted.lock().as_ref() {
            Some(escalation) => Err(escalation.to_error()),
            None => Ok(()),
        }
    }

    fn adopt_term(&self, term: Term, reason: &str) {
        if self.terms.observe(term) {
            self.persist_term(term);
        }
        self.step_down(term, reason);
    }

    fn persist_term(&self, term: Term) {
        if let Err(e) = put_json(self.store.as_ref(), &term_key(&self.config.node_id), &term) {
            tracing::warn!(term, error = %e, "Failed to persist term");
        }
    }

    /// Grant or refuse `req` through the voter. A newly granted vote is
    /// persisted before it is returned; if that write fails the vote is withdrawn.
    fn cast_vote(&self, req: &VoteRequest) -> VoteResponse {
        let mut voter = self.voter.lock();
        let current = self.terms.current();
        if current > voter.current_term {
            voter.current_term = current;
            voter.voted_for = None;
        }
        let before = voter.ballot();
        let mut response = voter.handle_vote_request(req);
        if response.vote.is_none() || voter.ballot() == before {
            return response;
        }

        let ballot = voter.ballot();
        if let Err(e) = put_json(self.store.as_ref(), &ballot_key(&self.config.node_id), &ballot) {
            tracing::warn!(term = ballot.term, error = %e, "Failed to persist vote, withdrawing it");
            if ballot.term == before.term {
                voter.voted_for = before.voted_for;
            } else {
                voter.voted_for = None;
            }
            response.vote = None;
        }
        response
    }

    fn escalate(&self, escalation: Escalation) {
        tracing::error!(node_id = %self.config.node_id, ?escalation, "Escalating to operator");
        if let Err(e) = self.escalations.try_send(escalation) {
            tracing::warn!(error = %e, "Escalation channel unavailable");
        }
    }

    /// Our lease promise: while a live leader other than `candidate` holds a
    /// lease we acknowledged, no vote is granted.
    fn lease_blocks(&self, candidate: &str) -> bool {
        let leader = self.leader.read();
        leader.has_leader()
            && leader.node_id != candidate
            && is_lease_valid(&leader, self.clock.now_ms())
    }
}

impl PeerHandler for Coordinator {
    fn handle_vote_request(&self, req: &VoteRequest) -> VoteResponse {
        if self.lease_blocks(&req.candidate_id) {
            tracing::debug!(
                candidate = %req.candidate_id,
                term = req.term,
                "Vote refused while a leader lease is live"
            );
            return VoteResponse {
                voter_id: self.config.node_id.clone(),
                term: self.terms.current(),
                vote: None,
            };
        }

        if req.term > self.terms.current() {
            self.adopt_term(req.term, "vote request with higher term");
        }
        self.cast_vote(req)
    }

    fn handle_heartbeat(&self, beat: &Heartbeat) -> HeartbeatAck {
        let current = self.terms.current();
        if beat.term < current {
            return HeartbeatAck {
                node_id: self.config.node_id.clone(),
                term: current,
                accepted: false,
            };
        }
        if self.terms.observe(beat.term) {
            self.persist_term(beat.term);
        }

        let mut leader = self.leader.write();
        if leader.is_leader && beat.leader_id != self.config.node_id {
            tracing::info!(
                node_id = %self.config.node_id,
                leader = %beat.leader_id,
                term = beat.term,
                "Following newer leader"
            );
        }
        *leader = LeaderState {
            node_id: beat.leader_id.clone(),
            term: beat.term,
            is_leader: beat.leader_id == self.config.node_id,
            lease_expiry: beat.lease_expiry,
        };
        HeartbeatAck {
            node_id: self.config.node_id.clone(),
            term: beat.term,
            accepted: true,
        }
    }

    fn events_after(&self, after: u64) -> Vec<Event> {
        self.checkpoints.tail_after(after)
    }
}

fn term_key(node_id: &str) -> String {
    format!("{node_id}-term")
}

fn ballot_key(node_id: &str) -> String {
    format!("{node_id}-ballot")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use crate::transport::LocalNetwork;

    fn single_node(clock: Arc<ManualClock>) -> Coordinator {
        let network = LocalNetwork::new();
        let (coordinator, _rx) = Coordinator::new(
            CoordinatorConfig::new("n1"),
            clock,
            network.endpoint("n1"),
            Arc::new(MemoryStore::new()),
        )
        .unwrap();
        coordinator
    }

    #[tokio::test]
    async fn test_single_node_elects_itself() {
        let clock = Arc::new(ManualClock::new(1_000));
        let coordinator = single_node(clock);
        let outcome = coordinator
            .run_election_round(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.leader.node_id, "n1");
        assert_eq!(coordinator.term(), 1);
        assert_eq!(coordinator.role(), Role::Leader);
        assert!(coordinator.holds_lease());
    }

    #[tokio::test]
    async fn test_lease_expiry_steps_down() {
        let clock = Arc::new(ManualClock::new(1_000));
        let coordinator = single_node(clock.clone());
        coordinator
            .run_election_round(&CancellationToken::new())
            .await
            .unwrap();

        clock.advance(coordinator.config().election.lease_ttl_ms);
        assert!(!coordinator.holds_lease());
        let renewed = coordinator.renew_lease(&CancellationToken::new()).await.unwrap();
        assert!(!renewed);
        assert!(!coordinator.leader_state().is_leader);
        assert_eq!(coordinator.role(), Role::Follower);
    }

    #[tokio::test]
    async fn test_single_node_renews_lease() {
        let clock = Arc::new(ManualClock::new(1_000));
        let coordinator = single_node(clock.clone());
        coordinator
            .run_election_round(&CancellationToken::new())
            .await
            .unwrap();
        clock.advance(100);
        assert!(coordinator.renew_lease(&CancellationToken::new()).await.unwrap());
        assert_eq!(
            coordinator.leader_state().lease_expiry,
            1_100 + coordinator.config().election.lease_ttl_ms
        );
    }

    #[test]
    fn test_merge_view_adopts_higher_term() {
        let coordinator = single_node(Arc::new(ManualClock::new(0)));
        let remote = LeaderState {
            node_id: "n2".into(),
            term: 4,
            is_leader: true,
            lease_expiry: 500,
        };
        let merged = coordinator.merge_view(&remote);
        assert_eq!(merged.node_id, "n2");
        assert!(!merged.is_leader);
        assert_eq!(coordinator.term(), 4);

        let older = LeaderState {
            term: 2,
            ..remote
        };
        assert_eq!(coordinator.merge_view(&older).term, 4);
    }

    #[test]
    fn test_term_survives_restart() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        put_json(store.as_ref(), &term_key("n1"), &19u64).unwrap();
        let network = LocalNetwork::new();
        let (coordinator, _rx) = Coordinator::new(
            CoordinatorConfig::new("n1"),
            Arc::new(ManualClock::new(0)),
            network.endpoint("n1"),
            store,
        )
        .unwrap();
        assert_eq!(coordinator.term(), 19);
    }

    #[test]
    fn test_heartbeat_from_stale_term_rejected() {
        let coordinator = single_node(Arc::new(ManualClock::new(0)));
        coordinator.terms.observe(5);
        let ack = coordinator.handle_heartbeat(&Heartbeat {
            term: 3,
            leader_id: "n2".into(),
            lease_expiry: 100,
        });
        assert!(!ack.accepted);
        assert_eq!(ack.term, 5);
    }
}
