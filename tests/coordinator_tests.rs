//! Single-coordinator tests on a scripted transport.
//!
//! Each peer's reply is fixed up front so rounds see exact ballots: stale and
//! future votes, failing and slow peers, cancellation, split-brain halts,
//! catch-up through a breaker and replay divergence.


use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use quorum_replay::clock::ManualClock;
use quorum_replay::election::{LeaderState, Role, RoundId, Vote, VoteRequest};
use quorum_replay::replay::{replay, Event, ReplayedState};
use quorum_replay::resilience::{CircuitStatus, DegradationLevel};
use quorum_replay::store::{KvStore, MemoryStore};
use quorum_replay::transport::{Heartbeat, PeerHandler};
use quorum_replay::{CoordError, Coordinator, Escalation};
use test_harness::{event, scripted_coordinator, test_config, ScriptedReply, ScriptedTransport};

fn workload(count: u64) -> Vec<Event> {
    (1..=count)
        .map(|v| event(&format!("k{v}"), v, &format!("f{}", v % 5), v as i64))
        .collect()
}

/// Test 1: A round at term 20 counts fresh ballots and drops the stale one
#[tokio::test]
async fn test_round_drops_stale_ballot() {
    let config = test_config("n5", &["n1", "n2", "n3", "n4"]);
    let (coordinator, transport, _clock, _rx) = scripted_coordinator(config, 10_000);

    // Learn term 19 from an old leader whose lease has lapsed.
    coordinator.merge_view(&LeaderState {
        node_id: "n2".into(),
        term: 19,
        is_leader: true,
        lease_expiry: 0,
    });
    transport.script("n4", ScriptedReply::Vote(Vote::new("n2", "n4", 15)));

    let outcome = coordinator
        .run_election_round(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.leader.node_id, "n5");
    assert_eq!(outcome.leader.term, 20);
    assert_eq!(outcome.votes_for_leader, 4);
    assert_eq!(outcome.counted, 4);
    assert_eq!(outcome.stale, 1);
    assert_eq!(outcome.required, 3);
    assert_eq!(coordinator.role(), Role::Leader);
    assert_eq!(
        coordinator.leader_state().lease_expiry,
        10_000 + coordinator.config().election.lease_ttl_ms
    );

    // The new leader announced its lease right away.
    let beats = transport.heartbeats.lock();
    assert_eq!(beats.len(), 4);
    assert!(beats.iter().all(|(_, b)| b.term == 20 && b.leader_id == "n5"));
}

/// Test 2: A peer reporting a higher term ends the round and the candidacy
#[tokio::test]
async fn test_higher_term_refusal_aborts_round() {
    let config = test_config("n1", &["n2", "n3", "n4", "n5"]);
    let (coordinator, transport, _clock, _rx) = scripted_coordinator(config, 0);
    transport.script("n3", ScriptedReply::Refuse(30));

    let err = coordinator
        .run_election_round(&CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, CoordError::QuorumNotReached { term: 1, .. }));
    assert_eq!(coordinator.term(), 30);
    assert_eq!(coordinator.role(), Role::Follower);
    assert!(!coordinator.leader_state().is_leader);
}

/// Test 3: A ballot from a future term is not counted and the term is adopted
#[tokio::test]
async fn test_future_ballot_adopts_term() {
    let config = test_config("n1", &["n2", "n3"]);
    let (coordinator, transport, _clock, _rx) = scripted_coordinator(config, 0);
    transport.script("n2", ScriptedReply::Vote(Vote::new("n1", "n2", 7)));

    let result = coordinator.run_election_round(&CancellationToken::new()).await;

    assert!(result.is_err());
    assert_eq!(coordinator.term(), 7);

    // The next round starts above the adopted term.
    transport.script("n2", ScriptedReply::Refuse(0));
    let outcome = coordinator
        .run_election_round(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.leader.term, 8);
    assert_eq!(outcome.votes_for_leader, 2);
}

/// Test 4: Slow peers miss the round timeout; the round concludes without them
#[tokio::test]
async fn test_round_timeout_uses_replies_received() {
    let config = test_config("n1", &["n2", "n3", "n4", "n5"]);
    let (coordinator, transport, _clock, _rx) = scripted_coordinator(config, 0);
    for peer in ["n2", "n3"] {
        transport.script(
            peer,
            ScriptedReply::Delayed(
                Duration::from_millis(500),
                Box::new(ScriptedReply::Vote(Vote::new("n1", peer, 1))),
            ),
        );
    }

    let started = tokio::time::Instant::now();
    let outcome = coordinator
        .run_election_round(&CancellationToken::new())
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_millis(400));
    assert_eq!(outcome.counted, 3);
    assert_eq!(outcome.leader.node_id, "n1");
}

/// Test 5: Cancelling a round mid-flight returns Cancelled
#[tokio::test]
async fn test_cancel_interrupts_round() {
    let mut config = test_config("n1", &["n2", "n3"]);
    config.election.round_timeout_ms = 5_000;
    let (coordinator, transport, _clock, _rx) = scripted_coordinator(config, 0);
    for peer in ["n2", "n3"] {
        transport.script(
            peer,
            ScriptedReply::Delayed(Duration::from_secs(10), Box::new(ScriptedReply::Fail)),
        );
    }

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });

    let result = coordinator.run_election_round(&cancel).await;
    assert!(matches!(result, Err(CoordError::Cancelled(None))));
    assert_eq!(coordinator.role(), Role::Follower);
}

/// Test 6: Failing peers trip their breakers and later rounds skip them
#[tokio::test]
async fn test_failing_peers_open_breakers() {
    let mut config = test_config("n1", &["n2", "n3", "n4", "n5"]);
    config.breaker.failure_threshold = 2;
    config.breaker.cooldown_ms = 60_000;
    let (coordinator, transport, _clock, _rx) = scripted_coordinator(config, 0);
    for peer in ["n2", "n3", "n4"] {
        transport.script(peer, ScriptedReply::Fail);
    }

    for _ in 0..3 {
        let result = coordinator.run_election_round(&CancellationToken::new()).await;
        assert!(matches!(result, Err(CoordError::QuorumNotReached { votes: 2, needed: 3, .. })));
    }

    for peer in ["n2", "n3", "n4"] {
        assert_eq!(coordinator.breakers().get(peer).status(), CircuitStatus::Open);
    }
    assert_eq!(coordinator.breakers().get("n5").status(), CircuitStatus::Closed);

    let requests = transport.vote_requests.lock();
    assert_eq!(requests.iter().filter(|(peer, _)| peer == "n2").count(), 2);
    assert_eq!(requests.iter().filter(|(peer, _)| peer == "n5").count(), 3);
    drop(requests);
    assert_eq!(coordinator.degradation(), DegradationLevel::Critical);
}

/// Test 7: Retried rounds back off and stop after max_rounds
#[tokio::test]
async fn test_elect_with_retry_gives_up() {
    let mut config = test_config("n1", &["n2", "n3"]);
    config.election.max_rounds = 3;
    config.breaker.failure_threshold = 100;
    let (coordinator, transport, _clock, _rx) = scripted_coordinator(config, 0);
    transport.script("n2", ScriptedReply::Refuse(0));
    transport.script("n3", ScriptedReply::Refuse(0));

    let result = coordinator.elect_with_retry(&CancellationToken::new()).await;

    assert!(matches!(result, Err(CoordError::QuorumNotReached { .. })));
    assert_eq!(coordinator.term(), 3);
    assert_eq!(transport.vote_requests.lock().len(), 6);
}

/// Test 8: A voter keeps its lease promise until the lease lapses
#[tokio::test]
async fn test_live_lease_blocks_votes() {
    let config = test_config("n1", &["n2", "n3"]);
    let (coordinator, _transport, clock, _rx) = scripted_coordinator(config, 1_000);

    let ack = coordinator.handle_heartbeat(&Heartbeat {
        term: 3,
        leader_id: "n2".into(),
        lease_expiry: 1_300,
    });
    assert!(ack.accepted);
    assert_eq!(coordinator.term(), 3);

    let request = VoteRequest {
        round: RoundId::new(),
        term: 4,
        candidate_id: "n3".into(),
    };
    let refused = coordinator.handle_vote_request(&request);
    assert!(refused.vote.is_none());
    assert_eq!(refused.term, 3);

    clock.set(1_300);
    let granted = coordinator.handle_vote_request(&request);
    assert_eq!(granted.vote, Some(Vote::new("n3", "n1", 4)));
    assert_eq!(coordinator.term(), 4);

    // One vote per term.
    let rival = VoteRequest {
        round: RoundId::new(),
        term: 4,
        candidate_id: "n2".into(),
    };
    assert!(coordinator.handle_vote_request(&rival).vote.is_none());
}

/// Test 9: Two live leadership claims halt elections until an operator resumes
#[tokio::test]
async fn test_split_brain_halts_and_escalates() {
    let config = test_config("n1", &["n2", "n3"]);
    let (coordinator, _transport, _clock, mut escalations) = scripted_coordinator(config, 1_000);
    coordinator
        .run_election_round(&CancellationToken::new())
        .await
        .unwrap();

    // An expired claim is not a split brain.
    let expired = LeaderState {
        node_id: "n2".into(),
        term: 2,
        is_leader: true,
        lease_expiry: 900,
    };
    assert!(coordinator.check_split_brain(&[expired.clone()]).is_ok());

    let live = LeaderState {
        lease_expiry: 5_000,
        ..expired
    };
    match coordinator.check_split_brain(&[live]) {
        Err(CoordError::SplitBrainDetected { term, leaders }) => {
            assert_eq!(term, 2);
            assert_eq!(leaders, vec!["n1".to_string(), "n2".to_string()]);
        }
        other => panic!("expected split brain, got {other:?}"),
    }
    assert_eq!(coordinator.split_brain_detections(), 1);
    assert!(matches!(
        escalations.try_recv(),
        Ok(Escalation::SplitBrain { term: 2, .. })
    ));

    let halted = coordinator.run_election_round(&CancellationToken::new()).await;
    assert!(matches!(halted, Err(CoordError::SplitBrainDetected { .. })));

    coordinator.resume();
    assert!(coordinator.halted().is_none());
    assert!(coordinator
        .run_election_round(&CancellationToken::new())
        .await
        .is_ok());
}

/// Test 10: Catch-up retries transient fetch failures and checkpoints the result
#[tokio::test]
async fn test_catch_up_retries_fetch() {
    let config = test_config("n1", &["n2"]);
    let (coordinator, transport, _clock, _rx) = scripted_coordinator(config, 0);
    transport.serve_events("n2", workload(150));
    transport.fail_fetches("n2", 2);

    let outcome = coordinator
        .catch_up("n2", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.applied, 150);
    assert_eq!(coordinator.engine().watermark(), 150);
    assert_eq!(coordinator.checkpoints().sequences(), vec![100]);
    assert_eq!(coordinator.breakers().get("n2").status(), CircuitStatus::Closed);

    // Nothing new above the watermark.
    let again = coordinator
        .catch_up("n2", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(again.applied, 0);
}

/// Test 11: A persistently failing peer opens its breaker and catch-up fails fast
#[tokio::test]
async fn test_catch_up_fails_fast_when_open() {
    let mut config = test_config("n1", &["n2"]);
    config.breaker.failure_threshold = 2;
    config.breaker.cooldown_ms = 60_000;
    let (coordinator, transport, _clock, _rx) = scripted_coordinator(config, 0);
    transport.fail_fetches("n2", u32::MAX);

    let first = coordinator.catch_up("n2", &CancellationToken::new()).await;
    assert!(matches!(first, Err(CoordError::CircuitOpen(ref dep)) if dep == "n2"));

    let started = tokio::time::Instant::now();
    let second = coordinator.catch_up("n2", &CancellationToken::new()).await;
    assert!(matches!(second, Err(CoordError::CircuitOpen(_))));
    assert!(started.elapsed() < Duration::from_millis(20));
    assert_eq!(coordinator.engine().watermark(), 0);
}

/// Test 12: Divergent replay state is escalated, matching state is not
#[tokio::test]
async fn test_convergence_check_escalates_divergence() {
    let config = test_config("n1", &[]);
    let (coordinator, _transport, _clock, mut escalations) = scripted_coordinator(config, 0);
    coordinator
        .ingest(&workload(40), &CancellationToken::new())
        .unwrap();

    let same = replay(&workload(40), &ReplayedState::default()).unwrap();
    assert!(coordinator.verify_convergence(&same).is_ok());
    assert!(escalations.try_recv().is_err());

    let other = replay(&workload(39), &ReplayedState::default()).unwrap();
    assert!(matches!(
        coordinator.verify_convergence(&other),
        Err(CoordError::ReplayDivergence { .. })
    ));
    assert!(matches!(
        escalations.try_recv(),
        Ok(Escalation::ReplayDivergence { .. })
    ));
}

/// Test 13: Term, breaker counters and checkpoints survive a restart
#[tokio::test]
async fn test_state_survives_restart() {
    let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(0));
    let mut config = test_config("n1", &["n2", "n3"]);
    config.breaker.failure_threshold = 1;
    config.breaker.cooldown_ms = 60_000;
    config.checkpoint.interval = 50;

    {
        let transport = ScriptedTransport::new();
        transport.script("n3", ScriptedReply::Fail);
        let (coordinator, _rx) =
            Coordinator::new(config.clone(), clock.clone(), transport, store.clone()).unwrap();
        coordinator
            .run_election_round(&CancellationToken::new())
            .await
            .unwrap();
        coordinator
            .ingest(&workload(120), &CancellationToken::new())
            .unwrap();
        coordinator.breakers().persist_all().unwrap();
    }

    let (restarted, _rx) =
        Coordinator::new(config, clock, ScriptedTransport::new(), store).unwrap();
    assert_eq!(restarted.term(), 1);
    assert_eq!(restarted.breakers().get("n3").status(), CircuitStatus::Open);
    assert_eq!(restarted.checkpoints().sequences(), vec![50, 100]);
    assert_eq!(restarted.engine().watermark(), 100);
    assert_eq!(restarted.role(), Role::Follower);
}

/// Test 14: A vote granted before a restart still binds the term afterwards
#[tokio::test]
async fn test_vote_survives_restart() {
    let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(0));
    let config = test_config("n2", &["n1", "n3"]);
    let request = |candidate: &str, term| VoteRequest {
        round: RoundId::new(),
        term,
        candidate_id: candidate.into(),
    };

    {
        let (coordinator, _rx) = Coordinator::new(
            config.clone(),
            clock.clone(),
            ScriptedTransport::new(),
            store.clone(),
        )
        .unwrap();
        let granted = coordinator.handle_vote_request(&request("n1", 5));
        assert_eq!(granted.vote, Some(Vote::new("n1", "n2", 5)));
    }

    let (restarted, _rx) =
        Coordinator::new(config, clock, ScriptedTransport::new(), store).unwrap();
    assert_eq!(restarted.term(), 5);
    assert!(restarted.handle_vote_request(&request("n3", 5)).vote.is_none());
    assert_eq!(
        restarted.handle_vote_request(&request("n1", 5)).vote,
        Some(Vote::new("n1", "n2", 5))
    );
    assert_eq!(
        restarted.handle_vote_request(&request("n3", 6)).vote,
        Some(Vote::new("n3", "n2", 6))
    );
}
