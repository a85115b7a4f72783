//! Multi-node election tests on the in-process network.
//!
//! These tests verify leadership under partitions and crashes: a majority
//! elects, a minority cannot, a cut-off leader loses its lease and the cluster
//! settles on one leader after healing.


use std::time::Duration;

use rand::seq::SliceRandom;
use rand::{rngs::StdRng, SeedableRng};
use tokio_util::sync::CancellationToken;

use quorum_replay::replay::{replay, ReplayedState};
use test_harness::{assert_eventually, event, TestCluster};

/// Test 1: A fresh cluster elects exactly one leader that every node follows
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cluster_elects_single_leader() {
    let cluster = TestCluster::new(3).await;

    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");

    assert_eventually(
        || async {
            cluster.nodes.values().all(|n| {
                let view = n.coordinator.leader_state();
                view.node_id == leader
            })
        },
        Duration::from_secs(3),
        "all nodes should follow the elected leader",
    )
    .await;
    assert_eq!(cluster.count_leaders(), 1);

    cluster.shutdown().await;
}

/// Test 2: Majority partition elects a leader
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_majority_partition_elects_leader() {
    let cluster = TestCluster::new(5).await;
    cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Initial leader should be elected");

    let majority = ["n1", "n2", "n3"];
    let minority = ["n4", "n5"];
    cluster.create_partition(&majority, &minority);

    let leader = cluster
        .wait_for_leader_in_group(&majority, Duration::from_secs(5))
        .await;

    assert!(leader.is_some(), "Majority partition should elect a leader");
    assert!(
        majority.contains(&leader.unwrap().as_str()),
        "Leader should be in the majority partition"
    );

    cluster.shutdown().await;
}

/// Test 3: Minority partition cannot elect a leader
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_minority_partition_cannot_elect_leader() {
    let cluster = TestCluster::new(5).await;
    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Initial leader should be elected");

    // Keep the leader in the majority so a stale lease cannot pass for a minority leader.
    let mut majority: Vec<String> = vec![leader_id.clone()];
    let mut minority: Vec<String> = Vec::new();
    for id in ["n1", "n2", "n3", "n4", "n5"] {
        if id == leader_id {
            continue;
        }
        if majority.len() < 3 {
            majority.push(id.to_string());
        } else {
            minority.push(id.to_string());
        }
    }
    let majority_refs: Vec<&str> = majority.iter().map(|s| s.as_str()).collect();
    let minority_refs: Vec<&str> = minority.iter().map(|s| s.as_str()).collect();
    cluster.create_partition(&majority_refs, &minority_refs);

    tokio::time::sleep(Duration::from_millis(500)).await;

    let minority_leader = cluster
        .wait_for_leader_in_group(&minority, Duration::from_millis(500))
        .await;
    assert!(
        minority_leader.is_none(),
        "Minority partition should not be able to elect a leader"
    );
    assert!(cluster
        .wait_for_leader_in_group(&majority, Duration::from_secs(2))
        .await
        .is_some());

    cluster.shutdown().await;
}

/// Test 4: An isolated leader's lease lapses and the rest elect a successor
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_isolated_leader_fails_over() {
    let cluster = TestCluster::new(5).await;
    let old_leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Initial leader should be elected");
    let old_term = cluster.get_node(&old_leader).unwrap().term();

    cluster.isolate_node(&old_leader);

    let others: Vec<String> = cluster
        .nodes
        .keys()
        .filter(|id| **id != old_leader)
        .cloned()
        .collect();
    let new_leader = cluster
        .wait_for_leader_in_group(&others, Duration::from_secs(5))
        .await
        .expect("Remaining nodes should elect a new leader");
    assert_ne!(new_leader, old_leader);
    assert!(cluster.get_node(&new_leader).unwrap().term() > old_term);

    assert_eventually(
        || async { !cluster.get_node(&old_leader).unwrap().is_leader() },
        Duration::from_secs(2),
        "isolated leader should lose its lease",
    )
    .await;

    cluster.shutdown().await;
}

/// Test 5: After healing, the cluster converges on one leader and one term
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_heal_converges_on_one_leader() {
    let cluster = TestCluster::new(5).await;
    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Initial leader should be elected");

    cluster.isolate_node(&leader);
    tokio::time::sleep(Duration::from_millis(800)).await;
    cluster.heal();

    assert_eventually(
        || async {
            if cluster.count_leaders() != 1 {
                return false;
            }
            let leaders = cluster.leaders();
            cluster
                .nodes
                .values()
                .all(|n| n.coordinator.leader_state().node_id == leaders[0])
        },
        Duration::from_secs(5),
        "healed cluster should agree on a single leader",
    )
    .await;

    let views: Vec<_> = cluster
        .nodes
        .values()
        .map(|n| n.coordinator.leader_state())
        .collect();
    let any = cluster.nodes.values().next().unwrap();
    assert!(any.coordinator.check_split_brain(&views).is_ok());

    cluster.shutdown().await;
}

/// Test 6: A crashed follower does not stop the cluster from keeping a leader
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_crashed_follower_tolerated() {
    let mut cluster = TestCluster::new(3).await;
    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");

    let follower = cluster
        .nodes
        .keys()
        .find(|id| **id != leader)
        .cloned()
        .unwrap();
    assert!(cluster.shutdown_node(&follower));

    // Two of three still acknowledge heartbeats, so the lease keeps renewing.
    tokio::time::sleep(Duration::from_millis(900)).await;
    assert!(cluster
        .wait_for_leader(Duration::from_secs(2))
        .await
        .is_some());

    cluster.shutdown().await;
}

/// Test 7: Every node replays shuffled deliveries to the same digest
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_nodes_converge_on_replay() {
    let cluster = TestCluster::new(3).await;
    let events: Vec<_> = (1..=180u64)
        .map(|v| event(&format!("order-{}", v % 60), v, "total", v as i64))
        .collect();
    let expected = replay(&events, &ReplayedState::default()).unwrap();

    for (i, node) in cluster.nodes.values().enumerate() {
        let mut delivery = events.clone();
        delivery.shuffle(&mut StdRng::seed_from_u64(i as u64));
        let outcome = node
            .coordinator
            .ingest(&delivery, &CancellationToken::new())
            .unwrap();
        assert_eq!(outcome.applied, 60);
        assert_eq!(node.coordinator.checkpoints().sequences(), vec![100]);
    }

    for node in cluster.nodes.values() {
        let state = node.coordinator.engine().snapshot();
        assert_eq!(state.digest(), expected.digest(), "node {}", node.node_id());
        assert!(node.coordinator.verify_convergence(&expected).is_ok());
    }

    cluster.shutdown().await;
}
