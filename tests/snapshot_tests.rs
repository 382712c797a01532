//! Snapshotting tests: compaction on the leader, restart recovery, and
//! follower catch-up through snapshot installation.


use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use raft_lite::{OperationType, RaftNode, StateMachine};
use test_harness::{
    assert_eventually, test_config, ClusterRouter, EchoStateMachine, RouterTransport, TestCluster,
};

async fn start_single_node(
    router: &Arc<ClusterRouter>,
    dir: &TempDir,
    snapshot_threshold: usize,
) -> (Arc<RaftNode>, Arc<EchoStateMachine>) {
    let fsm = EchoStateMachine::with_snapshot_threshold(snapshot_threshold);
    let transport = Arc::new(RouterTransport::new(Arc::clone(router), "node-1"));
    let node = RaftNode::new(
        "node-1",
        vec!["node-1".to_string()],
        dir.path(),
        fsm.clone() as Arc<dyn StateMachine>,
        transport,
        test_config(),
    )
    .unwrap();
    router.register("node-1", Arc::clone(&node));
    node.start().await.unwrap();
    (node, fsm)
}

/// A node that snapshotted and compacted its log restores the state machine
/// and replays the tail after a restart.
#[tokio::test]
async fn test_snapshot_survives_restart() {
    test_harness::init_tracing();
    let router = ClusterRouter::new();
    let dir = TempDir::new().unwrap();
    let (node, fsm) = start_single_node(&router, &dir, 5).await;

    let payloads: Vec<Vec<u8>> = (1u8..=6).map(|n| vec![n]).collect();
    for payload in &payloads {
        let result = node
            .submit_operation(
                payload.clone(),
                OperationType::Replicated,
                Duration::from_secs(2),
            )
            .await
            .recv()
            .await
            .expect("operation should be applied");
        assert_eq!(result.response, *payload);
    }
    assert_eq!(fsm.applied(), payloads);

    node.stop().await;

    // Reopen on the same data directory with a fresh state machine.
    let (restarted, restarted_fsm) = start_single_node(&router, &dir, 5).await;
    assert_eventually(
        || async { restarted_fsm.applied() == payloads },
        Duration::from_secs(5),
        "restart should restore the snapshot and replay the tail",
    )
    .await;

    let status = restarted.status().await;
    assert!(status.last_applied >= 7, "NoOp plus six operations");

    restarted.stop().await;
}

/// A follower that lagged past the leader's compaction frontier is caught
/// up with a snapshot and then serves normal replication again.
#[tokio::test]
async fn test_follower_catches_up_via_snapshot() {
    let cluster = TestCluster::builder(3).snapshot_threshold(4).start().await;
    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("leader should be elected");

    let lagging = cluster
        .nodes
        .keys()
        .find(|id| **id != leader)
        .unwrap()
        .clone();
    cluster.router.isolate(&lagging);

    // Enough traffic to push the leader's compaction frontier past
    // everything the lagging follower has.
    let payloads: Vec<Vec<u8>> = (1u8..=6).map(|n| vec![n]).collect();
    for payload in &payloads {
        cluster
            .submit(payload, OperationType::Replicated)
            .await
            .expect("operation should be applied");
    }

    cluster.router.heal_node(&lagging);

    let expected = payloads.clone();
    assert_eventually(
        || async { cluster.get(&lagging).fsm.applied() == expected },
        Duration::from_secs(5),
        "the lagging follower should be restored from a snapshot",
    )
    .await;
    assert!(cluster.get(&lagging).last_applied().await >= 7);

    // Replication continues normally after the installation.
    cluster
        .submit(&[0x0A], OperationType::Replicated)
        .await
        .expect("operation should be applied");
    assert_eventually(
        || async { cluster.get(&lagging).fsm.applied().contains(&vec![0x0A]) },
        Duration::from_secs(5),
        "appends after the snapshot should reach the follower",
    )
    .await;

    cluster.stop_all().await;
}

/// A briefly disconnected follower catches up through ordinary conflict
/// hints when the log has not been compacted underneath it.
#[tokio::test]
async fn test_lagging_follower_catches_up_without_snapshot() {
    let cluster = TestCluster::new(3).await;
    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("leader should be elected");

    let lagging = cluster
        .nodes
        .keys()
        .find(|id| **id != leader)
        .unwrap()
        .clone();
    cluster.router.isolate(&lagging);

    for payload in [[0x01], [0x02], [0x03]] {
        cluster
            .submit(&payload, OperationType::Replicated)
            .await
            .expect("operation should be applied");
    }

    cluster.router.heal_node(&lagging);

    assert_eventually(
        || async {
            cluster.get(&lagging).fsm.applied() == vec![vec![0x01], vec![0x02], vec![0x03]]
        },
        Duration::from_secs(5),
        "the follower should catch up from the leader's log",
    )
    .await;

    cluster.stop_all().await;
}
