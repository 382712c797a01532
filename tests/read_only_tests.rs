//! Read-only operation tests: linearizable reads, lease-based reads, and
//! lease expiry.


use std::time::Duration;

use raft_lite::{OperationType, RaftError};
use test_harness::TestCluster;

/// A linearizable read is served after a heartbeat quorum confirms
/// leadership, and observes previously committed operations.
#[tokio::test]
async fn test_linearizable_read() {
    let cluster = TestCluster::new(3).await;
    cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("leader should be elected");

    cluster
        .submit(&[0x01], OperationType::Replicated)
        .await
        .expect("write should be applied");

    let result = cluster
        .submit(&[0x99], OperationType::LinearizableReadOnly)
        .await
        .expect("linearizable read should be served");
    assert_eq!(result.response, vec![0x99]);
    assert!(
        result.operation.read_index >= 2,
        "the read must observe the committed write"
    );

    cluster.stop_all().await;
}

/// A lease-based read on a healthy leader is served from the renewed lease.
#[tokio::test]
async fn test_lease_based_read() {
    let cluster = TestCluster::new(3).await;
    cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("leader should be elected");

    cluster
        .submit(&[0x02], OperationType::Replicated)
        .await
        .expect("write should be applied");

    // Heartbeat rounds renew the lease continuously on a healthy cluster.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let result = cluster
        .submit(&[0x42], OperationType::LeaseBasedReadOnly)
        .await
        .expect("lease-based read should be served");
    assert_eq!(result.response, vec![0x42]);

    cluster.stop_all().await;
}

/// A leader that lost heartbeat quorum serves lease-based reads with
/// `InvalidLease` once the lease expires.
#[tokio::test]
async fn test_lease_read_after_quorum_loss() {
    let cluster = TestCluster::new(3).await;
    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("leader should be elected");

    cluster
        .submit(&[0x03], OperationType::Replicated)
        .await
        .expect("write should be applied");

    // Cut the leader off and let its lease run out. It keeps believing it
    // is the leader, since no higher term ever reaches it.
    cluster.router.isolate(&leader);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let result = cluster
        .get(&leader)
        .node
        .submit_operation(
            vec![0x42],
            OperationType::LeaseBasedReadOnly,
            Duration::from_secs(2),
        )
        .await
        .recv()
        .await;

    match result {
        Err(RaftError::InvalidLease { server_id }) => assert_eq!(server_id, leader),
        other => panic!(
            "expected InvalidLease, got {:?}",
            other.map(|r| r.response)
        ),
    }

    cluster.stop_all().await;
}

/// Read-only operations submitted to a follower resolve with NotLeader.
#[tokio::test]
async fn test_read_on_follower_returns_not_leader() {
    let cluster = TestCluster::new(3).await;
    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("leader should be elected");

    let follower = cluster
        .nodes
        .keys()
        .find(|id| **id != leader)
        .unwrap()
        .clone();

    for operation_type in [
        OperationType::LeaseBasedReadOnly,
        OperationType::LinearizableReadOnly,
    ] {
        let result = cluster
            .get(&follower)
            .node
            .submit_operation(vec![0x10], operation_type, Duration::from_secs(1))
            .await
            .recv()
            .await;
        assert!(
            matches!(result, Err(RaftError::NotLeader { .. })),
            "{operation_type} submitted to a follower must be rejected"
        );
    }

    cluster.stop_all().await;
}

/// Linearizable reads submitted while a verification round is in flight are
/// confirmed by that round and all served.
#[tokio::test]
async fn test_concurrent_linearizable_reads() {
    let cluster = TestCluster::new(3).await;
    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("leader should be elected");

    cluster
        .submit(&[0x04], OperationType::Replicated)
        .await
        .expect("write should be applied");

    let node = &cluster.get(&leader).node;
    let mut futures = Vec::new();
    for n in 0u8..4 {
        futures.push(
            node.submit_operation(
                vec![0x20 + n],
                OperationType::LinearizableReadOnly,
                Duration::from_secs(2),
            )
            .await,
        );
    }

    for (n, future) in futures.into_iter().enumerate() {
        let result = future.recv().await.expect("read should be served");
        assert_eq!(result.response, vec![0x20 + n as u8]);
    }

    cluster.stop_all().await;
}
