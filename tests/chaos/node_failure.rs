//! Chaos test: servers drop off the network while objects stabilize.
//!
//! Nothing is lost while a server is away: nursery copies stay put until
//! every primary has been reached, and the cluster converges once the
//! server is back.

use axum::http::StatusCode;
use strata_integration_tests::{TestCluster, test_data, ts};
use strata_types::NURSERY_SHARD;

#[tokio::test]
async fn test_replicated_write_waits_for_missing_primary() {
    let c = TestCluster::replicated(4, 3);
    let data = test_data(2000);
    let timestamp = ts(5);
    c.peers.set_down(3, true);
    for id in [1, 2] {
        assert_eq!(c.put_object(id, "obj", &timestamp, &data).await, StatusCode::CREATED);
    }

    for _ in 0..3 {
        assert_eq!(c.stabilize(1).await.failed, 1);
        assert_eq!(c.stabilize(2).await.failed, 1);
    }
    assert!(c.rows(1, "obj").await[0].nursery);
    assert!(c.rows(3, "obj").await.is_empty());

    // Reads keep working from the nursery copies.
    let (status, body) = c.get_object(1, "obj").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.to_vec(), data);

    c.peers.set_down(3, false);
    c.stabilize_until_quiet(4).await;
    for id in 1..=3 {
        let rows = c.rows(id, "obj").await;
        assert_eq!(rows.len(), 1, "sd{id}");
        assert!(!rows[0].nursery, "sd{id}");
    }
}

#[tokio::test]
async fn test_handoff_covers_for_a_down_primary() {
    let c = TestCluster::replicated(4, 3);
    let data = test_data(640);
    let timestamp = ts(5);
    c.peers.set_down(3, true);
    // The proxy falls back to the handoff for the unreachable primary.
    for id in [1, 2, 4] {
        assert_eq!(c.put_object(id, "obj", &timestamp, &data).await, StatusCode::CREATED);
    }
    c.stabilize_until_quiet(2).await;
    assert_eq!(c.rows(4, "obj").await.len(), 1, "handoff keeps its copy");

    c.peers.set_down(3, false);
    c.stabilize_until_quiet(4).await;

    assert!(c.rows(4, "obj").await.is_empty());
    let (status, headers) = c.head_object(3, "obj").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["X-Timestamp"], timestamp.as_str());
}

#[tokio::test]
async fn test_erasure_coded_write_survives_shard_holder_outage() {
    let c = TestCluster::erasure_coded(4, 2, 1, 2);
    let data = test_data(3000);
    let timestamp = ts(5);
    for id in [1, 2] {
        assert_eq!(c.put_object(id, "obj", &timestamp, &data).await, StatusCode::CREATED);
    }

    c.peers.set_down(3, true);
    assert_eq!(c.stabilize(1).await.failed, 1);
    assert!(
        c.rows(1, "obj").await.iter().any(|r| r.shard == NURSERY_SHARD),
        "nursery copy must survive a failed encode"
    );
    let (status, body) = c.get_object(2, "obj").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.to_vec(), data);

    c.peers.set_down(3, false);
    c.stabilize_until_quiet(4).await;
    for id in 1..=3 {
        let rows = c.rows(id, "obj").await;
        assert!(rows.iter().all(|r| !r.nursery), "sd{id}: {rows:?}");
        let (status, body) = c.get_object(id, "obj").await;
        assert_eq!(status, StatusCode::OK, "sd{id}");
        assert_eq!(body.to_vec(), data);
    }
}
