//! Integration test: deletes travel from a nursery tombstone to every
//! stable copy.

use axum::http::StatusCode;
use strata_integration_tests::{TestCluster, test_data, ts};

#[tokio::test]
async fn test_client_delete_removes_every_replica() {
    let c = TestCluster::replicated(3, 3);
    c.put_everywhere("obj", &ts(20), &test_data(512)).await;
    c.stabilize_until_quiet(3).await;

    assert_eq!(c.delete_object(1, "obj", &ts(10)).await, StatusCode::NO_CONTENT);
    let (status, _) = c.get_object(1, "obj").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    c.peers.clear();
    let report = c.stabilize(1).await;
    assert_eq!(report.succeeded, 1);
    assert_eq!(c.peers.count("DELETE /shard/"), 2);

    for id in 1..=3 {
        assert!(c.rows(id, "obj").await.is_empty(), "sd{id}");
        let (status, _) = c.get_object(id, "obj").await;
        assert_eq!(status, StatusCode::NOT_FOUND, "sd{id}");
    }
}

#[tokio::test]
async fn test_delete_of_unknown_object_still_settles() {
    let c = TestCluster::replicated(3, 3);
    let timestamp = ts(5);
    for id in 1..=3 {
        assert_eq!(c.nursery_delete(id, "ghost", &timestamp).await, StatusCode::CREATED);
    }

    assert_eq!(c.stabilize_until_quiet(3).await, 1);
    for id in 1..=3 {
        assert!(c.rows(id, "ghost").await.is_empty(), "sd{id}");
    }
}

#[tokio::test]
async fn test_delete_waits_for_unreachable_replicas() {
    let c = TestCluster::replicated(3, 3);
    c.put_everywhere("obj", &ts(20), &test_data(64)).await;
    c.stabilize_until_quiet(3).await;
    assert_eq!(c.delete_object(1, "obj", &ts(10)).await, StatusCode::NO_CONTENT);

    c.peers.set_down(2, true);
    c.peers.set_down(3, true);
    assert_eq!(c.stabilize(1).await.failed, 1);
    let rows = c.rows(1, "obj").await;
    assert!(rows[0].deletion && rows[0].nursery);

    c.peers.set_down(2, false);
    c.peers.set_down(3, false);
    assert_eq!(c.stabilize(1).await.succeeded, 1);
    for id in 1..=3 {
        assert!(c.rows(id, "obj").await.is_empty(), "sd{id}");
    }
}

#[tokio::test]
async fn test_stale_delete_keeps_newer_replica() {
    let c = TestCluster::replicated(3, 3);
    let data = test_data(128);
    // sd1 saw an old delete; the others already hold a newer write.
    assert_eq!(c.nursery_delete(1, "obj", &ts(30)).await, StatusCode::CREATED);
    let timestamp = ts(10);
    for id in [2, 3] {
        assert_eq!(c.put_object(id, "obj", &timestamp, &data).await, StatusCode::CREATED);
    }
    c.stabilize_until_quiet(4).await;

    for id in [2, 3] {
        let (status, body) = c.get_object(id, "obj").await;
        assert_eq!(status, StatusCode::OK, "sd{id}");
        assert_eq!(body.to_vec(), data);
    }
}

#[tokio::test]
async fn test_erasure_coded_delete_removes_every_shard() {
    let c = TestCluster::erasure_coded(4, 2, 1, 2);
    let data = test_data(900);
    let timestamp = ts(20);
    for id in [1, 2] {
        assert_eq!(c.put_object(id, "obj", &timestamp, &data).await, StatusCode::CREATED);
    }
    c.stabilize_until_quiet(3).await;

    assert_eq!(c.nursery_delete(1, "obj", &ts(10)).await, StatusCode::CREATED);
    c.peers.clear();
    assert_eq!(c.stabilize(1).await.succeeded, 1);
    assert_eq!(c.peers.count("DELETE /shard/"), 2);

    for id in 1..=3 {
        assert!(c.rows(id, "obj").await.is_empty(), "sd{id}");
    }
}
