//! Integration test: replicated objects through the object server surface.
//!
//! Clients write nursery copies over HTTP; the stabilizer moves them to
//! stable storage by talking to the other servers' routers.

use axum::http::StatusCode;
use strata_integration_tests::{TestCluster, test_data, ts};

/// A proxy wrote every primary: one pass per server stabilizes everything
/// without pushing any data.
#[tokio::test]
async fn test_full_write_stabilizes_in_one_round() {
    let c = TestCluster::replicated(4, 3);
    let data = test_data(4096);
    c.put_everywhere("obj", &ts(5), &data).await;

    assert_eq!(c.stabilize_until_quiet(3).await, 1);
    assert_eq!(c.peers.count("PUT /shard"), 0);

    for id in c.primaries("obj") {
        let rows = c.rows(id, "obj").await;
        assert_eq!(rows.len(), 1, "sd{id}");
        assert!(!rows[0].nursery, "sd{id} should hold a stable copy");

        let (status, body) = c.get_object(id, "obj").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.to_vec(), data);
    }
}

/// Only one primary got the write: stabilizing it pushes stable copies to
/// the others, and the next pass marks its own copy stable.
#[tokio::test]
async fn test_partial_write_is_pushed_to_primaries() {
    let c = TestCluster::replicated(4, 3);
    let data = test_data(1500);
    let timestamp = ts(5);
    assert_eq!(c.put_object(1, "obj", &timestamp, &data).await, StatusCode::CREATED);

    let first = c.stabilize(1).await;
    assert_eq!(first.failed, 1);
    assert_eq!(c.peers.count("PUT /shard/sd2"), 1);
    assert_eq!(c.peers.count("PUT /shard/sd3"), 1);
    assert!(c.rows(1, "obj").await[0].nursery);

    let second = c.stabilize(1).await;
    assert_eq!(second.succeeded, 1);
    assert!(!c.rows(1, "obj").await[0].nursery);

    for id in [2, 3] {
        let (status, headers) = c.head_object(id, "obj").await;
        assert_eq!(status, StatusCode::OK, "sd{id}");
        assert_eq!(headers["X-Timestamp"], timestamp.as_str());
        assert_eq!(headers["Content-Type"], "application/test");
        assert_eq!(headers["Content-Length"], data.len().to_string().as_str());
    }
}

/// A copy written to a handoff is delivered to the primaries and then
/// dropped from the handoff.
#[tokio::test]
async fn test_handoff_copy_moves_to_primaries() {
    let c = TestCluster::replicated(4, 3);
    let data = test_data(700);
    assert_eq!(c.put_object(4, "obj", &ts(5), &data).await, StatusCode::CREATED);

    c.stabilize_until_quiet(3).await;

    assert!(c.rows(4, "obj").await.is_empty(), "handoff copy should be gone");
    for id in 1..=3 {
        let (status, body) = c.get_object(id, "obj").await;
        assert_eq!(status, StatusCode::OK, "sd{id}");
        assert_eq!(body.to_vec(), data);
    }
}

/// An older nursery copy never replaces a newer stable one.
#[tokio::test]
async fn test_newer_version_wins() {
    let c = TestCluster::replicated(3, 3);
    let old = test_data(100);
    let new = test_data(200);
    let old_ts = ts(30);
    let new_ts = ts(10);

    c.put_everywhere("obj", &new_ts, &new).await;
    c.stabilize_until_quiet(3).await;

    // A late write carrying an older timestamp is refused.
    assert_eq!(c.put_object(2, "obj", &old_ts, &old).await, StatusCode::CONFLICT);

    for id in 1..=3 {
        let (_, body) = c.get_object(id, "obj").await;
        assert_eq!(body.len(), new.len(), "sd{id}");
    }
}

/// A metadata POST on one primary reaches the others once stabilized.
#[tokio::test]
async fn test_metadata_update_restabilizes() {
    let c = TestCluster::replicated(3, 3);
    c.put_everywhere("obj", &ts(20), &test_data(64)).await;
    c.stabilize_until_quiet(3).await;

    let post_ts = ts(5);
    let request = axum::http::Request::builder()
        .method("POST")
        .uri(format!("/sd1/{}/a/c/obj", c.partition("obj")))
        .header("X-Timestamp", post_ts.as_str())
        .header("X-Object-Meta-Color", "blue")
        .body(axum::body::Body::empty())
        .unwrap();
    let (status, _, _) = c.send(1, request).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    c.stabilize_until_quiet(3).await;
    for id in 2..=3 {
        let (status, headers) = c.head_object(id, "obj").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["X-Object-Meta-Color"], "blue", "sd{id}");
    }
}

/// Names with URL delimiters reach the right object on every peer.
#[tokio::test]
async fn test_name_with_query_characters_stabilizes() {
    let c = TestCluster::replicated(4, 3);
    let data = test_data(700);
    let name = "report?v=2#draft";
    c.put_everywhere(name, &ts(5), &data).await;

    assert_eq!(c.stabilize_until_quiet(3).await, 1);
    assert_eq!(c.peers.count("PUT /shard"), 0);
    assert_eq!(c.peers.count("HEAD /sd2/0/a/c/report%3Fv%3D2%23draft"), 2);
    for id in c.primaries(name) {
        assert!(!c.rows(id, name).await[0].nursery, "sd{id}");
    }
}
