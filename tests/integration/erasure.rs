//! Integration test: erasure-coded objects across four servers (2+1).

use axum::body::Body;
use axum::http::{Request, StatusCode};
use strata_erasure::ErasureLayout;
use strata_integration_tests::{TestCluster, test_data, ts};
use strata_types::NURSERY_SHARD;

fn cluster() -> TestCluster {
    TestCluster::erasure_coded(4, 2, 1, 2)
}

/// Write full nursery copies to the first two primaries, as a proxy does.
async fn write(c: &TestCluster, object: &str, timestamp: &str, data: &[u8]) {
    for id in [1, 2] {
        assert_eq!(
            c.put_object(id, object, timestamp, data).await,
            StatusCode::CREATED
        );
    }
}

fn shard_request(method: &str, device: u32, c: &TestCluster, object: &str, index: u16) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(format!("/shard/sd{device}/{}/{index}", c.hash(object)))
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_stabilize_spreads_shards_over_primaries() {
    let c = cluster();
    let data = test_data(1000);
    write(&c, "obj", &ts(5), &data).await;

    let report = c.stabilize(1).await;
    assert_eq!(report.succeeded, 1);
    assert_eq!(c.peers.count("PUT /shard/sd2/"), 1);
    assert_eq!(c.peers.count("PUT /shard/sd3/"), 1);
    assert_eq!(c.peers.count("POST /nursery/sd2/"), 1);

    let streams = ErasureLayout::new(2, 1, 64).unwrap().encode_object(&data).unwrap();
    for (index, id) in [1u32, 2, 3].into_iter().enumerate() {
        let rows = c.rows(id, "obj").await;
        assert_eq!(rows.len(), 1, "sd{id} keeps only its shard");
        assert_eq!(rows[0].shard, index as u16);
        assert!(!rows[0].nursery);

        let (status, _, body) = c.send(id, shard_request("GET", id, &c, "obj", index as u16)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.to_vec(), streams[index], "shard {index} on sd{id}");
    }

    // The notified nursery copy on sd2 is gone, so its pass has nothing to do.
    assert!(c.rows(2, "obj").await.iter().all(|r| r.shard != NURSERY_SHARD));
    assert_eq!(c.stabilize(2).await.processed, 0);
}

#[tokio::test]
async fn test_nursery_copy_serves_reads_before_stabilizing() {
    let c = cluster();
    let data = test_data(300);
    write(&c, "obj", &ts(5), &data).await;

    let (status, body) = c.get_object(2, "obj").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.to_vec(), data);
}

#[tokio::test]
async fn test_read_decodes_from_remaining_shards() {
    let c = cluster();
    let data = test_data(5000);
    write(&c, "obj", &ts(5), &data).await;
    c.stabilize_until_quiet(3).await;

    for id in [1, 2, 3] {
        let (status, body) = c.get_object(id, "obj").await;
        assert_eq!(status, StatusCode::OK, "sd{id}");
        assert_eq!(body.to_vec(), data);
    }

    // Any two of three shards are enough.
    c.peers.set_down(1, true);
    let (status, body) = c.get_object(3, "obj").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.to_vec(), data);

    let (status, headers) = c.head_object(2, "obj").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["Content-Length"], "5000");
}

#[tokio::test]
async fn test_reconstruct_rebuilds_lost_shard() {
    let c = cluster();
    let data = test_data(2048);
    let timestamp = ts(5);
    write(&c, "obj", &timestamp, &data).await;
    c.stabilize_until_quiet(3).await;

    let (_, _, original) = c.send(3, shard_request("GET", 3, &c, "obj", 2)).await;

    // Lose sd3's shard.
    let mut delete = shard_request("DELETE", 3, &c, "obj", 2);
    delete
        .headers_mut()
        .insert("X-Timestamp", ts(1).parse().unwrap());
    let (status, _, _) = c.send(3, delete).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _, _) = c.send(3, shard_request("GET", 3, &c, "obj", 2)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let request = Request::builder()
        .method("PUT")
        .uri("/reconstruct/sd3/a/c/obj")
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = c.send(3, request).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, rebuilt) = c.send(3, shard_request("GET", 3, &c, "obj", 2)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(rebuilt, original);
}

#[tokio::test]
async fn test_reconstruct_fails_without_enough_shards() {
    let c = cluster();
    write(&c, "obj", &ts(5), &test_data(512)).await;
    c.stabilize_until_quiet(3).await;
    c.peers.set_down(1, true);
    c.peers.set_down(2, true);

    let request = Request::builder()
        .method("PUT")
        .uri("/reconstruct/sd3/a/c/obj")
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = c.send(3, request).await;
    assert!(status.is_server_error(), "got {status}");
}
