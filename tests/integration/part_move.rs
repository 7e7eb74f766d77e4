//! Integration test: ring changes planned into priority replication jobs
//! and run through the `/priorityrep` endpoint of the source servers.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use strata_engine::Strategy;
use strata_integration_tests::{TestCluster, device, single_partition_ring, test_data, ts};
use strata_repair::{PriorityRepRunner, get_part_move_jobs, get_restore_device_jobs};
use strata_ring::StaticRing;

const OBJECTS: [&str; 3] = ["alpha", "beta", "gamma/with/slashes"];

/// Install a stable copy on `sd{id}` as a peer's stabilizer would.
async fn seed_stable(c: &TestCluster, id: u32, object: &str, timestamp: &str, data: &[u8]) {
    let request = Request::builder()
        .method("PUT")
        .uri(format!("/shard/sd{id}/{}/0", c.hash(object)))
        .header("X-Timestamp", timestamp)
        .header("Meta-X-Timestamp", timestamp)
        .header("Meta-name", format!("/a/c/{object}"))
        .header("Meta-Content-Length", data.len().to_string())
        .body(Body::from(data.to_vec()))
        .unwrap();
    let (status, _, _) = c.send(id, request).await;
    assert_eq!(status, StatusCode::CREATED, "seed {object} on sd{id}");
}

/// Partition 0 moves its third replica from sd3 to sd4.
fn rings() -> (StaticRing, StaticRing) {
    let devices: Vec<_> = (1..=4).map(device).collect();
    let old = StaticRing::from_assignments(0, 3, devices.clone(), vec![vec![1, 2, 3]]).unwrap();
    let new = StaticRing::from_assignments(0, 3, devices, vec![vec![1, 2, 4]]).unwrap();
    (old, new)
}

#[tokio::test]
async fn test_part_move_copies_partition_to_new_primary() {
    let (old, new) = rings();
    let c = TestCluster::new(new.clone(), Strategy::Replicated);
    let data = test_data(800);
    let timestamp = ts(60);
    for object in OBJECTS {
        for id in 1..=3 {
            seed_stable(&c, id, object, &timestamp, &data).await;
        }
    }

    let jobs = get_part_move_jobs(&old, &new, &[], 0).unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].from_device.device, "sd3");
    assert_eq!(jobs[0].to_device.device, "sd4");

    let runner = PriorityRepRunner::new(c.peers.clone(), 2);
    let report = runner.run(jobs).await;
    assert_eq!(report.completed, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(c.peers.count("POST /priorityrep"), 1);

    for object in OBJECTS {
        let (status, body) = c.get_object(4, object).await;
        assert_eq!(status, StatusCode::OK, "{object} on sd4");
        assert_eq!(body.to_vec(), data);
        // sd3 is a handoff in the new ring, so its copy is dropped.
        assert!(c.rows(3, object).await.is_empty(), "{object} left on sd3");
        assert_eq!(c.rows(1, object).await.len(), 1);
    }
}

#[test]
fn test_part_move_skips_excluded_partitions() {
    let (old, new) = rings();
    assert!(get_part_move_jobs(&old, &new, &[0], 0).unwrap().is_empty());
    assert!(get_part_move_jobs(&new, &new, &[], 0).unwrap().is_empty());
}

#[tokio::test]
async fn test_restore_device_refills_from_a_peer() {
    let c = TestCluster::replicated(4, 3);
    let data = test_data(300);
    let timestamp = ts(60);
    for object in OBJECTS {
        seed_stable(&c, 1, object, &timestamp, &data).await;
        seed_stable(&c, 3, object, &timestamp, &data).await;
    }

    let jobs = get_restore_device_jobs(c.ring(), "127.0.0.1", "sd2", None, false, &[], 0);
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].to_device.device, "sd2");

    let report = PriorityRepRunner::new(c.peers.clone(), 1).run(jobs).await;
    assert_eq!(report.completed, 1);

    for object in OBJECTS {
        let rows = c.rows(2, object).await;
        assert_eq!(rows.len(), 1, "{object} on sd2");
        assert!(!rows[0].nursery);
        // Sources are primaries and keep their copies.
        assert_eq!(c.rows(1, object).await.len(), 1);
        assert_eq!(c.rows(3, object).await.len(), 1);
    }

    // Nothing left to copy on a second run.
    let again = get_restore_device_jobs(c.ring(), "127.0.0.1", "sd2", None, true, &[], 0);
    assert_eq!(again.len(), 2);
    c.peers.clear();
    let report = PriorityRepRunner::new(c.peers.clone(), 1).run(again).await;
    assert_eq!(report.completed, 2);
    assert_eq!(c.peers.count("PUT /shard/"), 0);
}

#[tokio::test]
async fn test_unreachable_source_fails_the_job() {
    let c = TestCluster::new(single_partition_ring(4, 3), Strategy::Replicated);
    seed_stable(&c, 1, "alpha", &ts(60), b"x").await;
    c.peers.set_down(1, true);

    let jobs = get_restore_device_jobs(c.ring(), "127.0.0.1", "sd2", Some(1), false, &[], 0);
    let runner = PriorityRepRunner::new(c.peers.clone(), 1);
    let report = runner.run(jobs).await;
    assert_eq!(report.completed, 0);
    assert_eq!(report.failed, 1);
    assert_eq!(runner.failed(), 1);
}
