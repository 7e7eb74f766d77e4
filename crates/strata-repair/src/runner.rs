//! Dispatch of priority replication jobs to source servers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::seq::SliceRandom;
use strata_engine::PeerClient;
use strata_types::PriorityRepJob;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::error::RepairError;
use crate::limiter::DevLimiter;

/// Counts from one [`PriorityRepRunner::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunReport {
    pub completed: u64,
    pub failed: u64,
}

/// Sends jobs to the `/priorityrep` endpoint of their source server,
/// keeping at most `max` jobs per device in flight.
pub struct PriorityRepRunner {
    peers: Arc<dyn PeerClient>,
    limiter: Arc<DevLimiter>,
    retry_wait: Duration,
    /// Jobs completed since the runner was created.
    completed: Arc<AtomicU64>,
    /// Jobs failed since the runner was created.
    failed: Arc<AtomicU64>,
}

impl PriorityRepRunner {
    pub fn new(peers: Arc<dyn PeerClient>, max_per_device: usize) -> Self {
        Self {
            peers,
            limiter: Arc::new(DevLimiter::new(max_per_device)),
            retry_wait: Duration::from_secs(1),
            completed: Arc::new(AtomicU64::new(0)),
            failed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Upper bound on the wait for a slot before jobs are retried.
    pub fn with_retry_wait(mut self, retry_wait: Duration) -> Self {
        self.retry_wait = retry_wait;
        self
    }

    pub fn limiter(&self) -> &Arc<DevLimiter> {
        &self.limiter
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Run every job once, in random order. Jobs whose devices are busy
    /// wait until another job finishes.
    pub async fn run(&self, mut jobs: Vec<PriorityRepJob>) -> RunReport {
        jobs.shuffle(&mut rand::rng());
        let total = jobs.len();
        info!(jobs = total, max_per_device = self.limiter.max(), "priority replication started");

        let mut report = RunReport::default();
        let mut set = JoinSet::new();
        let mut pending = jobs;

        while !pending.is_empty() {
            let mut waiting = Vec::new();
            for job in pending {
                if !self.limiter.start(&job) {
                    waiting.push(job);
                    continue;
                }
                let peers = self.peers.clone();
                let limiter = self.limiter.clone();
                set.spawn(async move {
                    let result = dispatch(peers.as_ref(), &job).await;
                    limiter.finished(&job);
                    (job, result)
                });
            }
            pending = waiting;

            if !pending.is_empty() {
                debug!(waiting = pending.len(), "devices busy, waiting for a slot");
                self.limiter.wait_for_finished(self.retry_wait).await;
            }
            while let Some(joined) = set.try_join_next() {
                self.record(joined, &mut report, total);
            }
        }
        while let Some(joined) = set.join_next().await {
            self.record(joined, &mut report, total);
        }

        info!(
            completed = report.completed,
            failed = report.failed,
            "priority replication finished"
        );
        report
    }

    fn record(
        &self,
        joined: Result<(PriorityRepJob, Result<(), RepairError>), JoinError>,
        report: &mut RunReport,
        total: usize,
    ) {
        match joined {
            Ok((job, Ok(()))) => {
                report.completed += 1;
                self.completed.fetch_add(1, Ordering::Relaxed);
                info!(
                    partition = job.partition,
                    from = %job.from_device.device,
                    to = %job.to_device.device,
                    progress = %format!("{}/{total}", report.completed + report.failed),
                    "priority replication job done"
                );
            }
            Ok((job, Err(e))) => {
                report.failed += 1;
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    partition = job.partition,
                    from = %job.from_device.device,
                    to = %job.to_device.device,
                    error = %e,
                    "priority replication job failed"
                );
            }
            Err(e) => {
                report.failed += 1;
                self.failed.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, "priority replication task panicked");
            }
        }
    }
}

/// POST one job to its source server.
pub async fn dispatch(peers: &dyn PeerClient, job: &PriorityRepJob) -> Result<(), RepairError> {
    let status = peers.post_priority_job(&job.from_device, job).await?;
    if (200..300).contains(&status) {
        Ok(())
    } else {
        Err(RepairError::Rejected {
            partition: job.partition,
            device: job.from_device.device.clone(),
            status,
        })
    }
}
