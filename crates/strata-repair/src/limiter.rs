//! Per-device concurrency limit for replication jobs.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use strata_types::PriorityRepJob;
use tokio::sync::mpsc;

/// Caps the number of jobs touching any one device, as source or target.
pub struct DevLimiter {
    max: usize,
    in_use: Mutex<HashMap<u32, usize>>,
    finished_tx: mpsc::Sender<()>,
    finished_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
}

impl DevLimiter {
    /// A limiter allowing `max` concurrent jobs per device (at least one).
    pub fn new(max: usize) -> Self {
        let (finished_tx, finished_rx) = mpsc::channel(1);
        Self {
            max: max.max(1),
            in_use: Mutex::new(HashMap::new()),
            finished_tx,
            finished_rx: tokio::sync::Mutex::new(finished_rx),
        }
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Reserve both devices of `job`. Returns `false` without reserving
    /// anything when either is saturated.
    pub fn start(&self, job: &PriorityRepJob) -> bool {
        let mut in_use = self.in_use.lock().expect("device limiter lock poisoned");
        let from = job.from_device.id;
        let to = job.to_device.id;
        let busy = |id: u32| in_use.get(&id).copied().unwrap_or(0);
        if busy(from) >= self.max || busy(to) >= self.max {
            return false;
        }
        *in_use.entry(from).or_default() += 1;
        *in_use.entry(to).or_default() += 1;
        true
    }

    /// Release the devices of a started job and wake one waiter.
    pub fn finished(&self, job: &PriorityRepJob) {
        {
            let mut in_use = self.in_use.lock().expect("device limiter lock poisoned");
            for id in [job.from_device.id, job.to_device.id] {
                if let Some(count) = in_use.get_mut(&id) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        in_use.remove(&id);
                    }
                }
            }
        }
        // A pending signal already covers this one.
        let _ = self.finished_tx.try_send(());
    }

    /// Jobs currently running on a device.
    pub fn in_use(&self, device_id: u32) -> usize {
        self.in_use
            .lock()
            .expect("device limiter lock poisoned")
            .get(&device_id)
            .copied()
            .unwrap_or(0)
    }

    /// Wait until some job finishes or `timeout` passes. Returns whether a
    /// job finished.
    pub async fn wait_for_finished(&self, timeout: Duration) -> bool {
        let mut rx = self.finished_rx.lock().await;
        matches!(tokio::time::timeout(timeout, rx.recv()).await, Ok(Some(())))
    }
}
