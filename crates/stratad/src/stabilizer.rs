//! Background stabilizer: periodic passes over every local device.

use std::sync::Arc;
use std::time::Duration;

use strata_engine::{PassReport, StorageEngine};
use strata_types::Device;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Stabilize every device once, at most `concurrency` devices at a time.
pub async fn stabilize_pass(
    engine: &StorageEngine,
    devices: &[Device],
    concurrency: usize,
) -> PassReport {
    let permits = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut set = JoinSet::new();
    for device in devices.iter().cloned() {
        let engine = engine.clone();
        let permits = permits.clone();
        set.spawn(async move {
            let _permit = permits.acquire_owned().await;
            engine.stabilize_device(&device).await
        });
    }

    let mut total = PassReport::default();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(report) => {
                total.processed += report.processed;
                total.succeeded += report.succeeded;
                total.failed += report.failed;
            }
            Err(e) => error!(error = %e, "stabilize task panicked"),
        }
    }
    total
}

/// Run [`stabilize_pass`] every `interval` until `cancel` fires.
pub async fn run(
    engine: StorageEngine,
    interval: Duration,
    concurrency: usize,
    cancel: CancellationToken,
) {
    info!(interval_secs = interval.as_secs(), "stabilizer started");
    loop {
        let devices = engine.local_devices();
        tokio::select! {
            () = cancel.cancelled() => break,
            report = stabilize_pass(&engine, &devices, concurrency) => {
                if report.failed > 0 {
                    info!(
                        devices = devices.len(),
                        processed = report.processed,
                        failed = report.failed,
                        "stabilize round left objects for the next pass"
                    );
                }
            }
        }
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }
    }
    info!("stabilizer stopped");
}
