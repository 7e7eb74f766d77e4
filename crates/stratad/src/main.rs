//! `stratad`: the Strata object server daemon.
//!
//! Serves the object server HTTP surface for the local devices, runs the
//! stabilizer, and plans priority replication after ring changes.
//!
//! # Usage
//!
//! ```text
//! stratad start                                   # serve with the default config
//! stratad start -c stratad.toml --bind 127.0.0.1:6010
//! stratad part-move --old-ring old.json --new-ring new.json --dry-run
//! stratad restore-device --ring object.ring.json --ip 10.0.0.5 --device sdb
//! ```

mod config;
mod stabilizer;
mod telemetry;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use strata_engine::{HttpPeerClient, StorageEngine};
use strata_http::{StrataServer, StrataServerConfig};
use strata_repair::{PriorityRepRunner, get_part_move_jobs, get_restore_device_jobs};
use strata_ring::{Ring, StaticRing};
use strata_types::PriorityRepJob;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use config::CliConfig;

// -----------------------------------------------------------------------
// CLI definition
// -----------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "stratad", version, about = "Strata object server daemon")]
struct Cli {
    /// Path to TOML config file.
    #[arg(short, long, global = true, env = "STRATA_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the object server API and run the stabilizer.
    Start {
        /// Override the devices root.
        #[arg(short, long)]
        devices: Option<PathBuf>,

        /// Override the bind address (e.g. "127.0.0.1:6010").
        #[arg(short, long)]
        bind: Option<String>,

        /// Override this server's ring ip.
        #[arg(long)]
        ip: Option<String>,

        /// Override this server's ring port.
        #[arg(long)]
        port: Option<u16>,

        /// Override the ring file.
        #[arg(short, long)]
        ring: Option<PathBuf>,
    },

    /// Move partitions whose devices changed between two rings.
    PartMove {
        #[arg(long)]
        old_ring: PathBuf,

        #[arg(long)]
        new_ring: PathBuf,

        /// Partitions to leave alone.
        #[arg(long = "exclude", value_delimiter = ',')]
        excluded: Vec<u64>,

        /// Print the jobs without running them.
        #[arg(long)]
        dry_run: bool,
    },

    /// Refill a replaced device from its peers.
    RestoreDevice {
        #[arg(long)]
        ring: PathBuf,

        /// Ring ip of the device to restore.
        #[arg(long)]
        ip: String,

        /// Device name to restore.
        #[arg(long)]
        device: String,

        /// Only copy from peers in this region.
        #[arg(long)]
        region: Option<u32>,

        /// Copy from every peer instead of one per partition.
        #[arg(long)]
        all_peers: bool,

        /// Partitions to leave alone.
        #[arg(long = "exclude", value_delimiter = ',')]
        excluded: Vec<u64>,

        #[arg(long)]
        dry_run: bool,
    },
}

// -----------------------------------------------------------------------
// Entrypoint
// -----------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = CliConfig::load(cli.config.as_deref()).context("failed to load config")?;

    telemetry::init(&config.log.level);

    match cli.command {
        Commands::Start {
            devices,
            bind,
            ip,
            port,
            ring,
        } => {
            // CLI args override config file values.
            if let Some(devices) = devices {
                config.node.devices = devices;
            }
            if let Some(bind) = bind {
                config.node.bind_addr = bind;
            }
            if ip.is_some() {
                config.node.ip = ip;
            }
            if let Some(port) = port {
                config.node.port = port;
            }
            if let Some(ring) = ring {
                config.ring.path = ring;
            }
            cmd_start(config).await
        }
        Commands::PartMove {
            old_ring,
            new_ring,
            excluded,
            dry_run,
        } => {
            let old = load_ring(&old_ring)?;
            let new = load_ring(&new_ring)?;
            let jobs = get_part_move_jobs(&old, &new, &excluded, config.policy.index)?;
            run_jobs(&config, jobs, dry_run).await
        }
        Commands::RestoreDevice {
            ring,
            ip,
            device,
            region,
            all_peers,
            excluded,
            dry_run,
        } => {
            let ring = load_ring(&ring)?;
            let jobs = get_restore_device_jobs(
                &ring,
                &ip,
                &device,
                region,
                all_peers,
                &excluded,
                config.policy.index,
            );
            if jobs.is_empty() {
                warn!(%ip, %device, "device holds no partitions in this ring");
            }
            run_jobs(&config, jobs, dry_run).await
        }
    }
}

fn load_ring(path: &std::path::Path) -> Result<StaticRing> {
    StaticRing::load(path).with_context(|| format!("failed to load ring {}", path.display()))
}

fn peer_client(config: &CliConfig) -> Result<HttpPeerClient> {
    HttpPeerClient::new(config.policy.index, config.peer_timeout())
        .context("failed to build peer client")
}

// -----------------------------------------------------------------------
// stratad start
// -----------------------------------------------------------------------

async fn cmd_start(config: CliConfig) -> Result<()> {
    info!("starting stratad");
    let ring = load_ring(&config.ring.path)?;
    info!(
        devices = %config.node.devices.display(),
        bind = %config.node.bind_addr,
        ring = %config.ring.path.display(),
        part_power = ring.part_power(),
        replicas = ring.replica_count(),
        policy = config.policy.index,
        kind = %config.policy.kind,
        "node configuration"
    );

    let engine = StorageEngine::new(
        config.engine_config()?,
        Arc::new(ring),
        Arc::new(peer_client(&config)?),
    )
    .context("invalid storage policy for this ring")?;

    let local = engine.local_devices();
    if local.is_empty() {
        warn!("no ring devices are local to this server");
    }
    for device in &local {
        info!(device = %device.device, id = device.id, "serving device");
    }

    let cancel = CancellationToken::new();
    let stabilizer = tokio::spawn(stabilizer::run(
        engine.clone(),
        config.stabilize_interval(),
        config.replication.concurrency,
        cancel.clone(),
    ));

    let shutdown = {
        let cancel = cancel.clone();
        async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("received ctrl-c, shutting down"),
                () = cancel.cancelled() => {}
            }
            cancel.cancel();
        }
    };

    let server = StrataServer::new(StrataServerConfig::new(engine));
    let served = server
        .serve_with_shutdown(&config.node.bind_addr, shutdown)
        .await;

    cancel.cancel();
    if let Err(e) = stabilizer.await {
        warn!(error = %e, "stabilizer task failed");
    }
    served.context("object server failed")
}

// -----------------------------------------------------------------------
// stratad part-move / restore-device
// -----------------------------------------------------------------------

async fn run_jobs(config: &CliConfig, jobs: Vec<PriorityRepJob>, dry_run: bool) -> Result<()> {
    info!(jobs = jobs.len(), dry_run, "priority replication planned");
    if dry_run {
        for job in &jobs {
            println!(
                "partition {}: {} {}/{} -> {} {}/{}",
                job.partition,
                job.from_device.id,
                job.from_device.ip,
                job.from_device.device,
                job.to_device.id,
                job.to_device.ip,
                job.to_device.device,
            );
        }
        return Ok(());
    }

    let runner = PriorityRepRunner::new(
        Arc::new(peer_client(config)?),
        config.replication.jobs_per_device,
    );
    let report = runner.run(jobs).await;
    println!(
        "priority replication: {} completed, {} failed",
        report.completed, report.failed
    );
    if report.failed > 0 {
        anyhow::bail!("{} priority replication jobs failed", report.failed);
    }
    Ok(())
}
