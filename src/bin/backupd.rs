//! Custodian Backup Daemon
//!
//! Runs on every node. The node holding the scheduler lease creates, uploads
//! and reclaims scheduled backups for the whole cluster.

use custodian::backup::{
    BackupContext, BackupReporter, BackupScheduler, ConfigLockConfig, FsBackupStorage,
    ScheduleInterval, SchedulerConfigStore, UploadPolicy, UrlTransportFactory,
};
use custodian::clock::{BoundedClock, Clock};
use custodian::cluster::{ClusterTopology, StaticTopology};
use custodian::config::ComponentFactory;
use custodian::coordination::{LeaderConfig, LeaderElector, LeaseManager};
use custodian::telemetry::Telemetry;

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Custodian Backup Daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Id of this node
    #[arg(long, env = "NODE_ID")]
    node_id: String,

    /// All controller nodes of the cluster (comma separated)
    #[arg(long, env = "CLUSTER_NODES", value_delimiter = ',')]
    nodes: Vec<String>,

    /// Ring tokens per node
    #[arg(long, default_value = "16")]
    tokens_per_node: usize,

    /// Site (data center) id
    #[arg(long, env = "SITE_ID", default_value = "site1")]
    site_id: String,

    /// Human-readable site name for audit records
    #[arg(long, env = "SITE_NAME")]
    site_name: Option<String>,

    /// Shared directory holding local backups
    #[arg(long, env = "BACKUP_ROOT", default_value = "./backups")]
    backup_root: PathBuf,

    /// Directory copied into every backup of this node
    #[arg(long, env = "BACKUP_SOURCE_DIR")]
    source_dir: Option<PathBuf>,

    /// Software version embedded in scheduled backup tags
    #[arg(long, env = "SOFTWARE_VERSION")]
    software_version: Option<String>,

    /// Enable or disable the backup scheduler (stored cluster-wide)
    #[arg(long)]
    scheduler_enabled: Option<bool>,

    /// Backup interval such as 1day or 12hour (stored cluster-wide)
    #[arg(long)]
    interval: Option<ScheduleInterval>,

    /// Minutes after the interval boundary to run (stored cluster-wide)
    #[arg(long)]
    start_offset_minutes: Option<u32>,

    /// Scheduled backups kept locally (stored cluster-wide)
    #[arg(long)]
    copies_to_keep: Option<usize>,

    /// Upload server URL, empty to disable uploads (stored cluster-wide)
    #[arg(long, env = "UPLOAD_URL")]
    upload_url: Option<String>,

    /// Scheduler lease TTL in seconds
    #[arg(long, default_value = "30")]
    lease_ttl_secs: u64,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn has_settings(&self) -> bool {
        self.scheduler_enabled.is_some()
            || self.interval.is_some()
            || self.start_offset_minutes.is_some()
            || self.copies_to_keep.is_some()
            || self.upload_url.is_some()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let _telemetry = Telemetry::init_for_component("custodian-backupd", &args.log_level)?;

    info!("Starting Custodian backup daemon on node {}", args.node_id);

    let store = ComponentFactory::create_coordinator_store().await?;
    let clock: Arc<dyn Clock> = Arc::new(BoundedClock::new());
    let leases = LeaseManager::new(store.clone(), clock.clone());

    let mut nodes: Vec<&str> = args
        .nodes
        .iter()
        .map(|n| n.trim())
        .filter(|n| !n.is_empty())
        .collect();
    if !nodes.contains(&args.node_id.as_str()) {
        nodes.push(&args.node_id);
    }
    let topology = StaticTopology::evenly_spaced(
        &nodes,
        &args.node_id,
        &args.site_id,
        args.tokens_per_node,
    )?;
    let topology = match &args.site_name {
        Some(name) => topology.with_site_name(name),
        None => topology,
    };
    let topology: Arc<dyn ClusterTopology> = Arc::new(topology);

    let config = Arc::new(SchedulerConfigStore::new(
        store.clone(),
        leases.clone(),
        &args.node_id,
        ConfigLockConfig::default(),
    ));
    if args.has_settings() {
        apply_settings(&config, &args).await?;
    }

    let ctx = BackupContext {
        config,
        storage: Arc::new(FsBackupStorage::new(
            &args.backup_root,
            &args.node_id,
            args.source_dir.clone(),
        )),
        topology: topology.clone(),
        transports: Arc::new(UrlTransportFactory),
        reporter: BackupReporter::logging(&args.node_id, topology.site_name()),
        clock,
        software_version: args
            .software_version
            .clone()
            .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
    };
    let scheduler = BackupScheduler::new(ctx, UploadPolicy::default());

    let elector = Arc::new(LeaderElector::new(
        leases,
        &args.node_id,
        LeaderConfig {
            lease_ttl: Duration::from_secs(args.lease_ttl_secs),
            ..Default::default()
        },
        Arc::new(scheduler.clone()),
    ));

    info!(
        nodes = nodes.len(),
        backup_root = %args.backup_root.display(),
        "Backup daemon ready"
    );

    let shutdown = CancellationToken::new();
    let election = elector.start(shutdown.clone());

    shutdown_signal().await;
    info!("Backup daemon shutting down");

    shutdown.cancel();
    election.await?;
    scheduler.shutdown().await;

    Ok(())
}

/// Store the settings given on the command line.
async fn apply_settings(config: &SchedulerConfigStore, args: &Args) -> custodian::Result<()> {
    let guard = config.lock().await?;
    let mut settings = config.load().await?.settings;
    if let Some(enabled) = args.scheduler_enabled {
        settings.scheduler_enabled = enabled;
    }
    if let Some(interval) = args.interval {
        settings.interval = interval;
    }
    if let Some(offset) = args.start_offset_minutes {
        settings.start_offset_minutes = offset;
    }
    if let Some(copies) = args.copies_to_keep {
        settings.copies_to_keep = copies;
    }
    if let Some(url) = &args.upload_url {
        settings.upload_url = Some(url.clone()).filter(|u| !u.trim().is_empty());
    }
    let saved = config.save_settings(&settings).await;
    if let Err(e) = guard.release().await {
        warn!("Failed to release configuration lock: {}", e);
    }
    saved
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
