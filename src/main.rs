//! diskmaker
//!
//! Node-local daemon that discovers block devices and decides which of them
//! can be claimed as local persistent volumes.
//!
//! Two modes:
//!
//! - `discover`: publish a `LocalVolumeDiscoveryResult` for this node on
//!   every pass.
//! - `volume-set`: reconcile one `LocalVolumeSet` spec on this node and
//!   report the devices that can be claimed.

use anyhow::{bail, Context};
use clap::Parser;
use k8s_openapi::api::core::v1::Node;
use kube::{Api, Client};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use diskmaker::controlplane::{
    load_volume_set_spec, parse_labels, retry_backoff, FileResultPublisher, KubeResultPublisher,
    LoggingEventReporter, LoggingResultPublisher, Reconcile,
};
use diskmaker::domain::ports::{ResultPublisherRef, SystemClock};
use diskmaker::hardware::{HostCommandRunner, HostDeviceOpener, LocalHostFs};
use diskmaker::{
    BlockDeviceEnumerator, DaemonConfig, DaemonMode, DeviceDiscovery, DiscoveryConfig,
    DiscoveryTask, Error, IdentityResolver, Result, VolumeSetConfig, VolumeSetReconciler,
    VolumeSetTask,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// diskmaker - local block device discovery and claim daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Name of the node this daemon runs on
    #[arg(long, env = "NODE_NAME")]
    node_name: String,

    /// What to reconcile
    #[arg(long, env = "DISKMAKER_MODE", value_enum, default_value_t = DaemonMode::Discover)]
    mode: DaemonMode,

    /// LocalVolumeSet spec (YAML) for volume-set mode
    #[arg(long, env = "VOLUME_SET_FILE")]
    volume_set_file: Option<PathBuf>,

    /// Node labels as k=v,k2=v2 (standalone mode)
    #[arg(long, env = "NODE_LABELS", default_value = "")]
    node_labels: String,

    /// Minimum age in seconds before a new device may be claimed
    #[arg(long, env = "DEVICE_MIN_AGE", default_value = "60")]
    device_min_age_secs: u64,

    /// Discovery interval in seconds
    #[arg(long, env = "DISCOVERY_INTERVAL", default_value = "60")]
    discovery_interval_secs: u64,

    /// Directory of claim symlinks used to evaluate claims
    #[arg(long, env = "CLAIM_DIR")]
    claim_dir: Option<PathBuf>,

    /// Write discovery results to this file (standalone mode)
    #[arg(long, env = "OUTPUT_FILE")]
    output_file: Option<PathBuf>,

    /// Run in standalone mode (no Kubernetes)
    #[arg(long, env = "STANDALONE")]
    standalone: bool,

    /// Namespace for discovery results
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn daemon_config(&self) -> DaemonConfig {
        DaemonConfig {
            node_name: self.node_name.clone(),
            mode: self.mode,
            discovery_interval: Duration::from_secs(self.discovery_interval_secs),
            volume_set: VolumeSetConfig {
                min_age: Duration::from_secs(self.device_min_age_secs),
                claim_dir: self.claim_dir.clone(),
                ..Default::default()
            },
            volume_set_file: self.volume_set_file.clone(),
            namespace: self.namespace.clone(),
            standalone: self.standalone,
            output_file: self.output_file.clone(),
            health_addr: self.health_addr.clone(),
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    let config = args.daemon_config();
    if config.node_name.is_empty() {
        bail!("node name must not be empty");
    }

    info!("Starting diskmaker");
    info!("  Version: {}", diskmaker::VERSION);
    info!("  Node: {}", config.node_name);
    info!("  Mode: {}", config.mode);
    info!("  Standalone mode: {}", config.standalone);

    let client = if config.standalone {
        None
    } else {
        Some(
            Client::try_default()
                .await
                .context("failed to create Kubernetes client")?,
        )
    };

    // Start health server
    let health_addr = config.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
        }
        shutdown.cancel();
    });

    let mut task = build_task(&config, client, &args.node_labels).await?;
    diskmaker::run_reconcile_loop(task.as_mut(), retry_backoff(), token)
        .await
        .context("reconcile loop failed")?;

    info!("diskmaker shutdown complete");
    Ok(())
}

/// Assemble the reconcile task for the configured mode
async fn build_task(
    config: &DaemonConfig,
    client: Option<Client>,
    node_labels: &str,
) -> anyhow::Result<Box<dyn Reconcile>> {
    let runner = Arc::new(HostCommandRunner);
    let fs = Arc::new(LocalHostFs);
    let enumerator = BlockDeviceEnumerator::new(runner);

    match config.mode {
        DaemonMode::Discover => {
            let publisher: ResultPublisherRef = match (&client, &config.output_file) {
                (Some(client), _) => Arc::new(KubeResultPublisher::new(
                    client.clone(),
                    &config.namespace,
                    config.node_name.clone(),
                )),
                (None, Some(path)) => Arc::new(FileResultPublisher::new(path)),
                (None, None) => Arc::new(LoggingResultPublisher),
            };
            let events = Arc::new(LoggingEventReporter::for_object(format!(
                "Node/{}",
                config.node_name
            )));

            let discovery = DeviceDiscovery::new(
                DiscoveryConfig {
                    node_name: config.node_name.clone(),
                    ..Default::default()
                },
                enumerator,
                IdentityResolver::new(fs.clone()),
                fs,
                Arc::new(SystemClock),
                events,
                publisher,
            );
            Ok(Box::new(DiscoveryTask::new(discovery, config.discovery_interval)))
        }
        DaemonMode::VolumeSet => {
            let Some(path) = &config.volume_set_file else {
                bail!("--volume-set-file is required in volume-set mode");
            };
            let yaml = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            let spec = load_volume_set_spec(&yaml)?;

            let labels = match &client {
                Some(client) => node_labels_from_api(client.clone(), &config.node_name).await?,
                None => parse_labels(node_labels)?,
            };
            let events = Arc::new(LoggingEventReporter::for_object(format!(
                "LocalVolumeSet/{}",
                path.display()
            )));

            let reconciler = VolumeSetReconciler::new(
                config.volume_set.clone(),
                enumerator,
                fs,
                Arc::new(HostDeviceOpener),
                Arc::new(SystemClock),
                events,
            );
            Ok(Box::new(VolumeSetTask::new(reconciler, spec, labels)))
        }
    }
}

/// Labels of this node as seen by the API server
async fn node_labels_from_api(client: Client, node_name: &str) -> Result<BTreeMap<String, String>> {
    let nodes: Api<Node> = Api::all(client);
    let node = nodes.get(node_name).await.map_err(Error::Kube)?;
    Ok(node.metadata.labels.unwrap_or_default())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse().unwrap())
        .add_directive("kube=info".parse().unwrap());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let (status, body) = match req.uri().path() {
                "/healthz" | "/livez" | "/readyz" => (StatusCode::OK, "ok"),
                _ => (StatusCode::NOT_FOUND, "not found"),
            };
            let mut response = Response::new(Body::from(body));
            *response.status_mut() = status;
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid health server address: {}", e))
    })?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}
