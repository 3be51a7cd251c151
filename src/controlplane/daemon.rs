//! Daemon Run Loop
//!
//! Drives one reconciler at a time until cancelled. A successful pass
//! schedules the next one after the delay it asks for; a failed pass is
//! retried with exponential backoff, or ends the loop when retrying
//! cannot help.

use crate::controlplane::discovery::DeviceDiscovery;
use crate::controlplane::volume_set::{VolumeSetConfig, VolumeSetReconciler};
use crate::crd::LocalVolumeSetSpec;
use crate::error::{ErrorAction, Result};
use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Default interval between discovery passes
pub const DEFAULT_DISCOVERY_INTERVAL: Duration = Duration::from_secs(60);

/// Longest delay between retries of a failing pass
pub const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(300);

// =============================================================================
// Configuration
// =============================================================================

/// What the daemon reconciles
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum DaemonMode {
    /// Publish the node's discovery result
    #[default]
    Discover,
    /// Reconcile a LocalVolumeSet on this node
    VolumeSet,
}

impl std::fmt::Display for DaemonMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DaemonMode::Discover => write!(f, "discover"),
            DaemonMode::VolumeSet => write!(f, "volume-set"),
        }
    }
}

/// Top-level daemon configuration
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub node_name: String,
    pub mode: DaemonMode,

    /// Interval between discovery passes
    pub discovery_interval: Duration,

    /// Volume set settings (minimum age, claim directory)
    pub volume_set: VolumeSetConfig,

    /// LocalVolumeSet spec file for volume-set mode
    pub volume_set_file: Option<PathBuf>,

    /// Namespace for discovery results
    pub namespace: String,

    /// Run without a Kubernetes API server
    pub standalone: bool,

    /// Write results here in standalone mode
    pub output_file: Option<PathBuf>,

    /// Health server bind address
    pub health_addr: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            mode: DaemonMode::default(),
            discovery_interval: DEFAULT_DISCOVERY_INTERVAL,
            volume_set: VolumeSetConfig::default(),
            volume_set_file: None,
            namespace: "default".to_string(),
            standalone: false,
            output_file: None,
            health_addr: "0.0.0.0:8081".to_string(),
        }
    }
}

/// Load a LocalVolumeSet spec from YAML
pub fn load_volume_set_spec(yaml: &str) -> Result<LocalVolumeSetSpec> {
    Ok(serde_yaml::from_str(yaml)?)
}

// =============================================================================
// Reconcile Tasks
// =============================================================================

/// A unit of work the run loop repeats
#[async_trait]
pub trait Reconcile: Send {
    /// Run one pass and return the delay before the next one
    async fn reconcile_once(&mut self) -> Result<Duration>;

    fn name(&self) -> &str;
}

/// Periodic discovery, publishing on every pass
pub struct DiscoveryTask {
    discovery: DeviceDiscovery,
    interval: Duration,
}

impl DiscoveryTask {
    pub fn new(discovery: DeviceDiscovery, interval: Duration) -> Self {
        Self { discovery, interval }
    }
}

#[async_trait]
impl Reconcile for DiscoveryTask {
    async fn reconcile_once(&mut self) -> Result<Duration> {
        self.discovery.discover().await?;
        Ok(self.interval)
    }

    fn name(&self) -> &str {
        "discovery"
    }
}

/// A volume set reconciled against fixed node labels
pub struct VolumeSetTask {
    reconciler: VolumeSetReconciler,
    spec: LocalVolumeSetSpec,
    node_labels: BTreeMap<String, String>,
}

impl VolumeSetTask {
    pub fn new(
        reconciler: VolumeSetReconciler,
        spec: LocalVolumeSetSpec,
        node_labels: BTreeMap<String, String>,
    ) -> Self {
        Self {
            reconciler,
            spec,
            node_labels,
        }
    }
}

#[async_trait]
impl Reconcile for VolumeSetTask {
    async fn reconcile_once(&mut self) -> Result<Duration> {
        let outcome = self.reconciler.reconcile(&self.spec, &self.node_labels).await?;
        for candidate in outcome.claimable() {
            info!(
                device = %candidate.device.name,
                device_id = %candidate.device_id,
                "Device can be claimed"
            );
        }
        Ok(outcome.requeue_after)
    }

    fn name(&self) -> &str {
        "volume-set"
    }
}

// =============================================================================
// Run Loop
// =============================================================================

/// Backoff used between retries of a failing pass
pub fn retry_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        max_interval: MAX_RETRY_BACKOFF,
        max_elapsed_time: None,
        ..Default::default()
    }
}

/// Run `task` until `token` is cancelled.
///
/// Returns an error only for failures that retrying cannot fix.
pub async fn run_reconcile_loop(
    task: &mut dyn Reconcile,
    mut backoff: ExponentialBackoff,
    token: CancellationToken,
) -> Result<()> {
    info!(task = task.name(), "Starting reconcile loop");
    backoff.reset();

    loop {
        if token.is_cancelled() {
            break;
        }

        let delay = match task.reconcile_once().await {
            Ok(next) => {
                backoff.reset();
                next
            }
            Err(e) => match e.action() {
                ErrorAction::NoRequeue => {
                    error!(task = task.name(), error = %e, "Reconcile failed permanently");
                    return Err(e);
                }
                ErrorAction::RequeueAfter(delay) => {
                    warn!(task = task.name(), error = %e, retry_secs = delay.as_secs(), "Reconcile failed");
                    delay
                }
                ErrorAction::RequeueWithBackoff => {
                    let delay = backoff.next_backoff().unwrap_or(backoff.max_interval);
                    warn!(task = task.name(), error = %e, retry_ms = delay.as_millis() as u64, "Reconcile failed, backing off");
                    delay
                }
            },
        };

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    info!(task = task.name(), "Reconcile loop stopped");
    Ok(())
}
