//! Volume Set Reconciler
//!
//! One node's share of a `LocalVolumeSet`: enumerate devices, drop the
//! structurally ineligible ones, hold back devices that appeared too
//! recently, apply the inclusion rules and decide which survivors can be
//! claimed.
//!
//! Per-device failures exclude the device and are logged. Only an
//! enumeration failure fails the whole reconcile.

use crate::controlplane::node_selector::node_selector_matches;
use crate::crd::LocalVolumeSetSpec;
use crate::domain::events::DiscoveryEvent;
use crate::domain::ports::{ClockRef, DeviceOpenerRef, EventReporterRef, HostFsRef};
use crate::error::Result;
use crate::hardware::claim::{ClaimDecision, ClaimLocker, DeviceAgeTracker, DEFAULT_DEVICE_MIN_AGE};
use crate::hardware::discovery::{BlockDevice, BlockDeviceEnumerator, IdentityResolution, IdentityResolver};
use crate::hardware::filter::{FilterPipeline, FilterVerdict, MatcherSet};
use dashmap::DashSet;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Requeue delay when no device is waiting out its age
pub const DEFAULT_REQUEUE: Duration = Duration::from_secs(60);

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the volume set reconciler
#[derive(Debug, Clone)]
pub struct VolumeSetConfig {
    /// Minimum time a device must be visible before it may be claimed
    pub min_age: Duration,

    /// Requeue delay when nothing is delayed
    pub requeue_after: Duration,

    /// Directory holding claim symlinks; claims are only evaluated when set
    pub claim_dir: Option<PathBuf>,
}

impl Default for VolumeSetConfig {
    fn default() -> Self {
        Self {
            min_age: DEFAULT_DEVICE_MIN_AGE,
            requeue_after: DEFAULT_REQUEUE,
            claim_dir: None,
        }
    }
}

// =============================================================================
// Outcome
// =============================================================================

/// A device that passed every stage, with its identity and claim decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimCandidate {
    pub device: BlockDevice,
    /// By-id path, or `/dev/<kname>` when none exists
    pub device_id: String,
    pub decision: ClaimDecision,
}

/// Result of one reconcile
#[derive(Debug, Clone, Default)]
pub struct ReconcileOutcome {
    /// The node selector did not match; nothing was enumerated
    pub skipped: bool,

    /// Devices passing filters, age gate and matchers
    pub valid: Vec<BlockDevice>,

    /// Devices passing filters but younger than the minimum age
    pub delayed: Vec<BlockDevice>,

    /// Devices rejected by a filter or matcher
    pub excluded: Vec<(BlockDevice, FilterVerdict)>,

    /// Claim decisions for valid devices, when a claim directory is set
    pub claims: Vec<ClaimCandidate>,

    /// Claim symlinks that no longer resolve to a valid device
    pub orphaned: Vec<PathBuf>,

    /// When to reconcile next
    pub requeue_after: Duration,
}

impl ReconcileOutcome {
    /// Devices that can be claimed right now
    pub fn claimable(&self) -> impl Iterator<Item = &ClaimCandidate> {
        self.claims
            .iter()
            .filter(|c| c.decision == ClaimDecision::Claimable)
    }
}

// =============================================================================
// Reconciler
// =============================================================================

/// Reconciles a volume set on this node.
///
/// The age record and the announced-device set are owned here, and
/// `reconcile` takes `&mut self`, so at most one reconcile runs at a time.
pub struct VolumeSetReconciler {
    config: VolumeSetConfig,
    enumerator: BlockDeviceEnumerator,
    resolver: IdentityResolver,
    filters: FilterPipeline,
    matchers: MatcherSet,
    ages: DeviceAgeTracker,
    locker: Option<ClaimLocker>,
    events: EventReporterRef,
    /// Kernel names already announced as delayed
    announced: DashSet<String>,
}

impl VolumeSetReconciler {
    pub fn new(
        config: VolumeSetConfig,
        enumerator: BlockDeviceEnumerator,
        fs: HostFsRef,
        opener: DeviceOpenerRef,
        clock: ClockRef,
        events: EventReporterRef,
    ) -> Self {
        let locker = config
            .claim_dir
            .as_ref()
            .map(|dir| ClaimLocker::new(fs.clone(), opener.clone(), vec![dir.clone()]));

        Self {
            ages: DeviceAgeTracker::new(clock, config.min_age),
            resolver: IdentityResolver::new(fs.clone()),
            filters: FilterPipeline::standard(fs, opener),
            matchers: MatcherSet::standard(),
            config,
            enumerator,
            locker,
            events,
            announced: DashSet::new(),
        }
    }

    /// Replace the filter pipeline
    pub fn with_filters(mut self, filters: FilterPipeline) -> Self {
        self.filters = filters;
        self
    }

    /// Replace the identity resolver
    pub fn with_resolver(mut self, resolver: IdentityResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn config(&self) -> &VolumeSetConfig {
        &self.config
    }

    pub fn ages(&self) -> &DeviceAgeTracker {
        &self.ages
    }

    /// Reconcile `spec` on a node carrying `node_labels`
    pub async fn reconcile(
        &mut self,
        spec: &LocalVolumeSetSpec,
        node_labels: &BTreeMap<String, String>,
    ) -> Result<ReconcileOutcome> {
        if !node_selector_matches(spec.node_selector.as_ref(), node_labels)? {
            debug!("Node selector does not match this node");
            return Ok(ReconcileOutcome {
                skipped: true,
                requeue_after: self.config.requeue_after,
                ..Default::default()
            });
        }

        let inventory = match self.enumerator.list_block_devices(&[]).await {
            Ok(inventory) => inventory,
            Err(e) => {
                self.events.report(DiscoveryEvent::ErrorRunningBlockList {
                    message: format!("failed to list block devices: {}", e),
                });
                return Err(e);
            }
        };
        if !inventory.bad_rows.is_empty() {
            self.events.report(DiscoveryEvent::ErrorRunningBlockList {
                message: format!("error parsing {} lsblk rows", inventory.bad_rows.len()),
            });
        }

        for device in &inventory.devices {
            self.ages.record(&device.kname);
        }

        let (passed, mut excluded) = self.filters.partition(&inventory.devices);

        let mut valid = Vec::new();
        let mut delayed = Vec::new();
        for device in passed {
            if !self.ages.is_older_than_min_age(&device.kname) {
                debug!(device = %device.name, "Device is too young to claim");
                if self.announced.insert(device.kname.clone()) {
                    self.events.report(DiscoveryEvent::DiscoveredNewDevice {
                        kname: device.kname.clone(),
                        min_age_secs: self.ages.min_age().as_secs(),
                    });
                }
                delayed.push(device);
                continue;
            }

            match self.matchers.evaluate(&device, &spec.device_inclusion_spec) {
                FilterVerdict::Pass => valid.push(device),
                verdict => excluded.push((device, verdict)),
            }
        }

        let claims = self.evaluate_claims(&valid);
        let orphaned = self.orphaned_symlinks(&valid);

        let requeue_after = if delayed.is_empty() {
            self.config.requeue_after
        } else {
            self.ages.fast_requeue()
        };

        info!(
            valid = valid.len(),
            delayed = delayed.len(),
            excluded = excluded.len(),
            claimable = claims.iter().filter(|c| c.decision == ClaimDecision::Claimable).count(),
            requeue_secs = requeue_after.as_secs(),
            "Reconciled volume set"
        );

        Ok(ReconcileOutcome {
            skipped: false,
            valid,
            delayed,
            excluded,
            claims,
            orphaned,
            requeue_after,
        })
    }

    fn evaluate_claims(&self, valid: &[BlockDevice]) -> Vec<ClaimCandidate> {
        let Some(locker) = &self.locker else {
            return Vec::new();
        };

        let mut claims = Vec::with_capacity(valid.len());
        for device in valid {
            let mut device = device.clone();
            let path = match device.dev_path() {
                Ok(path) => path,
                Err(e) => {
                    warn!(device = %device.name, error = %e, "Skipping claim");
                    continue;
                }
            };

            let device_id = match self.resolver.path_by_id(&mut device, None) {
                Ok(IdentityResolution::Found(id)) => id,
                Ok(IdentityResolution::NotFound { fallback }) => {
                    debug!(device = %device.name, "No by-id path, using kernel path");
                    fallback
                }
                Err(e) => {
                    warn!(device = %device.name, error = %e, "Failed to resolve by-id path");
                    path.clone()
                }
            };

            match locker.evaluate(&path) {
                Ok(decision) => {
                    debug!(device = %device.name, ?decision, "Claim evaluated");
                    claims.push(ClaimCandidate {
                        device,
                        device_id,
                        decision,
                    });
                }
                Err(e) => error!(device = %device.name, error = %e, "Claim evaluation failed"),
            }
        }
        claims
    }

    fn orphaned_symlinks(&self, valid: &[BlockDevice]) -> Vec<PathBuf> {
        let (Some(locker), Some(dir)) = (&self.locker, &self.config.claim_dir) else {
            return Vec::new();
        };
        match locker.orphaned_symlinks(dir, valid) {
            Ok(orphans) => {
                for orphan in &orphans {
                    warn!(symlink = %orphan.display(), "Claim symlink no longer points at a valid device");
                }
                orphans
            }
            Err(e) => {
                error!(dir = %dir.display(), error = %e, "Failed to scan claim directory");
                Vec::new()
            }
        }
    }
}

impl std::fmt::Debug for VolumeSetReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeSetReconciler")
            .field("config", &self.config)
            .field("filters", &self.filters)
            .field("tracked_devices", &self.ages.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::events::InMemoryEventReporter;
    use crate::crd::{DeviceInclusionSpec, DeviceType, NodeSelector, NodeSelectorOperator, NodeSelectorRequirement, NodeSelectorTerm};
    use crate::domain::ports::CommandOutput;
    use crate::error::Error;
    use crate::hardware::filter::{IN_SIZE_RANGE, NO_CHILDREN, NO_FILESYSTEM_SIGNATURE};
    use crate::hardware::mock::{DeviceState, FakeHostFs, ManualClock, ScriptedCommandRunner, ScriptedDeviceOpener};
    use assert_matches::assert_matches;
    use std::sync::Arc;

    const CLAIM_DIR: &str = "/mnt/local-storage/fast";
    const GIB: u64 = 1024 * 1024 * 1024;

    struct Harness {
        reconciler: VolumeSetReconciler,
        runner: Arc<ScriptedCommandRunner>,
        fs: Arc<FakeHostFs>,
        opener: Arc<ScriptedDeviceOpener>,
        clock: Arc<ManualClock>,
        events: Arc<InMemoryEventReporter>,
    }

    fn lsblk(rows: &[&str]) -> CommandOutput {
        CommandOutput::ok(format!(r#"{{"blockdevices": [{}]}}"#, rows.join(",")))
    }

    fn disk_row(kname: &str, size: u64) -> String {
        format!(
            r#"{{"name": "{0}", "kname": "{0}", "type": "disk", "size": {1}, "rota": false, "ro": false, "rm": false, "state": "running", "model": "SAMSUNG MZ7LH", "vendor": "ATA"}}"#,
            kname, size
        )
    }

    fn harness(config: VolumeSetConfig, rows: &[&str]) -> Harness {
        let runner = Arc::new(
            ScriptedCommandRunner::new()
                .respond("lsblk", lsblk(rows))
                .respond("blkid", CommandOutput::failed(2, "")),
        );
        let fs = Arc::new(FakeHostFs::new().with_file("/proc/1/mountinfo", ""));
        let opener = Arc::new(ScriptedDeviceOpener::new());
        let clock = Arc::new(ManualClock::default());
        let events = Arc::new(InMemoryEventReporter::new());
        let reconciler = VolumeSetReconciler::new(
            config,
            BlockDeviceEnumerator::new(runner.clone()),
            fs.clone(),
            opener.clone(),
            clock.clone(),
            events.clone(),
        );
        Harness {
            reconciler,
            runner,
            fs,
            opener,
            clock,
            events,
        }
    }

    fn no_labels() -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    fn kname_list(devices: &[BlockDevice]) -> Vec<&str> {
        devices.iter().map(|d| d.kname.as_str()).collect()
    }

    #[tokio::test]
    async fn test_new_devices_are_delayed_then_valid() {
        let sdb = disk_row("sdb", 10 * GIB);
        let mut h = harness(VolumeSetConfig::default(), &[&sdb]);
        let spec = LocalVolumeSetSpec::default();

        let first = h.reconciler.reconcile(&spec, &no_labels()).await.unwrap();
        assert!(first.valid.is_empty());
        assert_eq!(kname_list(&first.delayed), vec!["sdb"]);
        assert_eq!(first.requeue_after, Duration::from_secs(30));

        h.clock.advance(chrono::Duration::seconds(59));
        let second = h.reconciler.reconcile(&spec, &no_labels()).await.unwrap();
        assert_eq!(kname_list(&second.delayed), vec!["sdb"]);

        h.clock.advance(chrono::Duration::seconds(1));
        let third = h.reconciler.reconcile(&spec, &no_labels()).await.unwrap();
        assert_eq!(kname_list(&third.valid), vec!["sdb"]);
        assert!(third.delayed.is_empty());
        assert_eq!(third.requeue_after, DEFAULT_REQUEUE);

        // announced once, not on every delayed pass
        assert_eq!(h.events.events_with_reason("DiscoveredNewDevice").len(), 1);
    }

    #[tokio::test]
    async fn test_filters_run_before_age_gate() {
        let ro = r#"{"name": "sda", "kname": "sda", "type": "disk", "size": 10737418240, "ro": true, "rm": false, "state": "running"}"#;
        let mut h = harness(VolumeSetConfig::default(), &[ro]);

        let outcome = h
            .reconciler
            .reconcile(&LocalVolumeSetSpec::default(), &no_labels())
            .await
            .unwrap();
        assert!(outcome.delayed.is_empty());
        assert_eq!(outcome.excluded.len(), 1);
        assert!(h.events.events_with_reason("DiscoveredNewDevice").is_empty());
        assert_eq!(h.reconciler.ages().len(), 1);
    }

    #[tokio::test]
    async fn test_filesystem_signature_excludes_device() {
        let sdb = disk_row("sdb", 10 * GIB);
        let mut h = harness(VolumeSetConfig::default(), &[&sdb]);
        h.runner
            .set_response("blkid", CommandOutput::ok(r#"/dev/sdb: TYPE="xfs""#));

        let outcome = h
            .reconciler
            .reconcile(&LocalVolumeSetSpec::default(), &no_labels())
            .await
            .unwrap();
        assert_matches!(
            &outcome.excluded[0].1,
            FilterVerdict::Rejected { filter } if *filter == NO_FILESYSTEM_SIGNATURE
        );
    }

    #[tokio::test]
    async fn test_matchers_apply_after_age_gate() {
        let small = disk_row("sdb", GIB / 2);
        let large = disk_row("sdc", 10 * GIB);
        let mut h = harness(
            VolumeSetConfig {
                min_age: Duration::ZERO,
                ..Default::default()
            },
            &[&small, &large],
        );
        let spec = LocalVolumeSetSpec {
            device_inclusion_spec: DeviceInclusionSpec {
                device_types: vec![DeviceType::Disk],
                vendors: vec!["ATA".into()],
                ..Default::default()
            },
            ..Default::default()
        };

        let outcome = h.reconciler.reconcile(&spec, &no_labels()).await.unwrap();
        assert_eq!(kname_list(&outcome.valid), vec!["sdc"]);
        assert_matches!(
            &outcome.excluded[0].1,
            FilterVerdict::Rejected { filter } if *filter == IN_SIZE_RANGE
        );
    }

    #[tokio::test]
    async fn test_free_partition_of_partitioned_disk_is_valid() {
        let sdb = format!(
            r#"{{"name": "sdb", "kname": "sdb", "type": "disk", "size": {0}, "ro": false, "rm": false, "state": "running", "vendor": "ATA",
                "children": [{{"name": "sdb1", "kname": "sdb1", "type": "part", "size": {1}, "ro": false, "rm": false}}]}}"#,
            20 * GIB,
            10 * GIB
        );
        let mut h = harness(
            VolumeSetConfig {
                min_age: Duration::ZERO,
                ..Default::default()
            },
            &[&sdb],
        );
        let spec = LocalVolumeSetSpec {
            device_inclusion_spec: DeviceInclusionSpec {
                device_types: vec![DeviceType::Disk, DeviceType::Part],
                ..Default::default()
            },
            ..Default::default()
        };

        let outcome = h.reconciler.reconcile(&spec, &no_labels()).await.unwrap();
        assert_eq!(kname_list(&outcome.valid), vec!["sdb1"]);
        assert_eq!(outcome.excluded.len(), 1);
        assert_eq!(outcome.excluded[0].0.kname, "sdb");
        assert_matches!(
            &outcome.excluded[0].1,
            FilterVerdict::Rejected { filter } if *filter == NO_CHILDREN
        );
        assert_eq!(h.reconciler.ages().len(), 2);
    }

    #[tokio::test]
    async fn test_node_selector_skips_reconcile() {
        let sdb = disk_row("sdb", 10 * GIB);
        let mut h = harness(VolumeSetConfig::default(), &[&sdb]);
        let spec = LocalVolumeSetSpec {
            node_selector: Some(NodeSelector {
                node_selector_terms: vec![NodeSelectorTerm {
                    match_expressions: vec![NodeSelectorRequirement {
                        key: "kubernetes.io/hostname".into(),
                        operator: NodeSelectorOperator::In,
                        values: vec!["worker-1".into()],
                    }],
                }],
            }),
            ..Default::default()
        };

        let outcome = h.reconciler.reconcile(&spec, &no_labels()).await.unwrap();
        assert!(outcome.skipped);
        assert!(h.runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_enumeration_failure_fails_reconcile() {
        let mut h = harness(VolumeSetConfig::default(), &[]);
        h.runner.set_response("lsblk", CommandOutput::failed(32, "lsblk: not found"));

        let result = h.reconciler.reconcile(&LocalVolumeSetSpec::default(), &no_labels()).await;
        assert_matches!(result, Err(Error::CommandFailed { .. }));
        assert_eq!(h.events.events_with_reason("ErrorRunningBlockList").len(), 1);
    }

    #[tokio::test]
    async fn test_claim_decisions() {
        let sdb = disk_row("sdb", 10 * GIB);
        let sdc = disk_row("sdc", 10 * GIB);
        let mut h = harness(
            VolumeSetConfig {
                min_age: Duration::ZERO,
                claim_dir: Some(PathBuf::from(CLAIM_DIR)),
                ..Default::default()
            },
            &[&sdb, &sdc],
        );
        h.fs.add_symlink("/dev/disk/by-id/wwn-0x5000c500a1b2c3d4", "/dev/sdb");
        h.fs.add_symlink(format!("{}/wwn-0x5000c500a1b2c3d4", CLAIM_DIR), "/dev/sdc");
        h.fs.add_symlink(format!("{}/wwn-gone", CLAIM_DIR), "/dev/sdz");

        let outcome = h
            .reconciler
            .reconcile(&LocalVolumeSetSpec::default(), &no_labels())
            .await
            .unwrap();

        assert_eq!(outcome.claims.len(), 2);
        let claimable: Vec<_> = outcome.claimable().collect();
        assert_eq!(claimable.len(), 1);
        assert_eq!(claimable[0].device_id, "/dev/disk/by-id/wwn-0x5000c500a1b2c3d4");
        assert_matches!(&outcome.claims[1].decision, ClaimDecision::AlreadyClaimed { links } if links.len() == 1);
        assert_eq!(outcome.orphaned, vec![PathBuf::from(format!("{}/wwn-gone", CLAIM_DIR))]);
    }

    #[tokio::test]
    async fn test_busy_device_is_excluded() {
        let sdb = disk_row("sdb", 10 * GIB);
        let mut h = harness(
            VolumeSetConfig {
                min_age: Duration::ZERO,
                ..Default::default()
            },
            &[&sdb],
        );
        h.opener.set_state("/dev/sdb", DeviceState::Busy);

        let outcome = h
            .reconciler
            .reconcile(&LocalVolumeSetSpec::default(), &no_labels())
            .await
            .unwrap();
        assert!(outcome.valid.is_empty());
        assert_eq!(outcome.excluded.len(), 1);
    }
}
