//! Device Filters
//!
//! Structural predicates that exclude block devices which can never be
//! claimed. Each filter looks at one device on its own; the pipeline runs
//! them in order and stops at the first rejection.

use crate::domain::ports::{DeviceOpenerRef, HostFsRef, OpenOutcome};
use crate::error::{Error, Result};
use crate::hardware::discovery::{find_mount, BlockDevice};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

/// Host mount table used for bind-mount detection (requires hostPID)
pub const MOUNT_INFO_PATH: &str = "/proc/1/mountinfo";

// =============================================================================
// Filter Names
// =============================================================================

pub const NOT_READ_ONLY: &str = "notReadOnly";
pub const NOT_REMOVABLE: &str = "notRemovable";
pub const NOT_SUSPENDED: &str = "notSuspended";
pub const NO_BIOS_BOOT_IN_PART_LABEL: &str = "noBiosBootInPartLabel";
pub const NO_FILESYSTEM_SIGNATURE: &str = "noFilesystemSignature";
pub const NO_BIND_MOUNTS: &str = "noBindMounts";
pub const NO_CHILDREN: &str = "noChildren";
pub const CAN_OPEN_EXCLUSIVELY: &str = "canOpenExclusively";

// =============================================================================
// Filter Trait and Verdict
// =============================================================================

/// A named predicate over a single device
pub trait DeviceFilter: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Ok(true)` when the device passes
    fn check(&self, device: &BlockDevice) -> Result<bool>;
}

/// Outcome of running a device through a filter or matcher chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterVerdict {
    Pass,
    /// A predicate returned false
    Rejected { filter: &'static str },
    /// A predicate could not be evaluated; the device is excluded
    Failed { filter: &'static str, reason: String },
}

impl FilterVerdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, FilterVerdict::Pass)
    }

    /// Name of the predicate that excluded the device
    pub fn filter(&self) -> Option<&'static str> {
        match self {
            FilterVerdict::Pass => None,
            FilterVerdict::Rejected { filter } | FilterVerdict::Failed { filter, .. } => Some(*filter),
        }
    }
}

// =============================================================================
// Filters
// =============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct NotReadOnly;

impl DeviceFilter for NotReadOnly {
    fn name(&self) -> &'static str {
        NOT_READ_ONLY
    }

    fn check(&self, device: &BlockDevice) -> Result<bool> {
        Ok(!device.read_only)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NotRemovable;

impl DeviceFilter for NotRemovable {
    fn name(&self) -> &'static str {
        NOT_REMOVABLE
    }

    fn check(&self, device: &BlockDevice) -> Result<bool> {
        Ok(!device.removable)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NotSuspended;

impl DeviceFilter for NotSuspended {
    fn name(&self) -> &'static str {
        NOT_SUSPENDED
    }

    fn check(&self, device: &BlockDevice) -> Result<bool> {
        Ok(!device.is_suspended())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoBiosBootInPartLabel;

impl DeviceFilter for NoBiosBootInPartLabel {
    fn name(&self) -> &'static str {
        NO_BIOS_BOOT_IN_PART_LABEL
    }

    fn check(&self, device: &BlockDevice) -> Result<bool> {
        Ok(!device.has_bios_boot_label())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoFilesystemSignature;

impl DeviceFilter for NoFilesystemSignature {
    fn name(&self) -> &'static str {
        NO_FILESYSTEM_SIGNATURE
    }

    fn check(&self, device: &BlockDevice) -> Result<bool> {
        Ok(!device.has_filesystem())
    }
}

/// Rejects devices referenced by the host mount table
pub struct NoBindMounts {
    fs: HostFsRef,
    mount_info_path: PathBuf,
}

impl NoBindMounts {
    pub fn new(fs: HostFsRef, mount_info_path: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            mount_info_path: mount_info_path.into(),
        }
    }
}

impl DeviceFilter for NoBindMounts {
    fn name(&self) -> &'static str {
        NO_BIND_MOUNTS
    }

    fn check(&self, device: &BlockDevice) -> Result<bool> {
        let mount_info = self
            .fs
            .read_to_string(&self.mount_info_path)
            .map_err(|e| Error::FilterEvaluation {
                filter: NO_BIND_MOUNTS.into(),
                device: device.name.clone(),
                reason: format!("failed to read {}: {}", self.mount_info_path.display(), e),
            })?;

        match find_mount(&mount_info, &device.kname) {
            Some(mount) => {
                debug!(device = %device.name, mount_point = %mount.mount_point.display(), "Device is mounted");
                Ok(false)
            }
            None => Ok(true),
        }
    }
}

/// Rejects whole disks that carry partitions; the partitions themselves
/// are judged on their own
#[derive(Debug, Clone, Copy, Default)]
pub struct NoChildren;

impl DeviceFilter for NoChildren {
    fn name(&self) -> &'static str {
        NO_CHILDREN
    }

    fn check(&self, device: &BlockDevice) -> Result<bool> {
        Ok(device.children.is_empty())
    }
}

/// Probes the device with an exclusive open; busy devices are rejected
pub struct CanOpenExclusively {
    opener: DeviceOpenerRef,
}

impl CanOpenExclusively {
    pub fn new(opener: DeviceOpenerRef) -> Self {
        Self { opener }
    }
}

impl DeviceFilter for CanOpenExclusively {
    fn name(&self) -> &'static str {
        CAN_OPEN_EXCLUSIVELY
    }

    fn check(&self, device: &BlockDevice) -> Result<bool> {
        let path = device.dev_path()?;
        let evaluation_error = |reason: String| Error::FilterEvaluation {
            filter: CAN_OPEN_EXCLUSIVELY.into(),
            device: path.clone(),
            reason,
        };

        match self.opener.open_exclusive(Path::new(&path)) {
            Ok(OpenOutcome::Acquired(handle)) => {
                handle.close();
                Ok(true)
            }
            Ok(OpenOutcome::Busy) => Ok(false),
            Err(e) => Err(evaluation_error(e.to_string())),
        }
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// Ordered list of filters, built once and shared by reference
pub struct FilterPipeline {
    filters: Vec<Box<dyn DeviceFilter>>,
}

impl FilterPipeline {
    pub fn new(filters: Vec<Box<dyn DeviceFilter>>) -> Self {
        Self { filters }
    }

    /// The full filter set used on real hosts
    pub fn standard(fs: HostFsRef, opener: DeviceOpenerRef) -> Self {
        Self::with_mount_info(fs, opener, MOUNT_INFO_PATH)
    }

    pub fn with_mount_info(fs: HostFsRef, opener: DeviceOpenerRef, mount_info_path: impl Into<PathBuf>) -> Self {
        Self::new(vec![
            Box::new(NotReadOnly),
            Box::new(NotRemovable),
            Box::new(NotSuspended),
            Box::new(NoBiosBootInPartLabel),
            Box::new(NoFilesystemSignature),
            Box::new(NoChildren),
            Box::new(NoBindMounts::new(fs, mount_info_path)),
            // last: it opens the device
            Box::new(CanOpenExclusively::new(opener)),
        ])
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.filters.iter().map(|f| f.name()).collect()
    }

    /// Run every filter until one rejects the device or fails
    pub fn evaluate(&self, device: &BlockDevice) -> FilterVerdict {
        for filter in &self.filters {
            match filter.check(device) {
                Ok(true) => continue,
                Ok(false) => {
                    info!(device = %device.name, filter = filter.name(), "filter negative");
                    return FilterVerdict::Rejected { filter: filter.name() };
                }
                Err(e) => {
                    error!(device = %device.name, filter = filter.name(), error = %e, "filter error");
                    return FilterVerdict::Failed {
                        filter: filter.name(),
                        reason: e.to_string(),
                    };
                }
            }
        }
        FilterVerdict::Pass
    }

    /// Split devices into those passing every filter and those excluded
    pub fn partition(&self, devices: &[BlockDevice]) -> (Vec<BlockDevice>, Vec<(BlockDevice, FilterVerdict)>) {
        let mut passed = Vec::new();
        let mut excluded = Vec::new();
        for device in devices {
            match self.evaluate(device) {
                FilterVerdict::Pass => passed.push(device.clone()),
                verdict => excluded.push((device.clone(), verdict)),
            }
        }
        (passed, excluded)
    }
}

impl std::fmt::Debug for FilterPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterPipeline")
            .field("filters", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{DeviceState, FakeHostFs, ScriptedDeviceOpener};
    use assert_matches::assert_matches;
    use std::io::ErrorKind;
    use std::sync::Arc;

    const MOUNT_INFO: &str = "\
22 1 8:1 / / rw,relatime shared:1 - xfs /dev/sda1 rw
120 25 0:5 /sdc /mnt/local-storage/sc/sdc rw,nosuid - devtmpfs devtmpfs rw
";

    fn device(kname: &str) -> BlockDevice {
        BlockDevice {
            name: kname.into(),
            kname: kname.into(),
            device_type: "disk".into(),
            state: "running".into(),
            size: 10 * 1024 * 1024 * 1024,
            ..Default::default()
        }
    }

    fn pipeline(opener: ScriptedDeviceOpener) -> FilterPipeline {
        let fs = FakeHostFs::new().with_file(MOUNT_INFO_PATH, MOUNT_INFO);
        FilterPipeline::standard(Arc::new(fs), Arc::new(opener))
    }

    #[test]
    fn test_simple_filters() {
        let mut dev = device("sdb");
        assert!(NotReadOnly.check(&dev).unwrap());
        assert!(NotRemovable.check(&dev).unwrap());
        assert!(NotSuspended.check(&dev).unwrap());
        assert!(NoFilesystemSignature.check(&dev).unwrap());
        assert!(NoChildren.check(&dev).unwrap());

        dev.read_only = true;
        dev.removable = true;
        dev.state = "suspended".into();
        dev.fs_type = "xfs".into();
        dev.children.push(device("sdb1"));
        assert!(!NotReadOnly.check(&dev).unwrap());
        assert!(!NotRemovable.check(&dev).unwrap());
        assert!(!NotSuspended.check(&dev).unwrap());
        assert!(!NoFilesystemSignature.check(&dev).unwrap());
        assert!(!NoChildren.check(&dev).unwrap());
    }

    #[test]
    fn test_not_suspended_accepts_other_states() {
        for state in ["running", "live", ""] {
            let mut dev = device("sdb");
            dev.state = state.into();
            assert!(NotSuspended.check(&dev).unwrap(), "{}", state);
        }
    }

    #[test]
    fn test_no_bind_mounts() {
        let fs = Arc::new(FakeHostFs::new().with_file(MOUNT_INFO_PATH, MOUNT_INFO));
        let filter = NoBindMounts::new(fs, MOUNT_INFO_PATH);
        assert!(filter.check(&device("sdb")).unwrap());
        assert!(!filter.check(&device("sdc")).unwrap());
        assert!(filter.check(&device("sda")).unwrap());
        assert!(!filter.check(&device("sda1")).unwrap());
    }

    #[test]
    fn test_no_bind_mounts_read_error() {
        let filter = NoBindMounts::new(Arc::new(FakeHostFs::new()), MOUNT_INFO_PATH);
        let err = filter.check(&device("sdb")).unwrap_err();
        assert_matches!(err, Error::FilterEvaluation { ref filter, .. } if filter == NO_BIND_MOUNTS);
    }

    #[test]
    fn test_can_open_exclusively() {
        let opener = Arc::new(
            ScriptedDeviceOpener::new()
                .with_state("/dev/sdc", DeviceState::Busy)
                .with_state("/dev/sdd", DeviceState::Failing(ErrorKind::PermissionDenied)),
        );
        let filter = CanOpenExclusively::new(opener.clone());

        assert!(filter.check(&device("sdb")).unwrap());
        assert!(!filter.check(&device("sdc")).unwrap());
        assert_matches!(filter.check(&device("sdd")), Err(Error::FilterEvaluation { .. }));
        assert_matches!(filter.check(&BlockDevice::default()), Err(Error::EmptyKernelName(_)));
        assert_eq!(opener.opens().len(), 3);
    }

    #[test]
    fn test_pipeline_read_only_is_absolute() {
        let pipeline = pipeline(ScriptedDeviceOpener::new());
        let mut dev = device("sdb");
        dev.read_only = true;
        assert_eq!(
            pipeline.evaluate(&dev),
            FilterVerdict::Rejected { filter: NOT_READ_ONLY }
        );
    }

    #[test]
    fn test_pipeline_short_circuits() {
        let opener = Arc::new(ScriptedDeviceOpener::new());
        let fs = FakeHostFs::new().with_file(MOUNT_INFO_PATH, MOUNT_INFO);
        let pipeline = FilterPipeline::standard(Arc::new(fs), opener.clone());

        let mut dev = device("sdb");
        dev.part_label = "BIOS-BOOT".into();
        assert_eq!(pipeline.evaluate(&dev).filter(), Some(NO_BIOS_BOOT_IN_PART_LABEL));
        // the exclusive open probe never ran
        assert!(opener.opens().is_empty());
    }

    #[test]
    fn test_pipeline_failure_excludes_device() {
        let pipeline = pipeline(
            ScriptedDeviceOpener::new().with_state("/dev/sdb", DeviceState::Failing(ErrorKind::Other)),
        );
        assert_matches!(
            pipeline.evaluate(&device("sdb")),
            FilterVerdict::Failed { filter: CAN_OPEN_EXCLUSIVELY, .. }
        );
    }

    #[test]
    fn test_pipeline_partition_is_idempotent() {
        let pipeline = pipeline(ScriptedDeviceOpener::new().with_state("/dev/sde", DeviceState::Busy));
        let mut mounted = device("sdc");
        mounted.model = "mounted".into();
        let devices = vec![device("sdb"), mounted, device("sdd"), device("sde")];

        let first = pipeline.partition(&devices);
        let second = pipeline.partition(&devices);
        assert_eq!(first, second);

        let passed: Vec<_> = first.0.iter().map(|d| d.kname.as_str()).collect();
        assert_eq!(passed, vec!["sdb", "sdd"]);
        assert_eq!(first.1[0].1, FilterVerdict::Rejected { filter: NO_BIND_MOUNTS });
        assert_eq!(first.1[1].1, FilterVerdict::Rejected { filter: CAN_OPEN_EXCLUSIVELY });
    }

    #[test]
    fn test_pipeline_names() {
        let pipeline = pipeline(ScriptedDeviceOpener::new());
        assert_eq!(pipeline.names().len(), 8);
        assert_eq!(pipeline.names().last(), Some(&CAN_OPEN_EXCLUSIVELY));
    }
}
