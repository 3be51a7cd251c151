//! Device Discovery
//!
//! Builds the per-node discovery result: enumerate, drop devices that are
//! not worth reporting, resolve identities, compute availability, collapse
//! duplicates and publish.

use crate::crd::{
    DeviceMechanicalProperty, DeviceStatus, DeviceType, DiscoveredDevice, DiscoveryState,
    LocalVolumeDiscoveryResultStatus,
};
use crate::domain::events::DiscoveryEvent;
use crate::domain::ports::{ClockRef, EventReporterRef, HostFsRef, ResultPublisherRef};
use crate::error::Result;
use crate::hardware::discovery::{
    has_sysfs_partitions, BlockDevice, BlockDeviceEnumerator, IdentityResolution, IdentityResolver,
    SYSFS_BLOCK_DIR,
};
use chrono::SecondsFormat;
use dashmap::DashSet;
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for device discovery
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Node the result is reported for
    pub node_name: String,
    /// sysfs block directory used to detect partitions
    pub sysfs_block_dir: PathBuf,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            sysfs_block_dir: PathBuf::from(SYSFS_BLOCK_DIR),
        }
    }
}

// =============================================================================
// Device Discovery
// =============================================================================

/// Discovery result builder for one node
pub struct DeviceDiscovery {
    config: DiscoveryConfig,
    enumerator: BlockDeviceEnumerator,
    resolver: IdentityResolver,
    fs: HostFsRef,
    clock: ClockRef,
    events: EventReporterRef,
    publisher: ResultPublisherRef,
    /// Devices already reported as lacking a by-id link
    missing_ids: DashSet<String>,
}

impl DeviceDiscovery {
    pub fn new(
        config: DiscoveryConfig,
        enumerator: BlockDeviceEnumerator,
        resolver: IdentityResolver,
        fs: HostFsRef,
        clock: ClockRef,
        events: EventReporterRef,
        publisher: ResultPublisherRef,
    ) -> Self {
        Self {
            config,
            enumerator,
            resolver,
            fs,
            clock,
            events,
            publisher,
            missing_ids: DashSet::new(),
        }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Run one discovery pass and publish the result
    pub async fn discover(&self) -> Result<LocalVolumeDiscoveryResultStatus> {
        info!(node = %self.config.node_name, "Discovering devices");

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

        let valid = self.valid_block_devices(inventory.devices);
        let discovered = unique_devices(self.discovered_devices(valid));

        let status = LocalVolumeDiscoveryResultStatus {
            discovered_time_stamp: Some(self.clock.now().to_rfc3339_opts(SecondsFormat::Secs, true)),
            discovered_devices: discovered,
        };

        self.publisher.publish(&status).await?;
        info!(
            devices = status.discovered_devices.len(),
            publisher = self.publisher.name(),
            "Published discovery result"
        );
        Ok(status)
    }

    /// Devices worth reporting
    pub fn valid_block_devices(&self, devices: Vec<BlockDevice>) -> Vec<BlockDevice> {
        devices
            .into_iter()
            .filter(|device| !self.ignore_device(device))
            .collect()
    }

    /// Whether discovery skips the device entirely: read-only, suspended,
    /// an unsupported type, or a disk carrying partitions
    pub fn ignore_device(&self, device: &BlockDevice) -> bool {
        if device.read_only {
            debug!(device = %device.name, "Ignoring read-only device");
            return true;
        }
        if device.is_suspended() {
            debug!(device = %device.name, "Ignoring suspended device");
            return true;
        }
        if DeviceType::parse(&device.device_type).is_none() {
            debug!(device = %device.name, device_type = %device.device_type, "Ignoring unsupported device type");
            return true;
        }
        if !device.children.is_empty() {
            debug!(device = %device.name, "Ignoring device with partitions");
            return true;
        }
        match has_sysfs_partitions(self.fs.as_ref(), &self.config.sysfs_block_dir, &device.kname) {
            Ok(false) => false,
            Ok(true) => {
                debug!(device = %device.name, "Ignoring device with partitions");
                true
            }
            Err(e) => {
                error!(device = %device.name, error = %e, "Failed to check for partitions");
                true
            }
        }
    }

    /// Turn vetted devices into discovery records
    pub fn discovered_devices(&self, devices: Vec<BlockDevice>) -> Vec<DiscoveredDevice> {
        let mut discovered = Vec::with_capacity(devices.len());

        for mut device in devices {
            let path = match device.dev_path() {
                Ok(path) => path,
                Err(e) => {
                    warn!(device = %device.name, error = %e, "Skipping device without kernel name");
                    continue;
                }
            };

            let device_id = match self.resolver.path_by_id(&mut device, None) {
                Ok(IdentityResolution::Found(id)) => id,
                Ok(IdentityResolution::NotFound { fallback }) => {
                    if self.missing_ids.insert(device.kname.clone()) {
                        self.events.report(DiscoveryEvent::DeviceIdNotFound {
                            kname: device.kname.clone(),
                        });
                    }
                    fallback
                }
                Err(e) => {
                    warn!(device = %device.name, error = %e, "Failed to resolve by-id path");
                    path.clone()
                }
            };

            let status = if device.is_multipath() {
                DeviceStatus::new(DiscoveryState::Unknown)
            } else {
                device_status(&device)
            };

            discovered.push(DiscoveredDevice {
                device_id,
                path,
                model: device.model.clone(),
                device_type: DeviceType::parse(&device.device_type),
                vendor: device.vendor.clone(),
                serial: device.serial.clone(),
                size: device.size,
                property: DeviceMechanicalProperty::from_rotational(device.rotational),
                fs_type: device.fs_type.clone(),
                status,
                wwn: device.wwn.clone(),
            });
        }

        discovered
    }
}

impl std::fmt::Debug for DeviceDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceDiscovery")
            .field("config", &self.config)
            .field("publisher", &self.publisher.name())
            .finish()
    }
}

/// Availability from signatures: a filesystem or BIOS/boot label makes a
/// device `NotAvailable`
pub fn device_status(device: &BlockDevice) -> DeviceStatus {
    if device.has_filesystem() || device.has_bios_boot_label() {
        DeviceStatus::new(DiscoveryState::NotAvailable)
    } else {
        DeviceStatus::new(DiscoveryState::Available)
    }
}

/// Keep the first record for each device ID
pub fn unique_devices(devices: Vec<DiscoveredDevice>) -> Vec<DiscoveredDevice> {
    let mut seen = HashSet::new();
    devices
        .into_iter()
        .filter(|device| seen.insert(device.device_id.clone()))
        .collect()
}
