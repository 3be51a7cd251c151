//! Block Device Enumerator
//!
//! Lists block devices with lsblk and merges the filesystem signatures
//! reported by blkid.

use super::block_device::BlockDevice;
use crate::domain::ports::CommandRunnerRef;
use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::{debug, info, warn};

// =============================================================================
// Constants
// =============================================================================

/// Columns requested from lsblk
pub const LSBLK_COLUMNS: &str = "NAME,ROTA,TYPE,SIZE,MODEL,VENDOR,RO,RM,STATE,KNAME,SERIAL,PARTLABEL,WWN";

/// blkid exits with 2 when no device matched the query
const BLKID_NO_DEVICES_EXIT: i32 = 2;

// =============================================================================
// Inventory
// =============================================================================

/// An lsblk row that could not be used
#[derive(Debug, Clone, PartialEq)]
pub struct BadRow {
    /// The row as emitted by lsblk
    pub raw: serde_json::Value,
    pub reason: String,
}

/// Result of one enumeration pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Inventory {
    pub devices: Vec<BlockDevice>,
    pub bad_rows: Vec<BadRow>,
}

#[derive(Deserialize)]
struct LsblkOutput {
    #[serde(default)]
    blockdevices: Vec<serde_json::Value>,
}

// =============================================================================
// Enumerator
// =============================================================================

/// Enumerates the host's block devices through lsblk and blkid
#[derive(Clone)]
pub struct BlockDeviceEnumerator {
    runner: CommandRunnerRef,
}

impl BlockDeviceEnumerator {
    pub fn new(runner: CommandRunnerRef) -> Self {
        Self { runner }
    }

    /// List block devices, restricted to `devices` when non-empty.
    ///
    /// Partitions are listed after their parent disk, which keeps its
    /// `children`. Rows without a name are returned as bad rows. The call
    /// only fails when a tool cannot be run, its output is not JSON, or every
    /// row is bad.
    pub async fn list_block_devices(&self, devices: &[String]) -> Result<Inventory> {
        let fs_map = self.device_fs_map(devices).await?;

        let mut args: Vec<String> = vec![
            "--json".into(),
            "-b".into(),
            "-o".into(),
            LSBLK_COLUMNS.into(),
        ];
        args.extend(devices.iter().cloned());

        info!(command = "lsblk", args = ?args, "Executing command");
        let output = self.runner.run("lsblk", &args).await?;
        if !output.success() {
            return Err(Error::CommandFailed {
                command: "lsblk".into(),
                code: output.code,
                output: output.output,
            });
        }

        let mut inventory = parse_lsblk_output(&output.output)?;
        for device in inventory.devices.iter_mut() {
            apply_fs_types(device, &fs_map);
        }
        inventory.devices = flatten_children(inventory.devices);

        debug!(
            devices = inventory.devices.len(),
            bad_rows = inventory.bad_rows.len(),
            "lsblk enumeration finished"
        );
        Ok(inventory)
    }

    /// Map of `/dev/<name>` to filesystem type from `blkid -s TYPE`
    pub async fn device_fs_map(&self, devices: &[String]) -> Result<HashMap<String, String>> {
        let mut args: Vec<String> = vec!["-s".into(), "TYPE".into()];
        args.extend(devices.iter().cloned());

        let output = self.runner.run("blkid", &args).await?;
        match output.code {
            Some(0) => Ok(parse_blkid_output(&output.output)),
            Some(BLKID_NO_DEVICES_EXIT) => {
                debug!("blkid found no devices");
                Ok(HashMap::new())
            }
            code => Err(Error::CommandFailed {
                command: "blkid".into(),
                code,
                output: output.output,
            }),
        }
    }
}

impl std::fmt::Debug for BlockDeviceEnumerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockDeviceEnumerator").finish_non_exhaustive()
    }
}

// =============================================================================
// Parsing
// =============================================================================

/// Parse `lsblk --json` output into devices and bad rows
pub fn parse_lsblk_output(output: &str) -> Result<Inventory> {
    let parsed: LsblkOutput = serde_json::from_str(output.trim()).map_err(|e| {
        Error::Enumeration(format!("failed to unmarshal lsblk JSON {:?}: {}", output, e))
    })?;

    let total = parsed.blockdevices.len();
    let mut inventory = Inventory::default();

    for raw in parsed.blockdevices {
        match serde_json::from_value::<BlockDevice>(raw.clone()) {
            Ok(device) if device.name.trim().is_empty() => {
                warn!(row = %raw, "Found an lsblk entry with empty name");
                inventory.bad_rows.push(BadRow {
                    raw,
                    reason: "empty name".into(),
                });
            }
            Ok(device) => inventory.devices.push(device),
            Err(e) => {
                warn!(row = %raw, error = %e, "Failed to parse lsblk entry");
                inventory.bad_rows.push(BadRow {
                    raw,
                    reason: e.to_string(),
                });
            }
        }
    }

    if total > 0 && inventory.bad_rows.len() == total {
        return Err(Error::NoParsableRows { rows: total });
    }

    Ok(inventory)
}

/// Parse `blkid -s TYPE` output.
///
/// ```text
/// /dev/sdc: TYPE="ext4"
/// /dev/sdd: TYPE="ext2"
/// ```
pub fn parse_blkid_output(output: &str) -> HashMap<String, String> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let (device, rest) = line.split_once(':')?;
            let (key, value) = rest.split_once('=')?;
            if key.trim() != "TYPE" {
                return None;
            }
            Some((
                device.trim().to_string(),
                value.trim().trim_matches('"').to_string(),
            ))
        })
        .collect()
}

/// Device-mapper nodes show up in blkid as `/dev/mapper/<name>` or `/dev/dm-N`
fn apply_fs_types(device: &mut BlockDevice, fs_map: &HashMap<String, String>) {
    let candidates = [
        format!("/dev/{}", device.name),
        format!("/dev/{}", device.kname),
        format!("/dev/mapper/{}", device.name),
    ];
    if let Some(fs) = candidates.iter().find_map(|path| fs_map.get(path)) {
        device.fs_type = fs.clone();
    }
    for child in device.children.iter_mut() {
        apply_fs_types(child, fs_map);
    }
}

/// Every device in lsblk order with its descendants right after it
fn flatten_children(devices: Vec<BlockDevice>) -> Vec<BlockDevice> {
    let mut flat = Vec::with_capacity(devices.len());
    for device in devices {
        let children = device.children.clone();
        flat.push(device);
        flat.extend(flatten_children(children));
    }
    flat
}
