//! Block Device Model
//!
//! One row of `lsblk --json` output, tolerant of the variations between
//! util-linux releases (upper or lower case keys, `"0"`/`"1"` or boolean
//! flags, numeric or string sizes, `null` for empty columns).

use crate::domain::ports::HostFs;
use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};

/// `BlockDevice::state` value of a suspended device-mapper device
pub const STATE_SUSPENDED: &str = "suspended";

/// Root of the per-device sysfs tree used to detect partitions
pub const SYSFS_BLOCK_DIR: &str = "/sys/block";

// =============================================================================
// Block Device
// =============================================================================

/// A block device as reported by lsblk, plus fields merged from blkid and
/// `/dev/disk/by-id`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDevice {
    #[serde(alias = "NAME", default, deserialize_with = "trimmed_string")]
    pub name: String,

    #[serde(rename = "kname", alias = "KNAME", default, deserialize_with = "trimmed_string")]
    pub kname: String,

    #[serde(rename = "type", alias = "TYPE", default, deserialize_with = "trimmed_string")]
    pub device_type: String,

    /// Size in bytes (`lsblk -b`)
    #[serde(alias = "SIZE", default, deserialize_with = "flexible_u64")]
    pub size: u64,

    #[serde(alias = "MODEL", default, deserialize_with = "trimmed_string")]
    pub model: String,

    #[serde(alias = "VENDOR", default, deserialize_with = "trimmed_string")]
    pub vendor: String,

    #[serde(alias = "SERIAL", default, deserialize_with = "trimmed_string")]
    pub serial: String,

    #[serde(rename = "rota", alias = "ROTA", default, deserialize_with = "flexible_bool")]
    pub rotational: bool,

    #[serde(rename = "ro", alias = "RO", default, deserialize_with = "flexible_bool")]
    pub read_only: bool,

    #[serde(rename = "rm", alias = "RM", default, deserialize_with = "flexible_bool")]
    pub removable: bool,

    #[serde(alias = "STATE", default, deserialize_with = "trimmed_string")]
    pub state: String,

    #[serde(rename = "partlabel", alias = "PARTLABEL", default, deserialize_with = "trimmed_string")]
    pub part_label: String,

    #[serde(alias = "WWN", default, deserialize_with = "trimmed_string")]
    pub wwn: String,

    /// Filesystem signature from blkid, empty if none
    #[serde(rename = "fsType", default)]
    pub fs_type: String,

    /// Cached persistent identity, filled by the identity resolver
    #[serde(rename = "pathByID", default, skip_serializing_if = "String::is_empty")]
    pub path_by_id: String,

    #[serde(default, deserialize_with = "null_vec")]
    pub children: Vec<BlockDevice>,
}

impl BlockDevice {
    /// Kernel device path, e.g. `/dev/sdb`
    pub fn dev_path(&self) -> Result<String> {
        if self.kname.is_empty() {
            return Err(Error::EmptyKernelName(self.name.clone()));
        }
        Ok(format!("/dev/{}", self.kname))
    }

    pub fn is_multipath(&self) -> bool {
        self.device_type == "mpath"
    }

    pub fn is_suspended(&self) -> bool {
        self.state == STATE_SUSPENDED
    }

    /// Whether the partition label marks a BIOS or boot partition
    pub fn has_bios_boot_label(&self) -> bool {
        let label = self.part_label.to_lowercase();
        label.contains("bios") || label.contains("boot")
    }

    /// Whether blkid found any filesystem signature
    pub fn has_filesystem(&self) -> bool {
        !self.fs_type.is_empty()
    }
}

// =============================================================================
// Host Probes
// =============================================================================

/// Whether sysfs lists partitions for the device, i.e. entries under
/// `/sys/block/<kname>/` that start with the kernel name
pub fn has_sysfs_partitions(fs: &dyn HostFs, sysfs_block_dir: &Path, kname: &str) -> Result<bool> {
    let pattern = sysfs_block_dir.join(kname).join("*");
    let paths = fs.glob(&pattern.to_string_lossy())?;
    Ok(paths.iter().any(|path| {
        path.file_name()
            .map(|name| name.to_string_lossy().starts_with(kname))
            .unwrap_or(false)
    }))
}

/// A mount table entry that references a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountReference {
    pub mount_point: PathBuf,
    pub source: String,
}

/// Scan a `/proc/<pid>/mountinfo` table for mounts of `kname`.
///
/// A device counts as mounted when the mount root is `/<kname>` (a bind mount
/// of the devtmpfs node) or the mount source is `/dev/<kname>`.
pub fn find_mount(mount_info: &str, kname: &str) -> Option<MountReference> {
    if kname.is_empty() {
        return None;
    }
    let bind_root = format!("/{}", kname);
    let dev_source = format!("/dev/{}", kname);

    mount_info
        .lines()
        .filter(|line| line.contains(kname))
        .find_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 5 {
                return None;
            }
            // optional fields end at the "-" separator; source follows fstype
            let source = fields
                .iter()
                .position(|f| *f == "-")
                .and_then(|sep| fields.get(sep + 2))
                .copied()
                .unwrap_or_default();

            if fields[3] == bind_root || source == dev_source {
                Some(MountReference {
                    mount_point: PathBuf::from(fields[4]),
                    source: source.to_string(),
                })
            } else {
                None
            }
        })
}

// =============================================================================
// Deserialization Helpers
// =============================================================================

fn trimmed_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.map(|v| v.trim().to_string()).unwrap_or_default())
}

fn flexible_bool<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;

    match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => Ok(false),
        Some(serde_json::Value::Bool(b)) => Ok(b),
        Some(serde_json::Value::Number(n)) => Ok(n.as_u64().unwrap_or(0) != 0),
        Some(serde_json::Value::String(s)) => match s.trim() {
            "" | "0" => Ok(false),
            "1" => Ok(true),
            other => Err(D::Error::custom(format!(
                "lsblk bool value not 0 or 1: {:?}",
                other
            ))),
        },
        Some(other) => Err(D::Error::custom(format!("unexpected bool value {}", other))),
    }
}

fn flexible_u64<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;

    match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => Ok(0),
        Some(serde_json::Value::Number(n)) => n
            .as_u64()
            .ok_or_else(|| D::Error::custom(format!("invalid size {}", n))),
        Some(serde_json::Value::String(s)) if s.trim().is_empty() => Ok(0),
        Some(serde_json::Value::String(s)) => s
            .trim()
            .parse()
            .map_err(|_| D::Error::custom(format!("invalid size {:?}", s))),
        Some(other) => Err(D::Error::custom(format!("unexpected size value {}", other))),
    }
}

fn null_vec<'de, D>(deserializer: D) -> std::result::Result<Vec<BlockDevice>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<BlockDevice>>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::FakeHostFs;

    #[test]
    fn test_deserialize_modern_lsblk_row() {
        let row = r#"{"name": "sda", "rota": true, "type": "mpath", "size": 480103981056,
            "model": "MTFDDAK480TDS   ", "vendor": "ATA     ", "ro": false, "rm": false,
            "state": "running", "kname": "sda", "serial": "20442B9F5254", "partlabel": null,
            "wwn": "0x500a07512b9f5254"}"#;
        let dev: BlockDevice = serde_json::from_str(row).unwrap();
        assert_eq!(dev.name, "sda");
        assert_eq!(dev.kname, "sda");
        assert_eq!(dev.device_type, "mpath");
        assert_eq!(dev.size, 480_103_981_056);
        assert_eq!(dev.model, "MTFDDAK480TDS");
        assert_eq!(dev.vendor, "ATA");
        assert!(dev.rotational);
        assert!(!dev.read_only);
        assert_eq!(dev.part_label, "");
        assert!(dev.children.is_empty());
    }

    #[test]
    fn test_deserialize_legacy_lsblk_row() {
        let row = r#"{"NAME": "sdc", "ROTA": "1", "TYPE": "disk", "SIZE": "62914560000",
            "RO": "0", "RM": "1", "KNAME": "sdc", "children": null}"#;
        let dev: BlockDevice = serde_json::from_str(row).unwrap();
        assert_eq!(dev.name, "sdc");
        assert!(dev.rotational);
        assert!(dev.removable);
        assert!(!dev.read_only);
        assert_eq!(dev.size, 62_914_560_000);
    }

    #[test]
    fn test_invalid_bool_rejected() {
        let row = r#"{"name": "sdc", "ro": "yes"}"#;
        assert!(serde_json::from_str::<BlockDevice>(row).is_err());
    }

    #[test]
    fn test_dev_path() {
        let dev = BlockDevice {
            kname: "sdb".into(),
            ..Default::default()
        };
        assert_eq!(dev.dev_path().unwrap(), "/dev/sdb");

        let dev = BlockDevice {
            name: "sdb".into(),
            ..Default::default()
        };
        assert!(dev.dev_path().is_err());
    }

    #[test]
    fn test_bios_boot_label() {
        for label in ["BIOS-BOOT", "bios-boot", "this is a BIOS BOOT partition", "boot", "BIOS"] {
            let dev = BlockDevice {
                part_label: label.into(),
                ..Default::default()
            };
            assert!(dev.has_bios_boot_label(), "{}", label);
        }
        for label in ["", "asdf", "EFI-SYSTEM"] {
            let dev = BlockDevice {
                part_label: label.into(),
                ..Default::default()
            };
            assert!(!dev.has_bios_boot_label(), "{}", label);
        }
    }

    #[test]
    fn test_find_mount_by_source() {
        let info = "\
22 1 8:1 / / rw,relatime shared:1 - xfs /dev/sda1 rw
98 22 8:16 / /var/lib/kubelet/pods/x rw,relatime shared:50 - ext4 /dev/sdb rw";
        let found = find_mount(info, "sdb").unwrap();
        assert_eq!(found.mount_point, PathBuf::from("/var/lib/kubelet/pods/x"));
        assert_eq!(found.source, "/dev/sdb");
        assert!(find_mount(info, "sdc").is_none());
    }

    #[test]
    fn test_find_mount_by_bind_root() {
        let info = "120 25 0:5 /sdc /mnt/local-storage/sc/sdc rw,nosuid - devtmpfs devtmpfs rw";
        let found = find_mount(info, "sdc").unwrap();
        assert_eq!(found.mount_point, PathBuf::from("/mnt/local-storage/sc/sdc"));
    }

    #[test]
    fn test_find_mount_ignores_name_prefix() {
        // sdb1 is mounted, sdb itself is not
        let info = "98 22 8:17 / /data rw - ext4 /dev/sdb1 rw";
        assert!(find_mount(info, "sdb").is_none());
        assert!(find_mount(info, "sdb1").is_some());
    }

    #[test]
    fn test_has_sysfs_partitions() {
        let fs = FakeHostFs::new()
            .with_file("/sys/block/sda/sda1", "")
            .with_file("/sys/block/sda/removable", "0")
            .with_file("/sys/block/sdb/removable", "0");

        assert!(has_sysfs_partitions(&fs, Path::new(SYSFS_BLOCK_DIR), "sda").unwrap());
        assert!(!has_sysfs_partitions(&fs, Path::new(SYSFS_BLOCK_DIR), "sdb").unwrap());
    }
}
