//! LocalVolumeDiscoveryResult CRD
//!
//! Per-node report of every block device the discovery daemon considers
//! worth showing, with its persistent identity and availability.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Label on the discovery result identifying the node it belongs to
pub const DISCOVERY_NODE_LABEL: &str = "discovery-result-node";

// =============================================================================
// LocalVolumeDiscoveryResult CRD
// =============================================================================

/// LocalVolumeDiscoveryResult holds the devices discovered on one node.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.billyronks.io",
    version = "v1alpha1",
    kind = "LocalVolumeDiscoveryResult",
    plural = "localvolumediscoveryresults",
    shortname = "lvdr",
    status = "LocalVolumeDiscoveryResultStatus",
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".spec.nodeName"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct LocalVolumeDiscoveryResultSpec {
    /// Node the devices were discovered on
    pub node_name: String,
}

/// Status of a LocalVolumeDiscoveryResult
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalVolumeDiscoveryResultStatus {
    /// When the devices were last discovered (RFC 3339)
    #[serde(default)]
    pub discovered_time_stamp: Option<String>,

    /// Unique devices keyed by persistent identity
    #[serde(default)]
    pub discovered_devices: Vec<DiscoveredDevice>,
}

// =============================================================================
// Discovered Device
// =============================================================================

/// One discovery record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredDevice {
    /// Persistent identity, normally a `/dev/disk/by-id/` path
    #[serde(rename = "deviceID")]
    pub device_id: String,

    /// Kernel device path, e.g. `/dev/sdb`
    pub path: String,

    #[serde(default)]
    pub model: String,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<DeviceType>,

    #[serde(default)]
    pub vendor: String,

    #[serde(default)]
    pub serial: String,

    /// Size in bytes
    #[serde(default)]
    pub size: u64,

    pub property: DeviceMechanicalProperty,

    #[serde(default)]
    pub fs_type: String,

    pub status: DeviceStatus,

    #[serde(rename = "WWN", default)]
    pub wwn: String,
}

/// Availability of a discovered device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DeviceStatus {
    pub state: DiscoveryState,
}

impl DeviceStatus {
    pub fn new(state: DiscoveryState) -> Self {
        Self { state }
    }
}

/// Availability state of a device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum DiscoveryState {
    /// No disqualifying signature was found
    Available,
    /// Filesystem signature or BIOS/boot partition label present
    NotAvailable,
    /// Multipath identity not yet fully resolved
    #[default]
    Unknown,
}

impl std::fmt::Display for DiscoveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscoveryState::Available => write!(f, "Available"),
            DiscoveryState::NotAvailable => write!(f, "NotAvailable"),
            DiscoveryState::Unknown => write!(f, "Unknown"),
        }
    }
}

// =============================================================================
// Device Classification
// =============================================================================

/// Block device types supported for local volumes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Disk,
    Part,
    Lvm,
    Mpath,
}

impl DeviceType {
    /// Parse an lsblk TYPE column, `None` for unsupported types such as
    /// `loop` or `rom`
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "disk" => Some(DeviceType::Disk),
            "part" => Some(DeviceType::Part),
            "lvm" => Some(DeviceType::Lvm),
            "mpath" => Some(DeviceType::Mpath),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Disk => "disk",
            DeviceType::Part => "part",
            DeviceType::Lvm => "lvm",
            DeviceType::Mpath => "mpath",
        }
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a device has spinning media
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum DeviceMechanicalProperty {
    Rotational,
    #[default]
    NonRotational,
}

impl DeviceMechanicalProperty {
    pub fn from_rotational(rotational: bool) -> Self {
        if rotational {
            DeviceMechanicalProperty::Rotational
        } else {
            DeviceMechanicalProperty::NonRotational
        }
    }
}

impl std::fmt::Display for DeviceMechanicalProperty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceMechanicalProperty::Rotational => write!(f, "Rotational"),
            DeviceMechanicalProperty::NonRotational => write!(f, "NonRotational"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device_type() {
        assert_eq!(DeviceType::parse("disk"), Some(DeviceType::Disk));
        assert_eq!(DeviceType::parse("part"), Some(DeviceType::Part));
        assert_eq!(DeviceType::parse("lvm"), Some(DeviceType::Lvm));
        assert_eq!(DeviceType::parse("mpath"), Some(DeviceType::Mpath));
        assert_eq!(DeviceType::parse("loop"), None);
        assert_eq!(DeviceType::parse(""), None);
    }

    #[test]
    fn test_parse_mechanical_property() {
        assert_eq!(
            DeviceMechanicalProperty::from_rotational(true),
            DeviceMechanicalProperty::Rotational
        );
        assert_eq!(
            DeviceMechanicalProperty::from_rotational(false),
            DeviceMechanicalProperty::NonRotational
        );
    }

    #[test]
    fn test_discovered_device_wire_format() {
        let device = DiscoveredDevice {
            device_id: "/dev/disk/by-id/wwn-0x5000".to_string(),
            path: "/dev/sdb".to_string(),
            device_type: Some(DeviceType::Disk),
            size: 1024,
            property: DeviceMechanicalProperty::Rotational,
            status: DeviceStatus::new(DiscoveryState::NotAvailable),
            fs_type: "ext4".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_value(&device).unwrap();
        assert_eq!(json["deviceID"], "/dev/disk/by-id/wwn-0x5000");
        assert_eq!(json["type"], "disk");
        assert_eq!(json["fsType"], "ext4");
        assert_eq!(json["property"], "Rotational");
        assert_eq!(json["status"]["state"], "NotAvailable");
    }
}
