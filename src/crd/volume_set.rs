//! LocalVolumeSet CRD
//!
//! Describes which block devices on which nodes may be claimed as local
//! persistent volumes.

use super::discovery_result::{DeviceMechanicalProperty, DeviceType};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Smallest device considered when no minimum size is given (1 GiB)
pub const DEFAULT_MIN_SIZE_BYTES: u64 = 1024 * 1024 * 1024;

// =============================================================================
// LocalVolumeSet CRD
// =============================================================================

/// LocalVolumeSet selects devices by inclusion rules on the nodes matching
/// its node selector.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.billyronks.io",
    version = "v1alpha1",
    kind = "LocalVolumeSet",
    plural = "localvolumesets",
    shortname = "lvs",
    status = "LocalVolumeSetStatus",
    printcolumn = r#"{"name": "StorageClass", "type": "string", "jsonPath": ".spec.storageClassName"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct LocalVolumeSetSpec {
    /// Storage class the resulting volumes belong to
    #[serde(default)]
    pub storage_class_name: String,

    /// Nodes this volume set applies to; absent means every node
    #[serde(default)]
    pub node_selector: Option<NodeSelector>,

    /// Device inclusion rules
    #[serde(default)]
    pub device_inclusion_spec: DeviceInclusionSpec,
}

/// Status of a LocalVolumeSet
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalVolumeSetStatus {
    /// Devices claimed across all nodes
    #[serde(default)]
    pub total_provisioned_device_count: Option<u32>,
}

// =============================================================================
// Device Inclusion
// =============================================================================

/// Rules a device must satisfy to be claimed by a volume set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInclusionSpec {
    /// Allowed device types; empty means `disk` and `mpath`
    #[serde(default)]
    pub device_types: Vec<DeviceType>,

    /// Allowed mechanical properties; empty means any
    #[serde(default)]
    pub device_mechanical_properties: Vec<DeviceMechanicalProperty>,

    /// Minimum size in bytes; absent means 1 GiB
    #[serde(default)]
    pub min_size: Option<u64>,

    /// Maximum size in bytes; absent means unbounded
    #[serde(default)]
    pub max_size: Option<u64>,

    /// Allowed model substrings; empty means any
    #[serde(default)]
    pub models: Vec<String>,

    /// Allowed vendor substrings; empty means any
    #[serde(default)]
    pub vendors: Vec<String>,
}

impl DeviceInclusionSpec {
    pub fn effective_device_types(&self) -> Vec<DeviceType> {
        if self.device_types.is_empty() {
            vec![DeviceType::Disk, DeviceType::Mpath]
        } else {
            self.device_types.clone()
        }
    }

    pub fn effective_min_size(&self) -> u64 {
        self.min_size.unwrap_or(DEFAULT_MIN_SIZE_BYTES)
    }
}

// =============================================================================
// Node Selector
// =============================================================================

/// Node selector in the shape of the core/v1 NodeSelector; terms are ORed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeSelector {
    #[serde(default)]
    pub node_selector_terms: Vec<NodeSelectorTerm>,
}

/// A single term; its expressions are ANDed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeSelectorTerm {
    #[serde(default)]
    pub match_expressions: Vec<NodeSelectorRequirement>,
}

/// Label requirement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeSelectorRequirement {
    pub key: String,
    pub operator: NodeSelectorOperator,
    #[serde(default)]
    pub values: Vec<String>,
}

/// Label requirement operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum NodeSelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
    Gt,
    Lt,
}
