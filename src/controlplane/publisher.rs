//! Result Publishers
//!
//! Implements the `ResultPublisher` port: the discovery records of this node
//! go to the log, a JSON file, memory, or the Kubernetes API.

use crate::crd::{
    LocalVolumeDiscoveryResult, LocalVolumeDiscoveryResultSpec, LocalVolumeDiscoveryResultStatus,
    DISCOVERY_NODE_LABEL,
};
use crate::domain::ports::ResultPublisher;
use crate::error::Result;
use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, Resource};
use std::path::PathBuf;
use tracing::{debug, info};

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "diskmaker";

/// Name of the discovery result object for a node
pub fn discovery_result_name(node_name: &str) -> String {
    format!("discovery-result-{}", node_name)
}

// =============================================================================
// Logging Publisher
// =============================================================================

/// Logs a summary of each result
#[derive(Debug, Clone, Default)]
pub struct LoggingResultPublisher;

#[async_trait]
impl ResultPublisher for LoggingResultPublisher {
    async fn publish(&self, result: &LocalVolumeDiscoveryResultStatus) -> Result<()> {
        info!(
            devices = result.discovered_devices.len(),
            discovered_at = result.discovered_time_stamp.as_deref().unwrap_or("-"),
            "Discovered devices"
        );
        for device in &result.discovered_devices {
            debug!(
                device_id = %device.device_id,
                path = %device.path,
                state = %device.status.state,
                "Discovered device"
            );
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "logging"
    }
}

// =============================================================================
// File Publisher
// =============================================================================

/// Writes each result as pretty JSON, replacing the previous file
#[derive(Debug, Clone)]
pub struct FileResultPublisher {
    path: PathBuf,
}

impl FileResultPublisher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ResultPublisher for FileResultPublisher {
    async fn publish(&self, result: &LocalVolumeDiscoveryResultStatus) -> Result<()> {
        let json = serde_json::to_vec_pretty(result)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), "Wrote discovery result");
        Ok(())
    }

    fn name(&self) -> &str {
        "file"
    }
}

// =============================================================================
// In-Memory Publisher
// =============================================================================

/// Keeps every published result for inspection
#[derive(Debug, Default)]
pub struct InMemoryResultPublisher {
    results: parking_lot::RwLock<Vec<LocalVolumeDiscoveryResultStatus>>,
}

impl InMemoryResultPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn results(&self) -> Vec<LocalVolumeDiscoveryResultStatus> {
        self.results.read().clone()
    }

    pub fn latest(&self) -> Option<LocalVolumeDiscoveryResultStatus> {
        self.results.read().last().cloned()
    }

    pub fn len(&self) -> usize {
        self.results.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.read().is_empty()
    }
}

#[async_trait]
impl ResultPublisher for InMemoryResultPublisher {
    async fn publish(&self, result: &LocalVolumeDiscoveryResultStatus) -> Result<()> {
        self.results.write().push(result.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "in-memory"
    }
}

// =============================================================================
// Kubernetes Publisher
// =============================================================================

/// Applies a `LocalVolumeDiscoveryResult` for this node and patches its status
pub struct KubeResultPublisher {
    api: Api<LocalVolumeDiscoveryResult>,
    node_name: String,
}

impl KubeResultPublisher {
    pub fn new(client: Client, namespace: &str, node_name: impl Into<String>) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            node_name: node_name.into(),
        }
    }

    fn desired_object(&self) -> Result<serde_json::Value> {
        let mut object = LocalVolumeDiscoveryResult::new(
            &discovery_result_name(&self.node_name),
            LocalVolumeDiscoveryResultSpec {
                node_name: self.node_name.clone(),
            },
        );
        object
            .meta_mut()
            .labels
            .get_or_insert_with(Default::default)
            .insert(DISCOVERY_NODE_LABEL.to_string(), self.node_name.clone());

        let mut value = serde_json::to_value(&object)?;
        if let Some(map) = value.as_object_mut() {
            map.remove("status");
        }
        Ok(value)
    }
}

impl std::fmt::Debug for KubeResultPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeResultPublisher")
            .field("node_name", &self.node_name)
            .finish()
    }
}

#[async_trait]
impl ResultPublisher for KubeResultPublisher {
    async fn publish(&self, result: &LocalVolumeDiscoveryResultStatus) -> Result<()> {
        let name = discovery_result_name(&self.node_name);
        let params = PatchParams::apply(FIELD_MANAGER).force();

        self.api
            .patch(&name, &params, &Patch::Apply(self.desired_object()?))
            .await?;

        let status = serde_json::json!({ "status": result });
        self.api
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&status))
            .await?;

        info!(
            name = %name,
            devices = result.discovered_devices.len(),
            "Updated discovery result"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "kubernetes"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{DeviceStatus, DiscoveredDevice, DiscoveryState};
    use tempfile::TempDir;

    fn result() -> LocalVolumeDiscoveryResultStatus {
        LocalVolumeDiscoveryResultStatus {
            discovered_time_stamp: Some("2026-01-01T00:00:00Z".into()),
            discovered_devices: vec![DiscoveredDevice {
                device_id: "/dev/disk/by-id/wwn-0x5000".into(),
                path: "/dev/sdb".into(),
                status: DeviceStatus::new(DiscoveryState::Available),
                ..Default::default()
            }],
        }
    }

    #[test]
    fn test_discovery_result_name() {
        assert_eq!(discovery_result_name("worker-0"), "discovery-result-worker-0");
    }

    #[tokio::test]
    async fn test_logging_publisher() {
        // Should not fail
        LoggingResultPublisher.publish(&result()).await.unwrap();
    }

    #[tokio::test]
    async fn test_file_publisher_replaces_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("discovery.json");
        let publisher = FileResultPublisher::new(&path);

        publisher.publish(&LocalVolumeDiscoveryResultStatus::default()).await.unwrap();
        publisher.publish(&result()).await.unwrap();

        let written: LocalVolumeDiscoveryResultStatus =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(written, result());
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_in_memory_publisher() {
        let publisher = InMemoryResultPublisher::new();
        assert!(publisher.is_empty());
        publisher.publish(&result()).await.unwrap();
        assert_eq!(publisher.len(), 1);
        assert_eq!(publisher.latest(), Some(result()));
    }
}
