//! Discovery Events
//!
//! Events emitted by the discovery engine for the surrounding operator to
//! record against its custom resources.

use serde::{Deserialize, Serialize};

/// Event visibility, mirroring Kubernetes event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Normal,
    Warning,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::Normal => write!(f, "Normal"),
            EventType::Warning => write!(f, "Warning"),
        }
    }
}

/// Events emitted during discovery and volume-set reconciliation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoveryEvent {
    /// A device passed every filter but is younger than the minimum age
    DiscoveredNewDevice { kname: String, min_age_secs: u64 },

    /// lsblk/blkid could not be run or parsed, or some rows were dropped
    ErrorRunningBlockList { message: String },

    /// No by-id symlink exists for the device
    DeviceIdNotFound { kname: String },
}

impl DiscoveryEvent {
    /// Short machine-readable reason
    pub fn reason(&self) -> &'static str {
        match self {
            DiscoveryEvent::DiscoveredNewDevice { .. } => "DiscoveredNewDevice",
            DiscoveryEvent::ErrorRunningBlockList { .. } => "ErrorRunningBlockList",
            DiscoveryEvent::DeviceIdNotFound { .. } => "DeviceIdNotFound",
        }
    }

    pub fn event_type(&self) -> EventType {
        match self {
            DiscoveryEvent::DiscoveredNewDevice { .. } => EventType::Normal,
            DiscoveryEvent::ErrorRunningBlockList { .. }
            | DiscoveryEvent::DeviceIdNotFound { .. } => EventType::Warning,
        }
    }

    /// Human readable message
    pub fn message(&self) -> String {
        match self {
            DiscoveryEvent::DiscoveredNewDevice { min_age_secs, .. } => format!(
                "found possible matching disk, waiting {}s to claim",
                min_age_secs
            ),
            DiscoveryEvent::ErrorRunningBlockList { message } => message.clone(),
            DiscoveryEvent::DeviceIdNotFound { kname } => {
                format!("no persistent by-id symlink found for {}", kname)
            }
        }
    }

    /// Kernel name of the device the event is about, if any
    pub fn device(&self) -> Option<&str> {
        match self {
            DiscoveryEvent::DiscoveredNewDevice { kname, .. } => Some(kname),
            DiscoveryEvent::DeviceIdNotFound { kname } => Some(kname),
            DiscoveryEvent::ErrorRunningBlockList { .. } => None,
        }
    }
}
