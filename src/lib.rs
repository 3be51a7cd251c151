//! diskmaker - Local Block Device Discovery and Claim Engine
//!
//! Runs on every storage-bearing node and turns the raw block device
//! inventory into a small set of devices that are safe to format and expose
//! as local persistent volumes.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐   ┌──────────┐   ┌─────────────┐
//! │  Enumerator  │──▶│   Identity   │──▶│    Filter    │──▶│ Age Gate │──▶│ Claim Lock  │
//! │ lsblk/blkid  │   │   Resolver   │   │   Pipeline   │   │          │   │ + symlinks  │
//! └──────────────┘   └──────────────┘   └──────────────┘   └──────────┘   └─────────────┘
//!         │                                                                      │
//!         ▼                                                                      ▼
//! ┌─────────────────────────────┐                              ┌─────────────────────────┐
//! │  Discovery Result Builder   │                              │  Volume Set Reconciler  │
//! │  (LocalVolumeDiscovery-     │                              │  valid / delayed /      │
//! │   Result publication)       │                              │  claimable devices      │
//! └─────────────────────────────┘                              └─────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: Result builder, volume set reconciler, run loop
//! - [`hardware`]: Enumeration, identity, filters, age gate, claim lock
//! - [`crd`]: Custom Resource Definitions
//! - [`domain`]: Host ports and discovery events
//! - [`error`]: Error types and handling

pub mod controlplane;
pub mod crd;
pub mod domain;
pub mod error;
pub mod hardware;

// Re-export commonly used types
pub use controlplane::{
    run_reconcile_loop, DaemonConfig, DaemonMode, DeviceDiscovery, DiscoveryConfig, DiscoveryTask,
    ReconcileOutcome, VolumeSetConfig, VolumeSetReconciler, VolumeSetTask,
};

pub use crd::{
    DeviceInclusionSpec, DiscoveredDevice, DiscoveryState, LocalVolumeDiscoveryResult,
    LocalVolumeDiscoveryResultStatus, LocalVolumeSet, LocalVolumeSetSpec, NodeSelector,
};

pub use domain::ports::{
    Clock, CommandRunner, DeviceOpener, EventReporter, HostFs, ResultPublisher,
};

pub use error::{Error, ErrorAction, Result};

pub use hardware::{
    BlockDevice, BlockDeviceEnumerator, ClaimDecision, ClaimLocker, DeviceAgeTracker,
    FilterPipeline, FilterVerdict, IdentityResolution, IdentityResolver, MatcherSet,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
