//! Custom Resource Definitions for local volume discovery
//!
//! This module contains the CRD types exchanged with the surrounding operator:
//! - LocalVolumeSet: device inclusion rules and node selector (input)
//! - LocalVolumeDiscoveryResult: per-node discovery records (output)

pub mod discovery_result;
pub mod volume_set;

pub use discovery_result::*;
pub use volume_set::*;
