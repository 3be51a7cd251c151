//! Hardware Discovery Module
//!
//! Enumerates the host's block devices and resolves their persistent
//! identities.

pub mod block_device;
pub mod enumerator;
pub mod identity;

pub use block_device::*;
pub use enumerator::*;
pub use identity::*;
