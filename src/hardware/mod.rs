//! Hardware Module
//!
//! Provides block device discovery, filtering and claiming on the local
//! host, plus the host implementations of the domain ports.

pub mod discovery;
pub mod filter;
pub mod claim;
pub mod host;
pub mod mock;

pub use discovery::*;
pub use filter::*;
pub use claim::*;
pub use host::*;
