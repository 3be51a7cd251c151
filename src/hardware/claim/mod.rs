//! Device Claim Module
//!
//! Age gate for newly appeared devices and the exclusive lock that keeps
//! two claimants off the same device.

pub mod age;
pub mod lock;

pub use age::*;
pub use lock::*;
