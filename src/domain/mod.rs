//! Domain layer - Host ports and discovery events
//!
//! This module defines the traits (ports) that host adapters implement,
//! following hexagonal architecture principles.

pub mod events;
pub mod ports;

pub use events::*;
pub use ports::*;
