//! Control Plane Module
//!
//! Turns the hardware layer into per-node results: the discovery result
//! builder, the volume set reconciler, and the sinks and run loop around
//! them.

pub mod daemon;
pub mod discovery;
pub mod events;
pub mod node_selector;
pub mod publisher;
pub mod volume_set;

pub use daemon::*;
pub use discovery::*;
pub use events::*;
pub use node_selector::*;
pub use publisher::*;
pub use volume_set::*;
