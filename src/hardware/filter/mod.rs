//! Device Filter Module
//!
//! Structural filters that exclude unusable devices, and inclusion matchers
//! that apply a volume set's device rules.

pub mod filters;
pub mod matchers;

pub use filters::*;
pub use matchers::*;
