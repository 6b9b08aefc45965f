//! Utility library for the ccarena project

pub mod other;
pub mod serde;
pub mod stats;
