//! Hotspot trees built from periodic stack samples.

pub mod tree;

pub use tree::{HotspotNode, HotspotNodeSnapshot, HotspotTree};
