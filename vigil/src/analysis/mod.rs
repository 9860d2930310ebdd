//! Analysis logic for collected data
//!
//! This module contains pure logic for ranking hotspots, separated from the
//! capture engine and the collector sinks that present the results.

pub mod hotspot_analyzer;

pub use hotspot_analyzer::{analyze_hotspots, analyze_snapshot, FunctionHotspot, HotspotStats};
