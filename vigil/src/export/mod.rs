//! Report export functionality
//!
//! Writes collected operations to files for offline analysis. Currently
//! supports JSON Lines: one self-describing JSON object per report.

pub mod json_lines;

pub use json_lines::{ExportRecord, JsonLinesCollector, RecordKind};
