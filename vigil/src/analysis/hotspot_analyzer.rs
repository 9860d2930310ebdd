//! Hotspot analysis for sampled call trees.
//!
//! This module flattens a hotspot tree into a ranking of the functions that
//! samples most often ended in ("self" samples), which is what answers
//! "where is this operation spending its time?".
//!
//! # Architecture
//!
//! - **`HotspotStats`** - Aggregation of leaf samples keyed by function name
//! - **`analyze_hotspots()`** - Batch analysis of a live [`HotspotTree`]
//! - **`analyze_snapshot()`** - Same, for a tree already handed to a collector
//!
//! ## Data Flow
//!
//! ```text
//! HotspotTree ──snapshot()──► [HotspotNodeSnapshot]
//!                                    │
//!                                    └──► HotspotStats.record_leaf()  (per node with self samples)
//!                                                │
//!                                                └──► to_hotspots() ──► [FunctionHotspot]
//! ```
//!
//! # Performance
//!
//! - `record_leaf()`: O(1) amortized plus O(depth) when a new call path is kept
//! - `to_hotspots()`: O(n log n) where n = unique functions (sorting)

// Percentage calculations intentionally convert u64 to f64
#![allow(clippy::cast_precision_loss)]

use std::collections::HashMap;
use std::sync::Arc;

use vigil_common::{StackFrame, ThreadState};

use crate::hotspot::{HotspotNodeSnapshot, HotspotTree};

// =============================================================================
// CONSTANTS
// =============================================================================

/// Maximum unique call paths to store per hotspot.
///
/// A function reached from many places would otherwise keep every path.
const MAX_CALL_STACKS_PER_HOTSPOT: usize = 5;

// =============================================================================
// FUNCTION HOTSPOT (OUTPUT TYPE)
// =============================================================================

/// A function hotspot with aggregated statistics.
///
/// ```text
/// HOTSPOTS (Op#12, 48 samples)
/// ─────────────────────────────────
///   orders::query        62.5%  RUNNABLE 10 / BLOCKED 20
///   orders::render       25.0%  RUNNABLE 12
/// ```
#[derive(Debug, Clone)]
pub struct FunctionHotspot {
    /// Function name as recorded in the frame.
    pub name: String,

    /// Samples that ended in this function.
    pub count: u64,

    /// Percentage of all leaf samples (0.0 - 100.0).
    pub percentage: f64,

    /// Per-thread-state breakdown of `count`.
    pub states: HashMap<ThreadState, u64>,

    /// Source file of the first occurrence (if known).
    pub file: Option<String>,

    /// Line number of the first occurrence (if known).
    pub line: Option<u32>,

    /// Representative call paths (outermost frame first), most samples first.
    ///
    /// Limited to `MAX_CALL_STACKS_PER_HOTSPOT` to bound memory.
    pub call_stacks: Vec<Arc<Vec<StackFrame>>>,
}

impl FunctionHotspot {
    /// The state most samples were taken in.
    #[must_use]
    pub fn dominant_state(&self) -> Option<ThreadState> {
        self.states.iter().max_by_key(|(state, count)| (**count, std::cmp::Reverse(**state))).map(|(s, _)| *s)
    }
}

// =============================================================================
// HOTSPOT STATS (AGGREGATOR)
// =============================================================================

/// Hotspot statistics aggregator.
#[derive(Debug, Default)]
pub struct HotspotStats {
    /// Per-function statistics, keyed by function name.
    functions: HashMap<String, FunctionStats>,

    /// Total leaf samples recorded (percentage denominator).
    total_samples: u64,
}

/// Internal statistics for a single function.
#[derive(Debug, Clone)]
struct FunctionStats {
    count: u64,
    states: HashMap<ThreadState, u64>,
    file: Option<String>,
    line: Option<u32>,
    /// Call paths with their sample counts.
    call_stacks: Vec<(Arc<Vec<StackFrame>>, u64)>,
}

impl HotspotStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the samples that ended at the innermost frame of `path`.
    pub fn record_leaf(&mut self, path: &[StackFrame], states: &[(ThreadState, u64)]) {
        let Some(leaf) = path.last() else {
            return;
        };
        let samples: u64 = states.iter().map(|(_, count)| count).sum();
        if samples == 0 {
            return;
        }
        self.total_samples += samples;

        let stats = self.functions.entry(leaf.function.clone()).or_insert_with(|| FunctionStats {
            count: 0,
            states: HashMap::new(),
            file: leaf.file.clone(),
            line: leaf.line,
            call_stacks: Vec::new(),
        });
        stats.count += samples;
        for &(state, count) in states {
            *stats.states.entry(state).or_insert(0) += count;
        }

        if stats.call_stacks.len() < MAX_CALL_STACKS_PER_HOTSPOT {
            stats.call_stacks.push((Arc::new(path.to_vec()), samples));
        } else if let Some(weakest) = stats.call_stacks.iter_mut().min_by_key(|(_, count)| *count) {
            // keep the hottest paths
            if weakest.1 < samples {
                *weakest = (Arc::new(path.to_vec()), samples);
            }
        }
    }

    #[must_use]
    pub fn total_samples(&self) -> u64 {
        self.total_samples
    }

    /// Convert cumulative stats to a hotspot list, hottest first.
    #[must_use]
    pub fn to_hotspots(&self) -> Vec<FunctionHotspot> {
        let mut hotspots: Vec<FunctionHotspot> = self
            .functions
            .iter()
            .map(|(name, stats)| {
                let percentage = if self.total_samples > 0 {
                    (stats.count as f64 / self.total_samples as f64) * 100.0
                } else {
                    0.0
                };

                let mut sorted_stacks = stats.call_stacks.clone();
                sorted_stacks.sort_by_key(|(_, count)| std::cmp::Reverse(*count));

                FunctionHotspot {
                    name: name.clone(),
                    count: stats.count,
                    percentage,
                    states: stats.states.clone(),
                    file: stats.file.clone(),
                    line: stats.line,
                    call_stacks: sorted_stacks.into_iter().map(|(stack, _)| stack).collect(),
                }
            })
            .collect();

        hotspots.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
        hotspots
    }
}

/// Rank the functions of a live hotspot tree by self samples.
#[must_use]
pub fn analyze_hotspots(tree: &HotspotTree) -> Vec<FunctionHotspot> {
    analyze_snapshot(&tree.snapshot())
}

/// Rank the functions of a hotspot tree snapshot by self samples.
#[must_use]
pub fn analyze_snapshot(roots: &[HotspotNodeSnapshot]) -> Vec<FunctionHotspot> {
    fn visit(node: &HotspotNodeSnapshot, path: &mut Vec<StackFrame>, stats: &mut HotspotStats) {
        path.push(node.frame.clone());
        let states: Vec<(ThreadState, u64)> = node.leaf_states.iter().map(|(&s, &c)| (s, c)).collect();
        stats.record_leaf(path, &states);
        for child in &node.children {
            visit(child, path, stats);
        }
        path.pop();
    }

    let mut stats = HotspotStats::new();
    let mut path = Vec::new();
    for root in roots {
        visit(root, &mut path, &mut stats);
    }
    stats.to_hotspots()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::ThreadSnapshot;

    fn capture(tree: &HotspotTree, functions: &[&str], state: ThreadState) {
        tree.capture_sample(&ThreadSnapshot {
            thread_name: "worker-0".to_string(),
            state,
            frames: functions
                .iter()
                .enumerate()
                .map(|(i, f)| StackFrame::with_location(*f, "src/app.rs", u32::try_from(i).unwrap() + 1))
                .collect(),
        });
    }

    fn create_test_tree() -> HotspotTree {
        let tree = HotspotTree::new();
        capture(&tree, &["main", "handle", "query"], ThreadState::Blocked);
        capture(&tree, &["main", "handle", "query"], ThreadState::Runnable);
        capture(&tree, &["main", "handle", "render"], ThreadState::Runnable);
        tree
    }

    #[test]
    fn test_analyze_hotspots_aggregates_by_leaf_function() {
        let hotspots = analyze_hotspots(&create_test_tree());

        assert_eq!(hotspots.len(), 2);
        assert_eq!(hotspots[0].name, "query"); // Most frequent first
        assert_eq!(hotspots[0].count, 2);
        assert_eq!(hotspots[1].name, "render");
        assert_eq!(hotspots[1].count, 1);
    }

    #[test]
    fn test_analyze_hotspots_calculates_percentages() {
        let hotspots = analyze_hotspots(&create_test_tree());

        assert!((hotspots[0].percentage - 66.666).abs() < 0.01); // 2/3 * 100
        assert!((hotspots[1].percentage - 33.333).abs() < 0.01); // 1/3 * 100
    }

    #[test]
    fn test_analyze_hotspots_tracks_thread_states() {
        let hotspots = analyze_hotspots(&create_test_tree());

        let query = &hotspots[0];
        assert_eq!(query.states.len(), 2);
        assert_eq!(query.states[&ThreadState::Blocked], 1);
        assert_eq!(query.states[&ThreadState::Runnable], 1);
        assert_eq!(hotspots[1].dominant_state(), Some(ThreadState::Runnable));
    }

    #[test]
    fn test_analyze_hotspots_keeps_call_path_and_location() {
        let hotspots = analyze_hotspots(&create_test_tree());

        let query = &hotspots[0];
        assert_eq!(query.file.as_deref(), Some("src/app.rs"));
        assert_eq!(query.line, Some(3));
        let path: Vec<_> = query.call_stacks[0].iter().map(|f| f.function.as_str()).collect();
        assert_eq!(path, vec!["main", "handle", "query"]);
    }

    #[test]
    fn test_analyze_empty_tree() {
        assert!(analyze_hotspots(&HotspotTree::new()).is_empty());
    }

    #[test]
    fn test_call_stacks_are_bounded() {
        let mut stats = HotspotStats::new();
        for caller in 0..10 {
            let path = vec![StackFrame::new(format!("caller{caller}")), StackFrame::new("leaf")];
            stats.record_leaf(&path, &[(ThreadState::Runnable, caller + 1)]);
        }
        let hotspots = stats.to_hotspots();
        assert_eq!(hotspots[0].call_stacks.len(), MAX_CALL_STACKS_PER_HOTSPOT);
        assert_eq!(hotspots[0].call_stacks[0][0].function, "caller9");
        assert_eq!(stats.total_samples(), 55);
    }
}
