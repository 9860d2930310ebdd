//! Sampled call tree.
//!
//! A [`HotspotTree`] is built incrementally from periodic stack samples. Each
//! sample is walked from the outermost frame inwards; the longest path that
//! already exists in the tree has its counts bumped, and the rest of the
//! stack is attached as a fresh chain. The innermost node of every sample
//! also records the thread's execution state, so a hot leaf can be told
//! apart as CPU-bound (`RUNNABLE`) or stalled (`BLOCKED` / `WAITING`).
//!
//! ```text
//! sample 1: main → handle → query          main (2)
//! sample 2: main → handle → render   ==>    └─ handle (2)
//!                                               ├─ query (1)   {RUNNABLE: 1}
//!                                               └─ render (1)  {BLOCKED: 1}
//! ```
//!
//! # Concurrency
//!
//! Inserts are serialized by a build lock. Child lists are copy-on-write
//! snapshots behind [`ArcSwap`], so readers walk the tree without locking and
//! at worst miss a path that is being inserted concurrently.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::Serialize;
use vigil_common::{StackFrame, ThreadState};

use crate::sampling::ThreadSnapshot;

type Children = ArcSwap<Vec<Arc<HotspotNode>>>;

/// Per-state sample counts at a leaf.
///
/// Almost every leaf only ever sees one state, so the map is only allocated
/// once a second distinct state shows up.
#[derive(Debug, Clone, Default)]
enum LeafStates {
    #[default]
    Empty,
    Single(ThreadState, u64),
    Many(BTreeMap<ThreadState, u64>),
}

impl LeafStates {
    fn record(&mut self, state: ThreadState) {
        match self {
            LeafStates::Empty => *self = LeafStates::Single(state, 1),
            LeafStates::Single(existing, count) if *existing == state => *count += 1,
            LeafStates::Single(existing, count) => {
                let mut map = BTreeMap::new();
                map.insert(*existing, *count);
                map.insert(state, 1);
                *self = LeafStates::Many(map);
            }
            LeafStates::Many(map) => *map.entry(state).or_insert(0) += 1,
        }
    }

    fn to_vec(&self) -> Vec<(ThreadState, u64)> {
        match self {
            LeafStates::Empty => Vec::new(),
            LeafStates::Single(state, count) => vec![(*state, *count)],
            LeafStates::Many(map) => map.iter().map(|(&s, &c)| (s, c)).collect(),
        }
    }
}

/// One frame at one position in the sampled call tree.
#[derive(Debug)]
pub struct HotspotNode {
    frame: StackFrame,
    sample_count: AtomicU64,
    children: Children,
    leaf_states: Mutex<LeafStates>,
}

impl HotspotNode {
    fn new(frame: StackFrame) -> Self {
        Self {
            frame,
            sample_count: AtomicU64::new(0),
            children: ArcSwap::from_pointee(Vec::new()),
            leaf_states: Mutex::new(LeafStates::Empty),
        }
    }

    #[must_use]
    pub fn frame(&self) -> &StackFrame {
        &self.frame
    }

    /// Samples whose stack passed through this node.
    #[must_use]
    pub fn sample_count(&self) -> u64 {
        self.sample_count.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn children(&self) -> Arc<Vec<Arc<HotspotNode>>> {
        self.children.load_full()
    }

    /// Samples that ended exactly at this node, by thread state.
    #[must_use]
    pub fn leaf_states(&self) -> Vec<(ThreadState, u64)> {
        self.leaf_states.lock().to_vec()
    }

    /// Samples that ended exactly at this node.
    #[must_use]
    pub fn self_samples(&self) -> u64 {
        self.leaf_states().iter().map(|(_, count)| count).sum()
    }

    fn snapshot(&self) -> HotspotNodeSnapshot {
        let mut children: Vec<HotspotNodeSnapshot> =
            self.children.load().iter().map(|child| child.snapshot()).collect();
        children.sort_by_key(|c| std::cmp::Reverse(c.sample_count));
        HotspotNodeSnapshot {
            frame: self.frame.clone(),
            sample_count: self.sample_count(),
            leaf_states: self.leaf_states().into_iter().collect(),
            children,
        }
    }
}

/// Immutable copy of a node, handed to collectors.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HotspotNodeSnapshot {
    pub frame: StackFrame,
    pub sample_count: u64,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub leaf_states: BTreeMap<ThreadState, u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<HotspotNodeSnapshot>,
}

/// Call tree built from stack samples of one or more threads.
#[derive(Debug)]
pub struct HotspotTree {
    roots: Children,
    build_lock: Mutex<()>,
    total_samples: AtomicU64,
}

impl Default for HotspotTree {
    fn default() -> Self {
        Self::new()
    }
}

impl HotspotTree {
    #[must_use]
    pub fn new() -> Self {
        Self {
            roots: ArcSwap::from_pointee(Vec::new()),
            build_lock: Mutex::new(()),
            total_samples: AtomicU64::new(0),
        }
    }

    /// Merge one stack sample into the tree.
    ///
    /// Frames are expected outermost first. Empty samples are ignored.
    pub fn capture_sample(&self, sample: &ThreadSnapshot) {
        if sample.frames.is_empty() {
            return;
        }
        let _build_guard = self.build_lock.lock();
        self.total_samples.fetch_add(1, Ordering::Relaxed);

        let mut parent: Option<Arc<HotspotNode>> = None;
        for frame in &sample.frames {
            let node = {
                let level = parent.as_ref().map_or(&self.roots, |p| &p.children);
                Self::child_for(level, frame)
            };
            node.sample_count.fetch_add(1, Ordering::AcqRel);
            parent = Some(node);
        }
        if let Some(leaf) = parent {
            leaf.leaf_states.lock().record(sample.state);
        }
    }

    /// Find the child matching `frame`, or publish a new one. Build lock held.
    fn child_for(level: &Children, frame: &StackFrame) -> Arc<HotspotNode> {
        let current = level.load_full();
        if let Some(existing) = current.iter().find(|node| node.frame == *frame) {
            return Arc::clone(existing);
        }
        let node = Arc::new(HotspotNode::new(frame.clone()));
        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push(Arc::clone(&node));
        level.store(Arc::new(next));
        node
    }

    #[must_use]
    pub fn roots(&self) -> Arc<Vec<Arc<HotspotNode>>> {
        self.roots.load_full()
    }

    #[must_use]
    pub fn total_samples(&self) -> u64 {
        self.total_samples.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.roots.load().is_empty()
    }

    /// Immutable copy of the whole tree, hottest branches first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<HotspotNodeSnapshot> {
        let mut roots: Vec<HotspotNodeSnapshot> = self.roots.load().iter().map(|r| r.snapshot()).collect();
        roots.sort_by_key(|r| std::cmp::Reverse(r.sample_count));
        roots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(functions: &[&str], state: ThreadState) -> ThreadSnapshot {
        ThreadSnapshot {
            thread_name: "worker-1".to_string(),
            state,
            frames: functions.iter().map(|f| StackFrame::new(*f)).collect(),
        }
    }

    /// Follow the single chain from the root, asserting there is no branching.
    fn single_path(tree: &HotspotTree) -> Vec<(String, u64)> {
        let mut path = Vec::new();
        let mut level = tree.roots();
        while let Some(node) = level.first() {
            assert_eq!(level.len(), 1);
            path.push((node.frame().function.clone(), node.sample_count()));
            let next = node.children();
            level = next;
        }
        path
    }

    #[test]
    fn test_empty_tree_has_no_roots() {
        let tree = HotspotTree::new();
        assert!(tree.is_empty());
        tree.capture_sample(&sample(&[], ThreadState::Runnable));
        assert!(tree.is_empty());
        assert_eq!(tree.total_samples(), 0);
    }

    #[test]
    fn test_identical_samples_share_one_path() {
        let tree = HotspotTree::new();
        let stack = sample(&["main", "handle", "query"], ThreadState::Runnable);
        tree.capture_sample(&stack);
        tree.capture_sample(&stack);

        assert_eq!(
            single_path(&tree),
            vec![("main".to_string(), 2), ("handle".to_string(), 2), ("query".to_string(), 2)]
        );
        assert_eq!(tree.total_samples(), 2);
    }

    #[test]
    fn test_divergent_samples_branch_at_first_difference() {
        let tree = HotspotTree::new();
        tree.capture_sample(&sample(&["main", "handle", "query"], ThreadState::Runnable));
        tree.capture_sample(&sample(&["main", "handle", "render", "write"], ThreadState::Blocked));

        let roots = tree.roots();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].sample_count(), 2);
        let handle = &roots[0].children()[0];
        assert_eq!(handle.sample_count(), 2);

        let branches = handle.children();
        let names: Vec<_> = branches.iter().map(|n| n.frame().function.as_str()).collect();
        assert_eq!(names, vec!["query", "render"]);
        assert!(branches.iter().all(|n| n.sample_count() == 1));
        assert_eq!(branches[1].children()[0].leaf_states(), vec![(ThreadState::Blocked, 1)]);
    }

    #[test]
    fn test_leaf_states_switch_from_single_to_map() {
        let tree = HotspotTree::new();
        tree.capture_sample(&sample(&["main", "io"], ThreadState::Runnable));
        tree.capture_sample(&sample(&["main", "io"], ThreadState::Runnable));
        tree.capture_sample(&sample(&["main", "io"], ThreadState::Waiting));

        let io = &tree.roots()[0].children()[0];
        assert_eq!(io.leaf_states(), vec![(ThreadState::Runnable, 2), (ThreadState::Waiting, 1)]);
        assert_eq!(io.self_samples(), 3);
        assert_eq!(tree.roots()[0].self_samples(), 0);
    }

    #[test]
    fn test_frames_match_on_location_too() {
        let tree = HotspotTree::new();
        let at = |line| ThreadSnapshot {
            thread_name: "t".to_string(),
            state: ThreadState::Runnable,
            frames: vec![StackFrame::with_location("loop_body", "src/lib.rs", line)],
        };
        tree.capture_sample(&at(10));
        tree.capture_sample(&at(11));
        assert_eq!(tree.roots().len(), 2);
    }

    #[test]
    fn test_snapshot_orders_hottest_first_and_serializes() {
        let tree = HotspotTree::new();
        tree.capture_sample(&sample(&["cold"], ThreadState::Runnable));
        tree.capture_sample(&sample(&["hot"], ThreadState::Runnable));
        tree.capture_sample(&sample(&["hot"], ThreadState::Runnable));

        let snapshot = tree.snapshot();
        assert_eq!(snapshot[0].frame.function, "hot");
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json[0]["sampleCount"], 2);
        assert_eq!(json[0]["leafStates"]["RUNNABLE"], 2);
    }

    #[test]
    fn test_concurrent_readers_see_consistent_counts() {
        let tree = Arc::new(HotspotTree::new());
        let writer = {
            let tree = Arc::clone(&tree);
            std::thread::spawn(move || {
                for i in 0..2_000 {
                    let leaf = if i % 2 == 0 { "even" } else { "odd" };
                    tree.capture_sample(&sample(&["main", leaf], ThreadState::Runnable));
                }
            })
        };
        while !writer.is_finished() {
            for root in tree.roots().iter() {
                let children_total: u64 = root.children().iter().map(|c| c.sample_count()).sum();
                // children are bumped after their parent
                assert!(children_total <= root.sample_count());
            }
        }
        writer.join().unwrap();
        assert_eq!(tree.roots()[0].sample_count(), 2_000);
    }
}
