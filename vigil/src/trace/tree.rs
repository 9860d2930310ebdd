//! Rebuild the nested trace from its flat, parent-linked sequence.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use super::event::TraceEvent;
use crate::domain::format_duration;

/// One event with its nested children.
#[derive(Debug, Clone)]
pub struct TraceNode {
    pub event: Arc<TraceEvent>,
    pub children: Vec<TraceNode>,
}

/// Nested view over a batch of trace events.
///
/// Events whose parent is not part of the batch (it was flushed in an
/// earlier batch) are promoted to roots.
#[derive(Debug, Clone, Default)]
pub struct TraceTree {
    pub roots: Vec<TraceNode>,
}

impl TraceTree {
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a Arc<TraceEvent>>) -> Self {
        let mut events: Vec<&Arc<TraceEvent>> = events.into_iter().collect();
        // completed copies first, so they win the dedup
        events.sort_unstable_by_key(|e| (e.index, !e.completed));
        events.dedup_by_key(|e| e.index);

        let present: HashMap<usize, usize> =
            events.iter().enumerate().map(|(pos, e)| (e.index, pos)).collect();

        let mut children: Vec<Vec<usize>> = vec![Vec::new(); events.len()];
        let mut roots = Vec::new();
        for (pos, event) in events.iter().enumerate() {
            match event.parent_index.and_then(|p| present.get(&p)) {
                Some(&parent_pos) if parent_pos < pos => children[parent_pos].push(pos),
                _ => roots.push(pos),
            }
        }

        fn build(pos: usize, events: &[&Arc<TraceEvent>], children: &[Vec<usize>]) -> TraceNode {
            TraceNode {
                event: Arc::clone(events[pos]),
                children: children[pos].iter().map(|&c| build(c, events, children)).collect(),
            }
        }

        Self { roots: roots.into_iter().map(|pos| build(pos, &events, &children)).collect() }
    }

    /// Depth-first walk yielding `(depth, event)`.
    #[must_use]
    pub fn walk(&self) -> Vec<(usize, &TraceEvent)> {
        fn visit<'a>(node: &'a TraceNode, depth: usize, out: &mut Vec<(usize, &'a TraceEvent)>) {
            out.push((depth, &*node.event));
            for child in &node.children {
                visit(child, depth + 1, out);
            }
        }
        let mut out = Vec::new();
        for root in &self.roots {
            visit(root, 0, &mut out);
        }
        out
    }

    /// Indented text rendering for logs.
    #[must_use]
    pub fn render(&self) -> String {
        let mut text = String::new();
        for (depth, event) in self.walk() {
            let timing = event.duration_nanos.map_or_else(
                || "active".to_string(),
                |nanos| format_duration(std::time::Duration::from_nanos(nanos)),
            );
            let _ = writeln!(text, "{:indent$}{} [{timing}]", "", event.description, indent = depth * 2);
        }
        text
    }
}
