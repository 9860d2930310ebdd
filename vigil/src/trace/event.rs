//! One timed, nested call within an operation's trace.

use std::sync::Arc;

use serde::Serialize;

use super::context::ExecutionContext;
use crate::collections::IndexedElement;

/// A traced call, stored flat with a link to its enclosing event.
///
/// The tree shape is recovered from `parent_index` (see
/// [`TraceTree`](super::tree::TraceTree)); the sequence itself is only ever
/// appended to, so another thread can read it while the owner keeps tracing.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceEvent {
    /// Position in the operation's trace, assigned in creation order
    pub index: usize,
    /// Enclosing event; `None` for the operation's root event
    pub parent_index: Option<usize>,
    pub description: String,
    pub context: Arc<ExecutionContext>,
    /// Nanoseconds from operation start to event start
    pub start_offset_nanos: u64,
    /// `None` while the call is still running
    pub duration_nanos: Option<u64>,
    pub completed: bool,
}

impl TraceEvent {
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.completed
    }

    #[must_use]
    pub fn end_offset_nanos(&self) -> Option<u64> {
        self.duration_nanos.map(|d| self.start_offset_nanos + d)
    }

    /// Completed copy of this event ending at `end_offset_nanos`.
    #[must_use]
    pub fn completed_at(&self, end_offset_nanos: u64) -> Self {
        Self {
            duration_nanos: Some(end_offset_nanos.saturating_sub(self.start_offset_nanos)),
            completed: true,
            ..self.clone()
        }
    }
}

impl IndexedElement for TraceEvent {
    fn index(&self) -> usize {
        self.index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> TraceEvent {
        TraceEvent {
            index: 1,
            parent_index: Some(0),
            description: "jdbc query".to_string(),
            context: Arc::new(ExecutionContext::new().with("sql", "select 1")),
            start_offset_nanos: 1_000,
            duration_nanos: None,
            completed: false,
        }
    }

    #[test]
    fn test_completed_at_fills_in_duration() {
        let done = event().completed_at(4_000);
        assert_eq!(done.duration_nanos, Some(3_000));
        assert_eq!(done.end_offset_nanos(), Some(4_000));
        assert!(!done.is_active());
        assert_eq!(done.context.get_text("sql"), Some("select 1"));
    }

    #[test]
    fn test_serializes_camel_case() {
        let json = serde_json::to_value(event()).unwrap();
        assert_eq!(json["parentIndex"], 0);
        assert_eq!(json["startOffsetNanos"], 1_000);
        assert!(json["durationNanos"].is_null());
        assert_eq!(json["context"]["sql"], "select 1");
    }
}
