//! Execution trace of one operation.
//!
//! [`Trace`] records nested trace events as a flat indexed sequence with
//! parent links. The owning thread pushes an event when a traced call begins
//! and pops it when the call returns; the scheduler thread may flush or
//! snapshot the sequence at any time in between.
//!
//! ```text
//! push("request")          index 0, parent None     ┐ open stack
//!   push("query")          index 1, parent 0        │ [0, 1]
//!   pop(1)                 duration filled in       ┘ [0]
//!   push("render")         index 2, parent 0          [0, 2]
//!   pop(2)                                            [0]
//! pop(0)                                              []
//! ```

pub mod context;
pub mod event;
pub mod tree;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use log::warn;
use parking_lot::Mutex;

use crate::collections::{FlushedBatch, IndexedRingAppendList};

pub use context::{ContextValue, ExecutionContext};
pub use event::TraceEvent;
pub use tree::{TraceNode, TraceTree};

/// Trace events of one operation.
pub struct Trace {
    events: IndexedRingAppendList<TraceEvent>,
    /// Events pushed but not yet popped, outermost first. Owner thread only.
    open: Mutex<Vec<TraceEvent>>,
    next_index: AtomicUsize,
    /// `None` means unlimited.
    max_events: Option<usize>,
    dropped: AtomicU64,
}

impl Trace {
    #[must_use]
    pub fn new(prefix_capacity: usize, suffix_capacity: usize, max_events: Option<usize>) -> Self {
        Self {
            events: IndexedRingAppendList::new(prefix_capacity, suffix_capacity),
            open: Mutex::new(Vec::new()),
            next_index: AtomicUsize::new(0),
            max_events,
            dropped: AtomicU64::new(0),
        }
    }

    /// Record the start of a traced call.
    ///
    /// Returns the new event's index, or `None` when the per-operation cap
    /// has been reached; the context closure is not called in that case.
    /// The closure runs before any index is assigned, so it may panic or
    /// record events of its own without corrupting the sequence.
    pub fn push(
        &self,
        description: impl Into<String>,
        context: impl FnOnce() -> ExecutionContext,
        start_offset_nanos: u64,
    ) -> Option<usize> {
        if self.reject_over_cap() {
            return None;
        }
        let context = Arc::new(context());

        let mut open = self.open.lock();
        // the context closure may have used up the remaining room
        if self.reject_over_cap() {
            return None;
        }
        let index = self.next_index.load(Ordering::Relaxed);
        let event = TraceEvent {
            index,
            parent_index: open.last().map(|parent| parent.index),
            description: description.into(),
            context,
            start_offset_nanos,
            duration_nanos: None,
            completed: false,
        };
        open.push(event.clone());
        self.events.add(event);
        self.next_index.store(index + 1, Ordering::Relaxed);
        Some(index)
    }

    fn reject_over_cap(&self) -> bool {
        let recorded = self.next_index.load(Ordering::Relaxed);
        if !self.max_events.is_some_and(|max| recorded >= max) {
            return false;
        }
        if self.dropped.fetch_add(1, Ordering::Relaxed) == 0 {
            warn!("Trace event cap of {recorded} reached, further events are not recorded");
        }
        true
    }

    /// Record the end of the traced call `index`.
    ///
    /// Calls nested inside it that were never popped are closed at the same
    /// offset. Returns `false` if `index` is not open.
    pub fn pop(&self, index: usize, end_offset_nanos: u64) -> bool {
        let mut open = self.open.lock();
        let Some(pos) = open.iter().rposition(|e| e.index == index) else {
            return false;
        };
        if pos + 1 < open.len() {
            warn!("Trace event {} ended with {} nested events still open", index, open.len() - pos - 1);
        }
        for event in open.drain(pos..).rev() {
            self.events.update_possibly_flushed_element(event.completed_at(end_offset_nanos));
        }
        true
    }

    /// Close every open event, innermost first.
    pub fn close_all(&self, end_offset_nanos: u64) {
        let mut open = self.open.lock();
        for event in open.drain(..).rev() {
            self.events.update_possibly_flushed_element(event.completed_at(end_offset_nanos));
        }
    }

    /// Cut off everything recorded since the previous flush.
    ///
    /// Events that completed after being delivered by an earlier flush come
    /// back in [`FlushedBatch::updated`] with their duration filled in.
    pub fn flush(&self) -> FlushedBatch<TraceEvent> {
        self.events.flush()
    }

    /// Weakly consistent view of the retained events.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<TraceEvent>> {
        self.events.snapshot()
    }

    /// Number of events recorded so far.
    #[must_use]
    pub fn recorded(&self) -> usize {
        self.next_index.load(Ordering::Relaxed)
    }

    /// Number of events rejected by the cap.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Number of currently open events.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.open.lock().len()
    }
}

impl std::fmt::Debug for Trace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trace")
            .field("recorded", &self.recorded())
            .field("dropped", &self.dropped())
            .field("max_events", &self.max_events)
            .finish_non_exhaustive()
    }
}
