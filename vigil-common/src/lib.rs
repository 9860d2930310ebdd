//! # Shared Vocabulary (Core ↔ Collectors)
//!
//! Defines the plain data types and defaults shared between the monitoring
//! core and the code that consumes what it collects (collector sinks,
//! exporters, configuration loaders). Nothing in here owns threads or locks.
//!
//! ## Key Types
//!
//! - [`ThreadState`] - Execution state of a sampled thread
//! - [`StackFrame`] - Identity of one frame in a captured stack
//!
//! Enable the `serde` feature to derive `Serialize`/`Deserialize`.

use std::fmt;

// ============================================================================
// Defaults
// ============================================================================

/// Default log-if-exceeded threshold for completed operations.
pub const DEFAULT_THRESHOLD_MILLIS: i64 = 3_000;

/// Default duration after which an active operation is reported as stuck.
pub const DEFAULT_STUCK_THRESHOLD_MILLIS: i64 = 180_000;

/// Default delay before an operation's stack starts being sampled.
pub const DEFAULT_STACK_TRACE_INITIAL_DELAY_MILLIS: i64 = 5_000;

/// Default interval between two stack samples of the same operation.
pub const DEFAULT_STACK_TRACE_PERIOD_MILLIS: i64 = 1_000;

/// Default cap on recorded trace events per operation.
pub const DEFAULT_MAX_TRACE_EVENTS_PER_OPERATION: i64 = 2_000;

/// Default polling period of the background scheduler.
pub const DEFAULT_SCHEDULER_PERIOD_MILLIS: u64 = 100;

/// Default number of leading trace events retained across every flush.
pub const DEFAULT_TRACE_PREFIX_CAPACITY: usize = 100;

/// Default number of trailing trace events carried across a flush boundary.
pub const DEFAULT_TRACE_SUFFIX_CAPACITY: usize = 10;

/// Maximum depth of a shadow stack.
///
/// Frames pushed beyond this depth are counted but not recorded, so a
/// runaway recursion cannot grow the sampled stacks without bound.
pub const MAX_STACK_DEPTH: usize = 127;

// ============================================================================
// Shared Data Structures
// ============================================================================

/// Execution state of a thread at the moment its stack was sampled.
///
/// Recorded at the leaf of every hotspot path so the hotspot view can tell
/// "hot because CPU-bound" apart from "hot because blocked or waiting".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum ThreadState {
    /// Executing (or ready to execute) on a CPU
    #[default]
    Runnable,
    /// Waiting to acquire a lock held by another thread
    Blocked,
    /// Parked indefinitely until another thread wakes it
    Waiting,
    /// Parked with a timeout (sleep, timed wait, I/O with deadline)
    TimedWaiting,
}

impl ThreadState {
    /// All states, in declaration order.
    pub const ALL: [ThreadState; 4] =
        [ThreadState::Runnable, ThreadState::Blocked, ThreadState::Waiting, ThreadState::TimedWaiting];

    /// Compact encoding used by shadow stacks to publish state atomically.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            ThreadState::Runnable => 0,
            ThreadState::Blocked => 1,
            ThreadState::Waiting => 2,
            ThreadState::TimedWaiting => 3,
        }
    }

    /// Inverse of [`ThreadState::as_u8`]. Unknown encodings read as `Runnable`.
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => ThreadState::Blocked,
            2 => ThreadState::Waiting,
            3 => ThreadState::TimedWaiting,
            _ => ThreadState::Runnable,
        }
    }
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ThreadState::Runnable => "RUNNABLE",
            ThreadState::Blocked => "BLOCKED",
            ThreadState::Waiting => "WAITING",
            ThreadState::TimedWaiting => "TIMED_WAITING",
        };
        f.write_str(name)
    }
}

/// Identity of a single stack frame.
///
/// Two frames are the same hotspot node exactly when function, file and
/// line all match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StackFrame {
    /// Function or operation name (e.g. `"orders::checkout"`)
    pub function: String,
    /// Source file, when known
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub file: Option<String>,
    /// Source line, when known
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub line: Option<u32>,
}

impl StackFrame {
    /// Frame with a function name only.
    pub fn new(function: impl Into<String>) -> Self {
        Self { function: function.into(), file: None, line: None }
    }

    /// Frame with a source location.
    pub fn with_location(function: impl Into<String>, file: impl Into<String>, line: u32) -> Self {
        Self { function: function.into(), file: Some(file.into()), line: Some(line) }
    }
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.file, self.line) {
            (Some(file), Some(line)) => write!(f, "{} ({file}:{line})", self.function),
            (Some(file), None) => write!(f, "{} ({file})", self.function),
            _ => f.write_str(&self.function),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_state_round_trips_through_u8() {
        for state in ThreadState::ALL {
            assert_eq!(ThreadState::from_u8(state.as_u8()), state);
        }
        assert_eq!(ThreadState::from_u8(200), ThreadState::Runnable);
    }

    #[test]
    fn test_stack_frame_identity_includes_location() {
        let a = StackFrame::with_location("handler", "src/a.rs", 10);
        let b = StackFrame::with_location("handler", "src/a.rs", 11);
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn test_stack_frame_display() {
        assert_eq!(StackFrame::new("main").to_string(), "main");
        assert_eq!(StackFrame::with_location("run", "src/lib.rs", 7).to_string(), "run (src/lib.rs:7)");
    }
}
