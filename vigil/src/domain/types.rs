//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers keep operation ids, clock readings and trace-event
//! indices from being mixed up, and make function signatures more expressive.

use std::fmt;
use std::time::Duration;

/// Operation ID
///
/// Assigned from a per-monitor monotonic counter when an operation starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct OperationId(pub u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Op#{}", self.0)
    }
}

/// Timestamp in nanoseconds
///
/// A reading of the monitor's [`Clock`](crate::clock::Clock). Only
/// differences between two readings of the same clock are meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Time elapsed from `earlier` to `self`, zero if the clock went backwards.
    #[must_use]
    pub fn saturating_since(self, earlier: Timestamp) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }

    /// Convert to milliseconds (f64)
    #[allow(clippy::cast_precision_loss)]
    #[must_use]
    pub fn as_millis(self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }
}

impl fmt::Display for Timestamp {
    #[allow(clippy::cast_precision_loss)]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}s", self.0 as f64 / 1_000_000_000.0)
    }
}

/// Format a duration for logs: milliseconds below one second, seconds above.
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let ms = duration.as_secs_f64() * 1000.0;
    if ms >= 1000.0 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        format!("{ms:.2}ms")
    }
}

/// Saturating conversion of a duration to whole nanoseconds.
#[must_use]
pub fn duration_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}
