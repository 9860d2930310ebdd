//! Per-operation resource metrics
//!
//! Thread CPU time is read through `clock_gettime(CLOCK_THREAD_CPUTIME_ID)`,
//! which only measures the calling thread. It is therefore captured on the
//! operation's own thread at start and at completion; snapshots taken by the
//! scheduler thread leave it empty. Outside Unix it is never available.

#![cfg_attr(unix, allow(unsafe_code))] // clock_gettime() requires unsafe

use std::time::Duration;

use serde::Serialize;

/// Resource usage attached to an operation snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSnapshot {
    /// CPU time the operation's thread spent between start and completion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_cpu_nanos: Option<u64>,
    pub trace_events_recorded: usize,
    pub trace_events_dropped: u64,
    pub hotspot_samples: u64,
}

/// CPU time consumed so far by the calling thread.
///
/// Returns `None` where the clock is not supported.
#[cfg(unix)]
#[must_use]
pub fn thread_cpu_time() -> Option<Duration> {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: `ts` is a valid, writable timespec for the duration of the call
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_THREAD_CPUTIME_ID, &mut ts) };
    if rc != 0 {
        return None;
    }
    let secs = u64::try_from(ts.tv_sec).ok()?;
    let nanos = u32::try_from(ts.tv_nsec).ok()?;
    Some(Duration::new(secs, nanos))
}

#[cfg(not(unix))]
#[must_use]
pub fn thread_cpu_time() -> Option<Duration> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    #[test]
    fn test_thread_cpu_time_available_on_linux() {
        assert!(thread_cpu_time().is_some());
    }

    #[test]
    fn test_thread_cpu_time_is_monotonic() {
        let Some(before) = thread_cpu_time() else {
            return;
        };
        let mut acc = 0u64;
        for i in 0..200_000u64 {
            acc = acc.wrapping_mul(31).wrapping_add(i);
        }
        std::hint::black_box(acc);
        let after = thread_cpu_time().unwrap();
        assert!(after >= before);
    }

    #[test]
    fn test_snapshot_omits_missing_cpu_time() {
        let json = serde_json::to_value(MetricSnapshot::default()).unwrap();
        assert!(json.get("threadCpuNanos").is_none());
        assert_eq!(json["traceEventsRecorded"], 0);
    }
}
