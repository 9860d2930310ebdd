//! A monitored operation and the snapshots collectors receive.
//!
//! An [`Operation`] is created by the thread that starts it, shared with the
//! scheduler through the monitor's active set, and finished exactly once by
//! the owning thread. Its status moves through:
//!
//! ```text
//! Active ──(elapsed ≥ stuck threshold, scheduler)──► Active+Stuck
//!   │                                                    │
//!   └──────────────(root event popped, owner)────────────┴──► Completed
//! ```
//!
//! The stuck and completed bits live in one atomic so that "mark stuck unless
//! already completed" and "complete, remembering whether it was stuck" cannot
//! interleave badly.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::MonitorConfig;
use crate::domain::{duration_nanos, OperationId, Timestamp};
use crate::hotspot::{HotspotNodeSnapshot, HotspotTree};
use crate::metrics::{thread_cpu_time, MetricSnapshot};
use crate::sampling::ThreadRef;
use crate::trace::{Trace, TraceEvent, TraceTree};

const STUCK: u8 = 0b01;
const COMPLETED: u8 = 0b10;
const NEVER_SAMPLED: u64 = u64::MAX;

/// One unit of monitored work.
#[derive(Debug)]
pub struct Operation {
    id: OperationId,
    description: String,
    start_time_millis: u64,
    start: Timestamp,
    end: OnceLock<Timestamp>,
    flags: AtomicU8,
    config: Arc<MonitorConfig>,
    trace: Trace,
    hotspots: HotspotTree,
    threads: Mutex<Vec<ThreadRef>>,
    username: Mutex<Option<String>>,
    /// Scheduler-owned time of the last stack sample.
    last_sample_nanos: AtomicU64,
    trace_batches: AtomicU32,
    cpu_start: Option<Duration>,
    cpu_used: OnceLock<Duration>,
}

impl Operation {
    /// Start an operation on the calling thread.
    pub(crate) fn begin(
        id: OperationId,
        description: impl Into<String>,
        config: Arc<MonitorConfig>,
        start: Timestamp,
    ) -> Self {
        let start_time_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        let trace = Trace::new(
            config.trace_prefix_capacity,
            config.trace_suffix_capacity,
            config.max_trace_events(),
        );
        Self {
            id,
            description: description.into(),
            start_time_millis,
            start,
            end: OnceLock::new(),
            flags: AtomicU8::new(0),
            config,
            trace,
            hotspots: HotspotTree::new(),
            threads: Mutex::new(vec![ThreadRef::current()]),
            username: Mutex::new(None),
            last_sample_nanos: AtomicU64::new(NEVER_SAMPLED),
            trace_batches: AtomicU32::new(0),
            cpu_start: thread_cpu_time(),
            cpu_used: OnceLock::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> OperationId {
        self.id
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Wall-clock start, milliseconds since the Unix epoch.
    #[must_use]
    pub fn start_time_millis(&self) -> u64 {
        self.start_time_millis
    }

    #[must_use]
    pub fn start(&self) -> Timestamp {
        self.start
    }

    #[must_use]
    pub fn end(&self) -> Option<Timestamp> {
        self.end.get().copied()
    }

    /// Configuration captured when the operation started.
    #[must_use]
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    #[must_use]
    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    #[must_use]
    pub fn hotspots(&self) -> &HotspotTree {
        &self.hotspots
    }

    #[must_use]
    pub fn is_stuck(&self) -> bool {
        self.flags.load(Ordering::Acquire) & STUCK != 0
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.flags.load(Ordering::Acquire) & COMPLETED != 0
    }

    /// Duration so far, or the final duration once completed.
    #[must_use]
    pub fn elapsed(&self, now: Timestamp) -> Duration {
        self.end().unwrap_or(now).saturating_since(self.start)
    }

    #[must_use]
    pub fn username(&self) -> Option<String> {
        self.username.lock().clone()
    }

    pub fn set_username(&self, username: impl Into<String>) {
        *self.username.lock() = Some(username.into());
    }

    /// Threads this operation runs on.
    #[must_use]
    pub fn threads(&self) -> Vec<ThreadRef> {
        self.threads.lock().clone()
    }

    #[must_use]
    pub fn thread_names(&self) -> Vec<String> {
        self.threads.lock().iter().map(|t| t.name().to_string()).collect()
    }

    /// Include the calling thread in this operation's stack samples.
    ///
    /// Trace events are still only recorded by the thread that started it.
    pub fn attach_current_thread(&self) {
        let current = ThreadRef::current();
        let mut threads = self.threads.lock();
        if !threads.iter().any(|t| t.is_same_thread(&current)) {
            threads.push(current);
        }
    }

    /// Set the stuck bit unless already stuck or completed.
    ///
    /// Returns `true` exactly once per operation, to the caller that set it.
    pub(crate) fn mark_stuck(&self) -> bool {
        self.flags
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |flags| {
                (flags & (STUCK | COMPLETED) == 0).then_some(flags | STUCK)
            })
            .is_ok()
    }

    /// Record the end time and set the completed bit.
    ///
    /// Must be called on the thread that started the operation. Returns
    /// whether it had been marked stuck, or `None` if it was already completed.
    pub(crate) fn complete(&self, end: Timestamp) -> Option<bool> {
        self.end.set(end).ok()?;
        if let (Some(start), Some(now)) = (self.cpu_start, thread_cpu_time()) {
            let _ = self.cpu_used.set(now.saturating_sub(start));
        }
        let previous = self.flags.fetch_or(COMPLETED, Ordering::AcqRel);
        Some(previous & STUCK != 0)
    }

    /// Whether a stack sample is due, claiming the slot if so. Scheduler only.
    pub(crate) fn claim_sample_slot(&self, now: Timestamp) -> bool {
        let Some((initial_delay, period)) = self.config.stack_sampling() else {
            return false;
        };
        if self.elapsed(now) < initial_delay {
            return false;
        }
        let last = self.last_sample_nanos.load(Ordering::Relaxed);
        if last != NEVER_SAMPLED && now.saturating_since(Timestamp(last)) < period {
            return false;
        }
        self.last_sample_nanos.store(now.0, Ordering::Relaxed);
        true
    }

    #[must_use]
    pub fn metrics(&self) -> MetricSnapshot {
        MetricSnapshot {
            thread_cpu_nanos: self.cpu_used.get().map(|d| duration_nanos(*d)),
            trace_events_recorded: self.trace.recorded(),
            trace_events_dropped: self.trace.dropped(),
            hotspot_samples: self.hotspots.total_samples(),
        }
    }

    /// Flush the trace and copy everything a collector needs.
    pub(crate) fn snapshot(&self, now: Timestamp) -> OperationSnapshot {
        let batch = self.trace.flush();
        let trace_batch = self.trace_batches.fetch_add(1, Ordering::Relaxed);
        let flags = self.flags.load(Ordering::Acquire);
        OperationSnapshot {
            id: self.id,
            description: self.description.clone(),
            start_time_millis: self.start_time_millis,
            duration_nanos: duration_nanos(self.elapsed(now)),
            completed: flags & COMPLETED != 0,
            stuck: flags & STUCK != 0,
            thread_names: self.thread_names(),
            username: self.username(),
            trace_batch,
            trace: batch.iter().cloned().collect(),
            hotspots: self.hotspots.snapshot(),
            metrics: self.metrics(),
        }
    }
}

/// Immutable copy of an operation handed to a collector.
///
/// `trace` holds the events flushed for this report. When a stuck report was
/// delivered earlier, `trace_batch` is non-zero and events already reported
/// there are not repeated, except the retained first events, the last few
/// before the cut, and events that were still open then and have completed
/// since.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationSnapshot {
    pub id: OperationId,
    pub description: String,
    pub start_time_millis: u64,
    pub duration_nanos: u64,
    pub completed: bool,
    pub stuck: bool,
    pub thread_names: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub trace_batch: u32,
    pub trace: Vec<Arc<TraceEvent>>,
    pub hotspots: Vec<HotspotNodeSnapshot>,
    pub metrics: MetricSnapshot,
}

impl OperationSnapshot {
    #[must_use]
    pub fn duration(&self) -> Duration {
        Duration::from_nanos(self.duration_nanos)
    }

    /// Nested view of `trace`.
    #[must_use]
    pub fn trace_tree(&self) -> TraceTree {
        TraceTree::from_events(&self.trace)
    }
}
