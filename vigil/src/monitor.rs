//! # Monitor
//!
//! Entry point for instrumented code. A [`Monitor`] owns the configuration,
//! the set of active operations and the collector; instrumented threads call
//! it through four hooks:
//!
//! ```text
//! start_operation("GET /orders")  ─► Operation registered, root event pushed
//!   push_trace_event("query")     ─► nested event on the current operation
//!   pop_trace_event(handle)       ─► duration recorded
//! pop_trace_event(root handle)    ─► operation completed; collected if slow or stuck
//! ```
//!
//! The current operation is tracked per thread and per monitor, so several
//! monitors can coexist in one process (tests rely on this).
//!
//! None of the hooks return errors or panic on internal faults; faults are
//! logged and reported through [`Collector::collect_error`].

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::error::Error;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe, Location};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use vigil_common::StackFrame;

use crate::clock::{Clock, MonotonicClock};
use crate::collector::Collector;
use crate::config::MonitorConfig;
use crate::domain::{duration_nanos, format_duration, OperationId, Timestamp};
use crate::hotspot::HotspotTree;
use crate::operation::Operation;
use crate::sampling::{Scheduler, SchedulerHandle, ShadowStack, ShadowStackSampler, StackSampler};
use crate::trace::ExecutionContext;

static NEXT_MONITOR_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Operations started on this thread, innermost last, keyed by monitor id.
    static CURRENT_OPERATIONS: RefCell<Vec<(u64, Arc<Operation>)>> = const { RefCell::new(Vec::new()) };
}

pub(crate) struct MonitorInner {
    id: u64,
    config: ArcSwap<MonitorConfig>,
    collector: Arc<dyn Collector>,
    sampler: Arc<dyn StackSampler>,
    clock: Arc<dyn Clock>,
    active: Mutex<HashMap<OperationId, Arc<Operation>>>,
    next_operation_id: AtomicU64,
    global_hotspots: HotspotTree,
}

impl MonitorInner {
    pub(crate) fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub(crate) fn config(&self) -> Arc<MonitorConfig> {
        self.config.load_full()
    }

    pub(crate) fn sampler(&self) -> &dyn StackSampler {
        self.sampler.as_ref()
    }

    pub(crate) fn global_hotspots(&self) -> &HotspotTree {
        &self.global_hotspots
    }

    pub(crate) fn active_operations(&self) -> Vec<Arc<Operation>> {
        self.active.lock().values().cloned().collect()
    }

    /// Hand a report to the collector, containing any panic it raises.
    pub(crate) fn deliver(&self, what: &str, report: impl FnOnce(&dyn Collector)) {
        let collector = self.collector.as_ref();
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| report(collector))) {
            error!("Collector panicked while handling {what}: {}", panic_message(panic.as_ref()));
        }
    }

    pub(crate) fn report_error(&self, message: &str, cause: Option<&(dyn Error + 'static)>) {
        match cause {
            Some(cause) => warn!("{message}: {cause}"),
            None => warn!("{message}"),
        }
        self.deliver("an error report", |collector| collector.collect_error(message, cause));
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn offset_nanos(operation: &Operation, now: Timestamp) -> u64 {
    duration_nanos(now.saturating_since(operation.start()))
}

// =============================================================================
// TRACE EVENT HANDLE
// =============================================================================

#[derive(Debug)]
struct HandleTarget {
    operation: Arc<Operation>,
    /// `None` when the event cap was reached.
    index: Option<usize>,
    /// Popping the root completes the operation.
    root: bool,
    shadow_depth: usize,
}

/// Token returned by the push hooks, consumed by
/// [`Monitor::pop_trace_event`] on the same thread.
#[must_use = "pass the handle to Monitor::pop_trace_event when the traced call returns"]
#[derive(Debug)]
pub struct TraceEventHandle {
    target: Option<HandleTarget>,
    _not_send: PhantomData<*const ()>,
}

impl TraceEventHandle {
    fn untraced() -> Self {
        Self { target: None, _not_send: PhantomData }
    }

    /// Whether the call happened inside a monitored operation.
    #[must_use]
    pub fn is_monitored(&self) -> bool {
        self.target.is_some()
    }

    /// Index of the recorded event, `None` if nothing was recorded.
    #[must_use]
    pub fn index(&self) -> Option<usize> {
        self.target.as_ref().and_then(|t| t.index)
    }

    #[must_use]
    pub fn operation(&self) -> Option<&Arc<Operation>> {
        self.target.as_ref().map(|t| &t.operation)
    }

    #[must_use]
    pub fn is_operation_root(&self) -> bool {
        self.target.as_ref().is_some_and(|t| t.root)
    }
}

/// Pops its trace event when dropped.
#[must_use = "the event ends as soon as the guard is dropped"]
pub struct TraceEventGuard<'a> {
    monitor: &'a Monitor,
    handle: Option<TraceEventHandle>,
}

impl TraceEventGuard<'_> {
    #[must_use]
    pub fn handle(&self) -> Option<&TraceEventHandle> {
        self.handle.as_ref()
    }
}

impl Drop for TraceEventGuard<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.monitor.pop_trace_event(handle);
        }
    }
}

// =============================================================================
// MONITOR
// =============================================================================

/// Builder for a [`Monitor`] with injected clock and sampler.
pub struct MonitorBuilder {
    config: MonitorConfig,
    collector: Arc<dyn Collector>,
    clock: Option<Arc<dyn Clock>>,
    sampler: Option<Arc<dyn StackSampler>>,
}

impl MonitorBuilder {
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    #[must_use]
    pub fn sampler(mut self, sampler: Arc<dyn StackSampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    #[must_use]
    pub fn build(self) -> Monitor {
        Monitor {
            inner: Arc::new(MonitorInner {
                id: NEXT_MONITOR_ID.fetch_add(1, Ordering::Relaxed),
                config: ArcSwap::from_pointee(self.config.sanitized()),
                collector: self.collector,
                sampler: self.sampler.unwrap_or_else(|| Arc::new(ShadowStackSampler)),
                clock: self.clock.unwrap_or_else(|| Arc::new(MonotonicClock::new())),
                active: Mutex::new(HashMap::new()),
                next_operation_id: AtomicU64::new(1),
                global_hotspots: HotspotTree::new(),
            }),
        }
    }
}

/// In-process operation monitor. Cheap to clone.
#[derive(Clone)]
pub struct Monitor {
    inner: Arc<MonitorInner>,
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("id", &self.inner.id)
            .field("active", &self.inner.active.lock().len())
            .finish_non_exhaustive()
    }
}

impl Monitor {
    /// Monitor with the monotonic clock and shadow-stack sampler.
    #[must_use]
    pub fn new(config: MonitorConfig, collector: Arc<dyn Collector>) -> Self {
        Self::builder(config, collector).build()
    }

    #[must_use]
    pub fn builder(config: MonitorConfig, collector: Arc<dyn Collector>) -> MonitorBuilder {
        MonitorBuilder { config, collector, clock: None, sampler: None }
    }

    /// Current configuration. Running operations keep the one they started with.
    #[must_use]
    pub fn config(&self) -> Arc<MonitorConfig> {
        self.inner.config()
    }

    /// Replace the configuration; applies to operations started afterwards.
    pub fn update_config(&self, config: MonitorConfig) {
        let config = config.sanitized();
        info!(
            "Monitor configuration updated (enabled={}, threshold={}ms, stuck={}ms)",
            config.enabled, config.threshold_millis, config.stuck_threshold_millis
        );
        self.inner.config.store(Arc::new(config));
    }

    /// Begin an operation on the calling thread.
    ///
    /// If this thread is already inside an operation of this monitor, the
    /// call is recorded as a nested trace event instead. When monitoring is
    /// disabled the returned handle records nothing.
    #[track_caller]
    pub fn start_operation<C>(&self, description: impl Into<String>, context: C) -> TraceEventHandle
    where
        C: FnOnce() -> ExecutionContext,
    {
        let location = Location::caller();
        let description = description.into();
        if let Some(current) = self.current_operation() {
            trace!("{} already active, nesting {description:?}", current.id());
            return self.push_on(&current, description, context, location, false);
        }

        let config = self.inner.config();
        if !config.enabled {
            return TraceEventHandle::untraced();
        }

        let id = OperationId(self.inner.next_operation_id.fetch_add(1, Ordering::Relaxed));
        let operation = Arc::new(Operation::begin(id, description.clone(), config, self.inner.now()));
        self.inner.active.lock().insert(id, Arc::clone(&operation));
        CURRENT_OPERATIONS.with(|ops| ops.borrow_mut().push((self.inner.id, Arc::clone(&operation))));
        debug!("Started {id} {description:?}");
        self.push_on(&operation, description, context, location, true)
    }

    /// Record the start of a traced call within the current operation.
    ///
    /// `context` is only evaluated if the event is actually recorded.
    #[track_caller]
    pub fn push_trace_event<C>(&self, description: impl Into<String>, context: C) -> TraceEventHandle
    where
        C: FnOnce() -> ExecutionContext,
    {
        let location = Location::caller();
        let Some(operation) = self.current_operation() else {
            if self.inner.config().warn_on_trace_event_outside_operation {
                let description: String = description.into();
                warn!(
                    "Trace event {description:?} at {}:{} outside of any operation",
                    location.file(),
                    location.line()
                );
            }
            return TraceEventHandle::untraced();
        };
        self.push_on(&operation, description.into(), context, location, false)
    }

    fn push_on<C>(
        &self,
        operation: &Arc<Operation>,
        description: String,
        context: C,
        location: &'static Location<'static>,
        root: bool,
    ) -> TraceEventHandle
    where
        C: FnOnce() -> ExecutionContext,
    {
        let now = self.inner.now();
        let stack = ShadowStack::current();
        let shadow_depth = stack.total_depth();
        stack.push(StackFrame::with_location(description.clone(), location.file(), location.line()));
        let index = operation.trace().push(description, context, offset_nanos(operation, now));
        TraceEventHandle {
            target: Some(HandleTarget { operation: Arc::clone(operation), index, root, shadow_depth }),
            _not_send: PhantomData,
        }
    }

    /// Record the end of a traced call; completes the operation for its root.
    pub fn pop_trace_event(&self, handle: TraceEventHandle) {
        let Some(target) = handle.target else {
            return;
        };
        let now = self.inner.now();
        ShadowStack::current().unwind_to(target.shadow_depth);
        if let Some(index) = target.index {
            if !target.operation.trace().pop(index, offset_nanos(&target.operation, now)) {
                debug!("Trace event {index} of {} was already closed", target.operation.id());
            }
        }
        if target.root {
            self.complete(&target.operation, now);
        }
    }

    /// [`start_operation`](Self::start_operation) returning a guard.
    #[track_caller]
    pub fn operation_scope<C>(&self, description: impl Into<String>, context: C) -> TraceEventGuard<'_>
    where
        C: FnOnce() -> ExecutionContext,
    {
        TraceEventGuard { monitor: self, handle: Some(self.start_operation(description, context)) }
    }

    /// [`push_trace_event`](Self::push_trace_event) returning a guard.
    #[track_caller]
    pub fn trace_scope<C>(&self, description: impl Into<String>, context: C) -> TraceEventGuard<'_>
    where
        C: FnOnce() -> ExecutionContext,
    {
        TraceEventGuard { monitor: self, handle: Some(self.push_trace_event(description, context)) }
    }

    fn complete(&self, operation: &Arc<Operation>, end: Timestamp) {
        let Some(was_stuck) = operation.complete(end) else {
            debug!("{} already completed", operation.id());
            return;
        };
        operation.trace().close_all(offset_nanos(operation, end));
        self.inner.active.lock().remove(&operation.id());
        let monitor_id = self.inner.id;
        CURRENT_OPERATIONS.with(|ops| {
            ops.borrow_mut().retain(|(id, op)| !(*id == monitor_id && Arc::ptr_eq(op, operation)));
        });

        let duration = operation.elapsed(end);
        let over_threshold = operation.config().threshold().is_some_and(|t| duration >= t);
        if was_stuck || over_threshold {
            debug!("Collecting {} ({})", operation.id(), format_duration(duration));
            let snapshot = operation.snapshot(end);
            self.inner.deliver("a completed operation", |collector| collector.collect(snapshot));
        } else {
            trace!("Discarding {} ({})", operation.id(), format_duration(duration));
        }
    }

    /// The calling thread's innermost operation of this monitor.
    #[must_use]
    pub fn current_operation(&self) -> Option<Arc<Operation>> {
        let monitor_id = self.inner.id;
        CURRENT_OPERATIONS.with(|ops| {
            ops.borrow().iter().rev().find(|(id, _)| *id == monitor_id).map(|(_, op)| Arc::clone(op))
        })
    }

    /// Operations started and not yet completed, in no particular order.
    #[must_use]
    pub fn active_operations(&self) -> Vec<Arc<Operation>> {
        self.inner.active_operations()
    }

    /// Samples of every operation, when `globalHotspots` is enabled.
    #[must_use]
    pub fn global_hotspots(&self) -> &HotspotTree {
        self.inner.global_hotspots()
    }

    /// Scheduler bound to this monitor, for driving ticks by hand.
    #[must_use]
    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(Arc::clone(&self.inner))
    }

    /// Run the scheduler on a background thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn start_scheduler(&self) -> std::io::Result<SchedulerHandle> {
        self.scheduler().spawn()
    }
}
