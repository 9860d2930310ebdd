//! Background scheduler.
//!
//! Every tick the scheduler walks the active operations and, for each one:
//!
//! 1. samples the stacks of its threads once the initial delay has passed,
//!    then once per period, merging them into the operation's hotspot tree
//!    (and the global tree when enabled)
//! 2. marks it stuck the first time it outlives the stuck threshold and
//!    sends a snapshot to `collect_first_stuck`
//!
//! A failure while handling one operation is reported and does not affect
//! the others or later ticks.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use log::{debug, error, warn};

use crate::domain::Timestamp;
use crate::monitor::{panic_message, MonitorInner};
use crate::operation::Operation;

/// What one tick did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    pub active: usize,
    pub sampled: usize,
    pub newly_stuck: usize,
    pub failures: usize,
}

impl TickSummary {
    fn absorb(&mut self, other: TickSummary) {
        self.sampled += other.sampled;
        self.newly_stuck += other.newly_stuck;
        self.failures += other.failures;
    }
}

/// Periodic sampling and stuck detection for one monitor.
pub struct Scheduler {
    monitor: Arc<MonitorInner>,
}

impl Scheduler {
    pub(crate) fn new(monitor: Arc<MonitorInner>) -> Self {
        Self { monitor }
    }

    /// Run one pass over the active operations.
    pub fn tick(&self) -> TickSummary {
        let now = self.monitor.now();
        let operations = self.monitor.active_operations();
        let mut summary = TickSummary { active: operations.len(), ..TickSummary::default() };

        for operation in operations {
            let outcome =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| self.process(&operation, now)));
            match outcome {
                Ok(result) => summary.absorb(result),
                Err(panic) => {
                    let message = format!(
                        "Monitoring {} failed: {}",
                        operation.id(),
                        panic_message(panic.as_ref())
                    );
                    error!("{message}");
                    self.monitor.report_error(&message, None);
                    summary.failures += 1;
                }
            }
        }
        summary
    }

    fn process(&self, operation: &Operation, now: Timestamp) -> TickSummary {
        let mut summary = TickSummary::default();
        if operation.is_completed() {
            return summary;
        }

        if operation.claim_sample_slot(now) {
            let global = operation.config().global_hotspots;
            for thread in operation.threads() {
                match self.monitor.sampler().sample(&thread) {
                    Ok(sample) => {
                        operation.hotspots().capture_sample(&sample);
                        if global {
                            self.monitor.global_hotspots().capture_sample(&sample);
                        }
                        summary.sampled += 1;
                    }
                    Err(e) => {
                        let message =
                            format!("Failed to sample {} for {}", thread.name(), operation.id());
                        self.monitor.report_error(&message, Some(&e));
                        summary.failures += 1;
                    }
                }
            }
        }

        let stuck = operation.config().stuck_threshold().is_some_and(|t| operation.elapsed(now) >= t);
        if stuck && operation.mark_stuck() {
            warn!("{} {:?} is stuck", operation.id(), operation.description());
            let snapshot = operation.snapshot(now);
            self.monitor
                .deliver("a stuck operation", |collector| collector.collect_first_stuck(snapshot));
            summary.newly_stuck += 1;
        }
        summary
    }

    /// Tick on a dedicated thread until the handle is shut down or dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn(self) -> std::io::Result<SchedulerHandle> {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let thread = std::thread::Builder::new().name("vigil-scheduler".to_string()).spawn(move || {
            debug!("Scheduler started");
            loop {
                let period = self.monitor.config().scheduler_period();
                match shutdown_rx.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => {
                        self.tick();
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            debug!("Scheduler stopped");
        })?;
        Ok(SchedulerHandle { shutdown_tx: Some(shutdown_tx), thread: Some(thread) })
    }
}

/// Stops the scheduler thread when shut down or dropped.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Stop the thread and wait for the tick in progress to finish.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Scheduler thread panicked");
            }
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
