//! # Collectors
//!
//! A [`Collector`] receives everything the monitor reports:
//!
//! - `collect` - a completed operation that crossed the threshold or was stuck
//! - `collect_first_stuck` - an operation the first time it is found stuck
//! - `collect_error` - an internal fault that was swallowed
//!
//! Collectors are called from instrumented threads (completion) and from the
//! scheduler thread (stuck reports, errors), so they must be cheap and must
//! not block. The monitor catches panics raised by a collector.
//!
//! ## Provided sinks
//!
//! - [`ChannelCollector`] - forwards to a bounded channel, dropping when full
//! - [`LoggingCollector`] - writes a summary through the `log` facade
//! - [`CompositeCollector`] - fans out to several collectors
//! - [`JsonLinesCollector`](crate::export::JsonLinesCollector) - one JSON object per line

use std::error::Error;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{error, info, warn};

use crate::analysis::analyze_snapshot;
use crate::domain::format_duration;
use crate::operation::OperationSnapshot;

/// Sink for monitoring output.
pub trait Collector: Send + Sync {
    /// A completed operation worth reporting.
    fn collect(&self, operation: OperationSnapshot);

    /// An active operation that just crossed the stuck threshold.
    fn collect_first_stuck(&self, operation: OperationSnapshot);

    /// An internal fault that was not propagated to instrumented code.
    fn collect_error(&self, message: &str, cause: Option<&(dyn Error + 'static)>);
}

// =============================================================================
// CHANNEL COLLECTOR
// =============================================================================

/// Message sent by [`ChannelCollector`].
#[derive(Debug, Clone)]
pub enum CollectorEvent {
    Completed(OperationSnapshot),
    FirstStuck(OperationSnapshot),
    Error { message: String, cause: Option<String> },
}

/// Forwards reports to a bounded channel for another thread to consume.
///
/// Reports are dropped (and counted) when the channel is full so that
/// instrumented threads never wait on the consumer.
#[derive(Debug)]
pub struct ChannelCollector {
    tx: Sender<CollectorEvent>,
    dropped: AtomicU64,
}

impl ChannelCollector {
    #[must_use]
    pub fn bounded(capacity: usize) -> (Self, Receiver<CollectorEvent>) {
        let (tx, rx) = bounded(capacity);
        (Self { tx, dropped: AtomicU64::new(0) }, rx)
    }

    /// Reports lost because the channel was full or closed.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn send(&self, event: CollectorEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                if self.dropped.fetch_add(1, Ordering::Relaxed) == 0 {
                    warn!("Collector channel full, dropping reports");
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl Collector for ChannelCollector {
    fn collect(&self, operation: OperationSnapshot) {
        self.send(CollectorEvent::Completed(operation));
    }

    fn collect_first_stuck(&self, operation: OperationSnapshot) {
        self.send(CollectorEvent::FirstStuck(operation));
    }

    fn collect_error(&self, message: &str, cause: Option<&(dyn Error + 'static)>) {
        self.send(CollectorEvent::Error {
            message: message.to_string(),
            cause: cause.map(ToString::to_string),
        });
    }
}

// =============================================================================
// LOGGING COLLECTOR
// =============================================================================

/// Logs a summary of each report: trace tree and top hotspots.
#[derive(Debug, Clone)]
pub struct LoggingCollector {
    top_hotspots: usize,
}

impl Default for LoggingCollector {
    fn default() -> Self {
        Self { top_hotspots: 5 }
    }
}

impl LoggingCollector {
    #[must_use]
    pub fn new(top_hotspots: usize) -> Self {
        Self { top_hotspots }
    }

    /// Multi-line summary used by both report kinds.
    #[must_use]
    pub fn summarize(&self, operation: &OperationSnapshot) -> String {
        let mut text = format!(
            "{} {:?} took {} on [{}]",
            operation.id,
            operation.description,
            format_duration(operation.duration()),
            operation.thread_names.join(", "),
        );
        if let Some(user) = &operation.username {
            let _ = write!(text, " for {user}");
        }
        if operation.metrics.trace_events_dropped > 0 {
            let _ = write!(text, " ({} trace events dropped)", operation.metrics.trace_events_dropped);
        }
        text.push('\n');
        text.push_str(&operation.trace_tree().render());

        let hotspots = analyze_snapshot(&operation.hotspots);
        if !hotspots.is_empty() {
            let _ = writeln!(text, "hotspots ({} samples):", operation.metrics.hotspot_samples);
            for hotspot in hotspots.iter().take(self.top_hotspots) {
                let state = hotspot.dominant_state().map_or_else(String::new, |s| s.to_string());
                let _ = writeln!(
                    text,
                    "  {:<40} {:>5.1}%  {}",
                    hotspot.name, hotspot.percentage, state
                );
            }
        }
        text
    }
}

impl Collector for LoggingCollector {
    fn collect(&self, operation: OperationSnapshot) {
        info!("Slow operation {}", self.summarize(&operation));
    }

    fn collect_first_stuck(&self, operation: OperationSnapshot) {
        warn!("Stuck operation {}", self.summarize(&operation));
    }

    fn collect_error(&self, message: &str, cause: Option<&(dyn Error + 'static)>) {
        match cause {
            Some(cause) => error!("{message}: {cause}"),
            None => error!("{message}"),
        }
    }
}

// =============================================================================
// COMPOSITE COLLECTOR
// =============================================================================

/// Forwards every report to each inner collector in order.
#[derive(Default, Clone)]
pub struct CompositeCollector {
    collectors: Vec<Arc<dyn Collector>>,
}

impl CompositeCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, collector: Arc<dyn Collector>) -> Self {
        self.collectors.push(collector);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.collectors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.collectors.is_empty()
    }
}

impl Collector for CompositeCollector {
    fn collect(&self, operation: OperationSnapshot) {
        for collector in &self.collectors {
            collector.collect(operation.clone());
        }
    }

    fn collect_first_stuck(&self, operation: OperationSnapshot) {
        for collector in &self.collectors {
            collector.collect_first_stuck(operation.clone());
        }
    }

    fn collect_error(&self, message: &str, cause: Option<&(dyn Error + 'static)>) {
        for collector in &self.collectors {
            collector.collect_error(message, cause);
        }
    }
}
