//! # Vigil - In-Process Operation Monitor
//!
//! Vigil watches units of work ("operations", e.g. one HTTP request) inside a
//! running process. Instrumented code reports nested trace events; a
//! background scheduler samples the call stacks of long-running operations
//! and flags operations that run for too long. Slow and stuck operations are
//! handed to a pluggable collector together with their trace and hotspots.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Instrumented Threads                        │
//! │     start_operation / push_trace_event / pop_trace_event        │
//! └───────────────┬───────────────────────────────┬─────────────────┘
//!                 │ trace events                  │ frames + state
//!                 ▼                               ▼
//! ┌──────────────────────────────┐   ┌──────────────────────────────┐
//! │  Operation                   │   │  Shadow stacks (per thread)  │
//! │  • Trace (ring append list)  │   └──────────────┬───────────────┘
//! │  • Hotspot tree              │◀───── samples ───┤
//! │  • stuck / completed flags   │                  │
//! └───────────────┬──────────────┘   ┌──────────────┴───────────────┐
//!                 │                  │  Scheduler thread            │
//!                 │ completed        │  • periodic stack sampling   │
//!                 │ (slow or stuck)  │  • stuck detection           │
//!                 ▼                  └──────────────┬───────────────┘
//! ┌─────────────────────────────────────────────────┴───────────────┐
//! │  Collector: collect / collect_first_stuck / collect_error       │
//! │  (channel, log, JSON Lines export)                              │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! ### Core
//!
//! - [`monitor`]: the instrumentation hooks and the set of active operations
//! - [`operation`]: one monitored operation and the snapshot collectors receive
//! - [`trace`]: nested trace events, their context and tree reconstruction
//! - [`collections`]: the indexed ring append list that stores trace events
//!   with a bounded prefix and suffix across flushes
//!
//! ### Sampling
//!
//! - [`sampling`]: shadow stacks, the [`StackSampler`](sampling::StackSampler)
//!   seam and the background [`Scheduler`](sampling::Scheduler)
//! - [`hotspot`]: the call tree built from stack samples
//! - [`analysis`]: ranking of hotspot functions
//!
//! ### Output and Support
//!
//! - [`collector`]: the [`Collector`](collector::Collector) trait and basic sinks
//! - [`export`]: JSON Lines export
//! - [`config`]: JSON configuration with live updates
//! - [`clock`]: injectable time source
//! - [`metrics`]: per-operation resource metrics
//! - [`cli`]: arguments of the demo binary
//! - [`domain`]: ids, timestamps and error types
//!
//! ## Typical Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use vigil::collector::LoggingCollector;
//! use vigil::config::MonitorConfig;
//! use vigil::monitor::Monitor;
//! use vigil::trace::ExecutionContext;
//!
//! let monitor = Monitor::new(MonitorConfig::default(), Arc::new(LoggingCollector::default()));
//! let _scheduler = monitor.start_scheduler()?;
//!
//! let request = monitor.start_operation("GET /orders", ExecutionContext::new);
//! let query = monitor.push_trace_event("load orders", || {
//!     ExecutionContext::new().with("sql", "select * from orders")
//! });
//! // ... run the query ...
//! monitor.pop_trace_event(query);
//! monitor.pop_trace_event(request);
//! # Ok::<(), std::io::Error>(())
//! ```

pub mod analysis;
pub mod cli;
pub mod clock;
pub mod collections;
pub mod collector;
pub mod config;
pub mod domain;
pub mod export;
pub mod hotspot;
pub mod metrics;
pub mod monitor;
pub mod operation;
pub mod sampling;
pub mod trace;
