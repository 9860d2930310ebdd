//! # vigil - Demo Entry Point
//!
//! Runs a simulated request-handling workload on a few worker threads under
//! a [`Monitor`], so slow and stuck reports, stack samples and the JSON Lines
//! export can be observed end to end.
//!
//! Set `RUST_LOG=info` to see the reports as they are collected.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use log::debug;
use vigil::analysis::analyze_hotspots;
use vigil::cli::Args;
use vigil::collector::{ChannelCollector, CollectorEvent, CompositeCollector, LoggingCollector};
use vigil::config::MonitorConfig;
use vigil::export::JsonLinesCollector;
use vigil::monitor::Monitor;
use vigil::sampling::{enter, enter_state};
use vigil::trace::ExecutionContext;
use vigil_common::ThreadState;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_CONFIG: i32 = 78;

const FAST_REQUEST: Duration = Duration::from_millis(5);
const SLOW_REQUEST: Duration = Duration::from_millis(150);
const STUCK_REQUEST: Duration = Duration::from_millis(700);

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.chain().any(|cause| cause.is::<vigil::domain::ConfigError>()) {
        EXIT_CONFIG
    } else {
        EXIT_ERROR
    }
}

/// Thresholds short enough for the simulated workload to trip them.
fn demo_config() -> MonitorConfig {
    MonitorConfig {
        threshold_millis: 100,
        stuck_threshold_millis: 500,
        stack_trace_initial_delay_millis: 20,
        stack_trace_period_millis: 10,
        scheduler_period_millis: 5,
        global_hotspots: true,
        ..MonitorConfig::default()
    }
}

#[derive(Debug, Default)]
struct Summary {
    completed: usize,
    stuck: usize,
    errors: usize,
}

fn run() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => MonitorConfig::from_file(path)?,
        None => demo_config(),
    };

    let (channel, reports) = ChannelCollector::bounded(1024);
    let mut collector = CompositeCollector::new().with(Arc::new(channel));
    if !args.quiet {
        collector = collector.with(Arc::new(LoggingCollector::default()));
    }
    if let Some(path) = &args.export {
        let export = JsonLinesCollector::create(path)
            .with_context(|| format!("Failed to create export file {}", path.display()))?;
        collector = collector.with(Arc::new(export));
    }

    let monitor = Monitor::new(config, Arc::new(collector));
    let scheduler = monitor.start_scheduler().context("Failed to start scheduler")?;

    if !args.quiet {
        println!("vigil v{}", env!("CARGO_PKG_VERSION"));
        println!("workers: {}, requests per worker: {}", args.workers, args.requests);
        if let Some(path) = &args.export {
            println!("export: {}", path.display());
        }
    }

    let started = Instant::now();
    let workers: Vec<JoinHandle<()>> = (0..args.workers)
        .map(|worker| {
            let monitor = monitor.clone();
            let requests = args.requests;
            let slow_every = args.slow_every;
            std::thread::Builder::new()
                .name(format!("worker-{worker}"))
                .spawn(move || run_worker(&monitor, worker, requests, slow_every))
                .context("Failed to spawn worker")
        })
        .collect::<Result<_>>()?;

    for worker in workers {
        if worker.join().is_err() {
            anyhow::bail!("Worker thread panicked");
        }
    }
    scheduler.shutdown();

    let mut summary = Summary::default();
    for event in reports.try_iter() {
        match event {
            CollectorEvent::Completed(_) => summary.completed += 1,
            CollectorEvent::FirstStuck(_) => summary.stuck += 1,
            CollectorEvent::Error { .. } => summary.errors += 1,
        }
    }

    eprintln!(
        "\ndone: {:.1}s, {} requests, {} reported ({} stuck), {} errors",
        started.elapsed().as_secs_f64(),
        u64::from(args.workers) * u64::from(args.requests),
        summary.completed,
        summary.stuck,
        summary.errors,
    );

    let hotspots = analyze_hotspots(monitor.global_hotspots());
    if !hotspots.is_empty() && !args.quiet {
        eprintln!("top hotspots ({} samples):", monitor.global_hotspots().total_samples());
        for hotspot in hotspots.iter().take(5) {
            eprintln!("  {:<30} {:>5.1}%  ({} samples)", hotspot.name, hotspot.percentage, hotspot.count);
        }
    }

    Ok(())
}

fn run_worker(monitor: &Monitor, worker: u32, requests: u32, slow_every: u32) {
    for request in 1..=requests {
        let delay = match slow_every {
            0 => FAST_REQUEST,
            n if request % (n * 3) == 0 => STUCK_REQUEST,
            n if request % n == 0 => SLOW_REQUEST,
            _ => FAST_REQUEST,
        };
        handle_request(monitor, worker, request, delay);
    }
    debug!("worker-{worker} finished {requests} requests");
}

fn handle_request(monitor: &Monitor, worker: u32, request: u32, delay: Duration) {
    let _request = monitor.operation_scope(format!("GET /orders/{request}"), || {
        ExecutionContext::new().with("worker", worker.to_string()).with("request", request.to_string())
    });
    if let Some(operation) = monitor.current_operation() {
        operation.set_username(format!("user-{}", request % 7));
    }

    {
        let _load = monitor.trace_scope("load orders", || {
            ExecutionContext::new().with("sql", "select * from orders where customer = ?")
        });
        let _frame = enter("orders::query");
        let _waiting = enter_state(ThreadState::Waiting);
        std::thread::sleep(delay);
    }

    let _render = monitor.trace_scope("render", ExecutionContext::new);
    let _frame = enter("orders::render");
    let mut checksum = 0u64;
    for i in 0..10_000u64 {
        checksum = checksum.wrapping_mul(31).wrapping_add(i);
    }
    std::hint::black_box(checksum);
    debug!("worker-{worker} served request {request}");
}
