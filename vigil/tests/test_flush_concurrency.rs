use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use vigil::trace::{ExecutionContext, Trace, TraceEvent};

const PREFIX: usize = 8;
const SUFFIX: usize = 3;
const EVENTS: usize = 10_000;

/// One producer pushes and pops events while another thread keeps flushing.
/// Every event past the prefix must be delivered as fresh exactly once, and
/// the prefix must be complete in every batch taken after it filled up.
/// Every event must also show up completed in some batch, including events
/// that were cut off while still open.
#[test]
fn test_concurrent_flush_delivers_each_event_once() {
    let trace = Arc::new(Trace::new(PREFIX, SUFFIX, None));
    let done = Arc::new(AtomicBool::new(false));

    let producer = {
        let trace = Arc::clone(&trace);
        let done = Arc::clone(&done);
        std::thread::spawn(move || {
            let root = trace.push("root", ExecutionContext::new, 0).unwrap();
            for i in 1..EVENTS {
                let offset = u64::try_from(i).unwrap();
                let index = trace.push(format!("step-{i}"), ExecutionContext::new, offset).unwrap();
                trace.pop(index, offset + 1);
            }
            trace.pop(root, u64::try_from(EVENTS).unwrap());
            done.store(true, Ordering::Release);
        })
    };

    let mut fresh_counts: HashMap<usize, usize> = HashMap::new();
    let mut completed: HashSet<usize> = HashSet::new();
    loop {
        let finished = done.load(Ordering::Acquire);
        let batch = trace.flush();

        let prefix: Vec<usize> = batch.prefix().iter().map(|e| e.index).collect();
        assert!(prefix.iter().all(|&i| i < PREFIX));
        assert!(prefix.windows(2).all(|w| w[0] < w[1]));
        for event in batch.fresh() {
            assert!(event.index >= PREFIX, "prefix event {} delivered as fresh", event.index);
            *fresh_counts.entry(event.index).or_insert(0) += 1;
        }
        assert!(batch.carried().len() <= SUFFIX);
        completed.extend(batch.iter().filter(|e| e.completed).map(|e| e.index));

        if finished {
            break;
        }
    }
    producer.join().unwrap();
    let last = trace.flush();
    for event in last.fresh() {
        *fresh_counts.entry(event.index).or_insert(0) += 1;
    }
    completed.extend(last.iter().filter(|e| e.completed).map(|e| e.index));
    assert_eq!(completed.len(), EVENTS);

    assert_eq!(fresh_counts.len(), EVENTS - PREFIX);
    assert!(fresh_counts.values().all(|&count| count == 1));

    let prefix: Vec<&Arc<TraceEvent>> = last.prefix().iter().collect();
    assert_eq!(prefix.len(), PREFIX);
    assert_eq!(prefix[0].duration_nanos, Some(u64::try_from(EVENTS).unwrap()));
}
