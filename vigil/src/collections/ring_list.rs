//! Single-writer append list with bounded-memory flush.
//!
//! [`IndexedRingAppendList`] lets one producer thread append indexed elements
//! continuously while any other thread periodically cuts off a consistent
//! batch with [`flush`](IndexedRingAppendList::flush). Nothing appended
//! concurrently with a cut is lost, and memory stays bounded because flushed
//! segments are dropped.
//!
//! # Layout
//!
//! ```text
//!  prefix slots (permanent)      open segment (swapped on every flush)
//! ┌───┬───┬───┬───┐            ┌─────────────────┬──────────────────────┐
//! │ 0 │ 1 │ … │P-1│            │ carried (≤ K)   │ fresh                │
//! └───┴───┴───┴───┘            ├─────────────────┴──────────────────────┤
//!   index < P                  │ updated (flushed earlier, changed since)│
//!                              └────────────────────────────────────────┘
//! ```
//!
//! - Elements with `index < P` live only in the prefix slots and are part of
//!   every flush result, so the first events of a trace are never lost.
//! - All other elements go to the open segment. A flush seals it and
//!   installs a successor seeded with its last `K` elements (the carried
//!   suffix), which keeps recent context visible.
//! - An update to an element that is in the prefix or the open segment
//!   replaces it in place. An update to an element that was flushed and not
//!   carried is queued in the open segment's `updated` log and delivered by
//!   the next flush, so a duration filled in late is never lost.
//!
//! # Concurrency
//!
//! The fresh and updated logs are append-only chunked slots with a published
//! length. The producer writes a slot and then publishes it with a CAS on the
//! length word; a flush seals the word by setting its top bit. Readers load
//! the length and copy the slots below it without any lock, and the producer
//! never waits on a reader. The only mutex serializes flushes against each
//! other. An append that loses the race with a seal spins until the
//! successor segment is installed, which takes one copy of the carried
//! suffix.
//!
//! # Guarantees
//!
//! - Every element with `index >= P` appears in the `fresh` part of exactly
//!   one [`FlushedBatch`].
//! - The latest version of every updated element reaches at least one batch
//!   taken after the update.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use parking_lot::Mutex;

const CHUNK_LEN: usize = 64;
const SEALED: usize = 1 << (usize::BITS - 1);

/// An element that knows its position in the sequence.
///
/// Indices must be unique and appended in strictly increasing order.
pub trait IndexedElement {
    fn index(&self) -> usize;
}

/// Append-only sequence with a permanent prefix and flushable tail.
pub struct IndexedRingAppendList<T> {
    prefix: Box<[ArcSwapOption<T>]>,
    suffix_capacity: usize,
    open: ArcSwap<Segment<T>>,
    /// Serializes flushes only; appends never take it.
    flush_lock: Mutex<()>,
}

type Chunk<T> = Arc<[ArcSwapOption<T>]>;

/// Slots written by the producer thread only, readable from any thread.
struct AppendLog<T> {
    chunks: ArcSwap<Vec<Chunk<T>>>,
    /// Number of published slots, with `SEALED` set once flushed.
    state: AtomicUsize,
}

impl<T> AppendLog<T> {
    fn new() -> Self {
        Self { chunks: ArcSwap::from_pointee(Vec::new()), state: AtomicUsize::new(0) }
    }

    fn is_sealed(&self) -> bool {
        self.state.load(Ordering::SeqCst) & SEALED != 0
    }

    fn len(&self) -> usize {
        self.state.load(Ordering::Acquire) & !SEALED
    }

    /// Publish `element` after the last slot. Returns `false` if sealed.
    fn push(&self, element: &Arc<T>) -> bool {
        let len = self.state.load(Ordering::Acquire);
        if len & SEALED != 0 {
            return false;
        }
        self.chunk_for_write(len / CHUNK_LEN)[len % CHUNK_LEN].store(Some(Arc::clone(element)));
        self.state.compare_exchange(len, len + 1, Ordering::SeqCst, Ordering::SeqCst).is_ok()
    }

    fn chunk_for_write(&self, chunk: usize) -> Chunk<T> {
        let chunks = self.chunks.load();
        if let Some(existing) = chunks.get(chunk) {
            return Arc::clone(existing);
        }
        let added: Chunk<T> = (0..CHUNK_LEN).map(|_| ArcSwapOption::empty()).collect();
        let mut grown = Vec::clone(&chunks);
        grown.push(Arc::clone(&added));
        self.chunks.store(Arc::new(grown));
        added
    }

    /// Seal the log and return the number of published slots.
    fn seal(&self) -> usize {
        self.state.fetch_or(SEALED, Ordering::SeqCst) & !SEALED
    }

    /// Copy the first `len` published slots.
    fn read(&self, len: usize) -> Vec<Arc<T>> {
        let chunks = self.chunks.load();
        (0..len)
            .map_while(|pos| chunks.get(pos / CHUNK_LEN)?[pos % CHUNK_LEN].load_full())
            .collect()
    }
}

impl<T: IndexedElement> AppendLog<T> {
    /// Replace the published element with the same index. Producer only.
    fn replace(&self, element: &Arc<T>) -> bool {
        let index = element.index();
        let chunks = self.chunks.load();
        let slot = |pos: usize| chunks.get(pos / CHUNK_LEN).map(|chunk| &chunk[pos % CHUNK_LEN]);
        let (mut low, mut high) = (0, self.len());
        while low < high {
            let mid = low + (high - low) / 2;
            let Some(current) = slot(mid).and_then(|s| s.load_full()) else {
                return false;
            };
            match current.index().cmp(&index) {
                CmpOrdering::Less => low = mid + 1,
                CmpOrdering::Greater => high = mid,
                CmpOrdering::Equal => {
                    if let Some(target) = slot(mid) {
                        target.store(Some(Arc::clone(element)));
                    }
                    return true;
                }
            }
        }
        false
    }
}

struct Segment<T> {
    carried: Box<[ArcSwap<T>]>,
    fresh: AppendLog<T>,
    updated: AppendLog<T>,
}

impl<T> Segment<T> {
    fn seeded(carried: Vec<Arc<T>>) -> Self {
        Self {
            carried: carried.into_iter().map(ArcSwap::new).collect(),
            fresh: AppendLog::new(),
            updated: AppendLog::new(),
        }
    }

    fn is_sealed(&self) -> bool {
        self.fresh.is_sealed()
    }

    fn carried(&self) -> Vec<Arc<T>> {
        self.carried.iter().map(|slot| slot.load_full()).collect()
    }
}

impl<T: IndexedElement> Segment<T> {
    /// Replace the element with the same index in the carried or fresh part.
    fn replace(&self, element: &Arc<T>) -> bool {
        let index = element.index();
        if let Ok(pos) = self.carried.binary_search_by_key(&index, |slot| slot.load().index()) {
            self.carried[pos].store(Arc::clone(element));
            return true;
        }
        self.fresh.replace(element)
    }
}

/// One batch cut off by [`IndexedRingAppendList::flush`].
#[derive(Debug)]
pub struct FlushedBatch<T> {
    prefix: Vec<Arc<T>>,
    carried: Vec<Arc<T>>,
    fresh: Vec<Arc<T>>,
    updated: Vec<Arc<T>>,
}

impl<T> FlushedBatch<T> {
    /// Retained prefix elements below the cut line.
    #[must_use]
    pub fn prefix(&self) -> &[Arc<T>] {
        &self.prefix
    }

    /// Suffix carried over from the previous batch, already delivered once.
    #[must_use]
    pub fn carried(&self) -> &[Arc<T>] {
        &self.carried
    }

    /// Elements delivered for the first time by this batch.
    #[must_use]
    pub fn fresh(&self) -> &[Arc<T>] {
        &self.fresh
    }

    /// Elements delivered by an earlier batch and changed since, in update
    /// order.
    #[must_use]
    pub fn updated(&self) -> &[Arc<T>] {
        &self.updated
    }

    /// Prefix, carried and fresh elements in index order, then the updated
    /// ones.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<T>> {
        self.prefix
            .iter()
            .chain(self.carried.iter())
            .chain(self.fresh.iter())
            .chain(self.updated.iter())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.prefix.len() + self.carried.len() + self.fresh.len() + self.updated.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: IndexedElement> IndexedRingAppendList<T> {
    /// Create a list retaining the first `prefix_capacity` elements forever
    /// and carrying the last `suffix_capacity` elements across each flush.
    #[must_use]
    pub fn new(prefix_capacity: usize, suffix_capacity: usize) -> Self {
        Self {
            prefix: (0..prefix_capacity).map(|_| ArcSwapOption::empty()).collect(),
            suffix_capacity,
            open: ArcSwap::from_pointee(Segment::seeded(Vec::new())),
            flush_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn prefix_capacity(&self) -> usize {
        self.prefix.len()
    }

    #[must_use]
    pub fn suffix_capacity(&self) -> usize {
        self.suffix_capacity
    }

    /// Append an element. Producer thread only.
    pub fn add(&self, element: T) {
        let index = element.index();
        if let Some(slot) = self.prefix.get(index) {
            slot.store(Some(Arc::new(element)));
            return;
        }
        let element = Arc::new(element);
        loop {
            if self.open.load().fresh.push(&element) {
                return;
            }
            // sealed by a flush that has not installed the successor yet
            std::hint::spin_loop();
        }
    }

    /// Replace an element that may already have been cut off by a flush.
    /// Producer thread only.
    ///
    /// Returns `true` when the element was replaced in the prefix or the open
    /// segment, `false` when it had been flushed and not carried; the update
    /// is then delivered by the next flush as part of
    /// [`FlushedBatch::updated`].
    pub fn update_possibly_flushed_element(&self, element: T) -> bool {
        let index = element.index();
        if let Some(slot) = self.prefix.get(index) {
            slot.store(Some(Arc::new(element)));
            return true;
        }
        let element = Arc::new(element);
        loop {
            let segment = self.open.load_full();
            if segment.is_sealed() {
                std::hint::spin_loop();
                continue;
            }
            if segment.replace(&element) {
                if !segment.is_sealed() {
                    return true;
                }
                // the flush may have read the old value; repeat on the successor
                continue;
            }
            if segment.updated.push(&element) {
                return false;
            }
        }
    }

    /// Weakly consistent snapshot: retained prefix followed by the open
    /// segment's carried and fresh elements. Never blocks the producer.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        let mut elements = self.prefix_snapshot();
        let segment = self.open.load_full();
        elements.extend(segment.carried());
        elements.extend(segment.fresh.read(segment.fresh.len()));
        elements
    }

    /// Iterate over a [`snapshot`](Self::snapshot).
    pub fn iter(&self) -> impl Iterator<Item = Arc<T>> {
        self.snapshot().into_iter()
    }

    /// Seal the open segment, install its successor and return the cut.
    pub fn flush(&self) -> FlushedBatch<T> {
        let _flush_guard = self.flush_lock.lock();

        let segment = self.open.load_full();
        let fresh_len = segment.fresh.seal();
        let updated_len = segment.updated.seal();
        let carried = segment.carried();
        let fresh = segment.fresh.read(fresh_len);

        let total = carried.len() + fresh.len();
        let seed: Vec<Arc<T>> = carried
            .iter()
            .chain(fresh.iter())
            .skip(total.saturating_sub(self.suffix_capacity))
            .cloned()
            .collect();
        self.open.store(Arc::new(Segment::seeded(seed)));
        let updated = segment.updated.read(updated_len);

        let cut_line = carried.first().or_else(|| fresh.first()).map_or(usize::MAX, |e| e.index());
        let mut prefix = self.prefix_snapshot();
        prefix.retain(|e| e.index() < cut_line);

        FlushedBatch { prefix, carried, fresh, updated }
    }

    fn prefix_snapshot(&self) -> Vec<Arc<T>> {
        self.prefix.iter().map_while(|slot| slot.load_full()).collect()
    }
}

impl<T> std::fmt::Debug for IndexedRingAppendList<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexedRingAppendList")
            .field("prefix_capacity", &self.prefix.len())
            .field("suffix_capacity", &self.suffix_capacity)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        index: usize,
        label: &'static str,
    }

    impl IndexedElement for Item {
        fn index(&self) -> usize {
            self.index
        }
    }

    fn item(index: usize) -> Item {
        Item { index, label: "open" }
    }

    fn indices<'a>(items: impl IntoIterator<Item = &'a Arc<Item>>) -> Vec<usize> {
        items.into_iter().map(|i| i.index).collect()
    }

    #[test]
    fn test_flush_empty_list() {
        let list: IndexedRingAppendList<Item> = IndexedRingAppendList::new(2, 2);
        let batch = list.flush();
        assert!(batch.is_empty());
    }

    #[test]
    fn test_flush_returns_prefix_only_when_tail_is_empty() {
        let list = IndexedRingAppendList::new(2, 2);
        list.add(item(0));
        let batch = list.flush();
        assert_eq!(indices(batch.iter()), vec![0]);
        assert!(batch.fresh().is_empty());
    }

    #[test]
    fn test_prefix_and_suffix_across_two_flushes() {
        let list = IndexedRingAppendList::new(2, 2);
        for i in 0..10 {
            list.add(item(i));
        }

        let first = list.flush();
        assert_eq!(indices(first.prefix()), vec![0, 1]);
        assert!(first.carried().is_empty());
        assert_eq!(indices(first.fresh()), (2..10).collect::<Vec<_>>());

        let second = list.flush();
        assert_eq!(indices(second.prefix()), vec![0, 1]);
        assert_eq!(indices(second.carried()), vec![8, 9]);
        assert!(second.fresh().is_empty());

        // prefix survives any number of flushes
        let third = list.flush();
        assert_eq!(indices(third.prefix()), vec![0, 1]);
    }

    #[test]
    fn test_appends_after_flush_land_in_next_batch() {
        let list = IndexedRingAppendList::new(1, 1);
        list.add(item(0));
        list.add(item(1));
        list.add(item(2));
        let _ = list.flush();
        list.add(item(3));

        let batch = list.flush();
        assert_eq!(indices(batch.iter()), vec![0, 2, 3]);
        assert_eq!(indices(batch.fresh()), vec![3]);
    }

    #[test]
    fn test_snapshot_sees_prefix_and_open_segment() {
        let list = IndexedRingAppendList::new(2, 1);
        for i in 0..5 {
            list.add(item(i));
        }
        let _ = list.flush();
        list.add(item(5));
        assert_eq!(list.iter().map(|i| i.index).collect::<Vec<_>>(), vec![0, 1, 4, 5]);
    }

    #[test]
    fn test_update_reaches_prefix_and_open_segment() {
        let list = IndexedRingAppendList::new(1, 0);
        list.add(item(0));
        list.add(item(1));

        assert!(list.update_possibly_flushed_element(Item { index: 0, label: "done" }));
        assert!(list.update_possibly_flushed_element(Item { index: 1, label: "done" }));

        let labels: Vec<_> = list.iter().map(|i| i.label).collect();
        assert_eq!(labels, vec!["done", "done"]);
    }

    #[test]
    fn test_update_reaches_carried_suffix() {
        let list = IndexedRingAppendList::new(0, 1);
        list.add(item(0));
        list.add(item(1));
        let _ = list.flush();

        assert!(list.update_possibly_flushed_element(Item { index: 1, label: "done" }));
        let batch = list.flush();
        assert_eq!(batch.carried()[0].label, "done");
        assert!(batch.updated().is_empty());
    }

    #[test]
    fn test_update_of_element_flushed_and_not_carried_reaches_next_batch() {
        let list = IndexedRingAppendList::new(0, 1);
        list.add(item(0));
        list.add(item(1));
        list.add(item(2));
        let first = list.flush();
        assert_eq!(indices(first.fresh()), vec![0, 1, 2]);

        // only index 2 is carried
        assert!(!list.update_possibly_flushed_element(Item { index: 0, label: "done" }));
        list.add(item(3));

        let second = list.flush();
        assert_eq!(indices(second.fresh()), vec![3]);
        assert_eq!(second.updated().len(), 1);
        assert_eq!(*second.updated()[0], Item { index: 0, label: "done" });
        assert_eq!(indices(second.iter()), vec![2, 3, 0]);

        // delivered once
        assert!(list.flush().updated().is_empty());
    }

    #[test]
    fn test_snapshot_excludes_pending_updates() {
        let list = IndexedRingAppendList::new(0, 0);
        list.add(item(0));
        let _ = list.flush();
        assert!(!list.update_possibly_flushed_element(Item { index: 0, label: "done" }));
        assert!(list.snapshot().is_empty());
    }

    #[test]
    fn test_appends_span_several_chunks() {
        let list = IndexedRingAppendList::new(0, 2);
        for i in 0..(CHUNK_LEN * 3 + 5) {
            list.add(item(i));
        }
        assert!(list.update_possibly_flushed_element(Item { index: CHUNK_LEN * 2 + 1, label: "done" }));

        let batch = list.flush();
        assert_eq!(indices(batch.fresh()), (0..(CHUNK_LEN * 3 + 5)).collect::<Vec<_>>());
        assert_eq!(batch.fresh()[CHUNK_LEN * 2 + 1].label, "done");
        assert_eq!(indices(list.snapshot().iter()), vec![CHUNK_LEN * 3 + 3, CHUNK_LEN * 3 + 4]);
    }

    #[test]
    fn test_reader_snapshots_while_producer_appends() {
        const COUNT: usize = 50_000;

        let list = Arc::new(IndexedRingAppendList::new(4, 4));
        let producer = {
            let list = Arc::clone(&list);
            std::thread::spawn(move || {
                for i in 0..COUNT {
                    list.add(item(i));
                }
            })
        };

        let mut last_len = 0;
        while !producer.is_finished() {
            let snapshot = list.snapshot();
            assert!(snapshot.windows(2).all(|w| w[0].index < w[1].index));
            assert!(snapshot.len() >= last_len);
            last_len = snapshot.len();
        }
        producer.join().unwrap();
        assert_eq!(list.snapshot().len(), COUNT);
    }

    #[test]
    fn test_concurrent_add_and_flush_deliver_each_element_once() {
        const COUNT: usize = 20_000;
        const PREFIX: usize = 16;

        let list = Arc::new(IndexedRingAppendList::new(PREFIX, 4));
        let producer = {
            let list = Arc::clone(&list);
            std::thread::spawn(move || {
                for i in 0..COUNT {
                    list.add(item(i));
                }
            })
        };

        let mut seen = vec![0u32; COUNT];
        let mut record = |batch: &FlushedBatch<Item>| {
            for e in batch.fresh() {
                seen[e.index] += 1;
            }
        };
        while !producer.is_finished() {
            record(&list.flush());
        }
        producer.join().unwrap();
        let last = list.flush();
        record(&last);

        assert_eq!(indices(last.prefix()), (0..PREFIX).collect::<Vec<_>>());
        assert!(seen[..PREFIX].iter().all(|&n| n == 0));
        assert!(seen[PREFIX..].iter().all(|&n| n == 1));
    }

    #[test]
    fn test_concurrent_updates_reach_a_later_batch() {
        const COUNT: usize = 5_000;

        let list = Arc::new(IndexedRingAppendList::new(0, 2));
        let producer = {
            let list = Arc::clone(&list);
            std::thread::spawn(move || {
                for i in 0..COUNT {
                    list.add(item(i));
                    if i > 0 {
                        list.update_possibly_flushed_element(Item { index: i - 1, label: "done" });
                    }
                }
                list.update_possibly_flushed_element(Item { index: COUNT - 1, label: "done" });
            })
        };

        let mut done = vec![false; COUNT];
        let mut record = |batch: &FlushedBatch<Item>| {
            for e in batch.iter().filter(|e| e.label == "done") {
                done[e.index] = true;
            }
        };
        while !producer.is_finished() {
            record(&list.flush());
        }
        producer.join().unwrap();
        record(&list.flush());

        assert!(done.iter().all(|&d| d));
    }
}
