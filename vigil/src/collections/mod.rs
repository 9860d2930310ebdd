//! Concurrency primitives shared by the trace and hotspot layers.

pub mod ring_list;

pub use ring_list::{FlushedBatch, IndexedElement, IndexedRingAppendList};
