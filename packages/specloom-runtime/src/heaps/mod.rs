//! Versioned heaps over named shared memory.

pub mod heap;

pub use heap::{Heap, MapMode, MappedHeap, PageMethod};
