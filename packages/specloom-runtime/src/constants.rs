//! Layout and sizing constants shared by the heaps, queues and executive.
//!
//! The sub-heap geometry must agree with what the planner assumed when it
//! assigned sub-heap ids.

/// Sub-heaps per heap family.
pub const NUM_SUBHEAPS: usize = 8;

/// log2 of the virtual-address stride between sub-heaps (16 MiB).
pub const SUBHEAP_BITS: u64 = 24;

/// Mask extracting the sub-heap index from a pointer within a heap.
pub const SUBHEAP_MASK: u64 = ((NUM_SUBHEAPS as u64 - 1) << SUBHEAP_BITS) as u64;

/// Total virtual span of one heap.
pub const HEAP_SIZE: u64 = (NUM_SUBHEAPS as u64) << SUBHEAP_BITS;

/// Allocation granule inside a sub-heap.
pub const ALIGNMENT: u64 = 16;

pub const MAX_WORKERS: u32 = 32;

/// Cache line size assumed by the queue layouts.
pub const CACHELINE_SIZE: usize = 64;

/// Words per chunk in the chunked queue: sixteen cache lines minus the
/// fill counter.
pub const CHUNK_SIZE: usize = (16 * CACHELINE_SIZE - std::mem::size_of::<usize>()) / 8;

/// How far ahead the consumer prefetches in the streaming queue.
pub const QPREFETCH: usize = 1 << 7;

/// Capacity (in words) of a channel ring.
pub const QSIZE: usize = 1 << 15;

/// Spin-wait quantum, microseconds.
pub const SPIN_USEC: u64 = 10;

pub const ROUND_UP: fn(u64, u64) -> u64 = |x, align| (x + align - 1) & !(align - 1);
