//! Anonymous shared memory and the in-place SPSC ring.
//!
//! A `SharedRegion` is a MAP_SHARED|MAP_ANONYMOUS mapping: plain memory in
//! one process, shared memory across a later `fork`. The channel and its
//! rings are laid out inside one, so the worker processes inherit them at
//! the same addresses.

use crate::constants::SPIN_USEC;
use crate::errors::{Result, RuntimeError};
use std::sync::atomic::{AtomicUsize, Ordering};

pub struct SharedRegion {
    base: *mut u8,
    len: usize,
    next: AtomicUsize,
}

// The region is plain memory; all concurrency control lives in the
// structures placed inside it.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    pub fn new(len: usize) -> Result<SharedRegion> {
        let p = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if p == libc::MAP_FAILED {
            return Err(RuntimeError::Mmap(std::io::Error::last_os_error()));
        }
        Ok(SharedRegion { base: p as *mut u8, len, next: AtomicUsize::new(0) })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Carve an aligned sub-range; panics when the region is exhausted
    /// (sizing is static, decided by the channel constructor).
    pub fn carve(&self, bytes: usize, align: usize) -> *mut u8 {
        loop {
            let cur = self.next.load(Ordering::Relaxed);
            let aligned = (cur + align - 1) & !(align - 1);
            let end = aligned + bytes;
            assert!(end <= self.len, "shared region exhausted");
            if self
                .next
                .compare_exchange(cur, end, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return unsafe { self.base.add(aligned) };
            }
        }
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.base as *mut libc::c_void, self.len) };
    }
}

/// Fixed-capacity SPSC ring of u64 words, laid out in place inside a
/// shared region. Head and tail each own a cache line.
#[repr(C)]
pub struct ShmRing {
    head: AtomicUsize,
    _pad1: [u8; 56],
    tail: AtomicUsize,
    _pad2: [u8; 56],
    capacity: usize,
    data: *mut u64,
}

unsafe impl Send for ShmRing {}
unsafe impl Sync for ShmRing {}

fn spin() {
    std::thread::sleep(std::time::Duration::from_micros(SPIN_USEC));
}

impl ShmRing {
    /// Construct a ring whose header and data both live in `region`.
    /// Returns a reference with the region's lifetime.
    pub fn new_in(region: &SharedRegion, capacity: usize) -> &ShmRing {
        assert!(capacity.is_power_of_two());
        let header = region.carve(std::mem::size_of::<ShmRing>(), 64) as *mut ShmRing;
        let data = region.carve(capacity * 8, 64) as *mut u64;
        unsafe {
            header.write(ShmRing {
                head: AtomicUsize::new(0),
                _pad1: [0; 56],
                tail: AtomicUsize::new(0),
                _pad2: [0; 56],
                capacity,
                data,
            });
            &*header
        }
    }

    pub fn len(&self) -> usize {
        self.tail.load(Ordering::Acquire) - self.head.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity
    }

    /// Push one word; spins while the ring is full.
    pub fn produce(&self, value: u64) {
        loop {
            let tail = self.tail.load(Ordering::Relaxed);
            let head = self.head.load(Ordering::Acquire);
            if tail - head < self.capacity {
                unsafe { self.data.add(tail & (self.capacity - 1)).write(value) };
                self.tail.store(tail + 1, Ordering::Release);
                return;
            }
            spin();
        }
    }

    /// Pop one word if available.
    pub fn try_consume(&self) -> Option<u64> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let v = unsafe { self.data.add(head & (self.capacity - 1)).read() };
        self.head.store(head + 1, Ordering::Release);
        Some(v)
    }

    /// Pop one word, spinning while empty; `keep_waiting` is consulted
    /// each round so a mode change can abort the wait.
    pub fn consume_while(&self, keep_waiting: impl Fn() -> bool) -> Option<u64> {
        loop {
            if let Some(v) = self.try_consume() {
                return Some(v);
            }
            if !keep_waiting() {
                return None;
            }
            spin();
        }
    }

    /// Discard everything currently visible.
    pub fn drain(&self) {
        while self.try_consume().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_ring_fifo_across_threads() {
        let region = Arc::new(SharedRegion::new(1 << 16).unwrap());
        let ring = ShmRing::new_in(&region, 256) as *const ShmRing as usize;
        let region2 = region.clone();
        let producer = std::thread::spawn(move || {
            let ring = unsafe { &*(ring as *const ShmRing) };
            let _hold = region2;
            for i in 0..10_000u64 {
                ring.produce(i);
            }
        });
        let ring = unsafe { &*(ring as *const ShmRing) };
        for i in 0..10_000u64 {
            assert_eq!(ring.consume_while(|| true), Some(i));
        }
        producer.join().unwrap();
    }

    #[test]
    fn test_consume_abort_on_predicate() {
        let region = SharedRegion::new(1 << 12).unwrap();
        let ring = ShmRing::new_in(&region, 8);
        assert_eq!(ring.consume_while(|| false), None);
    }

    #[test]
    fn test_drain() {
        let region = SharedRegion::new(1 << 12).unwrap();
        let ring = ShmRing::new_in(&region, 8);
        ring.produce(1);
        ring.produce(2);
        ring.drain();
        assert!(ring.is_empty());
    }

    #[test]
    fn test_carve_alignment() {
        let region = SharedRegion::new(4096).unwrap();
        let a = region.carve(10, 64) as usize;
        let b = region.carve(10, 64) as usize;
        assert_eq!(a % 64, 0);
        assert_eq!(b % 64, 0);
        assert!(b >= a + 10);
    }
}
