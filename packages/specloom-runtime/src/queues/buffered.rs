//! The double-buffered SPSC queue.
//!
//! Two fixed buffers, A and B. The producer fills one while the consumer
//! drains the other; when the consumer runs dry it flips its buffer's
//! ready_to_write flag and spins until the opposite buffer is marked
//! ready_to_read.

use crate::constants::SPIN_USEC;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

struct HalfQueue {
    ready_to_read: AtomicBool,
    ready_to_write: AtomicBool,
    size: AtomicUsize,
    data: parking_lot::Mutex<Vec<u64>>,
}

impl HalfQueue {
    fn new(capacity: usize) -> Self {
        HalfQueue {
            ready_to_read: AtomicBool::new(false),
            ready_to_write: AtomicBool::new(true),
            size: AtomicUsize::new(0),
            data: parking_lot::Mutex::new(Vec::with_capacity(capacity)),
        }
    }
}

struct Shared {
    halves: [HalfQueue; 2],
    capacity: usize,
}

/// Producer + consumer handles over the same pair of buffers.
pub struct BufferedQueue;

pub struct BufferedProducer {
    shared: Arc<Shared>,
    current: usize,
    staged: Vec<u64>,
}

pub struct BufferedConsumer {
    shared: Arc<Shared>,
    current: usize,
    local: Vec<u64>,
    offset: usize,
}

fn spin() {
    std::thread::sleep(std::time::Duration::from_micros(SPIN_USEC));
}

impl BufferedQueue {
    pub fn create(capacity: usize) -> (BufferedProducer, BufferedConsumer) {
        let shared = Arc::new(Shared {
            halves: [HalfQueue::new(capacity), HalfQueue::new(capacity)],
            capacity,
        });
        (
            BufferedProducer { shared: shared.clone(), current: 0, staged: Vec::new() },
            BufferedConsumer { shared, current: 0, local: Vec::new(), offset: 0 },
        )
    }
}

impl BufferedProducer {
    pub fn produce(&mut self, value: u64) {
        self.staged.push(value);
        if self.staged.len() == self.shared.capacity {
            self.flush();
        }
    }

    /// Hand the staged words to the current buffer, spinning until the
    /// consumer releases it, then switch to the other buffer.
    pub fn flush(&mut self) {
        if self.staged.is_empty() {
            return;
        }
        let half = &self.shared.halves[self.current];
        while !half.ready_to_write.load(Ordering::Acquire) {
            spin();
        }
        {
            let mut data = half.data.lock();
            data.clear();
            data.append(&mut self.staged);
            half.size.store(data.len(), Ordering::Relaxed);
        }
        half.ready_to_write.store(false, Ordering::Relaxed);
        half.ready_to_read.store(true, Ordering::Release);
        self.current ^= 1;
    }
}

impl BufferedConsumer {
    /// Pop one word, flipping buffers when the local one drains.
    pub fn consume(&mut self) -> u64 {
        if self.offset == self.local.len() {
            let half = &self.shared.halves[self.current];
            while !half.ready_to_read.load(Ordering::Acquire) {
                spin();
            }
            {
                let mut data = half.data.lock();
                self.local.clear();
                self.local.append(&mut data);
            }
            half.ready_to_read.store(false, Ordering::Relaxed);
            half.ready_to_write.store(true, Ordering::Release);
            self.current ^= 1;
            self.offset = 0;
        }
        let v = self.local[self.offset];
        self.offset += 1;
        v
    }

    pub fn try_consume(&mut self) -> Option<u64> {
        if self.offset == self.local.len() {
            let half = &self.shared.halves[self.current];
            if !half.ready_to_read.load(Ordering::Acquire) {
                return None;
            }
            {
                let mut data = half.data.lock();
                self.local.clear();
                self.local.append(&mut data);
            }
            half.ready_to_read.store(false, Ordering::Relaxed);
            half.ready_to_write.store(true, Ordering::Release);
            self.current ^= 1;
            self.offset = 0;
        }
        if self.offset < self.local.len() {
            let v = self.local[self.offset];
            self.offset += 1;
            Some(v)
        } else {
            None
        }
    }
}
