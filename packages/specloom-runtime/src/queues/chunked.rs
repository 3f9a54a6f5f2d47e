//! The chunked SPSC queue.
//!
//! The only shared state is one cache-line-sized "pathway" holding a chunk
//! pointer. The producer fills a private chunk and publishes it when full
//! (or on flush); the consumer drains a private chunk and grabs the next
//! from the pathway. Contention is one cache-line bounce per CHUNK_SIZE
//! words.

use crate::constants::{CHUNK_SIZE, QPREFETCH, SPIN_USEC};
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

/// Touch the cache line QPREFETCH words ahead of the read cursor so the
/// consumer streams through a freshly-arrived chunk without demand misses.
#[inline]
fn prefetch_ahead(chunk: &Chunk, offset: usize) {
    let ahead = offset + QPREFETCH.min(CHUNK_SIZE - 1);
    if ahead < chunk.fill {
        unsafe { std::ptr::read_volatile(&chunk.elts[ahead]) };
    }
}

pub struct Chunk {
    fill: usize,
    elts: [u64; CHUNK_SIZE],
}

impl Chunk {
    fn new() -> Box<Chunk> {
        Box::new(Chunk { fill: 0, elts: [0; CHUNK_SIZE] })
    }
}

/// The single producer/consumer-shared cache line.
pub struct Pathway {
    chunk: AtomicPtr<Chunk>,
}

fn spin() {
    std::thread::sleep(std::time::Duration::from_micros(SPIN_USEC / 2));
}

pub struct ChunkedProducer {
    chunk: Option<Box<Chunk>>,
    pathway: Arc<Pathway>,
    pub has_flushed_since_last_check: bool,
}

pub struct ChunkedConsumer {
    chunk: Option<Box<Chunk>>,
    offset: usize,
    pathway: Arc<Pathway>,
}

/// Create a connected producer/consumer pair.
pub fn chunked_queue() -> (ChunkedProducer, ChunkedConsumer) {
    let pathway = Arc::new(Pathway { chunk: AtomicPtr::new(std::ptr::null_mut()) });
    (
        ChunkedProducer {
            chunk: Some(Chunk::new()),
            pathway: pathway.clone(),
            has_flushed_since_last_check: false,
        },
        ChunkedConsumer { chunk: None, offset: 0, pathway },
    )
}

impl ChunkedProducer {
    pub fn produce(&mut self, value: u64) {
        let chunk = self.chunk.as_mut().expect("producer chunk");
        chunk.elts[chunk.fill] = value;
        chunk.fill += 1;
        if chunk.fill == CHUNK_SIZE {
            self.flush();
        }
    }

    /// Publish the current chunk, spinning while the pathway is occupied.
    pub fn flush(&mut self) {
        if self.chunk.as_ref().map(|c| c.fill).unwrap_or(0) == 0 {
            return;
        }
        self.has_flushed_since_last_check = true;

        let outgoing = Box::into_raw(self.chunk.take().expect("producer chunk"));
        loop {
            match self.pathway.chunk.compare_exchange(
                std::ptr::null_mut(),
                outgoing,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(_) => spin(),
            }
        }
        self.chunk = Some(Chunk::new());
    }
}

impl Drop for ChunkedProducer {
    fn drop(&mut self) {
        // Unpublished words are lost by design: the committer drains
        // queues before tearing a worker down.
        self.chunk.take();
    }
}

impl ChunkedConsumer {
    /// Pop one word, blocking until the producer publishes a chunk.
    pub fn consume(&mut self) -> u64 {
        let need_refill = match &self.chunk {
            None => true,
            Some(c) => self.offset == c.fill,
        };
        if need_refill {
            self.chunk.take();
            // Spin until the pathway carries something.
            loop {
                let p = self.pathway.chunk.swap(std::ptr::null_mut(), Ordering::Acquire);
                if !p.is_null() {
                    self.chunk = Some(unsafe { Box::from_raw(p) });
                    self.offset = 0;
                    break;
                }
                spin();
            }
        }
        let chunk = self.chunk.as_ref().expect("consumer chunk");
        prefetch_ahead(chunk, self.offset);
        let v = chunk.elts[self.offset];
        self.offset += 1;
        v
    }

    /// Pop one word if anything is available right now.
    pub fn try_consume(&mut self) -> Option<u64> {
        let have_local = match &self.chunk {
            None => false,
            Some(c) => self.offset < c.fill,
        };
        if !have_local {
            let p = self.pathway.chunk.swap(std::ptr::null_mut(), Ordering::Acquire);
            if p.is_null() {
                return None;
            }
            self.chunk = Some(unsafe { Box::from_raw(p) });
            self.offset = 0;
        }
        let chunk = self.chunk.as_ref()?;
        if self.offset < chunk.fill {
            let v = chunk.elts[self.offset];
            self.offset += 1;
            Some(v)
        } else {
            None
        }
    }

    /// Discard everything currently visible.
    pub fn drain(&mut self) {
        self.chunk.take();
        self.offset = 0;
        let p = self.pathway.chunk.swap(std::ptr::null_mut(), Ordering::Acquire);
        if !p.is_null() {
            drop(unsafe { Box::from_raw(p) });
        }
    }
}

impl Drop for ChunkedConsumer {
    fn drop(&mut self) {
        self.drain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_within_queue() {
        let (mut prod, mut cons) = chunked_queue();
        let n = (CHUNK_SIZE * 3 + 7) as u64;
        let handle = std::thread::spawn(move || {
            for i in 0..n {
                prod.produce(i);
            }
            prod.flush();
        });
        for i in 0..n {
            assert_eq!(cons.consume(), i);
        }
        handle.join().unwrap();
    }

    #[test]
    fn test_flush_publishes_partial_chunk() {
        let (mut prod, mut cons) = chunked_queue();
        prod.produce(7);
        assert_eq!(cons.try_consume(), None, "unflushed words stay private");
        prod.flush();
        assert_eq!(cons.try_consume(), Some(7));
        assert_eq!(cons.try_consume(), None);
    }

    #[test]
    fn test_drain_discards() {
        let (mut prod, mut cons) = chunked_queue();
        for i in 0..10 {
            prod.produce(i);
        }
        prod.flush();
        cons.drain();
        assert_eq!(cons.try_consume(), None);
    }

    #[test]
    fn test_empty_flush_is_noop() {
        let (mut prod, _cons) = chunked_queue();
        prod.flush();
        assert!(!prod.has_flushed_since_last_check);
    }
}
