//! Single-producer single-consumer software queues.
//!
//! Two variants, both moving 8-byte words:
//! * chunked: producer batches words into chunk buffers and hands whole
//!   chunks through a single shared pathway slot, so producer and consumer
//!   touch common cache lines only once per chunk;
//! * buffered: two fixed buffers flip between the sides with
//!   ready_to_read / ready_to_write flags.
//!
//! FIFO holds within one queue; nothing orders distinct queues (the
//! committer re-imposes cross-queue order via time vectors).

pub mod buffered;
pub mod chunked;

pub use buffered::{BufferedConsumer, BufferedProducer, BufferedQueue};
pub use chunked::{chunked_queue, ChunkedConsumer, ChunkedProducer};
