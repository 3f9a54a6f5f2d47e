//! The speculation executive.
//!
//! One process per worker plus one committer. The channel (modes, rings,
//! iteration bookkeeping) lives in anonymous shared memory created before
//! the workers fork, so every participant sees the same words. Workers are
//! supervised loops whose iteration boundaries are the only points where
//! misspeculation is observed and recovery restarts execution; there is no
//! non-local unwinding.

pub mod channel;
pub mod ffi;
pub mod shared;
pub mod state;
pub mod worker;

#[cfg(any(feature = "nospec-runtime", test))]
pub mod nospec;

pub use channel::{Channel, VerMode, VerTid};
pub use shared::{SharedRegion, ShmRing};
pub use worker::{IterControl, WorkerOutcome, WorkerPool};
