/*
 * Specloom runtime - speculative execution support
 *
 * - heaps/     : versioned heaps over named shared memory
 * - queues/    : single-producer single-consumer software queues
 * - txio/      : suspended I/O and progressive commit
 * - executive/ : process-per-worker speculation, channels, recovery,
 *                plus the non-speculative thread-based twin
 *
 * One process per worker plus one committer. Workers publish memory
 * effects only through the commit queue; the committer serializes side
 * effects in time-vector order.
 */

#![allow(clippy::too_many_arguments)]
#![allow(clippy::new_without_default)]

#[cfg(all(feature = "spec-runtime", feature = "nospec-runtime"))]
compile_error!("features `spec-runtime` and `nospec-runtime` are mutually exclusive");

pub mod constants;
pub mod errors;
pub mod executive;
pub mod heaps;
pub mod queues;
pub mod txio;

pub use errors::{Result, RuntimeError};
