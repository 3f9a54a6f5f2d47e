//! Suspended I/O with progressive commit.
//!
//! Side effects issue as time-stamped events into a tree of transactions;
//! the committer replays them in time-vector order. A subtree may commit
//! as soon as it is complete and aligned with its parent's watermark; it
//! need not wait for later siblings.

pub mod commit;
pub mod event;
pub mod prio;
pub mod tv;

pub use commit::{CommitEngine, Committer, TxId};
pub use event::{run_sop, ResultSlot, SusOp};
pub use prio::PrioQueue;
pub use tv::TimeVector;
