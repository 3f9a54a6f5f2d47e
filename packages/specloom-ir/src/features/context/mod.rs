//! Canonical contexts and allocation units.
//!
//! A `Ctx` is a path from a program point outward through enclosing loops
//! and functions; an `AU` is a handle to one conceptually distinct storage
//! object. Both are hash-consed into arenas so equality is id comparison
//! and cross-references are 32-bit indices rather than owning pointers.

pub mod domain;
pub mod fold;

pub use domain::{AuId, AuKind, CtxId, CtxStep, Int, Ptr};
pub use fold::{AuToAuMap, CtxToCtxMap, FoldManager, ValueMap};
