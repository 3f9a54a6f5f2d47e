//! Shared models used by every feature.
//!
//! The module IR here is the *queryable form* of the host toolkit's IR: just
//! enough structure (functions, blocks, instructions, globals, loops) for
//! dependence analysis and for the transform to rewrite call sites and
//! control edges. It is not a compiler IR in its own right.

pub mod ir;
pub mod loops;

pub use ir::{
    BinOp, BlockId, BlockIr, FcnId, FunctionIr, GlobalId, GlobalVar, Instr, InstrId, ModuleIr,
    Opcode, ValueRef,
};
pub use loops::LoopRef;
