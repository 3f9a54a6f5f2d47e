//! Context and allocation-unit value types.

use crate::shared::models::{BlockId, FcnId, GlobalId, InstrId};
use serde::{Deserialize, Serialize};

/// Canonical context handle (index into the fold manager's arena)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CtxId(pub u32);

/// Canonical allocation-unit handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AuId(pub u32);

/// One step of a context chain.
///
/// Loops record their function alongside the header so a step can be
/// printed and compared without chasing the parent chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CtxStep {
    Top,
    Fcn { fcn: FcnId },
    Loop { fcn: FcnId, header: BlockId, depth: u32 },
}

impl CtxStep {
    /// Compare a single element of context; does not recur to parents.
    pub fn step_equal(&self, other: &CtxStep) -> bool {
        match (self, other) {
            (CtxStep::Top, CtxStep::Top) => true,
            (CtxStep::Fcn { fcn: a }, CtxStep::Fcn { fcn: b }) => a == b,
            (
                CtxStep::Loop { header: ha, depth: da, .. },
                CtxStep::Loop { header: hb, depth: db, .. },
            ) => ha == hb && da == db,
            _ => false,
        }
    }

    pub fn fcn(&self) -> Option<FcnId> {
        match self {
            CtxStep::Top => None,
            CtxStep::Fcn { fcn } => Some(*fcn),
            CtxStep::Loop { fcn, .. } => Some(*fcn),
        }
    }
}

/// Allocation-unit kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AuKind {
    Unknown,
    Undefined,
    Io,
    Null,
    Constant(GlobalId),
    Global(GlobalId),
    /// Alloca site
    Stack(InstrId),
    /// Dynamic allocation site
    Heap(InstrId),
}

impl AuKind {
    pub fn is_dynamic(&self) -> bool {
        matches!(self, AuKind::Stack(_) | AuKind::Heap(_))
    }

    pub fn is_static(&self) -> bool {
        matches!(self, AuKind::Constant(_) | AuKind::Global(_))
    }

    /// The numeric tag used for repeatable ordering.
    pub fn tag(&self) -> u8 {
        match self {
            AuKind::Unknown => 0,
            AuKind::Undefined => 1,
            AuKind::Io => 2,
            AuKind::Null => 3,
            AuKind::Constant(_) => 4,
            AuKind::Global(_) => 5,
            AuKind::Stack(_) => 6,
            AuKind::Heap(_) => 7,
        }
    }
}

/// A pointer sample: which AU, at what offset, how often.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ptr {
    pub au: AuId,
    pub offset: u64,
    pub frequency: u64,
}

impl Ptr {
    pub fn new(au: AuId, offset: u64, frequency: u64) -> Self {
        Self { au, offset, frequency }
    }
}

/// An integer sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Int {
    pub value: u64,
    pub frequency: u64,
}

impl Int {
    pub fn new(value: u64, frequency: u64) -> Self {
        Self { value, frequency }
    }
}
