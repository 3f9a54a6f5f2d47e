//! The remedy record: what discharges an edge, and at what cost.
//!
//! Costs are scalars used only for ordering; `compare` provides the total
//! order that breaks cost ties deterministically.

use crate::features::classify::ReduxKind;
use crate::features::context::CtxId;
use crate::shared::models::{InstrId, ValueRef};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

pub const DEFAULT_TXIO_REMED_COST: u64 = 20;
pub const DEFAULT_COMM_LIBS_REMED_COST: u64 = 15;
pub const DEFAULT_PTR_RESIDUE_REMED_COST: u64 = 60;
/// Each inserted residue check: one and, one compare, one branch.
pub const RESIDUE_CHECK_COST: u64 = 2;
pub const DEFAULT_LOCALITY_REMED_COST: u64 = 50;
pub const PRIVATE_ACCESS_COST: u64 = 100;
pub const LOCAL_ACCESS_COST: u64 = 1;
pub const KILLPRIV_ACCESS_COST: u64 = 5;
pub const SHAREPRIV_ACCESS_COST: u64 = 35;
pub const DEFAULT_CTRL_SPEC_REMED_COST: u64 = 40;
/// Misspeculation was observed during profiling: this remedy loses every
/// cost comparison.
pub const EXPENSIVE_CTRL_REMED_COST: u64 = 1000;
/// Sentinel cost identifying reduction remedies; they demote the edge to
/// intra-iteration instead of erasing it.
pub const DEFAULT_REDUX_REMED_COST: u64 = 2;

/// How a locality remedy discharges its edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LocalityKind {
    Local,
    Private,
    Redux,
    KillPrivate,
    SharePrivate,
    /// Endpoints sit in different heap families.
    Separated,
    /// Same family, provably different sub-heaps.
    Subheaps,
    /// Discharged by the separation-aware alias stack alone.
    LocalityAa,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Remedy {
    TxIo {
        print_instr: InstrId,
    },
    CommutativeLibs {
        function_name: String,
    },
    PtrResidue {
        ptr1: ValueRef,
        ctx1: CtxId,
        ptr2: ValueRef,
        ctx2: CtxId,
        cost: u64,
    },
    Locality {
        kind: LocalityKind,
        ptr: Option<ValueRef>,
        ptr2: Option<ValueRef>,
        private_instr: Option<InstrId>,
        redux_store: Option<InstrId>,
        cost: u64,
    },
    ShortLived {
        ptr: ValueRef,
    },
    ControlSpec {
        branch: InstrId,
        expensive: bool,
    },
    Redux {
        kind: ReduxKind,
        store: Option<InstrId>,
    },
}

impl Remedy {
    pub fn cost(&self) -> u64 {
        match self {
            Remedy::TxIo { .. } => DEFAULT_TXIO_REMED_COST,
            Remedy::CommutativeLibs { .. } => DEFAULT_COMM_LIBS_REMED_COST,
            Remedy::PtrResidue { cost, .. } => *cost,
            Remedy::Locality { cost, .. } => *cost,
            Remedy::ShortLived { .. } => DEFAULT_LOCALITY_REMED_COST + LOCAL_ACCESS_COST,
            Remedy::ControlSpec { expensive, .. } => {
                if *expensive {
                    EXPENSIVE_CTRL_REMED_COST
                } else {
                    DEFAULT_CTRL_SPEC_REMED_COST
                }
            }
            Remedy::Redux { .. } => DEFAULT_REDUX_REMED_COST,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Remedy::TxIo { .. } => "txio-remedy",
            Remedy::CommutativeLibs { .. } => "comm-libs-remedy",
            Remedy::PtrResidue { .. } => "ptr-residue-remedy",
            Remedy::Locality { .. } => "locality-remedy",
            Remedy::ShortLived { .. } => "short-lived-remedy",
            Remedy::ControlSpec { .. } => "ctrl-spec-remedy",
            Remedy::Redux { .. } => "redux-remedy",
        }
    }

    pub fn is_redux(&self) -> bool {
        matches!(self, Remedy::Redux { .. })
    }

    fn rank(&self) -> u8 {
        match self {
            Remedy::TxIo { .. } => 0,
            Remedy::CommutativeLibs { .. } => 1,
            Remedy::PtrResidue { .. } => 2,
            Remedy::Locality { .. } => 3,
            Remedy::ShortLived { .. } => 4,
            Remedy::ControlSpec { .. } => 5,
            Remedy::Redux { .. } => 6,
        }
    }

    /// Total order over remedies, independent of insertion order. Used to
    /// break cost ties deterministically.
    pub fn compare(&self, other: &Remedy) -> Ordering {
        match self.rank().cmp(&other.rank()) {
            Ordering::Equal => {}
            o => return o,
        }
        match (self, other) {
            (Remedy::TxIo { print_instr: a }, Remedy::TxIo { print_instr: b }) => a.cmp(b),
            (
                Remedy::CommutativeLibs { function_name: a },
                Remedy::CommutativeLibs { function_name: b },
            ) => a.cmp(b),
            (
                Remedy::PtrResidue { ptr1: a1, ctx1: c1, ptr2: a2, ctx2: c2, .. },
                Remedy::PtrResidue { ptr1: b1, ctx1: d1, ptr2: b2, ctx2: d2, .. },
            ) => (a1, c1, a2, c2).cmp(&(b1, d1, b2, d2)),
            (
                Remedy::Locality {
                    kind: ka,
                    ptr: pa,
                    ptr2: qa,
                    private_instr: ia,
                    redux_store: ra,
                    ..
                },
                Remedy::Locality {
                    kind: kb,
                    ptr: pb,
                    ptr2: qb,
                    private_instr: ib,
                    redux_store: rb,
                    ..
                },
            ) => {
                let key = |k: &LocalityKind| *k as u8;
                (key(ka), ia, ra, pa, qa).cmp(&(key(kb), ib, rb, pb, qb))
            }
            (Remedy::ShortLived { ptr: a }, Remedy::ShortLived { ptr: b }) => a.cmp(b),
            (
                Remedy::ControlSpec { branch: a, expensive: ea },
                Remedy::ControlSpec { branch: b, expensive: eb },
            ) => (a, ea).cmp(&(b, eb)),
            (Remedy::Redux { kind: ka, store: sa }, Remedy::Redux { kind: kb, store: sb }) => {
                (*ka as u8, sa).cmp(&(*kb as u8, sb))
            }
            _ => unreachable!("rank() already separated variants"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cost_table() {
        assert_eq!(Remedy::TxIo { print_instr: InstrId(0) }.cost(), 20);
        assert_eq!(Remedy::CommutativeLibs { function_name: "rand".into() }.cost(), 15);
        assert_eq!(
            Remedy::ShortLived { ptr: ValueRef::Instr(InstrId(0)) }.cost(),
            51
        );
        assert_eq!(
            Remedy::ControlSpec { branch: InstrId(0), expensive: true }.cost(),
            EXPENSIVE_CTRL_REMED_COST
        );
        assert_eq!(Remedy::Redux { kind: ReduxKind::AddI64, store: None }.cost(), 2);
    }

    #[test]
    fn test_compare_total_order() {
        let a = Remedy::TxIo { print_instr: InstrId(1) };
        let b = Remedy::TxIo { print_instr: InstrId(2) };
        let c = Remedy::CommutativeLibs { function_name: "malloc".into() };
        assert_eq!(a.compare(&b), Ordering::Less);
        assert_eq!(b.compare(&a), Ordering::Greater);
        assert_eq!(a.compare(&a), Ordering::Equal);
        assert_eq!(a.compare(&c), Ordering::Less);
    }
}
