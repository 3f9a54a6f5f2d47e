//! Reductions.
//!
//! A recognized reduction chain (sum, min, max over an associative
//! operator) keeps its edge in the graph but demoted to intra-iteration:
//! the cycle must stay within one stage, yet it no longer forbids a
//! parallel stage, since per-worker partial results combine at commit.

use super::remediator::{RemedResp, Remediator};
use super::remedy::Remedy;
use crate::features::classify::ReduxKind;
use crate::features::pdg::DepDir;
use crate::shared::models::{InstrId, LoopRef, ModuleIr};
use rustc_hash::FxHashMap;

pub struct ReduxRemediator {
    /// Instructions participating in a recognized reduction, with the
    /// reduction operator of their chain.
    updates: FxHashMap<InstrId, ReduxKind>,
    pub num_removed: u64,
}

impl ReduxRemediator {
    pub fn new(updates: FxHashMap<InstrId, ReduxKind>) -> Self {
        ReduxRemediator { updates, num_removed: 0 }
    }

    fn decide(&mut self, ir: &ModuleIr, src: InstrId, dst: InstrId, loop_carried: bool) -> RemedResp {
        if !loop_carried {
            return RemedResp::dep();
        }
        let (Some(&k1), Some(&k2)) = (self.updates.get(&src), self.updates.get(&dst)) else {
            return RemedResp::dep();
        };
        if k1 != k2 {
            return RemedResp::dep();
        }
        self.num_removed += 1;
        let store = [src, dst].into_iter().find(|&i| ir.instr(i).is_store());
        RemedResp::no_dep(Remedy::Redux { kind: k1, store })
    }
}

impl Remediator for ReduxRemediator {
    fn name(&self) -> &'static str {
        "redux-remediator"
    }

    fn memdep(
        &mut self,
        ir: &ModuleIr,
        src: InstrId,
        dst: InstrId,
        loop_carried: bool,
        _dir: DepDir,
        _lp: &LoopRef,
    ) -> RemedResp {
        self.decide(ir, src, dst, loop_carried)
    }

    fn regdep(
        &mut self,
        ir: &ModuleIr,
        src: InstrId,
        dst: InstrId,
        loop_carried: bool,
        _lp: &LoopRef,
    ) -> RemedResp {
        self.decide(ir, src, dst, loop_carried)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::remedies::remediator::DepResult;
    use crate::shared::models::{BinOp, Opcode, ValueRef};

    #[test]
    fn test_reduction_chain_discharged() {
        let mut ir = ModuleIr::new();
        let f = ir.add_function("main", 0);
        let b = ir.add_block(f, "body");
        let phi = ir.append_instr(b, "sum.phi", Opcode::Phi { incoming: vec![] });
        let add = ir.append_instr(
            b,
            "sum.next",
            Opcode::Binary { op: BinOp::Add, lhs: ValueRef::Instr(phi), rhs: ValueRef::ConstInt(1) },
        );
        let lp = LoopRef {
            function: f,
            header: b,
            preheader: None,
            blocks: [b].into_iter().collect(),
            depth: 1,
            exit_edges: vec![],
        };
        let mut updates = FxHashMap::default();
        updates.insert(phi, ReduxKind::AddI64);
        updates.insert(add, ReduxKind::AddI64);
        let mut r = ReduxRemediator::new(updates);

        let resp = r.regdep(&ir, add, phi, true, &lp);
        assert_eq!(resp.result, DepResult::NoDep);
        assert!(resp.remedy.unwrap().is_redux());

        // Edges not in the chain stay.
        let other = ir.append_instr(b, "x", Opcode::Alloca { size: 8 });
        assert_eq!(r.regdep(&ir, add, other, true, &lp).result, DepResult::Dep);
    }
}
