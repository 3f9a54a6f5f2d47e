//! Control speculation.
//!
//! Control dependences sourced by heavily biased branches can be removed
//! by speculating the branch direction. A branch that actually left the
//! loop during profiling still gets a remedy, but an expensive one: using
//! it guarantees at least one misspeculation per invocation.

use super::remediator::{RemedResp, Remediator};
use super::remedy::Remedy;
use crate::shared::models::{InstrId, LoopRef, ModuleIr};
use rustc_hash::FxHashSet;

/// Branch-bias evidence from the edge-count profile.
#[derive(Debug, Default, Clone)]
pub struct ControlSpecInfo {
    /// Branches whose hot direction dominates.
    pub biased_branches: FxHashSet<InstrId>,
    /// Biased branches that were nonetheless observed taking the cold
    /// direction at least once.
    pub misspeculated: FxHashSet<InstrId>,
}

impl ControlSpecInfo {
    pub fn is_biased(&self, branch: InstrId) -> bool {
        self.biased_branches.contains(&branch)
    }

    pub fn observed_misspec(&self, branch: InstrId) -> bool {
        self.misspeculated.contains(&branch)
    }
}

pub struct ControlSpecRemediator {
    info: ControlSpecInfo,
    pub num_removed: u64,
}

impl ControlSpecRemediator {
    pub fn new(info: ControlSpecInfo) -> Self {
        ControlSpecRemediator { info, num_removed: 0 }
    }
}

impl Remediator for ControlSpecRemediator {
    fn name(&self) -> &'static str {
        "ctrl-spec-remediator"
    }

    fn ctrldep(
        &mut self,
        ir: &ModuleIr,
        src: InstrId,
        _dst: InstrId,
        _loop_carried: bool,
        _lp: &LoopRef,
    ) -> RemedResp {
        if !ir.instr(src).is_terminator() {
            return RemedResp::dep();
        }
        if !self.info.is_biased(src) {
            return RemedResp::dep();
        }
        self.num_removed += 1;
        RemedResp::no_dep(Remedy::ControlSpec {
            branch: src,
            expensive: self.info.observed_misspec(src),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::remedies::remediator::DepResult;
    use crate::features::remedies::remedy::EXPENSIVE_CTRL_REMED_COST;
    use crate::shared::models::{Opcode, ValueRef};

    fn fixture() -> (ModuleIr, LoopRef, InstrId, InstrId) {
        let mut ir = ModuleIr::new();
        let f = ir.add_function("main", 0);
        let b = ir.add_block(f, "body");
        let e = ir.add_block(f, "exit");
        let st = ir.append_instr(
            b,
            "st",
            Opcode::Store { ptr: ValueRef::ConstInt(0), value: ValueRef::ConstInt(0), size: 8 },
        );
        let br = ir.append_instr(
            b,
            "br",
            Opcode::Br { cond: Some(ValueRef::ConstInt(1)), targets: vec![b, e] },
        );
        let lp = LoopRef {
            function: f,
            header: b,
            preheader: None,
            blocks: [b].into_iter().collect(),
            depth: 1,
            exit_edges: vec![(b, 1)],
        };
        (ir, lp, br, st)
    }

    #[test]
    fn test_biased_branch_removed_cheap() {
        let (ir, lp, br, st) = fixture();
        let mut info = ControlSpecInfo::default();
        info.biased_branches.insert(br);
        let mut r = ControlSpecRemediator::new(info);
        let resp = r.ctrldep(&ir, br, st, true, &lp);
        assert_eq!(resp.result, DepResult::NoDep);
        assert!(resp.remedy.unwrap().cost() < EXPENSIVE_CTRL_REMED_COST);
    }

    #[test]
    fn test_observed_misspec_is_expensive() {
        let (ir, lp, br, st) = fixture();
        let mut info = ControlSpecInfo::default();
        info.biased_branches.insert(br);
        info.misspeculated.insert(br);
        let mut r = ControlSpecRemediator::new(info);
        let resp = r.ctrldep(&ir, br, st, true, &lp);
        assert_eq!(resp.remedy.unwrap().cost(), EXPENSIVE_CTRL_REMED_COST);
    }

    #[test]
    fn test_unbiased_branch_kept() {
        let (ir, lp, br, st) = fixture();
        let mut r = ControlSpecRemediator::new(ControlSpecInfo::default());
        assert_eq!(r.ctrldep(&ir, br, st, true, &lp).result, DepResult::Dep);
    }
}
