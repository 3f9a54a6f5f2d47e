//! Short-lived objects.
//!
//! Objects the profiler saw allocated and freed within one iteration of
//! the target loop are iteration-local; cross-iteration dependences
//! through them are impossible. Usable before a full heap assignment
//! exists, from the profile's local-object set alone.

use super::ptr_residue::adjust_pointer;
use super::remediator::{RemedResp, Remediator};
use super::remedy::Remedy;
use crate::features::context::{CtxId, FoldManager};
use crate::features::pdg::DepDir;
use crate::features::profile::ProfileInfo;
use crate::shared::models::{InstrId, LoopRef, ModuleIr, ValueRef};

pub struct ShortLivedRemediator<'a> {
    fm: &'a FoldManager,
    profile: &'a ProfileInfo,
    ctx: CtxId,
    pub num_privatized: u64,
}

impl<'a> ShortLivedRemediator<'a> {
    pub fn new(fm: &'a FoldManager, profile: &'a ProfileInfo, ctx: CtxId) -> Self {
        ShortLivedRemediator { fm, profile, ctx, num_privatized: 0 }
    }

    fn all_local(&self, ir: &ModuleIr, instr: InstrId) -> Option<ValueRef> {
        let raw = ir.instr(instr).mem_operand()?;
        let mut correction = 0i64;
        let ptr = adjust_pointer(ir, raw, &mut correction);
        let aus = self.profile.underlying_aus(self.fm, ptr, self.ctx)?;
        if self.profile.all_local(aus) {
            Some(ptr)
        } else {
            None
        }
    }
}

impl Remediator for ShortLivedRemediator<'_> {
    fn name(&self) -> &'static str {
        "short-lived-remediator"
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
        // Short-lived objects only break cross-iteration edges.
        if !loop_carried {
            return RemedResp::dep();
        }
        if let Some(ptr) = self.all_local(ir, src) {
            self.num_privatized += 1;
            return RemedResp::no_dep(Remedy::ShortLived { ptr });
        }
        if let Some(ptr) = self.all_local(ir, dst) {
            self.num_privatized += 1;
            return RemedResp::no_dep(Remedy::ShortLived { ptr });
        }
        RemedResp::dep()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::context::{AuKind, Ptr};
    use crate::features::remedies::remediator::DepResult;
    use crate::shared::models::Opcode;

    #[test]
    fn test_short_lived_discharges_at_cost_51() {
        let mut ir = ModuleIr::new();
        let f = ir.add_function("main", 0);
        let b = ir.add_block(f, "body");
        let m = ir.append_instr(
            b,
            "call.m",
            Opcode::Call { callee: "malloc".into(), args: vec![], noreturn: false },
        );
        let st = ir.append_instr(
            b,
            "st",
            Opcode::Store { ptr: ValueRef::Instr(m), value: ValueRef::ConstInt(1), size: 8 },
        );
        let lp = LoopRef {
            function: f,
            header: b,
            preheader: None,
            blocks: [b].into_iter().collect(),
            depth: 1,
            exit_edges: vec![],
        };
        let mut fm = FoldManager::new();
        let ctx = ProfileInfo::loop_ctx(&mut fm, &ir, &lp);
        let au = fm.fold_au(AuKind::Heap(m), Some(ctx));

        let mut profile = ProfileInfo::default();
        profile.local_aus.insert(au);
        profile.underlying_objects.insert((ValueRef::Instr(m), ctx), vec![Ptr::new(au, 0, 5)]);

        let mut r = ShortLivedRemediator::new(&fm, &profile, ctx);
        let resp = r.memdep(&ir, st, st, true, DepDir::Waw, &lp);
        assert_eq!(resp.result, DepResult::NoDep);
        assert_eq!(resp.remedy.unwrap().cost(), 51);

        // Intra-iteration edges remain.
        assert_eq!(r.memdep(&ir, st, st, false, DepDir::Waw, &lp).result, DepResult::Dep);
    }
}
