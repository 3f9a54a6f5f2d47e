//! Remedy application: the validation checks and call rewrites each chosen
//! remedy demands, inserted into the outlined body.

use super::api::Api;
use super::task::Task;
use crate::features::classify::{HeapAssignment, HeapKind};
use crate::features::context::{CtxId, FoldManager};
use crate::features::profile::ProfileInfo;
use crate::features::remedies::remedy::{LocalityKind, Remedy};
use crate::shared::models::{InstrId, ModuleIr, Opcode, ValueRef};
use rustc_hash::FxHashSet;
use tracing::debug;

pub struct CheckInserter<'a> {
    fm: &'a FoldManager,
    profile: &'a ProfileInfo,
    asgn: &'a HeapAssignment,
    ctx: CtxId,
    already_instrumented: FxHashSet<ValueRef>,
    pub num_uo_tests: u64,
    pub num_residue_checks: u64,
}

impl<'a> CheckInserter<'a> {
    pub fn new(
        fm: &'a FoldManager,
        profile: &'a ProfileInfo,
        asgn: &'a HeapAssignment,
        ctx: CtxId,
    ) -> Self {
        CheckInserter {
            fm,
            profile,
            asgn,
            ctx,
            already_instrumented: FxHashSet::default(),
            num_uo_tests: 0,
            num_residue_checks: 0,
        }
    }

    /// Which heap family do we expect this object in?
    fn select_heap(&self, obj: ValueRef) -> HeapKind {
        match self.profile.underlying_aus(self.fm, obj, self.ctx) {
            Some(aus) => self.asgn.classify(aus),
            None => HeapKind::Unclassified,
        }
    }

    fn subheap_of(&self, obj: ValueRef) -> u8 {
        self.profile
            .underlying_aus(self.fm, obj, self.ctx)
            .and_then(|aus| self.asgn.subheap(aus))
            .unwrap_or(0)
    }

    /// Insert the unclassified-object check: the pointer must point into
    /// the heap family the planner assumed.
    fn insert_uo_check(&mut self, ir: &mut ModuleIr, task: &Task, obj: ValueRef) {
        if !self.already_instrumented.insert(obj) {
            return;
        }
        let heap = self.select_heap(obj);
        if heap == HeapKind::Unclassified {
            debug!(?obj, "cannot check unclassified object");
            return;
        }
        let sh = self.subheap_of(obj);

        // Anchor after the cloned definition when the object is an
        // instruction; otherwise at the top of the body.
        let message = format!(
            "UO violation on pointer {}; should be in {}, sub-heap {}",
            match obj {
                ValueRef::Instr(i) => ir.instr(i).name.clone(),
                ValueRef::Global(g) => ir.global(g).name.clone(),
                other => format!("{:?}", other),
            },
            heap.name(),
            sh
        );
        let message_gv =
            ir.add_global(format!("__uo_msg_{}", self.num_uo_tests), message.len() as u64, true, true);

        let check = Opcode::Call {
            callee: Api::UO_CHECK.into(),
            args: vec![
                obj,
                ValueRef::ConstInt(Api::heap_code(heap)),
                ValueRef::ConstInt(sh as i64),
                ValueRef::Global(message_gv),
            ],
            noreturn: false,
        };
        match obj {
            ValueRef::Instr(i) => {
                let anchor = task.clone_of(i);
                ir.insert_after(anchor, "", check);
            }
            _ => {
                ir.insert_at_top(task.body_header, "", check);
            }
        }
        self.num_uo_tests += 1;
        debug!(?obj, heap = heap.name(), "instrumented indeterminate object");
    }

    /// Residue-check branch: validates that the pointer keeps the residues
    /// the profile promised.
    fn insert_residue_check(&mut self, ir: &mut ModuleIr, task: &Task, ptr: ValueRef, ctx: CtxId) {
        let bits = self.profile.residue(self.fm, ptr, ctx);
        if bits == 0 {
            return;
        }
        let check = Opcode::Call {
            callee: Api::PTR_RESIDUE_CHECK.into(),
            args: vec![ptr, ValueRef::ConstInt(bits as i64)],
            noreturn: false,
        };
        match ptr {
            ValueRef::Instr(i) => {
                let anchor = task.clone_of(i);
                ir.insert_after(anchor, "", check);
            }
            _ => {
                ir.insert_at_top(task.body_header, "", check);
            }
        }
        self.num_residue_checks += 1;
    }

    /// Guard a private access: loads and stores go through the runtime so
    /// cross-worker collisions are caught.
    fn replace_private_access(&mut self, ir: &mut ModuleIr, task: &Task, instr: InstrId) {
        let target = task.clone_of(instr);
        match ir.instr(target).op.clone() {
            Opcode::Load { ptr, size } => {
                ir.replace_opcode(
                    target,
                    Opcode::Call {
                        callee: Api::private_read(size),
                        args: vec![ptr],
                        noreturn: false,
                    },
                );
            }
            Opcode::Store { ptr, value, size } => {
                ir.replace_opcode(
                    target,
                    Opcode::Call {
                        callee: Api::private_write(size),
                        args: vec![ptr, value],
                        noreturn: false,
                    },
                );
            }
            _ => {}
        }
    }

    /// Swap a terminal-output call for its deferring twin.
    fn defer_io_call(&mut self, ir: &mut ModuleIr, task: &Task, instr: InstrId) {
        let target = task.clone_of(instr);
        if let Opcode::Call { callee, .. } = &mut ir.instrs[target.0 as usize].op {
            if !callee.starts_with("__specpriv_io_") {
                *callee = Api::io_call(callee);
            }
        }
    }

    /// Insert the branch-direction check control speculation requires.
    fn insert_ctrl_spec_check(&mut self, ir: &mut ModuleIr, task: &Task, branch: InstrId) {
        let target = task.clone_of(branch);
        let cond = match &ir.instr(target).op {
            Opcode::Br { cond: Some(c), .. } => *c,
            _ => return,
        };
        ir.insert_before(
            target,
            "",
            Opcode::Call {
                callee: Api::CTRL_SPEC_CHECK.into(),
                args: vec![cond, ValueRef::ConstInt(1)],
                noreturn: false,
            },
        );
    }

    pub fn apply(&mut self, ir: &mut ModuleIr, task: &Task, remedy: &Remedy) {
        match remedy {
            Remedy::Locality { kind, ptr, ptr2, private_instr, .. } => {
                if let Some(i) = private_instr {
                    self.replace_private_access(ir, task, *i);
                }
                match kind {
                    LocalityKind::Separated | LocalityKind::Subheaps => {
                        if let Some(p) = ptr {
                            self.insert_uo_check(ir, task, *p);
                        }
                        if let Some(p) = ptr2 {
                            self.insert_uo_check(ir, task, *p);
                        }
                    }
                    LocalityKind::Local
                    | LocalityKind::KillPrivate
                    | LocalityKind::SharePrivate => {
                        if let Some(p) = ptr {
                            self.insert_uo_check(ir, task, *p);
                        }
                    }
                    _ => {}
                }
            }
            Remedy::PtrResidue { ptr1, ctx1, ptr2, ctx2, .. } => {
                self.insert_residue_check(ir, task, *ptr1, *ctx1);
                self.insert_residue_check(ir, task, *ptr2, *ctx2);
            }
            Remedy::TxIo { print_instr } => {
                self.defer_io_call(ir, task, *print_instr);
            }
            Remedy::ControlSpec { branch, .. } => {
                self.insert_ctrl_spec_check(ir, task, *branch);
            }
            // The relocation pass and the runtime's combine step realize
            // these; nothing to insert at the access site.
            Remedy::ShortLived { .. } | Remedy::Redux { .. } | Remedy::CommutativeLibs { .. } => {}
        }
    }
}

/// Counters from a remedy-application pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckStats {
    pub num_uo_tests: u64,
    pub num_residue_checks: u64,
}

/// Apply the cheapest remedy of every criticism edge.
pub fn apply_remedies(
    ir: &mut ModuleIr,
    task: &Task,
    pdg: &crate::features::pdg::DepGraph,
    criticisms: &crate::features::critic::Criticisms,
    fm: &FoldManager,
    profile: &ProfileInfo,
    asgn: &HeapAssignment,
    ctx: CtxId,
) -> CheckStats {
    let mut inserter = CheckInserter::new(fm, profile, asgn, ctx);
    let mut remedies = Vec::new();
    for &e in criticisms {
        if let Some(r) = pdg.edge(e).cheapest_remedy() {
            remedies.push(r.clone());
        }
    }
    for r in &remedies {
        inserter.apply(ir, task, r);
    }
    CheckStats {
        num_uo_tests: inserter.num_uo_tests,
        num_residue_checks: inserter.num_residue_checks,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::context::AuKind;
    use crate::features::context::Ptr;
    use crate::shared::models::{BlockId, LoopRef};

    fn fixture() -> (ModuleIr, LoopRef, Task, FoldManager, ProfileInfo, HeapAssignment, InstrId) {
        let mut ir = ModuleIr::new();
        let f = ir.add_function("main", 0);
        let pre = ir.add_block(f, "pre");
        let hdr = ir.add_block(f, "hdr");
        let exit = ir.add_block(f, "exit");
        ir.append_instr(pre, "", Opcode::Br { cond: None, targets: vec![hdr] });
        let p = ir.append_instr(hdr, "p", Opcode::Gep {
            base: ValueRef::ConstInt(0),
            const_offset: None,
        });
        let st = ir.append_instr(
            hdr,
            "st",
            Opcode::Store { ptr: ValueRef::Instr(p), value: ValueRef::ConstInt(0), size: 2 },
        );
        let _ = st;
        ir.append_instr(
            hdr,
            "br",
            Opcode::Br { cond: Some(ValueRef::ConstInt(1)), targets: vec![hdr, exit] },
        );
        ir.append_instr(exit, "", Opcode::Ret { value: None });
        let lp = LoopRef {
            function: f,
            header: hdr,
            preheader: Some(pre),
            blocks: [hdr].into_iter().collect(),
            depth: 1,
            exit_edges: vec![(hdr, 1)],
        };
        let mut task_ir = ir.clone();
        let task = Task::outline(&mut task_ir, &lp, 1, 2);

        let mut fm = FoldManager::new();
        let ctx = ProfileInfo::loop_ctx(&mut fm, &task_ir, &lp);
        let au = fm.fold_au(AuKind::Heap(p), Some(ctx));
        let mut profile = ProfileInfo::default();
        profile.underlying_objects.insert((ValueRef::Instr(p), ctx), vec![Ptr::new(au, 0, 1)]);
        profile.residues.insert((ValueRef::Instr(p), ctx), (0b0001_0001_0001_0001, 8));
        let mut asgn = HeapAssignment::new(BlockId(lp.header.0));
        asgn.assign(au, HeapKind::Local, 0);

        (task_ir, lp, task, fm, profile, asgn, p)
    }

    #[test]
    fn test_residue_remedy_inserts_two_checks() {
        let (mut ir, lp, task, mut fm, profile, asgn, p) = fixture();
        let ctx = ProfileInfo::loop_ctx(&mut fm, &ir, &lp);
        let mut inserter = CheckInserter::new(&fm, &profile, &asgn, ctx);
        let remedy = Remedy::PtrResidue {
            ptr1: ValueRef::Instr(p),
            ctx1: ctx,
            ptr2: ValueRef::Instr(p),
            ctx2: ctx,
            cost: 64,
        };
        inserter.apply(&mut ir, &task, &remedy);
        assert_eq!(inserter.num_residue_checks, 2);
        // Checks anchor after the cloned pointer definition.
        let p_clone = task.clone_of(p);
        let block = ir.instr(p_clone).block;
        let checks = ir
            .block(block)
            .instrs
            .iter()
            .filter(|&&i| ir.instr(i).callee() == Some(Api::PTR_RESIDUE_CHECK))
            .count();
        assert_eq!(checks, 2);
    }

    #[test]
    fn test_locality_local_inserts_uo_check() {
        let (mut ir, lp, task, mut fm, profile, asgn, p) = fixture();
        let ctx = ProfileInfo::loop_ctx(&mut fm, &ir, &lp);
        let mut inserter = CheckInserter::new(&fm, &profile, &asgn, ctx);
        let remedy = Remedy::Locality {
            kind: LocalityKind::Local,
            ptr: Some(ValueRef::Instr(p)),
            ptr2: None,
            private_instr: None,
            redux_store: None,
            cost: 51,
        };
        inserter.apply(&mut ir, &task, &remedy);
        assert_eq!(inserter.num_uo_tests, 1);
        // Instrumenting the same pointer twice is a no-op.
        inserter.apply(&mut ir, &task, &remedy);
        assert_eq!(inserter.num_uo_tests, 1);
    }

    #[test]
    fn test_private_access_guarded() {
        let (mut ir, lp, task, mut fm, profile, asgn, p) = fixture();
        let ctx = ProfileInfo::loop_ctx(&mut fm, &ir, &lp);
        // The store through p becomes a private_write call.
        let st = ir
            .instrs
            .iter()
            .find(|i| i.name == "st" && !task.instruction_clones.values().any(|&c| c == i.id))
            .map(|i| i.id)
            .unwrap();
        let mut inserter = CheckInserter::new(&fm, &profile, &asgn, ctx);
        let remedy = Remedy::Locality {
            kind: LocalityKind::Private,
            ptr: Some(ValueRef::Instr(p)),
            ptr2: None,
            private_instr: Some(st),
            redux_store: None,
            cost: 150,
        };
        inserter.apply(&mut ir, &task, &remedy);
        let st_clone = task.clone_of(st);
        assert_eq!(ir.instr(st_clone).callee(), Some("__specpriv_private_write_2"));
    }
}
