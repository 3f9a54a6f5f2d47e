//! Heap relocation.
//!
//! Static AUs (globals, constants) move behind reallocated pointers filled
//! in by a synthesized startup function and released by a shutdown
//! function; dynamic AUs (stack, heap) have their allocation sites
//! rewritten to the kind-specific runtime allocators, with matching frees
//! injected at function exits for stack objects.

use super::api::Api;
use crate::features::classify::{HeapAssignment, HeapKind};
use crate::features::context::{AuId, AuKind, CtxId, FoldManager};
use crate::features::profile::ProfileInfo;
use crate::features::remedies::ptr_residue::adjust_pointer;
use crate::shared::models::{FcnId, GlobalId, InstrId, ModuleIr, Opcode, ValueRef};
use tracing::debug;

pub struct HeapRelocator<'a> {
    fm: &'a FoldManager,
    asgn: &'a HeapAssignment,
    init_fcn: FcnId,
    fini_fcn: FcnId,
    init_block: crate::shared::models::BlockId,
    fini_block: crate::shared::models::BlockId,
    pub num_static_reloc: u64,
    pub num_dyn_reloc: u64,
}

impl<'a> HeapRelocator<'a> {
    /// Create the startup/finalization functions; they run outside the
    /// parallel region, before and after main.
    pub fn new(ir: &mut ModuleIr, fm: &'a FoldManager, asgn: &'a HeapAssignment) -> Self {
        let init_fcn = ir.add_function(Api::STARTUP, 0);
        let init_block = ir.add_block(init_fcn, "entry");
        ir.append_instr(
            init_block,
            "",
            Opcode::Call { callee: Api::BEGIN.into(), args: vec![], noreturn: false },
        );

        let fini_fcn = ir.add_function(Api::SHUTDOWN, 0);
        let fini_block = ir.add_block(fini_fcn, "entry");

        HeapRelocator {
            fm,
            asgn,
            init_fcn,
            fini_fcn,
            init_block,
            fini_block,
            num_static_reloc: 0,
            num_dyn_reloc: 0,
        }
    }

    pub fn init_fcn(&self) -> FcnId {
        self.init_fcn
    }

    pub fn fini_fcn(&self) -> FcnId {
        self.fini_fcn
    }

    /// Close both synthesized functions.
    pub fn finish(self, ir: &mut ModuleIr) {
        ir.append_instr(self.init_block, "", Opcode::Ret { value: None });
        ir.append_instr(
            self.fini_block,
            "",
            Opcode::Call { callee: Api::END.into(), args: vec![], noreturn: false },
        );
        ir.append_instr(self.fini_block, "", Opcode::Ret { value: None });
    }

    /// Relocate every classified static AU.
    pub fn reallocate_static_aus(&mut self, ir: &mut ModuleIr) {
        for kind in [
            HeapKind::Shared,
            HeapKind::Local,
            HeapKind::Private,
            HeapKind::ReadOnly,
            HeapKind::KillPrivate,
            HeapKind::SharePrivate,
            HeapKind::Redux,
        ] {
            for au in self.asgn.aus_of_kind(kind) {
                let (gv, is_constant) = match self.fm.au_kind(au) {
                    AuKind::Global(g) => (g, false),
                    AuKind::Constant(g) => (g, true),
                    _ => continue,
                };
                let _ = is_constant;
                if kind == HeapKind::Redux && ir.global(gv).external_linkage {
                    continue;
                }
                self.reallocate_global(ir, au, gv, kind);
            }
        }
    }

    fn reallocate_global(&mut self, ir: &mut ModuleIr, au: AuId, gv: GlobalId, heap: HeapKind) {
        let (size, name, has_init) = {
            let g = ir.global(gv);
            (g.size, g.name.clone(), g.has_nonzero_initializer)
        };
        debug!(global = %name, heap = heap.name(), "static AU relocated");

        // A new pointer global, null until startup runs.
        let gvptr = ir.add_global(format!("__reallocated_{}", name), 8, false, false);

        // Replace every use of the original global with a load through the
        // new pointer, inserted immediately before the use.
        let users: Vec<InstrId> = ir
            .instrs
            .iter()
            .filter(|i| {
                i.operands().contains(&ValueRef::Global(gv))
                    && i.op != Opcode::Deleted
                    && ir.block(i.block).function != self.init_fcn
                    && ir.block(i.block).function != self.fini_fcn
            })
            .map(|i| i.id)
            .collect();
        for user in users {
            let load = ir.insert_before(
                user,
                format!("{}.reloc", name),
                Opcode::Load { ptr: ValueRef::Global(gvptr), size: 8 },
            );
            ir.replace_use_in(user, ValueRef::Global(gv), ValueRef::Instr(load));
        }

        // Startup: allocate, publish, copy the initializer.
        let subheap = self.asgn.subheap_of(au);
        let mut args = vec![ValueRef::ConstInt(size as i64), ValueRef::ConstInt(subheap as i64)];
        if heap == HeapKind::Redux {
            let redux = self.asgn.redux_kind(au).expect("redux AU without operator") as i64;
            args.push(ValueRef::ConstInt(redux));
        }
        let alloc = ir.append_instr(
            self.init_block,
            format!("{}.heap", name),
            Opcode::Call { callee: Api::alloc(heap), args, noreturn: false },
        );
        ir.append_instr(
            self.init_block,
            "",
            Opcode::Store {
                ptr: ValueRef::Global(gvptr),
                value: ValueRef::Instr(alloc),
                size: 8,
            },
        );
        if has_init {
            ir.append_instr(
                self.init_block,
                "",
                Opcode::Call {
                    callee: "memcpy".into(),
                    args: vec![
                        ValueRef::Instr(alloc),
                        ValueRef::Global(gv),
                        ValueRef::ConstInt(size as i64),
                    ],
                    noreturn: false,
                },
            );
        }

        // Shutdown: free and null the slot.
        let reload = ir.append_instr(
            self.fini_block,
            format!("{}.reload", name),
            Opcode::Load { ptr: ValueRef::Global(gvptr), size: 8 },
        );
        ir.append_instr(
            self.fini_block,
            "",
            Opcode::Call {
                callee: Api::free(heap),
                args: vec![ValueRef::Instr(reload)],
                noreturn: false,
            },
        );
        ir.append_instr(
            self.fini_block,
            "",
            Opcode::Store { ptr: ValueRef::Global(gvptr), value: ValueRef::Null, size: 8 },
        );

        self.num_static_reloc += 1;
    }

    /// Rewrite classified dynamic allocation sites; stack objects get a
    /// matching free at every exit of their function.
    pub fn reallocate_dynamic_aus(&mut self, ir: &mut ModuleIr) {
        for (au, kind) in self.asgn.iter().collect::<Vec<_>>() {
            if kind == HeapKind::Unclassified {
                continue;
            }
            let (site, is_stack) = match self.fm.au_kind(au) {
                AuKind::Stack(i) => (i, true),
                AuKind::Heap(i) => (i, false),
                _ => continue,
            };
            if ir.instr(site).op == Opcode::Deleted {
                continue;
            }
            let subheap = self.asgn.subheap_of(au);
            let size_arg = match &ir.instr(site).op {
                Opcode::Alloca { size } => ValueRef::ConstInt(*size as i64),
                Opcode::Call { args, .. } => {
                    args.first().copied().unwrap_or(ValueRef::ConstInt(0))
                }
                _ => continue,
            };
            let mut args = vec![size_arg, ValueRef::ConstInt(subheap as i64)];
            if kind == HeapKind::Redux {
                let redux = self.asgn.redux_kind(au).expect("redux AU without operator") as i64;
                args.push(ValueRef::ConstInt(redux));
            }
            ir.replace_opcode(
                site,
                Opcode::Call { callee: Api::alloc(kind), args, noreturn: false },
            );
            debug!(?site, heap = kind.name(), "dynamic AU relocated");
            self.num_dyn_reloc += 1;

            if is_stack {
                let fcn = ir.function_of(site);
                for exit in ir.exit_blocks(fcn) {
                    let insert_at = *ir.block(exit).instrs.last().expect("terminated block");
                    ir.insert_before(
                        insert_at,
                        "",
                        Opcode::Call {
                            callee: Api::free(kind),
                            args: vec![ValueRef::Instr(site)],
                            noreturn: false,
                        },
                    );
                }
            }
        }
    }

    /// Replace calls to `free` on classified pointers with the
    /// kind-specific runtime free.
    pub fn replace_frees(&mut self, ir: &mut ModuleIr, profile: &ProfileInfo, ctx: CtxId) {
        let frees: Vec<InstrId> = ir
            .instrs
            .iter()
            .filter(|i| i.callee() == Some("free"))
            .map(|i| i.id)
            .collect();
        for f in frees {
            let arg_opt = match &ir.instr(f).op {
                Opcode::Call { args, .. } => args.first().copied(),
                _ => None,
            };
            let Some(arg) = arg_opt else { continue };
            let mut correction = 0i64;
            let base = adjust_pointer(ir, arg, &mut correction);
            let Some(aus) = profile.underlying_aus(self.fm, base, ctx) else { continue };
            let kind = self.asgn.classify(aus);
            if kind == HeapKind::Unclassified {
                continue;
            }
            if let Opcode::Call { callee, .. } = &mut ir.instrs[f.0 as usize].op {
                *callee = Api::free(kind);
            }
            debug!(?f, heap = kind.name(), "free call replaced");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::models::BlockId;

    #[test]
    fn test_static_relocation() {
        let mut ir = ModuleIr::new();
        let f = ir.add_function("main", 0);
        let b = ir.add_block(f, "entry");
        let gv = ir.add_global("table", 128, false, true);
        let user = ir.append_instr(b, "ld", Opcode::Load { ptr: ValueRef::Global(gv), size: 8 });
        ir.append_instr(b, "", Opcode::Ret { value: None });

        let mut fm = FoldManager::new();
        let au = fm.fold_au(AuKind::Global(gv), None);
        let mut asgn = HeapAssignment::new(BlockId(0));
        asgn.assign(au, HeapKind::Shared, 3);

        let mut reloc = HeapRelocator::new(&mut ir, &fm, &asgn);
        reloc.reallocate_static_aus(&mut ir);
        assert_eq!(reloc.num_static_reloc, 1);
        let (init_fcn, fini_fcn) = (reloc.init_fcn(), reloc.fini_fcn());
        reloc.finish(&mut ir);

        // The user now loads through the reallocated pointer.
        let reloc_gv = ir.globals.iter().find(|g| g.name == "__reallocated_table").unwrap().id;
        match &ir.instr(user).op {
            Opcode::Load { ptr: ValueRef::Instr(load), .. } => {
                assert_eq!(ir.instr(*load).mem_operand(), Some(ValueRef::Global(reloc_gv)));
            }
            other => panic!("{:?}", other),
        }

        // Startup allocates into the shared heap with sub-heap 3 and
        // copies the initializer; shutdown frees.
        let init_entry = ir.function(init_fcn).blocks[0];
        let callees: Vec<String> = ir
            .block(init_entry)
            .instrs
            .iter()
            .filter_map(|&i| ir.instr(i).callee().map(String::from))
            .collect();
        assert!(callees.contains(&"heap_alloc_shared".to_string()));
        assert!(callees.contains(&"memcpy".to_string()));
        let fini_entry = ir.function(fini_fcn).blocks[0];
        let fini_callees: Vec<String> = ir
            .block(fini_entry)
            .instrs
            .iter()
            .filter_map(|&i| ir.instr(i).callee().map(String::from))
            .collect();
        assert!(fini_callees.contains(&"heap_free_shared".to_string()));
    }

    #[test]
    fn test_dynamic_stack_relocation_frees_at_exits() {
        let mut ir = ModuleIr::new();
        let f = ir.add_function("worker", 0);
        let b = ir.add_block(f, "entry");
        let site = ir.append_instr(b, "buf", Opcode::Alloca { size: 64 });
        ir.append_instr(b, "", Opcode::Ret { value: None });

        let mut fm = FoldManager::new();
        let top = fm.top();
        let au = fm.fold_au(AuKind::Stack(site), Some(top));
        let mut asgn = HeapAssignment::new(BlockId(0));
        asgn.assign(au, HeapKind::Local, 0);

        let mut reloc = HeapRelocator::new(&mut ir, &fm, &asgn);
        reloc.reallocate_dynamic_aus(&mut ir);
        reloc.finish(&mut ir);

        assert_eq!(ir.instr(site).callee(), Some("heap_alloc_local"));
        // A heap_free_local call sits before the return.
        let frees: Vec<&str> = ir
            .block(b)
            .instrs
            .iter()
            .filter_map(|&i| ir.instr(i).callee())
            .filter(|c| c.starts_with("heap_free"))
            .collect();
        assert_eq!(frees, vec!["heap_free_local"]);
    }
}
