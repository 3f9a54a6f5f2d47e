// Residue disambiguation and short-lived locals, end to end.
//
// Two pointers with residues {0,4,8,12} and {2,6,10,14} under 2-byte
// accesses: the residue remedy discharges their dependence and the
// transform inserts two residue-check branches into the parallelized body.
//
// An AU allocated and freed within one iteration classifies Local: the
// locality remedy discharges all loop-carried edges through it at cost 51
// and the allocation site relocates into the local heap.

use specloom_ir::features::classify::{HeapAssignment, HeapKind};
use specloom_ir::features::context::{AuKind, FoldManager, Ptr};
use specloom_ir::features::pdg::{DepDir, DepEdge, DepGraph, DepKind};
use specloom_ir::features::profile::ProfileInfo;
use specloom_ir::features::remedies::{
    annotate_pdg, LocalityRemediator, PtrResidueRemediator, Remediator, ShortLivedRemediator,
};
use specloom_ir::features::transform::{apply_remedies, Api, HeapRelocator, Task};
use specloom_ir::shared::models::{InstrId, LoopRef, ModuleIr, Opcode, ValueRef};

struct Fix {
    ir: ModuleIr,
    lp: LoopRef,
    pdg: DepGraph,
    p: InstrId,
    q: InstrId,
    st_p: InstrId,
    st_q: InstrId,
    alloc: InstrId,
    st_local: InstrId,
}

fn fixture() -> Fix {
    let mut ir = ModuleIr::new();
    let f = ir.add_function("main", 0);
    let pre = ir.add_block(f, "entry");
    let hdr = ir.add_block(f, "for.body");
    let exit = ir.add_block(f, "for.end");
    ir.append_instr(pre, "", Opcode::Br { cond: None, targets: vec![hdr] });

    let p = ir.append_instr(hdr, "p", Opcode::Gep { base: ValueRef::ConstInt(0), const_offset: None });
    let q = ir.append_instr(hdr, "q", Opcode::Gep { base: ValueRef::ConstInt(0), const_offset: None });
    let st_p = ir.append_instr(
        hdr,
        "st.p",
        Opcode::Store { ptr: ValueRef::Instr(p), value: ValueRef::ConstInt(1), size: 2 },
    );
    let st_q = ir.append_instr(
        hdr,
        "st.q",
        Opcode::Store { ptr: ValueRef::Instr(q), value: ValueRef::ConstInt(2), size: 2 },
    );

    // Short-lived scratch object: allocated, written, freed per iteration.
    let alloc = ir.append_instr(
        hdr,
        "call.scratch",
        Opcode::Call { callee: "malloc".into(), args: vec![ValueRef::ConstInt(64)], noreturn: false },
    );
    let st_local = ir.append_instr(
        hdr,
        "st.scratch",
        Opcode::Store { ptr: ValueRef::Instr(alloc), value: ValueRef::ConstInt(3), size: 8 },
    );
    ir.append_instr(
        hdr,
        "call.free",
        Opcode::Call { callee: "free".into(), args: vec![ValueRef::Instr(alloc)], noreturn: false },
    );
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

    let mut pdg = DepGraph::new();
    pdg.add_edge(st_p, st_q, DepEdge::new(DepKind::Memory, DepDir::Waw, true));
    pdg.add_edge(st_local, st_local, DepEdge::new(DepKind::Memory, DepDir::Waw, true));

    Fix { ir, lp, pdg, p, q, st_p, st_q, alloc, st_local }
}

#[test]
fn residue_remedy_discharges_and_inserts_two_checks() {
    let mut fix = fixture();
    let mut fm = FoldManager::new();
    let ctx = ProfileInfo::loop_ctx(&mut fm, &fix.ir, &fix.lp);

    let mut profile = ProfileInfo::default();
    // {0,4,8,12} and {2,6,10,14}.
    profile.residues.insert((ValueRef::Instr(fix.p), ctx), (0b0001_0001_0001_0001, 400));
    profile.residues.insert((ValueRef::Instr(fix.q), ctx), (0b0100_0100_0100_0100, 400));

    let mut residue = PtrResidueRemediator::new(&fm, &profile, ctx);
    let mut rems: Vec<&mut dyn Remediator> = vec![&mut residue];
    annotate_pdg(&mut fix.pdg, &mut rems, &fix.ir, &fix.lp);

    let e = fix.pdg.edges_between_sets(&[fix.st_p], &[fix.st_q])[0];
    assert!(fix.pdg.edge(e).is_removable(), "disjoint widened residues discharge the edge");
    assert_eq!(fix.pdg.edge(e).cheapest_remedy().unwrap().name(), "ptr-residue-remedy");

    // Apply the plan: two residue-check calls appear in the parallelized
    // body, one per assumed pointer.
    let task = Task::outline(&mut fix.ir, &fix.lp, 1, 2);
    let asgn = HeapAssignment::new(fix.lp.header);
    let mut criticisms = specloom_ir::features::critic::Criticisms::new();
    criticisms.insert(e);
    let stats =
        apply_remedies(&mut fix.ir, &task, &fix.pdg, &criticisms, &fm, &profile, &asgn, ctx);
    assert_eq!(stats.num_residue_checks, 2);

    let body_checks = fix
        .ir
        .function(task.body_fcn)
        .blocks
        .iter()
        .flat_map(|&b| fix.ir.block(b).instrs.iter())
        .filter(|&&i| fix.ir.instr(i).callee() == Some(Api::PTR_RESIDUE_CHECK))
        .count();
    assert_eq!(body_checks, 2);
}

#[test]
fn short_lived_local_discharges_at_51_and_relocates() {
    let mut fix = fixture();
    let mut fm = FoldManager::new();
    let ctx = ProfileInfo::loop_ctx(&mut fm, &fix.ir, &fix.lp);
    let au = fm.fold_au(AuKind::Heap(fix.alloc), Some(ctx));

    // The profiler saw every free land in its allocation's iteration.
    let mut profile = ProfileInfo::default();
    profile.local_aus.insert(au);
    profile
        .underlying_objects
        .insert((ValueRef::Instr(fix.alloc), ctx), vec![Ptr::new(au, 0, 100)]);

    let mut short = ShortLivedRemediator::new(&fm, &profile, ctx);
    let mut rems: Vec<&mut dyn Remediator> = vec![&mut short];
    annotate_pdg(&mut fix.pdg, &mut rems, &fix.ir, &fix.lp);

    let e = fix.pdg.edges_between_sets(&[fix.st_local], &[fix.st_local])[0];
    assert!(fix.pdg.edge(e).is_removable());
    assert_eq!(fix.pdg.edge(e).min_removal_cost(), Some(51));

    // Classification puts the AU in the local family; the relocator
    // rewrites the allocation site and the free.
    let mut asgn = HeapAssignment::new(fix.lp.header);
    asgn.assign(au, HeapKind::Local, 0);
    let mut reloc = HeapRelocator::new(&mut fix.ir, &fm, &asgn);
    reloc.reallocate_dynamic_aus(&mut fix.ir);
    reloc.replace_frees(&mut fix.ir, &profile, ctx);
    assert_eq!(reloc.num_dyn_reloc, 1);
    reloc.finish(&mut fix.ir);

    assert_eq!(fix.ir.instr(fix.alloc).callee(), Some("heap_alloc_local"));
    let free_call = fix
        .ir
        .instrs
        .iter()
        .find(|i| i.name == "call.free")
        .map(|i| i.id)
        .unwrap();
    assert_eq!(fix.ir.instr(free_call).callee(), Some("heap_free_local"));
}

#[test]
fn locality_remediator_agrees_with_short_lived_cost() {
    // The locality oracle, given the finished assignment, reports the same
    // 50+1 cost for the local family.
    let mut fix = fixture();
    let mut fm = FoldManager::new();
    let ctx = ProfileInfo::loop_ctx(&mut fm, &fix.ir, &fix.lp);
    let au = fm.fold_au(AuKind::Heap(fix.alloc), Some(ctx));
    let mut profile = ProfileInfo::default();
    profile
        .underlying_objects
        .insert((ValueRef::Instr(fix.alloc), ctx), vec![Ptr::new(au, 0, 100)]);
    let mut asgn = HeapAssignment::new(fix.lp.header);
    asgn.assign(au, HeapKind::Local, 0);

    let mut locality = LocalityRemediator::new(&fm, &profile, &asgn, ctx);
    let mut rems: Vec<&mut dyn Remediator> = vec![&mut locality];
    annotate_pdg(&mut fix.pdg, &mut rems, &fix.ir, &fix.lp);
    let e = fix.pdg.edges_between_sets(&[fix.st_local], &[fix.st_local])[0];
    assert_eq!(fix.pdg.edge(e).min_removal_cost(), Some(51));
}
