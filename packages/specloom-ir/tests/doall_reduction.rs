// End to end over a sum-reduction loop: for i in 0..100 { sum += a[i] }.
// The induction-variable cycle is discharged by the bounded-IV rule, the
// reduction cycle by a redux remedy, and the critic produces a
// single-parallel-stage DOALL plan that the transform then wires up.

use rustc_hash::FxHashMap;
use specloom_ir::features::classify::ReduxKind;
use specloom_ir::features::critic::{
    DoallCritic, LoopDependenceInfo, ProfileWeights, StageType,
};
use specloom_ir::features::pdg::{DepDir, DepEdge, DepGraph, DepKind};
use specloom_ir::features::remedies::{annotate_pdg, ReduxRemediator, Remediator};
use specloom_ir::features::transform::{insert_invocation, mark_iteration_boundaries, Api, Task};
use specloom_ir::shared::models::{BinOp, LoopRef, ModuleIr, Opcode, ValueRef};

struct ReductionLoop {
    ir: ModuleIr,
    lp: LoopRef,
    pdg: DepGraph,
    sum_phi: specloom_ir::shared::models::InstrId,
    sum_next: specloom_ir::shared::models::InstrId,
}

fn reduction_loop() -> ReductionLoop {
    let mut ir = ModuleIr::new();
    let f = ir.add_function("main", 0);
    let pre = ir.add_block(f, "entry");
    let hdr = ir.add_block(f, "for.body");
    let exit = ir.add_block(f, "for.end");
    ir.add_global("a", 800, false, true);

    ir.append_instr(pre, "", Opcode::Br { cond: None, targets: vec![hdr] });

    let i_phi = ir.append_instr(hdr, "i", Opcode::Phi { incoming: vec![] });
    let i_next = ir.append_instr(
        hdr,
        "i.next",
        Opcode::Binary { op: BinOp::Add, lhs: ValueRef::Instr(i_phi), rhs: ValueRef::ConstInt(1) },
    );
    let gep = ir.append_instr(
        hdr,
        "a.elt",
        Opcode::Gep { base: ValueRef::Instr(i_phi), const_offset: None },
    );
    let load = ir.append_instr(hdr, "a.val", Opcode::Load { ptr: ValueRef::Instr(gep), size: 8 });
    let sum_phi = ir.append_instr(hdr, "sum", Opcode::Phi { incoming: vec![] });
    let sum_next = ir.append_instr(
        hdr,
        "sum.next",
        Opcode::Binary {
            op: BinOp::Add,
            lhs: ValueRef::Instr(sum_phi),
            rhs: ValueRef::Instr(load),
        },
    );
    let br = ir.append_instr(
        hdr,
        "br",
        Opcode::Br { cond: Some(ValueRef::Instr(i_next)), targets: vec![hdr, exit] },
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
    pdg.add_edge(i_phi, i_next, DepEdge::new(DepKind::Register, DepDir::Raw, false));
    pdg.add_edge(i_next, i_phi, DepEdge::new(DepKind::Register, DepDir::Raw, true));
    pdg.add_edge(i_next, br, DepEdge::new(DepKind::Register, DepDir::Raw, false));
    pdg.add_edge(br, i_phi, DepEdge::new(DepKind::Control, DepDir::Raw, true));
    pdg.add_edge(i_phi, gep, DepEdge::new(DepKind::Register, DepDir::Raw, false));
    pdg.add_edge(gep, load, DepEdge::new(DepKind::Register, DepDir::Raw, false));
    pdg.add_edge(load, sum_next, DepEdge::new(DepKind::Register, DepDir::Raw, false));
    pdg.add_edge(sum_phi, sum_next, DepEdge::new(DepKind::Register, DepDir::Raw, false));
    pdg.add_edge(sum_next, sum_phi, DepEdge::new(DepKind::Register, DepDir::Raw, true));

    ReductionLoop { ir, lp, pdg, sum_phi, sum_next }
}

#[test]
fn doall_plan_with_redux_remedy() {
    let mut fix = reduction_loop();

    // The reduction chain is recognized by the host's reduction analysis.
    let mut updates = FxHashMap::default();
    updates.insert(fix.sum_phi, ReduxKind::AddI64);
    updates.insert(fix.sum_next, ReduxKind::AddI64);
    let mut redux = ReduxRemediator::new(updates);
    let mut rems: Vec<&mut dyn Remediator> = vec![&mut redux];
    let removable = annotate_pdg(&mut fix.pdg, &mut rems, &fix.ir, &fix.lp);
    assert_eq!(removable, 1, "exactly the reduction back edge is removable");

    let pw = ProfileWeights::uniform();
    let critic = DoallCritic::new(&pw, 8);
    let ldi = LoopDependenceInfo { governed_by_bounded_iv: true, chunk_size: 16 };
    let res = critic.get_criticisms(&fix.pdg, &fix.ir, &fix.lp, &ldi);

    // One Parallel stage; one criticism carrying the Redux remedy.
    let ps = res.strategy.expect("DOALL plan");
    assert_eq!(ps.stages.len(), 1);
    assert_eq!(ps.stages[0].ty, StageType::Parallel);
    assert!(ps.summary().starts_with("DOALL"));
    assert_eq!(res.criticisms.len(), 1);
    let remedy_names: Vec<&str> = res
        .criticisms
        .iter()
        .filter_map(|&e| fix.pdg.edge(e).cheapest_remedy())
        .map(|r| r.name())
        .collect();
    assert_eq!(remedy_names, vec!["redux-remedy"]);
    assert!(res.exp_speedup > 0);
}

#[test]
fn transform_emits_invocation_protocol() {
    let mut fix = reduction_loop();
    let task = Task::outline(&mut fix.ir, &fix.lp, 16, 8);
    mark_iteration_boundaries(&mut fix.ir, &task);
    let sites = insert_invocation(&mut fix.ir, &task).unwrap();

    // Spawn protocol in the preheader, in call order.
    let callees: Vec<&str> = fix
        .ir
        .block(sites.spawn_block)
        .instrs
        .iter()
        .filter_map(|&i| fix.ir.instr(i).callee())
        .collect();
    assert_eq!(
        callees,
        vec![
            Api::BEGIN_INVOCATION,
            Api::CURRENT_ITER,
            Api::SPAWN_WORKERS,
            Api::JOIN_CHILDREN
        ]
    );

    // The outlined body is marked: one begin_iter, one end.iter split per
    // back edge plus per exit edge.
    let body_blocks = &fix.ir.function(task.body_fcn).blocks;
    let all_body_callees: Vec<&str> = body_blocks
        .iter()
        .flat_map(|&b| fix.ir.block(b).instrs.iter())
        .filter_map(|&i| fix.ir.instr(i).callee())
        .collect();
    assert_eq!(all_body_callees.iter().filter(|c| **c == Api::BEGIN_ITER).count(), 1);
    assert_eq!(all_body_callees.iter().filter(|c| **c == Api::END_ITER).count(), 2);
    assert_eq!(all_body_callees.iter().filter(|c| **c == Api::WORKER_FINISHES).count(), 1);
    assert_eq!(
        all_body_callees.iter().filter(|c| **c == Api::FINAL_ITER_CKPT_CHECK).count(),
        1
    );
}
