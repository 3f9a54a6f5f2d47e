//! Iteration boundary markup in the outlined body.
//!
//! `begin_iter` opens every iteration at the top of the cloned header; a
//! fresh `end.iter` block is split into every back edge and exit edge so
//! `end_iter` runs exactly once per iteration. Exit paths additionally run
//! the final-iteration checkpoint check (workers that executed one fewer
//! chunk must still reach the same commit barrier) and announce which exit
//! they took.

use super::api::Api;
use super::task::Task;
use crate::shared::models::{ModuleIr, Opcode, ValueRef};

pub fn mark_iteration_boundaries(ir: &mut ModuleIr, task: &Task) {
    // begin_iter at the top of the cloned loop header.
    ir.insert_at_top(
        task.body_header,
        "",
        Opcode::Call { callee: Api::BEGIN_ITER.into(), args: vec![], noreturn: false },
    );

    // Iteration-ending edges: back edges and exit edges of the clone.
    let back_edges = task.body_back_edges(ir);
    let exit_edges = task.exit_edges.clone();

    let mut bounds: Vec<((crate::shared::models::BlockId, usize), bool)> = Vec::new();
    for e in back_edges {
        bounds.push((e, false));
    }
    for e in exit_edges {
        bounds.push((e, true));
    }
    bounds.sort();
    bounds.dedup();

    let body_fcn = task.body_fcn;
    for (exit_token, ((source, sn), is_exit)) in bounds.into_iter().enumerate() {
        let dest = ir.successors(source)[sn];

        let split = ir.add_block(body_fcn, "end.iter");
        ir.append_instr(
            split,
            "",
            Opcode::Call { callee: Api::END_ITER.into(), args: vec![], noreturn: false },
        );
        if is_exit {
            ir.append_instr(
                split,
                "",
                Opcode::Call {
                    callee: Api::FINAL_ITER_CKPT_CHECK.into(),
                    args: vec![],
                    noreturn: false,
                },
            );
            ir.append_instr(
                split,
                "",
                Opcode::Call {
                    callee: Api::WORKER_FINISHES.into(),
                    args: vec![ValueRef::ConstInt(exit_token as i64)],
                    noreturn: false,
                },
            );
        }
        ir.append_instr(split, "", Opcode::Br { cond: None, targets: vec![dest] });

        ir.redirect_successor(source, sn, split);
        ir.retarget_phis(dest, source, split);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::models::LoopRef;

    #[test]
    fn test_boundaries_split_back_and_exit_edges() {
        let mut ir = ModuleIr::new();
        let f = ir.add_function("main", 0);
        let pre = ir.add_block(f, "pre");
        let hdr = ir.add_block(f, "hdr");
        let exit = ir.add_block(f, "exit");
        ir.append_instr(pre, "", Opcode::Br { cond: None, targets: vec![hdr] });
        let phi = ir.append_instr(
            hdr,
            "i",
            Opcode::Phi { incoming: vec![(ValueRef::ConstInt(0), pre)] },
        );
        ir.append_instr(
            hdr,
            "br",
            Opcode::Br { cond: Some(ValueRef::Instr(phi)), targets: vec![hdr, exit] },
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
        let task = Task::outline(&mut ir, &lp, 1, 2);
        mark_iteration_boundaries(&mut ir, &task);

        // begin_iter leads the cloned header (after phis).
        let hdr_clone = task.body_header;
        let first_non_phi = ir
            .block(hdr_clone)
            .instrs
            .iter()
            .copied()
            .find(|&i| !ir.instr(i).is_phi())
            .unwrap();
        assert_eq!(ir.instr(first_non_phi).callee(), Some(Api::BEGIN_ITER));

        // Both the back edge and the exit edge now route through end.iter
        // blocks.
        let splits: Vec<_> = ir
            .function(task.body_fcn)
            .blocks
            .iter()
            .copied()
            .filter(|&b| ir.block(b).name == "end.iter")
            .collect();
        assert_eq!(splits.len(), 2);

        // The exit split announces the worker's exit and runs the final
        // iteration checkpoint check.
        let exit_split = splits
            .iter()
            .copied()
            .find(|&b| {
                ir.block(b).instrs.iter().any(|&i| {
                    ir.instr(i).callee() == Some(Api::WORKER_FINISHES)
                })
            })
            .expect("exit split");
        let callees: Vec<&str> = ir
            .block(exit_split)
            .instrs
            .iter()
            .filter_map(|&i| ir.instr(i).callee())
            .collect();
        assert_eq!(
            callees,
            vec![Api::END_ITER, Api::FINAL_ITER_CKPT_CHECK, Api::WORKER_FINISHES]
        );

        // The cloned header's phi got retargeted to the back-edge split.
        let phi_clone = task.clone_of(phi);
        if let Opcode::Phi { incoming } = &ir.instr(phi_clone).op {
            assert!(incoming.iter().any(|(_, pred)| splits.contains(pred)));
        } else {
            panic!("expected phi");
        }
    }
}
