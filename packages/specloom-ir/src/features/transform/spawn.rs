//! Worker spawn insertion.
//!
//! The sequential loop is replaced by the parallel invocation: the
//! preheader acquires the worker count, spawns the outlined body, joins,
//! and branches to either the normal end-of-invocation block or a
//! recovery block. Recovery is not wired through to re-execution yet; the
//! recovery block aborts.

use super::api::Api;
use super::task::Task;
use crate::errors::{Result, SpecloomError};
use crate::shared::models::{BlockId, ModuleIr, Opcode, ValueRef};

/// Blocks and key instructions created by `insert_invocation`.
#[derive(Debug, Clone)]
pub struct InvocationSites {
    pub spawn_block: BlockId,
    pub end_invocation_block: BlockId,
    pub recovery_block: BlockId,
}

pub fn insert_invocation(ir: &mut ModuleIr, task: &Task) -> Result<InvocationSites> {
    let lp = &task.lp;
    let preheader = lp
        .preheader
        .ok_or_else(|| SpecloomError::transform("loop has no preheader; run loop-simplify"))?;
    let fcn = lp.function;

    // The preheader's jump into the loop is removed; the parallel
    // invocation takes its place.
    if let Some(term) = ir.terminator(preheader) {
        ir.delete_instr(term);
    }

    let num_workers = ir.append_instr(
        preheader,
        "numThreads",
        Opcode::Call { callee: Api::BEGIN_INVOCATION.into(), args: vec![], noreturn: false },
    );
    let current_iter = ir.append_instr(
        preheader,
        "current.iter",
        Opcode::Call { callee: Api::CURRENT_ITER.into(), args: vec![], noreturn: false },
    );

    // Environment array: live-ins packed for the workers.
    let env = ir.append_instr(
        preheader,
        "env",
        Opcode::Alloca { size: 8 * task.live_ins.len().max(1) as u64 },
    );

    ir.append_instr(
        preheader,
        "spawn",
        Opcode::Call {
            callee: Api::SPAWN_WORKERS.into(),
            args: vec![
                ValueRef::Instr(current_iter),
                ValueRef::Fcn(task.body_fcn),
                ValueRef::Instr(env),
                ValueRef::Instr(num_workers),
                ValueRef::ConstInt(task.chunk_size as i64),
            ],
            noreturn: false,
        },
    );

    let join = ir.append_instr(
        preheader,
        "join",
        Opcode::Call { callee: Api::JOIN_CHILDREN.into(), args: vec![], noreturn: false },
    );
    let cmp = ir.append_instr(
        preheader,
        "misspec",
        Opcode::Binary {
            op: crate::shared::models::BinOp::CmpEq,
            lhs: ValueRef::Instr(join),
            rhs: ValueRef::ConstInt(0),
        },
    );

    // The block after the loop: first exit target outside the loop.
    let end_invocation_block = lp
        .exit_edges
        .first()
        .map(|&(b, sn)| ir.successors(b)[sn])
        .ok_or_else(|| SpecloomError::transform("loop has no exit edge"))?;

    let recovery_block = ir.add_block(fcn, "perform_recovery");
    ir.append_instr(
        recovery_block,
        "",
        Opcode::Call { callee: "abort".into(), args: vec![], noreturn: true },
    );
    ir.append_instr(recovery_block, "", Opcode::Unreachable);

    ir.append_instr(
        preheader,
        "",
        Opcode::Br {
            cond: Some(ValueRef::Instr(cmp)),
            targets: vec![recovery_block, end_invocation_block],
        },
    );

    // End of invocation on the normal path.
    ir.insert_at_top(
        end_invocation_block,
        "",
        Opcode::Call { callee: Api::END_INVOCATION.into(), args: vec![], noreturn: false },
    );

    Ok(InvocationSites { spawn_block: preheader, end_invocation_block, recovery_block })
}
