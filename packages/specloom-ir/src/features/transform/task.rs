//! The parallelization unit: one loop, outlined into a worker body.

use crate::shared::models::{
    BlockId, FcnId, InstrId, LoopRef, ModuleIr, Opcode, ValueRef,
};
use rustc_hash::{FxHashMap, FxHashSet};

/// Everything the transform needs about the loop being parallelized.
#[derive(Debug, Clone)]
pub struct Task {
    pub lp: LoopRef,
    /// The outlined clone of the loop body each worker executes.
    pub body_fcn: FcnId,
    /// Header block of the clone.
    pub body_header: BlockId,
    /// Values defined outside the loop but used inside.
    pub live_ins: Vec<ValueRef>,
    /// Values defined inside and used after the loop.
    pub live_outs: Vec<ValueRef>,
    /// original instruction -> its clone in the body function
    pub instruction_clones: FxHashMap<InstrId, InstrId>,
    /// original block -> cloned block
    pub block_clones: FxHashMap<BlockId, BlockId>,
    /// Exit edges of the clone, one exit token per original exit edge.
    pub exit_edges: Vec<(BlockId, usize)>,
    pub chunk_size: u64,
    pub num_workers: u32,
}

impl Task {
    /// Outline `lp` into a fresh function: clone its blocks, remap intra-
    /// loop operands to the clones, collect live-ins, and route every exit
    /// edge to a synthesized return block.
    pub fn outline(ir: &mut ModuleIr, lp: &LoopRef, chunk_size: u64, num_workers: u32) -> Task {
        let orig_fcn_name = ir.function(lp.function).name.clone();
        let body_fcn = ir.add_function(format!("{}.parallel_body", orig_fcn_name), 0);

        // Entry block standing in for the preheader.
        let entry = ir.add_block(body_fcn, "entry");

        let mut block_clones: FxHashMap<BlockId, BlockId> = FxHashMap::default();
        let mut loop_blocks: Vec<BlockId> = lp.blocks.iter().copied().collect();
        loop_blocks.sort();
        for &b in &loop_blocks {
            let name = ir.block(b).name.clone();
            let clone = ir.add_block(body_fcn, name);
            block_clones.insert(b, clone);
        }
        let body_header = block_clones[&lp.header];

        // One shared exit block; live-outs flow back through memory or the
        // environment, so a bare return suffices here.
        let exit_block = ir.add_block(body_fcn, "task.exit");
        ir.append_instr(exit_block, "", Opcode::Ret { value: None });

        ir.append_instr(entry, "", Opcode::Br { cond: None, targets: vec![body_header] });

        // Clone instructions.
        let mut instruction_clones: FxHashMap<InstrId, InstrId> = FxHashMap::default();
        let mut live_in_set: FxHashSet<ValueRef> = FxHashSet::default();
        for &b in &loop_blocks {
            let instrs = ir.block(b).instrs.clone();
            for orig in instrs {
                let name = ir.instr(orig).name.clone();
                let op = ir.instr(orig).op.clone();
                for operand in ir.instr(orig).operands() {
                    if let ValueRef::Instr(def) = operand {
                        if !lp.contains_instr(ir, def) {
                            live_in_set.insert(operand);
                        }
                    }
                }
                let clone = ir.append_instr(block_clones[&b], name, op);
                instruction_clones.insert(orig, clone);
            }
        }

        // Remap operands and control targets into the clone.
        let mut exit_edges = Vec::new();
        for (&orig_b, &clone_b) in &block_clones {
            let instrs = ir.block(clone_b).instrs.clone();
            for id in instrs {
                // Values defined inside the loop point at their clones.
                for operand in ir.instr(id).operands() {
                    if let ValueRef::Instr(def) = operand {
                        if let Some(&cloned_def) = instruction_clones.get(&def) {
                            ir.replace_use_in(id, operand, ValueRef::Instr(cloned_def));
                        }
                    }
                }
                // Control edges: intra-loop targets go to clones, exits to
                // the shared exit block.
                let retarget: Option<Vec<BlockId>> = match &ir.instr(id).op {
                    Opcode::Br { targets, .. } => Some(targets.clone()),
                    _ => None,
                };
                if let Some(targets) = retarget {
                    let mut new_targets = Vec::with_capacity(targets.len());
                    for (sn, t) in targets.iter().enumerate() {
                        if let Some(&ct) = block_clones.get(t) {
                            new_targets.push(ct);
                        } else {
                            new_targets.push(exit_block);
                            exit_edges.push((block_clones[&orig_b], sn));
                        }
                    }
                    if let Opcode::Br { targets, .. } = &mut ir.instrs[id.0 as usize].op {
                        *targets = new_targets;
                    }
                }
                // Phi predecessors likewise.
                if let Opcode::Phi { incoming } = &mut ir.instrs[id.0 as usize].op {
                    for (_, pred) in incoming.iter_mut() {
                        if let Some(&cp) = block_clones.get(pred) {
                            *pred = cp;
                        } else {
                            // Initial value arrives from the entry block.
                            *pred = entry;
                        }
                    }
                }
            }
        }
        exit_edges.sort();

        let mut live_ins: Vec<ValueRef> = live_in_set.into_iter().collect();
        live_ins.sort();

        Task {
            lp: lp.clone(),
            body_fcn,
            body_header,
            live_ins,
            live_outs: Vec::new(),
            instruction_clones,
            block_clones,
            exit_edges,
            chunk_size,
            num_workers,
        }
    }

    /// The clone of an instruction, or the instruction itself when it was
    /// not part of the outlined region.
    pub fn clone_of(&self, i: InstrId) -> InstrId {
        self.instruction_clones.get(&i).copied().unwrap_or(i)
    }

    /// Back edges within the outlined body.
    pub fn body_back_edges(&self, ir: &ModuleIr) -> Vec<(BlockId, usize)> {
        let mut out = Vec::new();
        for &clone_b in self.block_clones.values() {
            for (sn, succ) in ir.successors(clone_b).into_iter().enumerate() {
                if succ == self.body_header {
                    out.push((clone_b, sn));
                }
            }
        }
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// pre -> hdr { phi; add; br hdr|exit } -> exit
    fn loop_module() -> (ModuleIr, LoopRef) {
        let mut ir = ModuleIr::new();
        let f = ir.add_function("main", 0);
        let pre = ir.add_block(f, "pre");
        let hdr = ir.add_block(f, "hdr");
        let exit = ir.add_block(f, "exit");
        let outside = ir.append_instr(pre, "init", Opcode::Alloca { size: 8 });
        ir.append_instr(pre, "", Opcode::Br { cond: None, targets: vec![hdr] });
        let phi = ir.append_instr(
            hdr,
            "i",
            Opcode::Phi { incoming: vec![(ValueRef::Instr(outside), pre)] },
        );
        let add = ir.append_instr(
            hdr,
            "i.next",
            Opcode::Binary {
                op: crate::shared::models::BinOp::Add,
                lhs: ValueRef::Instr(phi),
                rhs: ValueRef::ConstInt(1),
            },
        );
        ir.append_instr(
            hdr,
            "br",
            Opcode::Br { cond: Some(ValueRef::Instr(add)), targets: vec![hdr, exit] },
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
        (ir, lp)
    }

    #[test]
    fn test_outline_clones_and_remaps() {
        let (mut ir, lp) = loop_module();
        let task = Task::outline(&mut ir, &lp, 4, 2);

        // Clone exists, in a new function.
        assert_ne!(task.body_fcn, lp.function);
        let hdr_clone = task.block_clones[&lp.header];
        assert_eq!(task.body_header, hdr_clone);

        // Intra-loop operand remapped: the cloned add reads the cloned phi.
        let orig_add = ir.function(lp.function).blocks[1];
        let orig_add = ir.block(orig_add).instrs[1];
        let cloned_add = task.instruction_clones[&orig_add];
        let ops = ir.instr(cloned_add).operands();
        assert!(ops.iter().all(|o| match o {
            ValueRef::Instr(i) => task.instruction_clones.values().any(|c| c == i),
            _ => true,
        }));

        // The back edge points at the cloned header; the exit edge at the
        // synthesized exit.
        assert_eq!(task.body_back_edges(&ir), vec![(hdr_clone, 0)]);
        assert_eq!(task.exit_edges.len(), 1);

        // The init value stays a live-in.
        assert_eq!(task.live_ins.len(), 1);
    }
}
