//! Loop descriptors.
//!
//! Loop discovery belongs to the host toolkit; the planner receives loops in
//! this already-analyzed form.

use super::ir::{BlockId, FcnId, InstrId, ModuleIr};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

/// A natural loop: header, optional preheader, member blocks, nesting depth
/// and the control edges that leave the loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopRef {
    pub function: FcnId,
    pub header: BlockId,
    pub preheader: Option<BlockId>,
    pub blocks: FxHashSet<BlockId>,
    pub depth: u32,
    /// (terminator block, successor index) pairs leaving the loop
    pub exit_edges: Vec<(BlockId, usize)>,
}

impl LoopRef {
    pub fn contains_block(&self, b: BlockId) -> bool {
        self.blocks.contains(&b)
    }

    pub fn contains_instr(&self, ir: &ModuleIr, i: InstrId) -> bool {
        self.blocks.contains(&ir.instr(i).block)
    }

    /// Back edges: (source block, successor index) pairs whose target is the
    /// header, sourced from inside the loop.
    pub fn back_edges(&self, ir: &ModuleIr) -> Vec<(BlockId, usize)> {
        let mut out = Vec::new();
        for &b in &self.blocks {
            for (sn, succ) in ir.successors(b).into_iter().enumerate() {
                if succ == self.header {
                    out.push((b, sn));
                }
            }
        }
        out.sort();
        out
    }

    /// All iteration-ending edges: back edges plus exit edges.
    pub fn iteration_bounds(&self, ir: &ModuleIr) -> Vec<(BlockId, usize)> {
        let mut out = self.back_edges(ir);
        out.extend(self.exit_edges.iter().copied());
        out.sort();
        out.dedup();
        out
    }

    pub fn num_exits(&self) -> usize {
        self.exit_edges.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::models::ir::{Opcode, ValueRef};

    #[test]
    fn test_back_and_exit_edges() {
        let mut m = ModuleIr::new();
        let f = m.add_function("f", 0);
        let pre = m.add_block(f, "pre");
        let header = m.add_block(f, "hdr");
        let body = m.add_block(f, "body");
        let exit = m.add_block(f, "exit");
        m.append_instr(pre, "", Opcode::Br { cond: None, targets: vec![header] });
        m.append_instr(
            header,
            "",
            Opcode::Br { cond: Some(ValueRef::ConstInt(1)), targets: vec![body, exit] },
        );
        m.append_instr(body, "", Opcode::Br { cond: None, targets: vec![header] });
        m.append_instr(exit, "", Opcode::Ret { value: None });

        let lp = LoopRef {
            function: f,
            header,
            preheader: Some(pre),
            blocks: [header, body].into_iter().collect(),
            depth: 1,
            exit_edges: vec![(header, 1)],
        };
        assert_eq!(lp.back_edges(&m), vec![(body, 0)]);
        let bounds = lp.iteration_bounds(&m);
        assert!(bounds.contains(&(body, 0)) && bounds.contains(&(header, 1)));
    }
}
