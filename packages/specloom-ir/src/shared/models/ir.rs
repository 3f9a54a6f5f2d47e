//! Module IR
//!
//! Arena-backed: instructions live in one module-wide vector so that
//! `InstrId` is a stable, cheap handle usable as a PDG node key. Blocks hold
//! ordered lists of instruction ids; mutation never invalidates ids
//! (deleted instructions are tombstoned).

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Function identifier (arena index)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FcnId(pub u32);

/// Basic-block identifier (arena index)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub u32);

/// Instruction identifier (arena index)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstrId(pub u32);

/// Global-variable identifier (arena index)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GlobalId(pub u32);

/// A reference to a value: an instruction result, a function argument,
/// a global, or a constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ValueRef {
    Instr(InstrId),
    Arg(FcnId, u32),
    Global(GlobalId),
    /// Address of a function, e.g. the outlined loop body passed to spawn.
    Fcn(FcnId),
    ConstInt(i64),
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    FAdd,
    FMul,
    And,
    Or,
    Xor,
    CmpEq,
    CmpLt,
}

/// Instruction opcodes.
///
/// Loads and stores carry the access size in bytes; calls carry the callee
/// name because dependence oracles key on it (TXIO functions, commutative
/// library functions, allocators).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Opcode {
    /// SSA merge: (incoming value, predecessor block) pairs
    Phi { incoming: Vec<(ValueRef, BlockId)> },
    Load { ptr: ValueRef, size: u32 },
    Store { ptr: ValueRef, value: ValueRef, size: u32 },
    /// Stack allocation of `size` bytes
    Alloca { size: u64 },
    Call { callee: String, args: Vec<ValueRef>, noreturn: bool },
    /// Conditional or unconditional branch; `targets` has one entry per
    /// successor (two for a conditional, n for a switch)
    Br { cond: Option<ValueRef>, targets: Vec<BlockId> },
    Ret { value: Option<ValueRef> },
    Binary { op: BinOp, lhs: ValueRef, rhs: ValueRef },
    /// Pointer arithmetic with an optionally-constant byte offset
    Gep { base: ValueRef, const_offset: Option<i64> },
    Cast { value: ValueRef },
    Unreachable,
    /// Tombstone left behind by deletion; never executed, never referenced
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instr {
    pub id: InstrId,
    pub name: String,
    pub block: BlockId,
    pub op: Opcode,
}

impl Instr {
    pub fn is_terminator(&self) -> bool {
        matches!(self.op, Opcode::Br { .. } | Opcode::Ret { .. } | Opcode::Unreachable)
    }

    pub fn is_phi(&self) -> bool {
        matches!(self.op, Opcode::Phi { .. })
    }

    pub fn is_store(&self) -> bool {
        matches!(self.op, Opcode::Store { .. })
    }

    pub fn may_write_to_memory(&self) -> bool {
        match &self.op {
            Opcode::Store { .. } => true,
            Opcode::Call { callee, .. } => !is_readonly_callee(callee),
            _ => false,
        }
    }

    /// The callee name, if this is a call.
    pub fn callee(&self) -> Option<&str> {
        match &self.op {
            Opcode::Call { callee, .. } => Some(callee.as_str()),
            _ => None,
        }
    }

    /// The pointer operand of a load or store.
    pub fn mem_operand(&self) -> Option<ValueRef> {
        match &self.op {
            Opcode::Load { ptr, .. } => Some(*ptr),
            Opcode::Store { ptr, .. } => Some(*ptr),
            _ => None,
        }
    }

    /// Access size in bytes for a load or store.
    pub fn access_size(&self) -> Option<u32> {
        match &self.op {
            Opcode::Load { size, .. } => Some(*size),
            Opcode::Store { size, .. } => Some(*size),
            _ => None,
        }
    }

    /// Every value this instruction reads.
    pub fn operands(&self) -> Vec<ValueRef> {
        match &self.op {
            Opcode::Phi { incoming } => incoming.iter().map(|(v, _)| *v).collect(),
            Opcode::Load { ptr, .. } => vec![*ptr],
            Opcode::Store { ptr, value, .. } => vec![*ptr, *value],
            Opcode::Alloca { .. } => vec![],
            Opcode::Call { args, .. } => args.clone(),
            Opcode::Br { cond, .. } => cond.iter().copied().collect(),
            Opcode::Ret { value } => value.iter().copied().collect(),
            Opcode::Binary { lhs, rhs, .. } => vec![*lhs, *rhs],
            Opcode::Gep { base, .. } => vec![*base],
            Opcode::Cast { value } => vec![*value],
            Opcode::Unreachable | Opcode::Deleted => vec![],
        }
    }

    fn replace_value(&mut self, from: ValueRef, to: ValueRef) {
        let repl = |v: &mut ValueRef| {
            if *v == from {
                *v = to;
            }
        };
        match &mut self.op {
            Opcode::Phi { incoming } => incoming.iter_mut().for_each(|(v, _)| repl(v)),
            Opcode::Load { ptr, .. } => repl(ptr),
            Opcode::Store { ptr, value, .. } => {
                repl(ptr);
                repl(value);
            }
            Opcode::Call { args, .. } => args.iter_mut().for_each(repl),
            Opcode::Br { cond, .. } => {
                if let Some(c) = cond {
                    repl(c)
                }
            }
            Opcode::Ret { value } => {
                if let Some(v) = value {
                    repl(v)
                }
            }
            Opcode::Binary { lhs, rhs, .. } => {
                repl(lhs);
                repl(rhs);
            }
            Opcode::Gep { base, .. } => repl(base),
            Opcode::Cast { value } => repl(value),
            Opcode::Alloca { .. } | Opcode::Unreachable | Opcode::Deleted => {}
        }
    }
}

/// Callees with no memory side effects that the oracles care about.
fn is_readonly_callee(name: &str) -> bool {
    matches!(name, "sqrt" | "fabs" | "sin" | "cos" | "strlen" | "strcmp")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockIr {
    pub id: BlockId,
    pub name: String,
    pub function: FcnId,
    pub instrs: Vec<InstrId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionIr {
    pub id: FcnId,
    pub name: String,
    pub num_args: u32,
    pub blocks: Vec<BlockId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalVar {
    pub id: GlobalId,
    pub name: String,
    pub size: u64,
    pub is_constant: bool,
    pub has_nonzero_initializer: bool,
    pub external_linkage: bool,
}

/// The module: arenas for functions, blocks, instructions and globals.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModuleIr {
    pub functions: Vec<FunctionIr>,
    pub blocks: Vec<BlockIr>,
    pub instrs: Vec<Instr>,
    pub globals: Vec<GlobalVar>,
    #[serde(skip)]
    fcn_by_name: FxHashMap<String, FcnId>,
}

impl ModuleIr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_function(&mut self, name: impl Into<String>, num_args: u32) -> FcnId {
        let id = FcnId(self.functions.len() as u32);
        let name = name.into();
        self.fcn_by_name.insert(name.clone(), id);
        self.functions.push(FunctionIr { id, name, num_args, blocks: Vec::new() });
        id
    }

    pub fn add_block(&mut self, fcn: FcnId, name: impl Into<String>) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BlockIr { id, name: name.into(), function: fcn, instrs: Vec::new() });
        self.functions[fcn.0 as usize].blocks.push(id);
        id
    }

    pub fn add_global(
        &mut self,
        name: impl Into<String>,
        size: u64,
        is_constant: bool,
        has_nonzero_initializer: bool,
    ) -> GlobalId {
        let id = GlobalId(self.globals.len() as u32);
        self.globals.push(GlobalVar {
            id,
            name: name.into(),
            size,
            is_constant,
            has_nonzero_initializer,
            external_linkage: false,
        });
        id
    }

    fn new_instr(&mut self, block: BlockId, name: impl Into<String>, op: Opcode) -> InstrId {
        let id = InstrId(self.instrs.len() as u32);
        self.instrs.push(Instr { id, name: name.into(), block, op });
        id
    }

    /// Append an instruction to the end of a block.
    pub fn append_instr(&mut self, block: BlockId, name: impl Into<String>, op: Opcode) -> InstrId {
        let id = self.new_instr(block, name, op);
        self.blocks[block.0 as usize].instrs.push(id);
        id
    }

    /// Insert an instruction at the first insertion point of a block
    /// (after any leading phis).
    pub fn insert_at_top(&mut self, block: BlockId, name: impl Into<String>, op: Opcode) -> InstrId {
        let id = self.new_instr(block, name, op);
        let pos = self.blocks[block.0 as usize]
            .instrs
            .iter()
            .position(|i| !self.instrs[i.0 as usize].is_phi())
            .unwrap_or(self.blocks[block.0 as usize].instrs.len());
        self.blocks[block.0 as usize].instrs.insert(pos, id);
        id
    }

    /// Insert an instruction immediately before `before` in its block.
    pub fn insert_before(
        &mut self,
        before: InstrId,
        name: impl Into<String>,
        op: Opcode,
    ) -> InstrId {
        let block = self.instrs[before.0 as usize].block;
        let id = self.new_instr(block, name, op);
        let pos = self.blocks[block.0 as usize]
            .instrs
            .iter()
            .position(|&i| i == before)
            .expect("instruction not in its own block");
        self.blocks[block.0 as usize].instrs.insert(pos, id);
        id
    }

    /// Insert an instruction immediately after `after` in its block.
    pub fn insert_after(&mut self, after: InstrId, name: impl Into<String>, op: Opcode) -> InstrId {
        let block = self.instrs[after.0 as usize].block;
        let id = self.new_instr(block, name, op);
        let pos = self.blocks[block.0 as usize]
            .instrs
            .iter()
            .position(|&i| i == after)
            .expect("instruction not in its own block");
        self.blocks[block.0 as usize].instrs.insert(pos + 1, id);
        id
    }

    /// Tombstone an instruction, detaching it from its block.
    pub fn delete_instr(&mut self, id: InstrId) {
        let block = self.instrs[id.0 as usize].block;
        self.blocks[block.0 as usize].instrs.retain(|&i| i != id);
        self.instrs[id.0 as usize].op = Opcode::Deleted;
    }

    /// Replace an instruction's opcode in place, keeping its id and position.
    pub fn replace_opcode(&mut self, id: InstrId, op: Opcode) {
        self.instrs[id.0 as usize].op = op;
    }

    /// Rewrite every use of `from` to `to` across the whole module.
    pub fn replace_all_uses(&mut self, from: ValueRef, to: ValueRef) {
        for instr in &mut self.instrs {
            instr.replace_value(from, to);
        }
    }

    /// Rewrite uses of `from` within a single instruction.
    pub fn replace_use_in(&mut self, instr: InstrId, from: ValueRef, to: ValueRef) {
        self.instrs[instr.0 as usize].replace_value(from, to);
    }

    pub fn instr(&self, id: InstrId) -> &Instr {
        &self.instrs[id.0 as usize]
    }

    pub fn block(&self, id: BlockId) -> &BlockIr {
        &self.blocks[id.0 as usize]
    }

    pub fn function(&self, id: FcnId) -> &FunctionIr {
        &self.functions[id.0 as usize]
    }

    pub fn global(&self, id: GlobalId) -> &GlobalVar {
        &self.globals[id.0 as usize]
    }

    pub fn function_by_name(&self, name: &str) -> Option<FcnId> {
        self.fcn_by_name.get(name).copied().or_else(|| {
            // The map is skipped by serde; fall back to a scan.
            self.functions.iter().find(|f| f.name == name).map(|f| f.id)
        })
    }

    /// The function an instruction belongs to.
    pub fn function_of(&self, instr: InstrId) -> FcnId {
        self.block(self.instr(instr).block).function
    }

    /// The terminator of a block, if the block is terminated.
    pub fn terminator(&self, block: BlockId) -> Option<InstrId> {
        self.block(block)
            .instrs
            .last()
            .copied()
            .filter(|&i| self.instr(i).is_terminator())
    }

    /// Successor blocks of a block.
    pub fn successors(&self, block: BlockId) -> Vec<BlockId> {
        match self.terminator(block) {
            Some(t) => match &self.instr(t).op {
                Opcode::Br { targets, .. } => targets.clone(),
                _ => vec![],
            },
            None => vec![],
        }
    }

    /// Redirect the `succ_index`-th successor of `block`'s terminator.
    pub fn redirect_successor(&mut self, block: BlockId, succ_index: usize, to: BlockId) {
        let term = self.terminator(block).expect("block has no terminator");
        if let Opcode::Br { targets, .. } = &mut self.instrs[term.0 as usize].op {
            targets[succ_index] = to;
        }
    }

    /// Update phi nodes in `block` that name `old_pred` as predecessor to
    /// name `new_pred` instead.
    pub fn retarget_phis(&mut self, block: BlockId, old_pred: BlockId, new_pred: BlockId) {
        let instrs = self.block(block).instrs.clone();
        for id in instrs {
            let instr = &mut self.instrs[id.0 as usize];
            if let Opcode::Phi { incoming } = &mut instr.op {
                for (_, pred) in incoming.iter_mut() {
                    if *pred == old_pred {
                        *pred = new_pred;
                    }
                }
            } else {
                break;
            }
        }
    }

    /// Blocks that exit a function: return blocks, plus blocks whose
    /// terminator is unreachable preceded by a noreturn call.
    pub fn exit_blocks(&self, fcn: FcnId) -> Vec<BlockId> {
        let mut out = Vec::new();
        for &bid in &self.function(fcn).blocks {
            let block = self.block(bid);
            let Some(&last) = block.instrs.last() else { continue };
            match &self.instr(last).op {
                Opcode::Ret { .. } => out.push(bid),
                Opcode::Unreachable => {
                    if block.instrs.len() >= 2 {
                        let prev = self.instr(block.instrs[block.instrs.len() - 2]);
                        if matches!(&prev.op, Opcode::Call { noreturn: true, .. }) {
                            out.push(bid);
                        }
                    }
                }
                _ => {}
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_module() -> (ModuleIr, FcnId, BlockId) {
        let mut m = ModuleIr::new();
        let f = m.add_function("main", 0);
        let b = m.add_block(f, "entry");
        (m, f, b)
    }

    #[test]
    fn test_append_and_lookup() {
        let (mut m, f, b) = tiny_module();
        let i = m.append_instr(b, "x", Opcode::Alloca { size: 8 });
        assert_eq!(m.instr(i).name, "x");
        assert_eq!(m.function_of(i), f);
        assert_eq!(m.block(b).instrs, vec![i]);
    }

    #[test]
    fn test_insert_at_top_skips_phis() {
        let (mut m, _, b) = tiny_module();
        let phi = m.append_instr(b, "p", Opcode::Phi { incoming: vec![] });
        let add = m.append_instr(
            b,
            "a",
            Opcode::Binary { op: BinOp::Add, lhs: ValueRef::ConstInt(1), rhs: ValueRef::ConstInt(2) },
        );
        let top = m.insert_at_top(b, "t", Opcode::Call { callee: "f".into(), args: vec![], noreturn: false });
        assert_eq!(m.block(b).instrs, vec![phi, top, add]);
    }

    #[test]
    fn test_replace_all_uses() {
        let (mut m, _, b) = tiny_module();
        let g = m.add_global("gv", 4, false, true);
        let ld = m.append_instr(b, "v", Opcode::Load { ptr: ValueRef::Global(g), size: 4 });
        let slot = m.append_instr(b, "slot", Opcode::Alloca { size: 8 });
        m.replace_all_uses(ValueRef::Global(g), ValueRef::Instr(slot));
        assert_eq!(m.instr(ld).mem_operand(), Some(ValueRef::Instr(slot)));
    }

    #[test]
    fn test_exit_blocks_noreturn() {
        let (mut m, f, b) = tiny_module();
        m.append_instr(b, "", Opcode::Call { callee: "exit".into(), args: vec![], noreturn: true });
        m.append_instr(b, "", Opcode::Unreachable);
        let b2 = m.add_block(f, "ret");
        m.append_instr(b2, "", Opcode::Ret { value: None });
        let exits = m.exit_blocks(f);
        assert!(exits.contains(&b));
        assert!(exits.contains(&b2));
    }

    #[test]
    fn test_delete_tombstones() {
        let (mut m, _, b) = tiny_module();
        let i = m.append_instr(b, "x", Opcode::Alloca { size: 8 });
        m.delete_instr(i);
        assert!(m.block(b).instrs.is_empty());
        assert_eq!(m.instr(i).op, Opcode::Deleted);
    }
}
