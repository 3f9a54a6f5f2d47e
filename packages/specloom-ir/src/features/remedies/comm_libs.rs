//! Commutative library calls.
//!
//! Calls to self-commutative functions (allocators, PRNGs) may reorder
//! against each other; dependences between two such calls, or across
//! iterations of a commutative caller, carry no program-visible order.

use super::remediator::{RemedResp, Remediator};
use super::remedy::Remedy;
use crate::features::pdg::DepDir;
use crate::shared::models::{InstrId, LoopRef, ModuleIr};
use tracing::debug;

const COMM_FUN_NAMES: &[&str] =
    &["malloc", "calloc", "realloc", "free", "xalloc", "rand", "random", "lrand48", "drand48"];

/// In the fixed set, or heuristically commutative by name.
fn is_commutative_name(name: &str) -> bool {
    COMM_FUN_NAMES.contains(&name) || name.contains("random") || name.contains("alloc")
}

#[derive(Default)]
pub struct CommutativeLibsRemediator {
    pub num_mem_removed: u64,
    pub num_reg_removed: u64,
}

impl CommutativeLibsRemediator {
    pub fn new() -> Self {
        Self::default()
    }

    fn containing_fcn_name<'a>(ir: &'a ModuleIr, instr: InstrId) -> &'a str {
        &ir.function(ir.function_of(instr)).name
    }

    /// The shared decision rule for memory and register queries.
    fn decide(
        &self,
        ir: &ModuleIr,
        src: InstrId,
        dst: InstrId,
        loop_carried: bool,
    ) -> Option<String> {
        let callee_src = ir.instr(src).callee();
        let callee_dst = ir.instr(dst).callee();

        // Reflexive: both endpoints call the same self-commutative function.
        if let (Some(a), Some(b)) = (callee_src, callee_dst) {
            if a == b && is_commutative_name(a) {
                return Some(a.to_string());
            }
        }

        if !loop_carried {
            return None;
        }

        // Cross-iteration: a call into a commutative function from within
        // it, or both endpoints inside the same commutative caller.
        let fcn_src = Self::containing_fcn_name(ir, src);
        let fcn_dst = Self::containing_fcn_name(ir, dst);

        if let Some(a) = callee_src {
            if a == fcn_dst && is_commutative_name(fcn_dst) {
                return Some(a.to_string());
            }
        }
        if let Some(b) = callee_dst {
            if b == fcn_src && is_commutative_name(fcn_src) {
                return Some(b.to_string());
            }
        }
        if fcn_src == fcn_dst && is_commutative_name(fcn_src) {
            return Some(fcn_src.to_string());
        }

        None
    }
}

impl Remediator for CommutativeLibsRemediator {
    fn name(&self) -> &'static str {
        "comm-libs-remediator"
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
        match self.decide(ir, src, dst, loop_carried) {
            Some(function_name) => {
                self.num_mem_removed += 1;
                debug!(%function_name, "removed mem dep via commutative library");
                RemedResp::no_dep(Remedy::CommutativeLibs { function_name })
            }
            None => RemedResp::dep(),
        }
    }

    fn regdep(
        &mut self,
        ir: &ModuleIr,
        src: InstrId,
        dst: InstrId,
        loop_carried: bool,
        _lp: &LoopRef,
    ) -> RemedResp {
        if !loop_carried {
            return RemedResp::dep();
        }
        match self.decide(ir, src, dst, true) {
            Some(function_name) => {
                self.num_reg_removed += 1;
                debug!(%function_name, "removed reg dep via commutative library");
                RemedResp::no_dep(Remedy::CommutativeLibs { function_name })
            }
            None => RemedResp::dep(),
        }
    }
}
