//! Pointer-residue disambiguation.
//!
//! Profiling records the distinct `addr mod 16` residues of each pointer.
//! If two accesses' residue footprints (widened by their access sizes,
//! corrected by constant offsets) never intersect, the accesses cannot
//! alias; the remedy inserts residue-check branches to validate the
//! assumption at run time.

use super::remediator::{RemedResp, Remediator};
use super::remedy::{Remedy, DEFAULT_PTR_RESIDUE_REMED_COST, RESIDUE_CHECK_COST};
use crate::features::context::{CtxId, FoldManager};
use crate::features::pdg::DepDir;
use crate::features::profile::ProfileInfo;
use crate::shared::models::{InstrId, LoopRef, ModuleIr, Opcode, ValueRef};
use tracing::debug;

/// Rotate left by N bits (mod 16).
fn rol_i16(bv: u16, n: u32) -> u16 {
    let n = n % 16;
    if n == 0 {
        bv
    } else {
        (bv << n) | (bv >> (16 - n))
    }
}

/// Signed rotation: positive rotates left, negative right.
fn rotate_i16(bv: u16, n: i64) -> u16 {
    let mut n = n % 16;
    if n < 0 {
        n += 16;
    }
    rol_i16(bv, n as u32)
}

/// Spread a residue bit-vector over the footprint of an access of the
/// given size.
pub fn widen(bv: u16, access_size_bytes: u32) -> u16 {
    let size = access_size_bytes.min(16);
    let mut accum: u16 = 0;
    for _ in 0..size {
        if accum == 0x0ffff {
            break;
        }
        accum = bv | rotate_i16(accum, 1);
    }
    accum
}

/// Do the two residue footprints intersect?
pub fn residues_overlap(
    bv1: u16,
    size1: u32,
    correction1: i64,
    bv2: u16,
    size2: u32,
    correction2: i64,
) -> bool {
    let adjusted1 = rotate_i16(bv1, correction1);
    let adjusted2 = rotate_i16(bv2, correction2);
    widen(adjusted1, size1) & widen(adjusted2, size2) != 0
}

/// Strip casts and constant-offset pointer arithmetic, accumulating the
/// byte correction.
pub fn adjust_pointer(ir: &ModuleIr, mut v: ValueRef, correction: &mut i64) -> ValueRef {
    loop {
        let ValueRef::Instr(id) = v else { return v };
        match &ir.instr(id).op {
            Opcode::Cast { value } => v = *value,
            Opcode::Gep { base, const_offset: Some(off) } => {
                *correction += off;
                v = *base;
            }
            _ => return v,
        }
    }
}

pub struct PtrResidueRemediator<'a> {
    fm: &'a FoldManager,
    profile: &'a ProfileInfo,
    /// Query context for the loop under consideration.
    ctx: CtxId,
    pub num_applicable: u64,
    pub num_no_mem_dep: u64,
}

impl<'a> PtrResidueRemediator<'a> {
    pub fn new(fm: &'a FoldManager, profile: &'a ProfileInfo, ctx: CtxId) -> Self {
        PtrResidueRemediator { fm, profile, ctx, num_applicable: 0, num_no_mem_dep: 0 }
    }

    /// May the two accesses alias? On `false`, reports the assumptions
    /// (base pointer + context) that speculation must validate.
    fn may_alias(
        &mut self,
        ir: &ModuleIr,
        p1: ValueRef,
        size1: u32,
        p2: ValueRef,
        size2: u32,
    ) -> Option<(ValueRef, ValueRef)> {
        if p1 == p2 {
            return None;
        }
        self.num_applicable += 1;

        let mut correction1 = 0i64;
        let ptr1 = adjust_pointer(ir, p1, &mut correction1);
        let mut correction2 = 0i64;
        let ptr2 = adjust_pointer(ir, p2, &mut correction2);

        let residual1 = self.profile.residue(self.fm, ptr1, self.ctx);
        if residual1 == 0 || residual1 == 0x0ffff {
            return None;
        }
        let residual2 = self.profile.residue(self.fm, ptr2, self.ctx);
        if residual2 == 0 || residual2 == 0x0ffff {
            return None;
        }

        if residues_overlap(residual1, size1, correction1, residual2, size2, correction2) {
            return None;
        }

        debug!(?ptr1, ?ptr2, "residue sets disjoint -> no alias");
        Some((ptr1, ptr2))
    }
}

impl Remediator for PtrResidueRemediator<'_> {
    fn name(&self) -> &'static str {
        "ptr-residue-remediator"
    }

    fn memdep(
        &mut self,
        ir: &ModuleIr,
        src: InstrId,
        dst: InstrId,
        _loop_carried: bool,
        _dir: DepDir,
        _lp: &LoopRef,
    ) -> RemedResp {
        let (Some(p1), Some(s1)) = (ir.instr(src).mem_operand(), ir.instr(src).access_size())
        else {
            return RemedResp::dep();
        };
        let (Some(p2), Some(s2)) = (ir.instr(dst).mem_operand(), ir.instr(dst).access_size())
        else {
            return RemedResp::dep();
        };

        match self.may_alias(ir, p1, s1, p2, s2) {
            Some((ptr1, ptr2)) => {
                self.num_no_mem_dep += 1;
                // One check branch per assumed pointer.
                let cost = DEFAULT_PTR_RESIDUE_REMED_COST + 2 * RESIDUE_CHECK_COST;
                RemedResp::no_dep(Remedy::PtrResidue {
                    ptr1,
                    ctx1: self.ctx,
                    ptr2,
                    ctx2: self.ctx,
                    cost,
                })
            }
            None => RemedResp::dep(),
        }
    }
}
