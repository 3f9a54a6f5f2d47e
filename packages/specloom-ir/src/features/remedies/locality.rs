//! Separation speculation: dependences between accesses that land in
//! different heap families (or iteration-private families) are discharged,
//! validated at run time by unclassified-object checks and private-access
//! guards.

use super::ptr_residue::adjust_pointer;
use super::remediator::{RemedResp, Remediator};
use super::remedy::{
    LocalityKind, Remedy, DEFAULT_LOCALITY_REMED_COST, KILLPRIV_ACCESS_COST, LOCAL_ACCESS_COST,
    PRIVATE_ACCESS_COST, SHAREPRIV_ACCESS_COST,
};
use crate::features::classify::{HeapAssignment, HeapKind};
use crate::features::context::{CtxId, FoldManager};
use crate::features::pdg::DepDir;
use crate::features::profile::ProfileInfo;
use crate::shared::models::{InstrId, LoopRef, ModuleIr, ValueRef};
use rustc_hash::FxHashSet;
use tracing::debug;

pub struct LocalityRemediator<'a> {
    fm: &'a FoldManager,
    profile: &'a ProfileInfo,
    asgn: &'a HeapAssignment,
    ctx: CtxId,
    /// Memory accesses already guarded as private; re-used rather than
    /// guarded twice.
    private_insts: FxHashSet<InstrId>,
    /// Pointers seen resolving to an unclassified heap (reported once).
    unclassified_ptrs: FxHashSet<ValueRef>,
    pub num_privatized: u64,
    pub num_separated: u64,
    pub num_subheap_separated: u64,
}

impl<'a> LocalityRemediator<'a> {
    pub fn new(
        fm: &'a FoldManager,
        profile: &'a ProfileInfo,
        asgn: &'a HeapAssignment,
        ctx: CtxId,
    ) -> Self {
        LocalityRemediator {
            fm,
            profile,
            asgn,
            ctx,
            private_insts: FxHashSet::default(),
            unclassified_ptrs: FxHashSet::default(),
            num_privatized: 0,
            num_separated: 0,
            num_subheap_separated: 0,
        }
    }

    fn classify_operand(
        &mut self,
        ir: &ModuleIr,
        instr: InstrId,
    ) -> Option<(ValueRef, HeapKind, Option<u8>)> {
        let raw = ir.instr(instr).mem_operand()?;
        let mut correction = 0i64;
        let ptr = adjust_pointer(ir, raw, &mut correction);
        let aus = self.profile.underlying_aus(self.fm, ptr, self.ctx)?;
        let kind = self.asgn.classify(aus);
        let subheap = self.asgn.subheap(aus);
        if kind == HeapKind::Unclassified && self.unclassified_ptrs.insert(ptr) {
            debug!(?ptr, "pointer resolves to unclassified heap");
        }
        Some((ptr, kind, subheap))
    }

    fn locality_remedy(kind: LocalityKind, cost: u64) -> Remedy {
        Remedy::Locality {
            kind,
            ptr: None,
            ptr2: None,
            private_instr: None,
            redux_store: None,
            cost,
        }
    }

    /// Iteration-private families kill cross-iteration flows outright.
    fn private_family_remedy(
        &mut self,
        ir: &ModuleIr,
        kind: HeapKind,
        instr: InstrId,
        ptr: ValueRef,
    ) -> Option<Remedy> {
        let (lk, cost) = match kind {
            HeapKind::Local => {
                (LocalityKind::Local, DEFAULT_LOCALITY_REMED_COST + LOCAL_ACCESS_COST)
            }
            HeapKind::KillPrivate => {
                (LocalityKind::KillPrivate, DEFAULT_LOCALITY_REMED_COST + KILLPRIV_ACCESS_COST)
            }
            HeapKind::SharePrivate => {
                (LocalityKind::SharePrivate, DEFAULT_LOCALITY_REMED_COST + SHAREPRIV_ACCESS_COST)
            }
            HeapKind::Redux => (LocalityKind::Redux, DEFAULT_LOCALITY_REMED_COST),
            _ => return None,
        };
        self.num_privatized += 1;
        let redux_store = if lk == LocalityKind::Redux && ir.instr(instr).is_store() {
            Some(instr)
        } else {
            None
        };
        Some(Remedy::Locality {
            kind: lk,
            ptr: Some(ptr),
            ptr2: None,
            private_instr: None,
            redux_store,
            cost,
        })
    }
}

impl Remediator for LocalityRemediator<'_> {
    fn name(&self) -> &'static str {
        "locality-remediator"
    }

    fn memdep(
        &mut self,
        ir: &ModuleIr,
        src: InstrId,
        dst: InstrId,
        loop_carried: bool,
        _dir: DepDir,
        lp: &LoopRef,
    ) -> RemedResp {
        if !self.asgn.is_valid_for(lp.header) {
            return RemedResp::dep();
        }

        let c1 = self.classify_operand(ir, src);
        let c2 = self.classify_operand(ir, dst);
        let (Some((ptr1, t1, sh1)), Some((ptr2, t2, sh2))) = (c1, c2) else {
            return RemedResp::dep();
        };

        // Cross-iteration queries: iteration-private families cannot carry
        // flows between iterations.
        if loop_carried {
            if let Some(remedy) = self.private_family_remedy(ir, t1, src, ptr1) {
                return RemedResp::no_dep(remedy);
            }
            if let Some(remedy) = self.private_family_remedy(ir, t2, dst, ptr2) {
                return RemedResp::no_dep(remedy);
            }
        }

        // Any query: distinct families never alias.
        if t1 != t2 && t1 != HeapKind::Unclassified && t2 != HeapKind::Unclassified {
            self.num_separated += 1;
            let mut remedy = Self::locality_remedy(
                LocalityKind::Separated,
                DEFAULT_LOCALITY_REMED_COST,
            );
            if let Remedy::Locality { ptr, ptr2: p2, .. } = &mut remedy {
                *ptr = Some(ptr1);
                *p2 = Some(ptr2);
            }
            return RemedResp::no_dep(remedy);
        }

        // Cross-iteration into the private family: guarded accesses.
        if loop_carried {
            if t1 == HeapKind::Private && !self.private_insts.contains(&dst) {
                self.num_privatized += 1;
                self.private_insts.insert(src);
                return RemedResp::no_dep(Remedy::Locality {
                    kind: LocalityKind::Private,
                    ptr: Some(ptr1),
                    ptr2: None,
                    private_instr: Some(src),
                    redux_store: None,
                    cost: DEFAULT_LOCALITY_REMED_COST + PRIVATE_ACCESS_COST,
                });
            }
            if t2 == HeapKind::Private {
                self.num_privatized += 1;
                self.private_insts.insert(dst);
                return RemedResp::no_dep(Remedy::Locality {
                    kind: LocalityKind::Private,
                    ptr: Some(ptr2),
                    ptr2: None,
                    private_instr: Some(dst),
                    redux_store: None,
                    cost: DEFAULT_LOCALITY_REMED_COST + PRIVATE_ACCESS_COST,
                });
            }
        }

        // Same family: are they in provably different sub-heaps?
        if t1 == t2 && t1 != HeapKind::Unclassified {
            if let (Some(s1), Some(s2)) = (sh1, sh2) {
                if s1 > 0 && s2 > 0 && s1 != s2 {
                    self.num_subheap_separated += 1;
                    let mut remedy = Self::locality_remedy(
                        LocalityKind::Subheaps,
                        DEFAULT_LOCALITY_REMED_COST,
                    );
                    if let Remedy::Locality { ptr, ptr2: p2, .. } = &mut remedy {
                        *ptr = Some(ptr1);
                        *p2 = Some(ptr2);
                    }
                    return RemedResp::no_dep(remedy);
                }
            }
        }

        RemedResp::dep()
    }
}
