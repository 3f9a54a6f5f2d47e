//! Ports: the semantic-action interface the parser drives, and the
//! queryable profile results the oracles consume.

use crate::features::context::{AuId, CtxId, CtxStep, FoldManager, Int, Ptr};
use crate::shared::models::{LoopRef, ModuleIr, ValueRef};
use rustc_hash::{FxHashMap, FxHashSet};

/// Callbacks generated while parsing a profile. Clients implement this and
/// receive records already resolved into fold-manager terms.
pub trait SemanticAction {
    fn fold_ctx(&mut self, step: CtxStep, parent: Option<CtxId>) -> CtxId;
    fn fold_au(&mut self, kind: crate::features::context::AuKind, ctx: Option<CtxId>) -> AuId;

    fn sem_complete_allocation_info(&mut self, complete: bool, fcn: Option<&str>) -> bool;
    fn sem_local_object(&mut self, au: AuId, ctx: CtxId) -> bool;
    fn sem_escape_object(&mut self, au: AuId, ctx: CtxId, count: u64) -> bool;
    fn sem_obj_predict(&mut self, value: ValueRef, ctx: CtxId, ptrs: Vec<Ptr>) -> bool;
    fn sem_val_predict(&mut self, value: ValueRef, observed: u64) -> bool;
    fn sem_int_predict(&mut self, value: ValueRef, ctx: CtxId, ints: Vec<Int>) -> bool;
    fn sem_pointer_residual(&mut self, value: ValueRef, ctx: CtxId, bits: u16, samples: u64)
        -> bool;

    fn sem_set_valid(&mut self, valid: bool);
}

/// Parsed profile results, queryable by the remediators.
#[derive(Debug, Default, Clone)]
pub struct ProfileInfo {
    pub valid: bool,
    pub complete_allocation_info: bool,
    pub incomplete_fcns: Vec<String>,

    pub local_aus: FxHashSet<AuId>,
    pub local_contexts: FxHashMap<AuId, Vec<CtxId>>,
    pub escape_counts: FxHashMap<(AuId, CtxId), u64>,

    pub underlying_objects: FxHashMap<(ValueRef, CtxId), Vec<Ptr>>,
    pub int_predictions: FxHashMap<(ValueRef, CtxId), Vec<Int>>,
    pub value_predictions: FxHashMap<ValueRef, u64>,
    /// residue bits plus sample count
    pub residues: FxHashMap<(ValueRef, CtxId), (u16, u64)>,
}

impl ProfileInfo {
    /// The canonical query context for a loop: LOOP within FUNCTION within
    /// TOP.
    pub fn loop_ctx(fm: &mut FoldManager, ir: &ModuleIr, lp: &LoopRef) -> CtxId {
        let top = fm.top();
        let fcn_ctx = fm.fold_ctx(CtxStep::Fcn { fcn: lp.function }, Some(top));
        let _ = ir;
        fm.fold_ctx(
            CtxStep::Loop { fcn: lp.function, header: lp.header, depth: lp.depth },
            Some(fcn_ctx),
        )
    }

    /// Underlying AUs observed for `value` in a context matching `ctx`.
    pub fn underlying_aus(&self, fm: &FoldManager, value: ValueRef, ctx: CtxId) -> Option<&[Ptr]> {
        if let Some(ptrs) = self.underlying_objects.get(&(value, ctx)) {
            return Some(ptrs);
        }
        for ((v, c), ptrs) in &self.underlying_objects {
            if *v == value && (fm.matches(*c, ctx) || fm.matches(ctx, *c)) {
                return Some(ptrs);
            }
        }
        None
    }

    /// Residue bits for `value` in a context matching `ctx`; 0 = no info.
    pub fn residue(&self, fm: &FoldManager, value: ValueRef, ctx: CtxId) -> u16 {
        if let Some(&(bits, _)) = self.residues.get(&(value, ctx)) {
            return bits;
        }
        for ((v, c), &(bits, _)) in &self.residues {
            if *v == value && (fm.matches(*c, ctx) || fm.matches(ctx, *c)) {
                return bits;
            }
        }
        0
    }

    pub fn is_local_au(&self, au: AuId) -> bool {
        self.local_aus.contains(&au)
    }

    /// Is every AU of the set classified local?
    pub fn all_local(&self, ptrs: &[Ptr]) -> bool {
        !ptrs.is_empty() && ptrs.iter().all(|p| self.local_aus.contains(&p.au))
    }
}

/// Standard `SemanticAction` implementor that accumulates a `ProfileInfo`.
pub struct ProfileInfoBuilder<'fm> {
    fm: &'fm mut FoldManager,
    pub info: ProfileInfo,
}

impl<'fm> ProfileInfoBuilder<'fm> {
    pub fn new(fm: &'fm mut FoldManager) -> Self {
        ProfileInfoBuilder { fm, info: ProfileInfo::default() }
    }

    pub fn finish(self) -> ProfileInfo {
        self.info
    }
}

impl SemanticAction for ProfileInfoBuilder<'_> {
    fn fold_ctx(&mut self, step: CtxStep, parent: Option<CtxId>) -> CtxId {
        self.fm.fold_ctx(step, parent)
    }

    fn fold_au(&mut self, kind: crate::features::context::AuKind, ctx: Option<CtxId>) -> AuId {
        self.fm.fold_au(kind, ctx)
    }

    fn sem_complete_allocation_info(&mut self, complete: bool, fcn: Option<&str>) -> bool {
        if complete {
            self.info.complete_allocation_info = true;
        } else if let Some(f) = fcn {
            self.info.incomplete_fcns.push(f.to_string());
        }
        true
    }

    fn sem_local_object(&mut self, au: AuId, ctx: CtxId) -> bool {
        self.info.local_aus.insert(au);
        self.info.local_contexts.entry(au).or_default().push(ctx);
        true
    }

    fn sem_escape_object(&mut self, au: AuId, ctx: CtxId, count: u64) -> bool {
        *self.info.escape_counts.entry((au, ctx)).or_insert(0) += count;
        true
    }

    fn sem_obj_predict(&mut self, value: ValueRef, ctx: CtxId, ptrs: Vec<Ptr>) -> bool {
        self.info.underlying_objects.insert((value, ctx), ptrs);
        true
    }

    fn sem_val_predict(&mut self, value: ValueRef, observed: u64) -> bool {
        self.info.value_predictions.insert(value, observed);
        true
    }

    fn sem_int_predict(&mut self, value: ValueRef, ctx: CtxId, ints: Vec<Int>) -> bool {
        self.info.int_predictions.insert((value, ctx), ints);
        true
    }

    fn sem_pointer_residual(
        &mut self,
        value: ValueRef,
        ctx: CtxId,
        bits: u16,
        samples: u64,
    ) -> bool {
        self.info.residues.insert((value, ctx), (bits, samples));
        true
    }

    fn sem_set_valid(&mut self, valid: bool) {
        self.info.valid = valid;
    }
}
