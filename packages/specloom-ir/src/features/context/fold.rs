//! The fold manager: canonicalization and clone/inline bookkeeping.
//!
//! Contexts and AUs live in append-only arenas for the process lifetime.
//! Folding is a hash-table lookup keyed on the structural tuple; two
//! structurally equal values always resolve to the same id.

use super::domain::{AuId, AuKind, CtxId, CtxStep};
use crate::shared::models::{BlockId, FcnId, InstrId, ModuleIr};
use rustc_hash::FxHashMap;
use std::cmp::Ordering;

pub type CtxToCtxMap = FxHashMap<CtxId, CtxId>;
pub type AuToAuMap = FxHashMap<AuId, AuId>;

/// Correspondence between original and duplicated IR entities, produced by
/// function cloning or inlining in the host toolkit.
#[derive(Debug, Clone, Default)]
pub struct ValueMap {
    pub fcns: FxHashMap<FcnId, FcnId>,
    pub blocks: FxHashMap<BlockId, BlockId>,
    pub instrs: FxHashMap<InstrId, InstrId>,
}

#[derive(Debug, Clone)]
struct CtxNode {
    step: CtxStep,
    parent: Option<CtxId>,
}

#[derive(Debug, Clone)]
struct AuNode {
    kind: AuKind,
    ctx: Option<CtxId>,
}

pub struct FoldManager {
    ctxs: Vec<CtxNode>,
    ctx_table: FxHashMap<(CtxStep, Option<CtxId>), CtxId>,
    aus: Vec<AuNode>,
    au_table: FxHashMap<(AuKind, Option<CtxId>), AuId>,
    /// AUs in creation order, for deterministic sweeps.
    all_aus: Vec<AuId>,
    top: CtxId,
}

impl FoldManager {
    pub fn new() -> Self {
        let mut fm = FoldManager {
            ctxs: Vec::new(),
            ctx_table: FxHashMap::default(),
            aus: Vec::new(),
            au_table: FxHashMap::default(),
            all_aus: Vec::new(),
            top: CtxId(0),
        };
        fm.top = fm.fold_ctx(CtxStep::Top, None);
        fm
    }

    /// The synthetic outermost context.
    pub fn top(&self) -> CtxId {
        self.top
    }

    /// Canonicalize a context.
    pub fn fold_ctx(&mut self, step: CtxStep, parent: Option<CtxId>) -> CtxId {
        if let Some(&id) = self.ctx_table.get(&(step, parent)) {
            return id;
        }
        let id = CtxId(self.ctxs.len() as u32);
        self.ctxs.push(CtxNode { step, parent });
        self.ctx_table.insert((step, parent), id);
        id
    }

    /// Canonicalize an AU. The context participates in the fold key only for
    /// stack and heap AUs, mirroring how equality is defined.
    pub fn fold_au(&mut self, kind: AuKind, ctx: Option<CtxId>) -> AuId {
        let key_ctx = if kind.is_dynamic() { ctx } else { None };
        if let Some(&id) = self.au_table.get(&(kind, key_ctx)) {
            return id;
        }
        let id = AuId(self.aus.len() as u32);
        self.aus.push(AuNode { kind, ctx });
        self.au_table.insert((kind, key_ctx), id);
        self.all_aus.push(id);
        id
    }

    pub fn ctx_step(&self, id: CtxId) -> CtxStep {
        self.ctxs[id.0 as usize].step
    }

    pub fn ctx_parent(&self, id: CtxId) -> Option<CtxId> {
        self.ctxs[id.0 as usize].parent
    }

    pub fn au_kind(&self, id: AuId) -> AuKind {
        self.aus[id.0 as usize].kind
    }

    pub fn au_ctx(&self, id: AuId) -> Option<CtxId> {
        self.aus[id.0 as usize].ctx
    }

    pub fn all_aus(&self) -> &[AuId] {
        &self.all_aus
    }

    pub fn num_ctxs(&self) -> usize {
        self.ctxs.len()
    }

    /// The function owning the innermost step, if any.
    pub fn fcn_of(&self, id: CtxId) -> Option<FcnId> {
        self.ctx_step(id).fcn()
    }

    /// The innermost function invocation containing this context.
    pub fn fcn_context(&self, id: CtxId) -> Option<CtxId> {
        let mut cur = Some(id);
        while let Some(c) = cur {
            match self.ctx_step(c) {
                CtxStep::Top => return None,
                CtxStep::Fcn { .. } => return Some(c),
                CtxStep::Loop { .. } => cur = self.ctx_parent(c),
            }
        }
        None
    }

    fn chain(&self, id: CtxId) -> Vec<CtxId> {
        let mut out = Vec::new();
        let mut cur = Some(id);
        while let Some(c) = cur {
            out.push(c);
            cur = self.ctx_parent(c);
        }
        out
    }

    /// Loose match: every step of `b` occurs in `a`, in order, allowing
    /// gaps. Reflexive and transitive.
    pub fn matches(&self, a: CtxId, b: CtxId) -> bool {
        let chain_a = self.chain(a);
        for start in 0..chain_a.len() {
            if !self.ctx_step(chain_a[start]).step_equal(&self.ctx_step(b)) {
                continue;
            }
            // Walk both chains from here; 'a' may skip steps, 'b' may not.
            let mut j = Some(chain_a[start]);
            let mut k = Some(b);
            while let (Some(cj), Some(ck)) = (j, k) {
                if self.ctx_step(cj).step_equal(&self.ctx_step(ck)) {
                    j = self.ctx_parent(cj);
                    k = self.ctx_parent(ck);
                } else {
                    j = self.ctx_parent(cj);
                }
            }
            if k.is_none() {
                return true;
            }
        }
        false
    }

    /// Assuming `a` matches `b`, is `a` inside a subloop of `b`?
    pub fn is_within_subloop_of(&self, a: CtxId, b: CtxId) -> bool {
        let b_step = self.ctx_step(b);
        let mut cur = Some(a);
        while let Some(c) = cur {
            let step = self.ctx_step(c);
            if std::mem::discriminant(&step) == std::mem::discriminant(&b_step)
                && step.step_equal(&b_step)
            {
                return false;
            }
            if matches!(step, CtxStep::Loop { .. }) {
                return true;
            }
            cur = self.ctx_parent(c);
        }
        false
    }

    /// AU equivalence at query time: same kind/value, and one context is a
    /// (gappy) suffix of the other.
    pub fn au_equiv(&self, a: AuId, b: AuId) -> bool {
        if a == b {
            return true;
        }
        let (na, nb) = (&self.aus[a.0 as usize], &self.aus[b.0 as usize]);
        if na.kind != nb.kind {
            return false;
        }
        match (na.ctx, nb.ctx) {
            (Some(ca), Some(cb)) => self.matches(ca, cb) || self.matches(cb, ca),
            (None, None) => true,
            _ => false,
        }
    }

    /// A context has been cloned to a new name via function duplication.
    /// Eliminate all transitive references to the old context, replacing
    /// them through `vmap`; report the correspondences.
    pub fn clone_context(
        &mut self,
        old_ctx: CtxId,
        vmap: &ValueMap,
    ) -> (CtxToCtxMap, AuToAuMap) {
        let mut cmap = CtxToCtxMap::default();
        let mut amap = AuToAuMap::default();

        let parent = self.ctx_parent(old_ctx);
        let new_ctx = match self.ctx_step(old_ctx) {
            CtxStep::Fcn { fcn } => {
                let new_fcn = *vmap.fcns.get(&fcn).expect("cloned function missing from vmap");
                self.fold_ctx(CtxStep::Fcn { fcn: new_fcn }, parent)
            }
            CtxStep::Loop { fcn, header, depth } => {
                let new_header =
                    *vmap.blocks.get(&header).expect("cloned loop header missing from vmap");
                self.fold_ctx(CtxStep::Loop { fcn, header: new_header, depth }, parent)
            }
            CtxStep::Top => return (cmap, amap),
        };
        cmap.insert(old_ctx, new_ctx);

        self.duplicate_children(old_ctx, &mut cmap, |_fm, child_step, _child| child_step);
        Self::flatten(&mut cmap);
        self.remap_aus(vmap, &cmap, &mut amap);
        Self::flatten(&mut amap);

        (cmap, amap)
    }

    /// A context has been eliminated via inlining: the inlined function's
    /// context is replaced by its parent, and loops that lived inside the
    /// inlined function get their headers remapped through `vmap`.
    pub fn inline_context(
        &mut self,
        old_ctx: CtxId,
        vmap: &ValueMap,
    ) -> (CtxToCtxMap, AuToAuMap) {
        let mut cmap = CtxToCtxMap::default();
        let mut amap = AuToAuMap::default();

        let replacement = self.ctx_parent(old_ctx).unwrap_or(self.top);
        cmap.insert(old_ctx, replacement);

        self.duplicate_children(old_ctx, &mut cmap, |fm, child_step, child| {
            // Loops from the inlined function were duplicated into the
            // caller; map the loop header.
            if let CtxStep::Loop { fcn, header, depth } = child_step {
                if fm.fcn_context(child) == Some(old_ctx) {
                    let new_header = *vmap
                        .blocks
                        .get(&header)
                        .expect("can't find image of loop header in the vmap");
                    return CtxStep::Loop { fcn, header: new_header, depth };
                }
            }
            child_step
        });
        Self::flatten(&mut cmap);
        self.remap_aus(vmap, &cmap, &mut amap);
        Self::flatten(&mut amap);

        (cmap, amap)
    }

    /// Work-list duplication of every context transitively parented on
    /// `root`. `map_step` lets inlining rewrite loop headers.
    fn duplicate_children<F>(&mut self, root: CtxId, cmap: &mut CtxToCtxMap, map_step: F)
    where
        F: Fn(&FoldManager, CtxStep, CtxId) -> CtxStep,
    {
        let mut fringe = vec![root];
        while let Some(changed) = fringe.pop() {
            let replacement = cmap[&changed];

            // Snapshot the affected children before mutating the arena.
            let children: Vec<CtxId> = (0..self.ctxs.len() as u32)
                .map(CtxId)
                .filter(|&c| self.ctx_parent(c) == Some(changed))
                .collect();

            for child in children {
                let step = map_step(self, self.ctx_step(child), child);
                let clone = self.fold_ctx(step, Some(replacement));
                cmap.insert(child, clone);
                fringe.push(child);
            }
        }
    }

    /// Rewrite AUs whose context changed, remapping their values through
    /// `vmap` when an image exists.
    fn remap_aus(&mut self, vmap: &ValueMap, cmap: &CtxToCtxMap, amap: &mut AuToAuMap) {
        let snapshot = self.all_aus.clone();
        for old_au in snapshot {
            let Some(old_ctx) = self.au_ctx(old_au) else { continue };
            let Some(&new_ctx) = cmap.get(&old_ctx) else { continue };

            let kind = match self.au_kind(old_au) {
                AuKind::Stack(i) => AuKind::Stack(vmap.instrs.get(&i).copied().unwrap_or(i)),
                AuKind::Heap(i) => AuKind::Heap(vmap.instrs.get(&i).copied().unwrap_or(i)),
                other => other,
            };
            let new_au = self.fold_au(kind, Some(new_ctx));
            amap.insert(old_au, new_au);
        }
    }

    /// clone/inline is called repeatedly and the maps build progressively,
    /// so an entry may need to change twice (a -> b and b -> c). Flatten so
    /// that a -> c.
    fn flatten<K: Copy + Eq + std::hash::Hash>(map: &mut FxHashMap<K, K>) {
        loop {
            let mut update = None;
            for (&from, &to) in map.iter() {
                if let Some(&next) = map.get(&to) {
                    if next != to {
                        update = Some((from, next));
                        break;
                    }
                }
            }
            match update {
                Some((from, next)) => {
                    map.insert(from, next);
                }
                None => break,
            }
        }
    }

    /// Render a context the way the profile writes it:
    /// `{ LOOP f header depth WITHIN FUNCTION f WITHIN TOP }`
    pub fn print_ctx(&self, ir: &ModuleIr, id: CtxId) -> String {
        let mut parts = Vec::new();
        for c in self.chain(id) {
            parts.push(match self.ctx_step(c) {
                CtxStep::Top => "TOP".to_string(),
                CtxStep::Fcn { fcn } => format!("FUNCTION {}", ir.function(fcn).name),
                CtxStep::Loop { fcn, header, depth } => format!(
                    "LOOP {} {} {}",
                    ir.function(fcn).name,
                    ir.block(header).name,
                    depth
                ),
            });
        }
        format!("{{ {} }}", parts.join(" WITHIN "))
    }

    /// Render an AU the way the profile writes it.
    pub fn print_au(&self, ir: &ModuleIr, id: AuId) -> String {
        let body = match self.au_kind(id) {
            AuKind::Unknown => "UNKNOWN".to_string(),
            AuKind::Undefined => "UNDEFINED".to_string(),
            AuKind::Io => "IO".to_string(),
            AuKind::Null => "NULL".to_string(),
            AuKind::Constant(g) => format!("CONSTANT {}", ir.global(g).name),
            AuKind::Global(g) => format!("GLOBAL {}", ir.global(g).name),
            AuKind::Stack(i) | AuKind::Heap(i) => {
                let tag = if matches!(self.au_kind(id), AuKind::Stack(_)) { "STACK" } else { "HEAP" };
                let instr = ir.instr(i);
                let block = ir.block(instr.block);
                let fcn = ir.function(block.function);
                format!("{} {} {} {}", tag, fcn.name, block.name, instr.name)
            }
        };
        match self.au_ctx(id) {
            Some(ctx) if self.au_kind(id).is_dynamic() => {
                format!("AU {} FROM CONTEXT {}", body, self.print_ctx(ir, ctx))
            }
            _ => format!("AU {}", body),
        }
    }

    /// A strict weak ordering for stack/heap AUs that is repeatable across
    /// invocations (never compares arena ids of unrelated values).
    pub fn repeatable_au_order(&self, ir: &ModuleIr, a: AuId, b: AuId) -> Ordering {
        let (ka, kb) = (self.au_kind(a), self.au_kind(b));
        match ka.tag().cmp(&kb.tag()) {
            Ordering::Equal => {}
            other => return other,
        }
        let name_of = |k: AuKind| -> String {
            match k {
                AuKind::Constant(g) | AuKind::Global(g) => ir.global(g).name.clone(),
                AuKind::Stack(i) | AuKind::Heap(i) => {
                    let instr = ir.instr(i);
                    let block = ir.block(instr.block);
                    let fcn = ir.function(block.function);
                    format!("{}\u{1}{}\u{1}{}", fcn.name, block.name, instr.name)
                }
                _ => String::new(),
            }
        };
        match name_of(ka).cmp(&name_of(kb)) {
            Ordering::Equal => {}
            other => return other,
        }
        self.compare_contexts(ir, self.au_ctx(a), self.au_ctx(b))
    }

    fn compare_contexts(&self, ir: &ModuleIr, a: Option<CtxId>, b: Option<CtxId>) -> Ordering {
        match (a, b) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(ca), Some(cb)) => {
                if ca == cb {
                    return Ordering::Equal;
                }
                let key = |c: CtxId| -> (u8, String, u32) {
                    match self.ctx_step(c) {
                        CtxStep::Top => (0, String::new(), 0),
                        CtxStep::Fcn { fcn } => (1, ir.function(fcn).name.clone(), 0),
                        CtxStep::Loop { fcn, header, depth } => (
                            2,
                            format!("{}\u{1}{}", ir.block(header).name, ir.function(fcn).name),
                            depth,
                        ),
                    }
                };
                match key(ca).cmp(&key(cb)) {
                    Ordering::Equal => {
                        self.compare_contexts(ir, self.ctx_parent(ca), self.ctx_parent(cb))
                    }
                    other => other,
                }
            }
        }
    }
}
