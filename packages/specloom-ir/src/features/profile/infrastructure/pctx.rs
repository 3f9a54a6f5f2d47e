//! Profiler-side contexts.
//!
//! The profiler runs against the instrumented program, where program points
//! are known by name only; its contexts are interned name chains. The
//! compiler-side `FoldManager` contexts are reconstructed from these when
//! the profile is parsed. The printed form is shared by both sides.

use rustc_hash::FxHashMap;
use std::fmt::Write as _;

/// Profiler context handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PCtxId(pub u32);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PCtxStep {
    Top,
    Fcn { name: String },
    Loop { fcn: String, header: String, depth: u32 },
}

struct PCtxNode {
    step: PCtxStep,
    parent: Option<PCtxId>,
}

/// Interner for profiler contexts.
pub struct PCtxArena {
    nodes: Vec<PCtxNode>,
    table: FxHashMap<(PCtxStep, Option<PCtxId>), PCtxId>,
    top: PCtxId,
}

impl PCtxArena {
    pub fn new() -> Self {
        let mut a =
            PCtxArena { nodes: Vec::new(), table: FxHashMap::default(), top: PCtxId(0) };
        a.top = a.intern(PCtxStep::Top, None);
        a
    }

    pub fn top(&self) -> PCtxId {
        self.top
    }

    pub fn intern(&mut self, step: PCtxStep, parent: Option<PCtxId>) -> PCtxId {
        let key = (step.clone(), parent);
        if let Some(&id) = self.table.get(&key) {
            return id;
        }
        let id = PCtxId(self.nodes.len() as u32);
        self.nodes.push(PCtxNode { step, parent });
        self.table.insert(key, id);
        id
    }

    pub fn step(&self, id: PCtxId) -> &PCtxStep {
        &self.nodes[id.0 as usize].step
    }

    pub fn parent(&self, id: PCtxId) -> Option<PCtxId> {
        self.nodes[id.0 as usize].parent
    }

    /// The deepest common ancestor of two contexts.
    pub fn find_common(&self, a: PCtxId, b: PCtxId) -> PCtxId {
        let chain = |mut c: PCtxId| -> Vec<PCtxId> {
            let mut v = vec![c];
            while let Some(p) = self.parent(c) {
                v.push(p);
                c = p;
            }
            v.reverse();
            v
        };
        let (ca, cb) = (chain(a), chain(b));
        let mut common = self.top;
        for (x, y) in ca.iter().zip(cb.iter()) {
            if x == y {
                common = *x;
            } else {
                break;
            }
        }
        common
    }

    /// Printed form, shared with the compiler-side parser:
    /// `{ LOOP f header depth WITHIN FUNCTION f WITHIN TOP }`
    pub fn print(&self, id: PCtxId) -> String {
        let mut parts = Vec::new();
        let mut cur = Some(id);
        while let Some(c) = cur {
            let mut s = String::new();
            match self.step(c) {
                PCtxStep::Top => s.push_str("TOP"),
                PCtxStep::Fcn { name } => {
                    let _ = write!(s, "FUNCTION {}", name);
                }
                PCtxStep::Loop { fcn, header, depth } => {
                    let _ = write!(s, "LOOP {} {} {}", fcn, header, depth);
                }
            }
            parts.push(s);
            cur = self.parent(c);
        }
        format!("{{ {} }}", parts.join(" WITHIN "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_canonical() {
        let mut a = PCtxArena::new();
        let top = a.top();
        let f1 = a.intern(PCtxStep::Fcn { name: "main".into() }, Some(top));
        let f2 = a.intern(PCtxStep::Fcn { name: "main".into() }, Some(top));
        assert_eq!(f1, f2);
    }

    #[test]
    fn test_find_common() {
        let mut a = PCtxArena::new();
        let top = a.top();
        let f = a.intern(PCtxStep::Fcn { name: "main".into() }, Some(top));
        let l = a.intern(
            PCtxStep::Loop { fcn: "main".into(), header: "for.cond".into(), depth: 1 },
            Some(f),
        );
        let g = a.intern(PCtxStep::Fcn { name: "callee".into() }, Some(l));
        assert_eq!(a.find_common(g, f), f);
        assert_eq!(a.find_common(l, g), l);
    }

    #[test]
    fn test_print_form() {
        let mut a = PCtxArena::new();
        let top = a.top();
        let f = a.intern(PCtxStep::Fcn { name: "main".into() }, Some(top));
        let l = a.intern(
            PCtxStep::Loop { fcn: "main".into(), header: "for.cond".into(), depth: 1 },
            Some(f),
        );
        assert_eq!(a.print(l), "{ LOOP main for.cond 1 WITHIN FUNCTION main WITHIN TOP }");
    }
}
