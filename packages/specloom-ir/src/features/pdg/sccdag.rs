//! SCC DAG over a dependence graph.
//!
//! Tarjan via petgraph; reachability between SCCs is precomputed since the
//! critic's pivoting queries it heavily.

use super::graph::DepGraph;
use crate::shared::models::{InstrId, ModuleIr};
use petgraph::algo::tarjan_scc;
use rustc_hash::{FxHashMap, FxHashSet};

/// SCC identifier, stable within one `SccDag`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SccId(pub usize);

#[derive(Debug, Clone)]
pub struct Scc {
    pub id: SccId,
    pub members: Vec<InstrId>,
}

pub struct SccDag {
    sccs: Vec<Scc>,
    scc_of: FxHashMap<InstrId, SccId>,
    /// Direct DAG successors per SCC.
    succs: Vec<FxHashSet<usize>>,
    /// Transitive reachability per SCC (excluding self).
    reach: Vec<FxHashSet<usize>>,
}

impl SccDag {
    /// Build the SCC DAG of `pdg`. SCC member lists and ids are
    /// deterministic for a given graph.
    pub fn build(pdg: &DepGraph) -> Self {
        let g = pdg.petgraph();
        let mut comps = tarjan_scc(g);
        // Tarjan yields reverse topological order; flip so SCC 0 has no
        // predecessors among later SCCs.
        comps.reverse();

        let mut sccs = Vec::with_capacity(comps.len());
        let mut scc_of = FxHashMap::default();
        for (ix, comp) in comps.iter().enumerate() {
            let mut members: Vec<InstrId> = comp.iter().map(|&n| g[n]).collect();
            members.sort();
            let id = SccId(ix);
            for &m in &members {
                scc_of.insert(m, id);
            }
            sccs.push(Scc { id, members });
        }

        // Inter-SCC adjacency.
        let mut succs: Vec<FxHashSet<usize>> = vec![FxHashSet::default(); sccs.len()];
        for e in pdg.edges() {
            let (s, d) = pdg.endpoints(e);
            let (ss, ds) = (scc_of[&s], scc_of[&d]);
            if ss != ds {
                succs[ss.0].insert(ds.0);
            }
        }

        // Transitive closure by reverse-topological accumulation.
        let mut reach: Vec<FxHashSet<usize>> = vec![FxHashSet::default(); sccs.len()];
        for ix in (0..sccs.len()).rev() {
            let mut acc = FxHashSet::default();
            for &succ in &succs[ix] {
                acc.insert(succ);
                acc.extend(reach[succ].iter().copied());
            }
            reach[ix] = acc;
        }

        SccDag { sccs, scc_of, succs, reach }
    }

    pub fn sccs(&self) -> &[Scc] {
        &self.sccs
    }

    pub fn len(&self) -> usize {
        self.sccs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sccs.is_empty()
    }

    pub fn scc(&self, id: SccId) -> &Scc {
        &self.sccs[id.0]
    }

    pub fn scc_of(&self, instr: InstrId) -> Option<SccId> {
        self.scc_of.get(&instr).copied()
    }

    /// Is there a directed path `a -> ... -> b`?
    pub fn ordered_before(&self, a: SccId, b: SccId) -> bool {
        self.reach[a.0].contains(&b.0)
    }

    /// Is any SCC of `pivots` reachable from `a`?
    pub fn ordered_before_any(&self, a: SccId, pivots: &[SccId]) -> bool {
        pivots.iter().any(|&p| self.ordered_before(a, p))
    }

    /// Is `a` reachable from any SCC of `pivots`?
    pub fn ordered_after_any(&self, a: SccId, pivots: &[SccId]) -> bool {
        pivots.iter().any(|&p| self.ordered_before(p, a))
    }

    pub fn direct_successors(&self, a: SccId) -> impl Iterator<Item = SccId> + '_ {
        self.succs[a.0].iter().map(|&i| SccId(i))
    }

    /// No internal loop-carried edge: the SCC may run in a parallel stage.
    pub fn is_parallel(&self, pdg: &DepGraph, id: SccId) -> bool {
        let members: FxHashSet<InstrId> = self.scc(id).members.iter().copied().collect();
        for &m in &self.scc(id).members {
            for e in pdg.out_edges(m) {
                let (_, d) = pdg.endpoints(e);
                if members.contains(&d) && pdg.edge(e).loop_carried {
                    return false;
                }
            }
        }
        true
    }

    /// Is there a loop-carried edge between the two SCCs, in either
    /// direction?
    pub fn loop_carried_between(&self, pdg: &DepGraph, a: SccId, b: SccId) -> bool {
        let bm: FxHashSet<InstrId> = self.scc(b).members.iter().copied().collect();
        for &m in &self.scc(a).members {
            for e in pdg.out_edges(m) {
                let (_, d) = pdg.endpoints(e);
                if bm.contains(&d) && pdg.edge(e).loop_carried {
                    return true;
                }
            }
            for e in pdg.in_edges(m) {
                let (s, _) = pdg.endpoints(e);
                if bm.contains(&s) && pdg.edge(e).loop_carried {
                    return true;
                }
            }
        }
        false
    }

    /// Loop-carried edge from `a` to `b` specifically.
    pub fn loop_carried_from_to(&self, pdg: &DepGraph, a: SccId, b: SccId) -> bool {
        let bm: FxHashSet<InstrId> = self.scc(b).members.iter().copied().collect();
        for &m in &self.scc(a).members {
            for e in pdg.out_edges(m) {
                let (_, d) = pdg.endpoints(e);
                if bm.contains(&d) && pdg.edge(e).loop_carried {
                    return true;
                }
            }
        }
        false
    }

    /// No member writes memory: the SCC may be replicated across workers.
    pub fn is_replicable(&self, ir: &ModuleIr, id: SccId) -> bool {
        self.scc(id).members.iter().all(|&m| !ir.instr(m).may_write_to_memory())
    }

    /// Only phis and branches: cheap enough that replication is free.
    pub fn is_lightweight(&self, ir: &ModuleIr, id: SccId) -> bool {
        self.scc(id).members.iter().all(|&m| {
            let instr = ir.instr(m);
            instr.is_phi() || matches!(instr.op, crate::shared::models::Opcode::Br { .. })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::pdg::graph::{DepDir, DepEdge, DepKind};

    fn i(n: u32) -> InstrId {
        InstrId(n)
    }

    fn edge(lc: bool) -> DepEdge {
        DepEdge::new(DepKind::Register, DepDir::Raw, lc)
    }

    /// 1 <-> 2 form a cycle; 3 depends on them; 4 independent.
    fn diamond() -> DepGraph {
        let mut g = DepGraph::new();
        g.add_edge(i(1), i(2), edge(false));
        g.add_edge(i(2), i(1), edge(true));
        g.add_edge(i(2), i(3), edge(false));
        g.add_node(i(4));
        g
    }

    #[test]
    fn test_scc_grouping() {
        let g = diamond();
        let dag = SccDag::build(&g);
        assert_eq!(dag.len(), 3);
        let s12 = dag.scc_of(i(1)).unwrap();
        assert_eq!(dag.scc_of(i(2)), Some(s12));
        assert_ne!(dag.scc_of(i(3)), Some(s12));
    }

    #[test]
    fn test_ordered_before() {
        let g = diamond();
        let dag = SccDag::build(&g);
        let s12 = dag.scc_of(i(1)).unwrap();
        let s3 = dag.scc_of(i(3)).unwrap();
        let s4 = dag.scc_of(i(4)).unwrap();
        assert!(dag.ordered_before(s12, s3));
        assert!(!dag.ordered_before(s3, s12));
        assert!(!dag.ordered_before(s12, s4));
        assert!(!dag.ordered_before(s4, s12));
    }

    #[test]
    fn test_is_parallel() {
        let g = diamond();
        let dag = SccDag::build(&g);
        let s12 = dag.scc_of(i(1)).unwrap();
        let s3 = dag.scc_of(i(3)).unwrap();
        // The 1<->2 cycle carries a loop-carried edge internally.
        assert!(!dag.is_parallel(&g, s12));
        assert!(dag.is_parallel(&g, s3));
    }

    #[test]
    fn test_loop_carried_between() {
        let mut g = DepGraph::new();
        g.add_edge(i(1), i(2), edge(true));
        let dag = SccDag::build(&g);
        let s1 = dag.scc_of(i(1)).unwrap();
        let s2 = dag.scc_of(i(2)).unwrap();
        assert!(dag.loop_carried_between(&g, s1, s2));
        assert!(dag.loop_carried_between(&g, s2, s1));
        assert!(dag.loop_carried_from_to(&g, s1, s2));
        assert!(!dag.loop_carried_from_to(&g, s2, s1));
    }
}
