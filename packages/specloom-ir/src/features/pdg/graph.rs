//! The dependence graph proper.

use crate::features::remedies::remedy::Remedy;
use crate::shared::models::InstrId;
use petgraph::stable_graph::{EdgeIndex, NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

pub type EdgeId = EdgeIndex;

/// Dependence kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DepKind {
    Memory,
    Register,
    Control,
}

/// Dependence direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DepDir {
    Raw,
    War,
    Waw,
}

/// One dependence edge.
#[derive(Debug, Clone)]
pub struct DepEdge {
    pub kind: DepKind,
    pub dir: DepDir,
    pub loop_carried: bool,
    /// Remedies able to discharge this edge, cheapest first once selected.
    pub remedies: Vec<Remedy>,
}

impl DepEdge {
    pub fn new(kind: DepKind, dir: DepDir, loop_carried: bool) -> Self {
        DepEdge { kind, dir, loop_carried, remedies: Vec::new() }
    }

    pub fn is_removable(&self) -> bool {
        !self.remedies.is_empty()
    }

    /// Cost of the cheapest remedy, or None for a non-removable edge.
    pub fn min_removal_cost(&self) -> Option<u64> {
        self.remedies.first().map(|r| r.cost())
    }

    pub fn cheapest_remedy(&self) -> Option<&Remedy> {
        self.remedies.first()
    }
}

/// The PDG: instruction nodes, dependence edges. Parallel edges between the
/// same pair of instructions are allowed (a mem RAW and a reg RAW can
/// coexist).
#[derive(Debug, Clone, Default)]
pub struct DepGraph {
    graph: StableDiGraph<InstrId, DepEdge>,
    node_of: FxHashMap<InstrId, NodeIndex>,
}

impl DepGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, instr: InstrId) -> NodeIndex {
        if let Some(&n) = self.node_of.get(&instr) {
            return n;
        }
        let n = self.graph.add_node(instr);
        self.node_of.insert(instr, n);
        n
    }

    pub fn add_edge(&mut self, src: InstrId, dst: InstrId, edge: DepEdge) -> EdgeId {
        let s = self.add_node(src);
        let d = self.add_node(dst);
        self.graph.add_edge(s, d, edge)
    }

    pub fn is_internal(&self, instr: InstrId) -> bool {
        self.node_of.contains_key(&instr)
    }

    pub fn nodes(&self) -> impl Iterator<Item = InstrId> + '_ {
        self.graph.node_weights().copied()
    }

    pub fn num_nodes(&self) -> usize {
        self.graph.node_count()
    }

    pub fn num_edges(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn edge(&self, id: EdgeId) -> &DepEdge {
        &self.graph[id]
    }

    pub fn edge_mut(&mut self, id: EdgeId) -> &mut DepEdge {
        &mut self.graph[id]
    }

    pub fn contains_edge(&self, id: EdgeId) -> bool {
        self.graph.edge_weight(id).is_some()
    }

    /// (source instr, dest instr) of an edge.
    pub fn endpoints(&self, id: EdgeId) -> (InstrId, InstrId) {
        let (s, d) = self.graph.edge_endpoints(id).expect("edge endpoints");
        (self.graph[s], self.graph[d])
    }

    pub fn remove_edge(&mut self, id: EdgeId) {
        self.graph.remove_edge(id);
    }

    /// All edge ids, ascending; deterministic across runs.
    pub fn edges(&self) -> Vec<EdgeId> {
        let mut v: Vec<EdgeId> = self.graph.edge_indices().collect();
        v.sort();
        v
    }

    pub fn out_edges(&self, instr: InstrId) -> Vec<EdgeId> {
        self.directed_edges(instr, Direction::Outgoing)
    }

    pub fn in_edges(&self, instr: InstrId) -> Vec<EdgeId> {
        self.directed_edges(instr, Direction::Incoming)
    }

    fn directed_edges(&self, instr: InstrId, dir: Direction) -> Vec<EdgeId> {
        let Some(&n) = self.node_of.get(&instr) else { return Vec::new() };
        let mut v: Vec<EdgeId> = self.graph.edges_directed(n, dir).map(|e| e.id()).collect();
        v.sort();
        v
    }

    /// All edges from any instruction of `srcs` to any of `dsts`.
    pub fn edges_between_sets(&self, srcs: &[InstrId], dsts: &[InstrId]) -> Vec<EdgeId> {
        let dst_set: rustc_hash::FxHashSet<InstrId> = dsts.iter().copied().collect();
        let mut out = Vec::new();
        for &s in srcs {
            for e in self.out_edges(s) {
                let (_, d) = self.endpoints(e);
                if dst_set.contains(&d) {
                    out.push(e);
                }
            }
        }
        out.sort();
        out.dedup();
        out
    }

    /// Raw petgraph access for SCC computation.
    pub(crate) fn petgraph(&self) -> &StableDiGraph<InstrId, DepEdge> {
        &self.graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn i(n: u32) -> InstrId {
        InstrId(n)
    }

    #[test]
    fn test_parallel_edges() {
        let mut g = DepGraph::new();
        let e1 = g.add_edge(i(1), i(2), DepEdge::new(DepKind::Memory, DepDir::Raw, true));
        let e2 = g.add_edge(i(1), i(2), DepEdge::new(DepKind::Register, DepDir::Raw, false));
        assert_ne!(e1, e2);
        assert_eq!(g.num_edges(), 2);
        assert_eq!(g.out_edges(i(1)).len(), 2);
    }

    #[test]
    fn test_remove_edge_keeps_ids_stable() {
        let mut g = DepGraph::new();
        let e1 = g.add_edge(i(1), i(2), DepEdge::new(DepKind::Memory, DepDir::Raw, true));
        let e2 = g.add_edge(i(2), i(3), DepEdge::new(DepKind::Memory, DepDir::War, false));
        g.remove_edge(e1);
        assert!(!g.contains_edge(e1));
        assert!(g.contains_edge(e2));
        assert_eq!(g.endpoints(e2), (i(2), i(3)));
    }

    #[test]
    fn test_edges_between_sets() {
        let mut g = DepGraph::new();
        let e = g.add_edge(i(1), i(5), DepEdge::new(DepKind::Memory, DepDir::Raw, false));
        g.add_edge(i(5), i(1), DepEdge::new(DepKind::Memory, DepDir::War, false));
        assert_eq!(g.edges_between_sets(&[i(1)], &[i(5)]), vec![e]);
    }
}
