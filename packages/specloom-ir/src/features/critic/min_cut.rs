//! Min-cut over the non-mergeability flow network.
//!
//! Vertices: Source, Sink, and an L/R pair per eligible SCC. Source->L and
//! R->Sink carry the SCC's profile weight; infinite L->R edges encode
//! "these two SCCs cannot share the parallel stage". After the cut, an SCC
//! belongs to the parallel stage iff neither its L nor its R vertex was
//! displaced from its natural side.

use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;

pub type Vertex = usize;

pub const SOURCE: Vertex = 0;
pub const SINK: Vertex = 1;

/// Map an SCC id to its Left / Right vertex.
pub fn left(scc_id: usize) -> Vertex {
    2 + 2 * scc_id
}

pub fn right(scc_id: usize) -> Vertex {
    3 + 2 * scc_id
}

/// Effectively uncuttable.
pub const INFINITE: u64 = u64::MAX / 4;

#[derive(Debug, Default)]
pub struct FlowNetwork {
    succs: FxHashMap<Vertex, Vec<Vertex>>,
    capacity: FxHashMap<(Vertex, Vertex), u64>,
}

impl FlowNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_edge(&mut self, u: Vertex, v: Vertex, weight: u64) {
        let cap = self.capacity.entry((u, v)).or_insert(0);
        *cap = cap.saturating_add(weight);
        self.succs.entry(u).or_default().push(v);
        // Residual arc.
        self.capacity.entry((v, u)).or_insert(0);
        self.succs.entry(v).or_default().push(u);
    }

    pub fn num_edges(&self) -> usize {
        self.capacity.iter().filter(|(_, &c)| c > 0).count()
    }

    fn bfs_augmenting(
        &self,
        flow: &FxHashMap<(Vertex, Vertex), u64>,
    ) -> Option<Vec<Vertex>> {
        let mut prev: FxHashMap<Vertex, Vertex> = FxHashMap::default();
        let mut queue = VecDeque::new();
        queue.push_back(SOURCE);
        prev.insert(SOURCE, SOURCE);
        while let Some(u) = queue.pop_front() {
            if u == SINK {
                break;
            }
            let Some(nexts) = self.succs.get(&u) else { continue };
            for &v in nexts {
                if prev.contains_key(&v) {
                    continue;
                }
                if self.residual(flow, u, v) > 0 {
                    prev.insert(v, u);
                    queue.push_back(v);
                }
            }
        }
        if !prev.contains_key(&SINK) {
            return None;
        }
        let mut path = vec![SINK];
        let mut cur = SINK;
        while cur != SOURCE {
            cur = prev[&cur];
            path.push(cur);
        }
        path.reverse();
        Some(path)
    }

    fn residual(&self, flow: &FxHashMap<(Vertex, Vertex), u64>, u: Vertex, v: Vertex) -> u64 {
        let cap = self.capacity.get(&(u, v)).copied().unwrap_or(0);
        let f = flow.get(&(u, v)).copied().unwrap_or(0);
        let back = flow.get(&(v, u)).copied().unwrap_or(0);
        cap.saturating_sub(f).saturating_add(back)
    }

    /// Edmonds-Karp max flow, then the displaced-vertex min cut: L vertices
    /// cut off from the source plus R vertices still attached to it.
    pub fn compute_min_cut(&self) -> FxHashSet<Vertex> {
        let mut flow: FxHashMap<(Vertex, Vertex), u64> = FxHashMap::default();

        while let Some(path) = self.bfs_augmenting(&flow) {
            let mut bottleneck = u64::MAX;
            for w in path.windows(2) {
                bottleneck = bottleneck.min(self.residual(&flow, w[0], w[1]));
            }
            debug_assert!(bottleneck > 0);
            for w in path.windows(2) {
                let (u, v) = (w[0], w[1]);
                // Cancel back-flow first.
                let back = flow.get(&(v, u)).copied().unwrap_or(0);
                if back >= bottleneck {
                    *flow.get_mut(&(v, u)).unwrap() -= bottleneck;
                } else {
                    if back > 0 {
                        flow.insert((v, u), 0);
                    }
                    *flow.entry((u, v)).or_insert(0) += bottleneck - back;
                }
            }
        }

        // Source side of the cut.
        let mut reachable: FxHashSet<Vertex> = FxHashSet::default();
        let mut queue = VecDeque::new();
        queue.push_back(SOURCE);
        reachable.insert(SOURCE);
        while let Some(u) = queue.pop_front() {
            let Some(nexts) = self.succs.get(&u) else { continue };
            for &v in nexts {
                if !reachable.contains(&v) && self.residual(&flow, u, v) > 0 {
                    reachable.insert(v);
                    queue.push_back(v);
                }
            }
        }

        let mut cut = FxHashSet::default();
        for &v in self.succs.keys() {
            if v == SOURCE || v == SINK {
                continue;
            }
            let is_left = v % 2 == 0;
            if is_left && !reachable.contains(&v) {
                cut.insert(v);
            } else if !is_left && reachable.contains(&v) {
                cut.insert(v);
            }
        }
        cut
    }
}
