//! The DOALL critic.
//!
//! Every iteration must be independent: each loop-carried edge either
//! belongs to the bounded induction-variable SCC (discharged by chunked
//! iteration distribution), or must carry a remedy. One bare loop-carried
//! edge makes the loop infeasible.

use super::perf::{exp_pipeline_speedup, PerformanceEstimator};
use super::pipeline::{PipelineStage, PipelineStrategy, StageType};
use super::{CriticRes, Criticisms, LoopDependenceInfo};
use crate::features::pdg::{DepGraph, EdgeId, SccDag};
use crate::shared::models::{InstrId, LoopRef, ModuleIr};
use rustc_hash::FxHashSet;
use std::collections::BTreeSet;
use tracing::{debug, info};

pub struct DoallCritic<'a> {
    perf: &'a dyn PerformanceEstimator,
    thread_budget: u32,
}

impl<'a> DoallCritic<'a> {
    pub fn new(perf: &'a dyn PerformanceEstimator, thread_budget: u32) -> Self {
        DoallCritic { perf, thread_budget }
    }

    /// Loop-carried edges internal to the header's SCC, removable when the
    /// loop is governed by a bounded induction variable.
    fn bounded_iv_removable_edges(
        pdg: &DepGraph,
        ir: &ModuleIr,
        lp: &LoopRef,
        ldi: &LoopDependenceInfo,
    ) -> BTreeSet<EdgeId> {
        let mut out = BTreeSet::new();
        if !ldi.governed_by_bounded_iv {
            return out;
        }
        let Some(header_term) = ir.terminator(lp.header) else { return out };
        let sccdag = SccDag::build(pdg);
        let Some(header_scc) = sccdag.scc_of(header_term) else { return out };
        let members: FxHashSet<InstrId> =
            sccdag.scc(header_scc).members.iter().copied().collect();
        for e in pdg.edges() {
            let (s, d) = pdg.endpoints(e);
            if members.contains(&s) && members.contains(&d) && pdg.edge(e).loop_carried {
                out.insert(e);
            }
        }
        out
    }

    pub fn get_criticisms(
        &self,
        pdg: &DepGraph,
        ir: &ModuleIr,
        lp: &LoopRef,
        ldi: &LoopDependenceInfo,
    ) -> CriticRes {
        debug!("begin criticisms generation for DOALL critic");

        if lp.num_exits() > 1 {
            debug!("DOALL: more than one loop exit block");
        }

        let bounded_iv = Self::bounded_iv_removable_edges(pdg, ir, lp, ldi);

        let mut criticisms = Criticisms::new();
        for e in pdg.edges() {
            if !pdg.edge(e).loop_carried || bounded_iv.contains(&e) {
                continue;
            }
            let (src, dst) = pdg.endpoints(e);
            if pdg.edge(e).is_removable() {
                debug!(?src, ?dst, "DOALL criticism: removable loop-carried edge");
                criticisms.insert(e);
            } else {
                info!(?src, ?dst, "DOALL infeasible: bare loop-carried edge");
                return CriticRes::infeasible();
            }
        }

        // The expected PDG once every criticism is satisfied.
        let mut expected = pdg.clone();
        for &e in bounded_iv.iter().chain(criticisms.iter()) {
            expected.remove_edge(e);
        }
        debug_assert!(
            expected.edges().iter().all(|&e| !expected.edge(e).loop_carried),
            "expected PDG still carries a cross-iteration edge"
        );

        // One parallel stage holding every instruction.
        let mut stage =
            PipelineStage::from_instrs(StageType::Parallel, expected.nodes());
        stage.parallel_factor = self.thread_budget;
        let mut ps = PipelineStrategy { stages: vec![stage], ..Default::default() };
        ps.set_valid_for(lp.header);

        let exp_speedup = exp_pipeline_speedup(self.perf, &ps, ir, lp);
        CriticRes { criticisms, exp_speedup, strategy: Some(ps) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::classify::ReduxKind;
    use crate::features::critic::perf::ProfileWeights;
    use crate::features::pdg::{DepDir, DepEdge, DepKind};
    use crate::features::remedies::remedy::Remedy;
    use crate::shared::models::{BinOp, Opcode, ValueRef};

    /// `for i in 0..n { sum += a[i] }`: an IV cycle and a reduction cycle.
    fn fixture() -> (ModuleIr, LoopRef, DepGraph, EdgeId, EdgeId) {
        let mut ir = ModuleIr::new();
        let f = ir.add_function("main", 0);
        let hdr = ir.add_block(f, "for.cond");
        let exit = ir.add_block(f, "for.end");
        let i_phi = ir.append_instr(hdr, "i", Opcode::Phi { incoming: vec![] });
        let i_next = ir.append_instr(
            hdr,
            "i.next",
            Opcode::Binary { op: BinOp::Add, lhs: ValueRef::Instr(i_phi), rhs: ValueRef::ConstInt(1) },
        );
        let sum_phi = ir.append_instr(hdr, "sum", Opcode::Phi { incoming: vec![] });
        let sum_next = ir.append_instr(
            hdr,
            "sum.next",
            Opcode::Binary {
                op: BinOp::Add,
                lhs: ValueRef::Instr(sum_phi),
                rhs: ValueRef::ConstInt(0),
            },
        );
        let br = ir.append_instr(
            hdr,
            "br",
            Opcode::Br { cond: Some(ValueRef::Instr(i_next)), targets: vec![hdr, exit] },
        );
        ir.append_instr(exit, "", Opcode::Ret { value: None });

        let lp = LoopRef {
            function: f,
            header: hdr,
            preheader: None,
            blocks: [hdr].into_iter().collect(),
            depth: 1,
            exit_edges: vec![(hdr, 1)],
        };

        let mut pdg = DepGraph::new();
        pdg.add_edge(i_phi, i_next, DepEdge::new(DepKind::Register, DepDir::Raw, false));
        let iv_lc = pdg.add_edge(i_next, i_phi, DepEdge::new(DepKind::Register, DepDir::Raw, true));
        pdg.add_edge(i_next, br, DepEdge::new(DepKind::Register, DepDir::Raw, false));
        // The branch participates in the IV SCC via its loop-carried
        // control edge back to the header phis.
        pdg.add_edge(br, i_phi, DepEdge::new(DepKind::Control, DepDir::Raw, true));
        pdg.add_edge(sum_phi, sum_next, DepEdge::new(DepKind::Register, DepDir::Raw, false));
        let redux_lc =
            pdg.add_edge(sum_next, sum_phi, DepEdge::new(DepKind::Register, DepDir::Raw, true));
        (ir, lp, pdg, iv_lc, redux_lc)
    }

    #[test]
    fn test_doall_reduction_loop() {
        let (ir, lp, mut pdg, _iv, redux_lc) = fixture();
        pdg.edge_mut(redux_lc).remedies = vec![Remedy::Redux { kind: ReduxKind::AddI64, store: None }];

        let pw = ProfileWeights::uniform();
        let critic = DoallCritic::new(&pw, 8);
        let ldi = LoopDependenceInfo { governed_by_bounded_iv: true, chunk_size: 16 };
        let res = critic.get_criticisms(&pdg, &ir, &lp, &ldi);

        // One criticism: the reduction edge. Plan: single parallel stage.
        assert_eq!(res.criticisms.len(), 1);
        assert!(res.criticisms.contains(&redux_lc));
        let ps = res.strategy.expect("doall plan");
        assert_eq!(ps.stages.len(), 1);
        assert_eq!(ps.stages[0].ty, StageType::Parallel);
        assert_eq!(ps.stages[0].parallel_factor, 8);
        assert!(ps.summary().starts_with("DOALL"));
    }

    #[test]
    fn test_infeasible_on_bare_loop_carried_edge() {
        let (ir, lp, pdg, _iv, _redux) = fixture();
        // No remedies anywhere; the reduction edge is bare.
        let pw = ProfileWeights::uniform();
        let critic = DoallCritic::new(&pw, 8);
        let ldi = LoopDependenceInfo { governed_by_bounded_iv: true, chunk_size: 16 };
        let res = critic.get_criticisms(&pdg, &ir, &lp, &ldi);
        assert_eq!(res.exp_speedup, super::super::INFEASIBLE_SPEEDUP);
        assert!(res.strategy.is_none());
    }

    #[test]
    fn test_without_iv_analysis_header_cycle_blocks() {
        let (ir, lp, pdg, _iv, _redux) = fixture();
        let pw = ProfileWeights::uniform();
        let critic = DoallCritic::new(&pw, 8);
        // IV analysis did not certify the loop: the IV cycle itself is a
        // bare loop-carried edge.
        let res = critic.get_criticisms(&pdg, &ir, &lp, &LoopDependenceInfo::default());
        assert_eq!(res.exp_speedup, super::super::INFEASIBLE_SPEEDUP);
    }
}
