//! The PS-DSWP critic.
//!
//! Builds the optimistic PDG, finds the heaviest legal parallel stage by
//! min-cut over the non-mergeability network, assembles a
//! [sequential] parallel [sequential] pipeline, then adjusts stage
//! membership (register loop-carried flows into the parallel stage,
//! expensive criticisms, replicable prefixes) before emitting criticisms
//! and cross-stage dependences.

use super::min_cut::{left, right, FlowNetwork, INFINITE, SINK, SOURCE};
use super::perf::{exp_pipeline_speedup, PerformanceEstimator, FIXED_POINT};
use super::pipeline::{
    all_scc_ids, pivot2, pivot3, CrossStageDependence, PipelineStage, PipelineStrategy, StageType,
};
use super::{CriticRes, Criticisms, LoopDependenceInfo};
use crate::errors::{Result, SpecloomError};
use crate::features::pdg::{DepGraph, DepKind, EdgeId, SccDag, SccId};
use crate::features::remedies::remedy::{DEFAULT_REDUX_REMED_COST, EXPENSIVE_CTRL_REMED_COST};
use crate::features::remedies::txio::is_txio_fcn;
use crate::shared::models::{InstrId, LoopRef, ModuleIr};
use rustc_hash::FxHashSet;
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Tunables whose values the original derived from profiling runs.
#[derive(Debug, Clone)]
pub struct CriticConfig {
    /// Max fraction of the parallel-stage weight that instruction movement
    /// may strip off it, in percent.
    pub off_pstage_perc_threshold: f64,
    /// Only remedies at least this expensive are worth avoiding by moving
    /// instructions across stages.
    pub off_pstage_edge_cost_threshold: u64,
    /// A replicable first sequential stage lighter than this fraction of
    /// the parallel stage (percent) dissolves into a replicated prefix.
    pub replicable_prefix_perc_threshold: f64,
    pub include_replicable_stages: bool,
    pub include_parallel_stages: bool,
}

impl Default for CriticConfig {
    fn default() -> Self {
        CriticConfig {
            off_pstage_perc_threshold: 3.0,
            off_pstage_edge_cost_threshold: 100,
            replicable_prefix_perc_threshold: 10.0,
            include_replicable_stages: true,
            include_parallel_stages: true,
        }
    }
}

pub struct PsDswpCritic<'a> {
    perf: &'a dyn PerformanceEstimator,
    thread_budget: u32,
    cfg: CriticConfig,

    // Working state for the adjustment passes.
    off_pstage_weight: f64,
    parallel_stage_weight: f64,
    not_movable_to_front: FxHashSet<InstrId>,
    not_movable_to_back: FxHashSet<InstrId>,
}

/// Weight of an SCC in fixed-point units.
fn scc_weight(perf: &dyn PerformanceEstimator, sccdag: &SccDag, id: SccId) -> u64 {
    let w: f64 = sccdag.scc(id).members.iter().map(|&i| perf.estimate_weight(i)).sum();
    (FIXED_POINT as f64 * w) as u64
}

fn min_removal_cost(pdg: &DepGraph, e: EdgeId) -> u64 {
    pdg.edge(e).min_removal_cost().unwrap_or(u64::MAX)
}

impl<'a> PsDswpCritic<'a> {
    pub fn new(perf: &'a dyn PerformanceEstimator, thread_budget: u32) -> Self {
        Self::with_config(perf, thread_budget, CriticConfig::default())
    }

    pub fn with_config(
        perf: &'a dyn PerformanceEstimator,
        thread_budget: u32,
        cfg: CriticConfig,
    ) -> Self {
        assert!(thread_budget > 0, "can't schedule SCCs with no threads");
        PsDswpCritic {
            perf,
            thread_budget,
            cfg,
            off_pstage_weight: 0.0,
            parallel_stage_weight: 0.0,
            not_movable_to_front: FxHashSet::default(),
            not_movable_to_back: FxHashSet::default(),
        }
    }

    /// The optimistic PDG: removable edges deleted, except reduction-
    /// removable loop-carried edges, which are demoted to intra-iteration
    /// so the reduction cycle stays within one (parallel-eligible) stage.
    pub fn simplify_pdg(&self, pdg: &DepGraph, ir: &ModuleIr, lp: &LoopRef) -> DepGraph {
        let mut optimistic = pdg.clone();
        let _ = (ir, lp);

        let mut lc_total = 0u64;
        let mut lc_not_covered = 0u64;
        let mut lc_raw_mem = 0u64;
        let mut lc_waw_mem = 0u64;
        let mut lc_war_mem = 0u64;
        let mut lc_reg = 0u64;
        let mut lc_ctrl = 0u64;

        let mut to_remove = Vec::new();
        for e in optimistic.edges() {
            let edge = optimistic.edge(e);
            if edge.loop_carried {
                lc_total += 1;
                match (edge.kind, edge.dir) {
                    (DepKind::Control, _) => lc_ctrl += 1,
                    (DepKind::Memory, crate::features::pdg::DepDir::Raw) => lc_raw_mem += 1,
                    (DepKind::Memory, crate::features::pdg::DepDir::Waw) => lc_waw_mem += 1,
                    (DepKind::Memory, crate::features::pdg::DepDir::War) => lc_war_mem += 1,
                    _ => lc_reg += 1,
                }
                if !edge.is_removable() {
                    lc_not_covered += 1;
                }
            }
            if edge.is_removable() {
                to_remove.push(e);
            }
        }

        for e in to_remove {
            let loop_carried = optimistic.edge(e).loop_carried;
            if min_removal_cost(&optimistic, e) == DEFAULT_REDUX_REMED_COST && loop_carried {
                optimistic.edge_mut(e).loop_carried = false;
            } else {
                optimistic.remove_edge(e);
            }
        }

        debug!(
            lc_raw_mem,
            lc_waw_mem, lc_war_mem, lc_reg, lc_ctrl, "loop-carried dependence census"
        );
        if lc_total > 0 {
            let covered = lc_total - lc_not_covered;
            info!(
                covered,
                total = lc_total,
                percentage = format!("{:.2}", 100.0 * covered as f64 / lc_total as f64),
                "coverage of loop-carried dependences"
            );
        }

        optimistic
    }

    /// Min-cut selection of the heaviest set of parallel-eligible SCCs
    /// that can legally share one parallel stage.
    fn find_max_parallel_stage(
        &self,
        pdg: &DepGraph,
        sccdag: &SccDag,
        all_sccs: &[SccId],
    ) -> Option<(Vec<SccId>, Vec<SccId>)> {
        let mut good = Vec::new();
        let mut bad = Vec::new();
        for &scc in all_sccs {
            if sccdag.is_parallel(pdg, scc) {
                good.push(scc);
            } else {
                bad.push(scc);
            }
        }
        if good.is_empty() {
            return None;
        }

        let mut net = FlowNetwork::new();
        for &g in &good {
            let w = scc_weight(self.perf, sccdag, g);
            // The algorithm assumes non-zero weights.
            net.add_edge(SOURCE, left(g.0), 1 + 100 * w);
            net.add_edge(right(g.0), SINK, 1 + 100 * w);
        }

        // RULE 1: pipelines must be acyclic. The parallel stage cannot hold
        // both X and Y when some path X -> s -> Y passes through a bad SCC
        // s, which necessarily sits in its own sequential stage.
        for &b in &bad {
            let (before, after, _flex) = pivot3(sccdag, &good, &[b]);
            for &a in &before {
                for &c in &after {
                    net.add_edge(left(a.0), right(c.0), INFINITE);
                }
            }
        }

        // RULE 2: no loop-carried dependence inside the parallel stage.
        for &s1 in &good {
            for &s2 in &good {
                if !sccdag.loop_carried_between(pdg, s1, s2) {
                    continue;
                }
                let (mut a_side, _, _) = pivot3(sccdag, &good, &[s1]);
                a_side.push(s1);
                let (_, mut b_side, _) = pivot3(sccdag, &good, &[s2]);
                b_side.push(s2);
                for &a in &a_side {
                    for &b in &b_side {
                        net.add_edge(left(a.0), right(b.0), INFINITE);
                    }
                }
            }
        }

        let cut = net.compute_min_cut();
        let mut max_par = Vec::new();
        for &g in &good {
            if !cut.contains(&left(g.0)) && !cut.contains(&right(g.0)) {
                max_par.push(g);
            }
        }
        if max_par.is_empty() {
            return None;
        }
        let chosen: FxHashSet<SccId> = max_par.iter().copied().collect();
        let not_max: Vec<SccId> =
            all_sccs.iter().copied().filter(|s| !chosen.contains(s)).collect();
        Some((max_par, not_max))
    }

    /// Build a pipeline {before} PARALLEL {after} over the SCC DAG.
    fn doall_and_pipeline(
        &self,
        pdg: &DepGraph,
        sccdag: &SccDag,
        stages: &mut Vec<PipelineStage>,
    ) -> bool {
        let all = all_scc_ids(sccdag);
        if all.is_empty() {
            return false;
        }

        if !self.cfg.include_parallel_stages {
            return false;
        }
        let Some((max_par, not_max)) = self.find_max_parallel_stage(pdg, sccdag, &all) else {
            return false;
        };

        let (before, after) = pivot2(sccdag, &not_max, &max_par);

        let mut thread_avail = self.thread_budget;
        if !before.is_empty() {
            stages.push(PipelineStage::from_sccs(StageType::Sequential, sccdag, &before));
            thread_avail = thread_avail.saturating_sub(1);
        }
        if !after.is_empty() {
            thread_avail = thread_avail.saturating_sub(1);
        }

        let mut parallel = PipelineStage::from_sccs(StageType::Parallel, sccdag, &max_par);
        parallel.parallel_factor = thread_avail.max(1);
        stages.push(parallel);

        if !after.is_empty() {
            stages.push(PipelineStage::from_sccs(StageType::Sequential, sccdag, &after));
        }

        true
    }

    // ---- adjustment passes ---------------------------------------------

    fn parallel_stage_weight(&self, ps: &PipelineStrategy) -> f64 {
        let mut sum = 0.0;
        for stage in &ps.stages {
            if stage.ty == StageType::Parallel {
                for &i in &stage.instructions {
                    sum += self.perf.estimate_weight(i);
                }
            }
        }
        FIXED_POINT as f64 * sum
    }

    /// A loop-carried register RAW from a sequential stage into the
    /// parallel stage cannot be satisfied: workers do not execute the
    /// previous iteration, so the phi would read a stale value. Move the
    /// destination into the sequential stage.
    fn adjust_for_reg_lc_from_seq_to_par(
        &self,
        ps: &mut PipelineStrategy,
        pdg: &DepGraph,
        first: usize,
        parallel: usize,
    ) {
        let mut move_to_seq = Vec::new();
        for &inst in &ps.stages[parallel].instructions {
            for e in pdg.in_edges(inst) {
                let edge = pdg.edge(e);
                if edge.loop_carried
                    && edge.kind == DepKind::Register
                    && edge.dir == crate::features::pdg::DepDir::Raw
                    && !edge.is_removable()
                {
                    move_to_seq.push(inst);
                    break;
                }
            }
        }
        for inst in move_to_seq {
            ps.stages[parallel].instructions.remove(&inst);
            ps.stages[first].instructions.insert(inst);
            debug!(
                ?inst,
                "moved to first sequential stage: non-removable loop-carried register flow"
            );
        }
    }

    /// Cost of moving `inst` (with its backward or forward slice) into the
    /// target sequential stage. `None` means not movable.
    fn move_off_stage(
        &mut self,
        pdg: &DepGraph,
        inst: InstrId,
        visited: &mut FxHashSet<InstrId>,
        insts_tgt_seq: Option<&BTreeSet<InstrId>>,
        insts_moved_tgt: &FxHashSet<InstrId>,
        insts_moved_other: &FxHashSet<InstrId>,
        insts_other_seq: Option<&BTreeSet<InstrId>>,
        edges_not_removed: &FxHashSet<EdgeId>,
        cur_off_pstage_weight: f64,
        move_to_front: bool,
        ir: &ModuleIr,
    ) -> Option<f64> {
        let mut extra_weight = 0.0;

        // Already claimed by the opposite stage: stuck.
        if insts_moved_other.contains(&inst) {
            self.mark_not_movable(inst, move_to_front);
            return None;
        }
        if insts_moved_tgt.contains(&inst) {
            return Some(0.0);
        }
        if let Some(tgt) = insts_tgt_seq {
            if tgt.contains(&inst) {
                return Some(0.0);
            }
        }
        if !visited.insert(inst) {
            return Some(0.0);
        }

        // Weight leaves the parallel stage only when the instruction is not
        // already in a sequential stage.
        let already_sequential = insts_other_seq.map(|s| s.contains(&inst)).unwrap_or(false);
        if !already_sequential {
            extra_weight += FIXED_POINT as f64 * self.perf.estimate_weight(inst);
            let off = (extra_weight + cur_off_pstage_weight) * 100.0;
            if off / self.parallel_stage_weight > self.cfg.off_pstage_perc_threshold {
                self.mark_not_movable(inst, move_to_front);
                return None;
            }
        }

        // Moving a store forward creates uncommitted memory forwarding to
        // every later stage, once per iteration. Refuse.
        if move_to_front && ir.instr(inst).is_store() {
            for e in pdg.out_edges(inst) {
                let edge = pdg.edge(e);
                let (_, dst) = pdg.endpoints(e);
                let dst_in_tgt = insts_moved_tgt.contains(&dst)
                    || insts_tgt_seq.map(|s| s.contains(&dst)).unwrap_or(false);
                let dst_in_other = insts_moved_other.contains(&dst)
                    || insts_other_seq.map(|s| s.contains(&dst)).unwrap_or(false);
                let inst_in_other = insts_other_seq.map(|s| s.contains(&inst)).unwrap_or(false);
                if edge.kind == DepKind::Memory
                    && edge.dir == crate::features::pdg::DepDir::Raw
                    && !dst_in_tgt
                    && !(dst_in_other && !inst_in_other)
                {
                    self.mark_not_movable(inst, move_to_front);
                    return None;
                }
            }
        }

        let edges =
            if move_to_front { pdg.in_edges(inst) } else { pdg.out_edges(inst) };
        for e in edges {
            let edge = pdg.edge(e);
            // Cheap removable non-redux edges do not drag their slice along.
            if edge.is_removable()
                && min_removal_cost(pdg, e) < self.cfg.off_pstage_edge_cost_threshold
                && min_removal_cost(pdg, e) != DEFAULT_REDUX_REMED_COST
                && !edges_not_removed.contains(&e)
            {
                continue;
            }
            let (src, dst) = pdg.endpoints(e);
            let next = if move_to_front { src } else { dst };
            if !pdg.is_internal(next) {
                continue;
            }
            match self.move_off_stage(
                pdg,
                next,
                visited,
                insts_tgt_seq,
                insts_moved_tgt,
                insts_moved_other,
                insts_other_seq,
                edges_not_removed,
                cur_off_pstage_weight,
                move_to_front,
                ir,
            ) {
                Some(cost) => extra_weight += cost,
                None => {
                    self.mark_not_movable(inst, move_to_front);
                    return None;
                }
            }
        }
        Some(extra_weight)
    }

    fn mark_not_movable(&mut self, inst: InstrId, to_front: bool) {
        if to_front {
            self.not_movable_to_front.insert(inst);
        } else {
            self.not_movable_to_back.insert(inst);
        }
    }

    /// Try to avoid removing an expensive edge by relocating its endpoint
    /// slice into a sequential stage instead.
    fn avoid_elim_dep(
        &mut self,
        pdg: &DepGraph,
        ps: &PipelineStrategy,
        e: EdgeId,
        insts_moved_to_front: &mut FxHashSet<InstrId>,
        insts_moved_to_back: &mut FxHashSet<InstrId>,
        edges_not_removed: &mut FxHashSet<EdgeId>,
        ir: &ModuleIr,
    ) -> bool {
        if (self.off_pstage_weight * 100.0) / self.parallel_stage_weight
            > self.cfg.off_pstage_perc_threshold
        {
            return false;
        }
        if min_removal_cost(pdg, e) < self.cfg.off_pstage_edge_cost_threshold {
            return false;
        }

        let (out_i, in_i) = pdg.endpoints(e);

        // Already satisfied by an earlier relocation.
        if insts_moved_to_front.contains(&out_i) || insts_moved_to_back.contains(&in_i) {
            return true;
        }

        let n = ps.stages.len();
        let front_is_seq = ps.stages[0].ty == StageType::Sequential;
        let back_is_seq = n > 1 && ps.stages[n - 1].ty == StageType::Sequential;
        let front_set = front_is_seq.then(|| ps.stages[0].instructions.clone());
        let back_set = back_is_seq.then(|| ps.stages[n - 1].instructions.clone());

        let mut tmp_front = FxHashSet::default();
        let move_front_cost = if pdg.is_internal(out_i) && front_is_seq {
            self.move_off_stage(
                pdg,
                out_i,
                &mut tmp_front,
                front_set.as_ref(),
                insts_moved_to_front,
                insts_moved_to_back,
                back_set.as_ref(),
                edges_not_removed,
                self.off_pstage_weight,
                true,
                ir,
            )
        } else {
            None
        };

        let mut tmp_back = FxHashSet::default();
        let move_back_cost = if pdg.is_internal(in_i) && back_is_seq {
            self.move_off_stage(
                pdg,
                in_i,
                &mut tmp_back,
                back_set.as_ref(),
                insts_moved_to_back,
                insts_moved_to_front,
                front_set.as_ref(),
                edges_not_removed,
                self.off_pstage_weight,
                false,
                ir,
            )
        } else {
            None
        };

        match (move_front_cost, move_back_cost) {
            (Some(fc), bc) if bc.map(|b| fc <= b).unwrap_or(true) => {
                edges_not_removed.insert(e);
                self.off_pstage_weight += fc;
                debug!(cost = min_removal_cost(pdg, e), "kept edge; moving slice to first stage");
                insts_moved_to_front.extend(tmp_front);
                true
            }
            (_, Some(bc)) => {
                edges_not_removed.insert(e);
                self.off_pstage_weight += bc;
                debug!(cost = min_removal_cost(pdg, e), "kept edge; moving slice to last stage");
                insts_moved_to_back.extend(tmp_back);
                true
            }
            _ => false,
        }
    }

    /// Avoid expensive criticisms by moving their slices off the parallel
    /// stage, bounded by the off-parallel-stage weight budget.
    fn avoid_expensive_criticisms(
        &mut self,
        pdg: &DepGraph,
        ps: &mut PipelineStrategy,
        criticisms: &Criticisms,
        ir: &ModuleIr,
    ) {
        let mut moved_front = FxHashSet::default();
        let mut moved_back = FxHashSet::default();
        let mut edges_not_removed = FxHashSet::default();

        for &e in criticisms {
            self.avoid_elim_dep(
                pdg,
                ps,
                e,
                &mut moved_front,
                &mut moved_back,
                &mut edges_not_removed,
                ir,
            );
        }

        let n = ps.stages.len();
        for inst in moved_front {
            for stage in ps.stages.iter_mut().skip(1) {
                stage.instructions.remove(&inst);
            }
            ps.stages[0].instructions.insert(inst);
        }
        for inst in moved_back {
            for stage in ps.stages.iter_mut().take(n - 1) {
                stage.instructions.remove(&inst);
            }
            ps.stages[n - 1].instructions.insert(inst);
        }
    }

    /// A replicable, lightweight first sequential stage dissolves into the
    /// parallel stage's replicated prefix, freeing its worker.
    fn convert_rep_light_first_seq_to_rep_prefix(
        &self,
        ps: &mut PipelineStrategy,
        ir: &ModuleIr,
    ) {
        if ps.stages.len() < 2 || ps.stages[0].ty != StageType::Sequential {
            return;
        }
        let parallel_ix = match ps.stages.iter().position(|s| s.ty == StageType::Parallel) {
            Some(ix) if ix > 0 => ix,
            _ => return,
        };

        let mut seq_weight = 0.0;
        for &inst in &ps.stages[0].instructions {
            if ir.instr(inst).may_write_to_memory() {
                return;
            }
            seq_weight += FIXED_POINT as f64 * self.perf.estimate_weight(inst);
            // Too heavy to replicate: the overlap with the parallel stage
            // is what pays for the duplication.
            if (seq_weight * 100.0) / self.parallel_stage_weight
                > self.cfg.replicable_prefix_perc_threshold
            {
                return;
            }
        }

        let seq_insts: Vec<InstrId> = ps.stages[0].instructions.iter().copied().collect();
        ps.stages[parallel_ix].replicated.extend(seq_insts);
        ps.stages.remove(0);
        let p = ps.stages.iter_mut().find(|s| s.ty == StageType::Parallel).unwrap();
        p.parallel_factor += 1;
        debug!("converted replicable first sequential stage into replicated prefix");
    }

    fn adjust_pipeline(&mut self, ps: &mut PipelineStrategy, pdg: &DepGraph, ir: &ModuleIr) {
        let parallel_ix = ps.stages.iter().position(|s| s.ty == StageType::Parallel);
        let Some(parallel_ix) = parallel_ix else { return };

        if parallel_ix > 0 && ps.stages[0].ty == StageType::Sequential {
            self.adjust_for_reg_lc_from_seq_to_par(ps, pdg, 0, parallel_ix);
        }

        if ps.stages[0].ty == StageType::Sequential {
            self.convert_rep_light_first_seq_to_rep_prefix(ps, ir);
        }
    }

    // ---- criticisms -----------------------------------------------------

    /// No dependence may run from a later stage back to an earlier one.
    fn crit_for_pipeline_property(
        pdg: &DepGraph,
        early: &PipelineStage,
        late: &PipelineStage,
        criticisms: &mut Criticisms,
    ) -> Result<()> {
        let all_early: Vec<InstrId> = early.all_instrs().into_iter().collect();
        let all_late: Vec<InstrId> = late.all_instrs().into_iter().collect();
        for e in pdg.edges_between_sets(&all_late, &all_early) {
            if pdg.edge(e).is_removable() {
                criticisms.insert(e);
            } else {
                let (src, dst) = pdg.endpoints(e);
                return Err(SpecloomError::PipelineProperty(format!(
                    "non-removable backward dependence {:?} -> {:?}",
                    src, dst
                )));
            }
        }
        Ok(())
    }

    /// No loop-carried edge may live inside a parallel stage.
    fn crit_for_parallel_stage_property(
        pdg: &DepGraph,
        parallel: &PipelineStage,
        criticisms: &mut Criticisms,
    ) -> Result<()> {
        let all: Vec<InstrId> = parallel.all_instrs().into_iter().collect();
        let srcs: Vec<InstrId> = parallel.instructions.iter().copied().collect();
        for e in pdg.edges_between_sets(&srcs, &all) {
            if !pdg.edge(e).loop_carried {
                continue;
            }
            if pdg.edge(e).is_removable() {
                criticisms.insert(e);
            } else {
                let (src, dst) = pdg.endpoints(e);
                return Err(SpecloomError::PipelineProperty(format!(
                    "non-removable loop-carried dependence {:?} -> {:?} in parallel stage",
                    src, dst
                )));
            }
        }
        Ok(())
    }

    fn populate_criticisms(
        ps: &PipelineStrategy,
        pdg: &DepGraph,
        criticisms: &mut Criticisms,
    ) -> Result<()> {
        for (i, early) in ps.stages.iter().enumerate() {
            for late in ps.stages.iter().skip(i + 1) {
                Self::crit_for_pipeline_property(pdg, early, late, criticisms)?;
            }
        }
        for stage in &ps.stages {
            if stage.ty == StageType::Parallel {
                Self::crit_for_parallel_stage_property(pdg, stage, criticisms)?;
            }
        }
        Ok(())
    }

    /// Control deps and forward memory flows that the code generator must
    /// route through inter-stage queues.
    fn populate_cross_stage_dependences(
        ps: &mut PipelineStrategy,
        pdg: &DepGraph,
        criticisms: &Criticisms,
        ir: &ModuleIr,
    ) {
        for stage_ix in 0..ps.stages.len() {
            let all_insts = ps.stages[stage_ix].all_instrs();
            for &src in &all_insts {
                for e in pdg.out_edges(src) {
                    let edge = pdg.edge(e);
                    let (_, dst) = pdg.endpoints(e);
                    if edge.kind == DepKind::Control && ir.instr(src).is_terminator() {
                        // Keep control deps that are non-removable or whose
                        // removal would misspeculate every invocation; also
                        // needed within a stage for the replicated prefix's
                        // off-iteration path.
                        if !edge.is_removable()
                            || min_removal_cost(pdg, e) == EXPENSIVE_CTRL_REMED_COST
                        {
                            ps.cross_stage_deps.push(CrossStageDependence { src, dst, edge: e });
                        }
                    } else if edge.kind == DepKind::Memory
                        && edge.dir == crate::features::pdg::DepDir::Raw
                        && !criticisms.contains(&e)
                        && !all_insts.contains(&dst)
                    {
                        ps.cross_stage_mem_flows.push(CrossStageDependence { src, dst, edge: e });
                    }
                }
            }
        }
    }

    /// Main entry: produce (plan, criticisms, expected speedup).
    pub fn get_criticisms(
        &mut self,
        pdg: &DepGraph,
        ir: &ModuleIr,
        lp: &LoopRef,
        _ldi: &LoopDependenceInfo,
    ) -> Result<CriticRes> {
        debug!("begin criticisms generation for PS-DSWP critic");

        let optimistic = self.simplify_pdg(pdg, ir, lp);
        let sccdag = SccDag::build(&optimistic);

        let mut ps = PipelineStrategy::default();
        if !self.doall_and_pipeline(&optimistic, &sccdag, &mut ps.stages) {
            info!("PS-DSWP not applicable: no large parallel stage found");
            return Ok(CriticRes { criticisms: Criticisms::new(), exp_speedup: 0, strategy: None });
        }

        self.off_pstage_weight = 0.0;
        self.parallel_stage_weight = self.parallel_stage_weight(&ps).max(1.0);

        self.adjust_pipeline(&mut ps, pdg, ir);

        let mut tmp_criticisms = Criticisms::new();
        Self::populate_criticisms(&ps, pdg, &mut tmp_criticisms)?;

        self.avoid_expensive_criticisms(pdg, &mut ps, &tmp_criticisms, ir);

        // Instruction movement may have changed which edges cross stages;
        // recompute from scratch.
        let mut criticisms = Criticisms::new();
        Self::populate_criticisms(&ps, pdg, &mut criticisms)?;

        ps.set_valid_for(lp.header);
        if ps.expand_replicated_stages() {
            debug!("expanded replicated stages");
        }

        Self::populate_cross_stage_dependences(&mut ps, pdg, &criticisms, ir);

        info!(summary = %ps.summary(), "PS-DSWP applicable");

        let exp_speedup = exp_pipeline_speedup(self.perf, &ps, ir, lp);
        Ok(CriticRes { criticisms, exp_speedup, strategy: Some(ps) })
    }

    /// Output-only calls relocate to the last sequential stage when one
    /// exists; kept for completeness with the movement machinery.
    pub fn is_deferrable_output(&self, ir: &ModuleIr, inst: InstrId) -> bool {
        is_txio_fcn(ir, inst)
    }
}
